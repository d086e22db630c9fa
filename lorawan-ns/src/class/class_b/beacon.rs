//! Class B beacon periods
//!
//! Beacons are broadcast every 128 seconds of GPS time. The first 2.12 s
//! of each period are reserved for the beacon itself.

use std::time::{Duration, SystemTime};

use super::timing::{from_gps, to_gps};

/// Beacon period
pub const BEACON_PERIOD: Duration = Duration::from_secs(128);

/// Time reserved for the beacon at the start of each period
pub const BEACON_RESERVED: Duration = Duration::from_millis(2_120);

/// A beacon period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconPeriod {
    /// GPS time of the beacon, in seconds
    pub gps_seconds: u64,
}

impl BeaconPeriod {
    /// Period containing `t`
    pub fn containing(t: SystemTime) -> Self {
        let secs = to_gps(t).as_secs();
        Self {
            gps_seconds: secs - secs % BEACON_PERIOD.as_secs(),
        }
    }

    /// Following period
    pub fn next(&self) -> Self {
        Self {
            gps_seconds: self.gps_seconds + BEACON_PERIOD.as_secs(),
        }
    }

    /// BeaconTime field of the beacon (GPS seconds modulo 2^32)
    pub fn beacon_time(&self) -> u32 {
        self.gps_seconds as u32
    }

    /// Wall clock start of the period
    pub fn start(&self) -> SystemTime {
        from_gps(Duration::from_secs(self.gps_seconds))
    }

    /// Wall clock start of the ping slot window
    pub fn ping_window_start(&self) -> SystemTime {
        self.start() + BEACON_RESERVED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_alignment() {
        let start = from_gps(Duration::from_secs(128 * 1000));
        let period = BeaconPeriod::containing(start + Duration::from_secs(100));
        assert_eq!(period.gps_seconds, 128 * 1000);
        assert_eq!(period.start(), start);
        assert_eq!(period.next().gps_seconds, 128 * 1001);
        assert_eq!(period.ping_window_start(), start + BEACON_RESERVED);
    }
}
