//! GPS time conversion
//!
//! Class B beacons and ping slots are aligned on GPS time. This module
//! converts between wall clock time and GPS time.

use std::time::{Duration, SystemTime};

/// GPS epoch (1980-01-06T00:00:00Z) as seconds since the Unix epoch
pub const GPS_EPOCH_OFFSET: u64 = 315_964_800;

/// Leap seconds between GPS and UTC
pub const GPS_LEAP_SECONDS: u64 = 18;

/// Time elapsed since the GPS epoch
///
/// Times before the GPS epoch saturate to zero.
pub fn to_gps(t: SystemTime) -> Duration {
    let unix = t
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    (unix + Duration::from_secs(GPS_LEAP_SECONDS))
        .saturating_sub(Duration::from_secs(GPS_EPOCH_OFFSET))
}

/// Wall clock time of a GPS time
pub fn from_gps(gps: Duration) -> SystemTime {
    let unix = (gps + Duration::from_secs(GPS_EPOCH_OFFSET))
        .saturating_sub(Duration::from_secs(GPS_LEAP_SECONDS));
    SystemTime::UNIX_EPOCH + unix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_round_trip() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_250);
        let gps = to_gps(t);
        assert_eq!(gps.as_secs(), 1_700_000_000 - GPS_EPOCH_OFFSET + GPS_LEAP_SECONDS);
        assert_eq!(from_gps(gps), t);
    }

    #[test]
    fn test_before_epoch_saturates() {
        assert_eq!(to_gps(SystemTime::UNIX_EPOCH), Duration::ZERO);
    }
}
