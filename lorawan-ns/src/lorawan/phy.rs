use std::time::{Duration, SystemTime};

/// Receive window timing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingParams {
    /// RX1 delay; RX2 opens one second later
    pub rx1_delay: Duration,
    /// Join accept delay 1
    pub join_accept_delay1: Duration,
    /// Join accept delay 2
    pub join_accept_delay2: Duration,
}

impl Default for TimingParams {
    fn default() -> Self {
        Self {
            rx1_delay: Duration::from_secs(1),
            join_accept_delay1: Duration::from_secs(5),
            join_accept_delay2: Duration::from_secs(6),
        }
    }
}

impl TimingParams {
    /// Timing with a negotiated RX1 delay in seconds (0 means 1)
    pub fn with_rx1_delay(rx1_delay_secs: u8) -> Self {
        Self {
            rx1_delay: Duration::from_secs(rx1_delay_secs.clamp(1, 15) as u64),
            ..Default::default()
        }
    }

    /// RX1 and RX2 opening times for a data uplink received at `up`
    pub fn data_windows(&self, up: SystemTime) -> (SystemTime, SystemTime) {
        let rx1 = up + self.rx1_delay;
        (rx1, rx1 + Duration::from_secs(1))
    }

    /// RX1 and RX2 opening times for a join-request received at `up`
    pub fn join_windows(&self, up: SystemTime) -> (SystemTime, SystemTime) {
        (up + self.join_accept_delay1, up + self.join_accept_delay2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows() {
        let up = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let t = TimingParams::with_rx1_delay(0);
        assert_eq!(
            t.data_windows(up),
            (up + Duration::from_secs(1), up + Duration::from_secs(2))
        );
        let t = TimingParams::with_rx1_delay(5);
        assert_eq!(t.data_windows(up).1, up + Duration::from_secs(6));
        assert_eq!(t.join_windows(up).0, up + Duration::from_secs(5));
    }
}
