//! Class C transmission timing
//!
//! A class C device listens continuously on RX2, so a downlink can go out
//! at any time. Confirmed downlinks are spaced by the class C timeout.

use std::time::{Duration, SystemTime};

use crate::device::{MacParameters, MacState};
use crate::messages::RxWindow;

/// Window a class C downlink is sent in
pub fn window(params: &MacParameters) -> RxWindow {
    RxWindow {
        data_rate_index: params.rx2_data_rate_index,
        frequency: params.rx2_frequency,
    }
}

/// Earliest time a confirmed network-initiated downlink may be sent
///
/// `timeout` is the class B or C timeout. Returns `None` when no confirmed
/// downlink was sent or it was sent long enough ago.
pub fn confirmed_not_before(
    state: &MacState,
    timeout: Duration,
    now: SystemTime,
) -> Option<SystemTime> {
    let last = state.last_confirmed_downlink_at?;
    let not_before = last + timeout;
    (not_before > now).then_some(not_before)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MacSettingsDefaults;
    use crate::device::MacSettings;
    use crate::lorawan::region::Band;
    use crate::lorawan::{MacVersion, PhyVersion};

    #[test]
    fn test_confirmed_spacing() {
        let band = Band::for_frequency_plan("EU_863_870", PhyVersion::V1_0_3RevA).unwrap();
        let mut state = MacState::new(
            &band,
            MacVersion::V1_0_3,
            &MacSettings::default(),
            &MacSettingsDefaults::default(),
        );
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let timeout = Duration::from_secs(30);
        assert_eq!(confirmed_not_before(&state, timeout, t0), None);

        state.last_confirmed_downlink_at = Some(t0);
        assert_eq!(
            confirmed_not_before(&state, timeout, t0 + Duration::from_secs(5)),
            Some(t0 + timeout)
        );
        assert_eq!(confirmed_not_before(&state, timeout, t0 + timeout), None);
        assert_eq!(window(&state.current_parameters).frequency, 869_525_000);
    }
}
