//! Downlink slot computation per device class
//!
//! This module decides when the next data downlink to a device can go out:
//! - Class A: in RX1/RX2 of the last uplink, while the windows are available
//! - Class B: in the next ping slot
//! - Class C: right away, spaced by the class C timeout for confirmed downlinks

/// Class A receive windows
pub mod class_a;

/// Class B ping slots
pub mod class_b;

/// Class C timing
pub mod class_c;

use std::time::{Duration, SystemTime};

use crate::config::MacSettingsDefaults;
use crate::device::{DeviceClass, EndDevice, MacState};
use crate::lorawan::TimingParams;

/// Next opportunity to send a data downlink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkSlot {
    /// Receive windows of the last uplink
    ClassA {
        /// Reception time of the uplink
        uplink_at: SystemTime,
        /// RX1 opening time
        rx1: SystemTime,
        /// RX2 opening time
        rx2: SystemTime,
    },
    /// Class B ping slot or class C transmission
    NetworkInitiated {
        /// Class the downlink is sent in
        class: DeviceClass,
        /// Transmission time
        at: SystemTime,
    },
}

impl DownlinkSlot {
    /// Time at which the downlink should be generated
    pub fn time(&self) -> SystemTime {
        match self {
            DownlinkSlot::ClassA { uplink_at, .. } => *uplink_at,
            DownlinkSlot::NetworkInitiated { at, .. } => *at,
        }
    }
}

/// Confirmed downlink timeout for a class
pub fn confirmed_timeout(
    dev: &EndDevice,
    class: DeviceClass,
    defaults: &MacSettingsDefaults,
) -> Duration {
    match class {
        DeviceClass::B => dev.mac_settings.class_b_timeout(defaults),
        _ => dev.mac_settings.class_c_timeout(defaults),
    }
}

/// Class A slot of the last uplink, if its windows have not passed
pub fn class_a_slot(state: &MacState, now: SystemTime) -> Option<DownlinkSlot> {
    if !state.rx_windows_available {
        return None;
    }
    let up = state.last_uplink().filter(|up| up.is_data())?;
    let (rx1, rx2) =
        TimingParams::with_rx1_delay(state.current_parameters.rx1_delay).data_windows(up.received_at);
    (now < rx2).then_some(DownlinkSlot::ClassA {
        uplink_at: up.received_at,
        rx1,
        rx2,
    })
}

/// Next slot for a data downlink, or `None` if nothing is due
///
/// Network-initiated slots are only computed for class B/C devices with a
/// queued application downlink. The head of the queue moves the slot to its
/// absolute time and, if confirmed, past the confirmed downlink timeout.
pub fn next_data_downlink_slot(
    dev: &EndDevice,
    defaults: &MacSettingsDefaults,
    now: SystemTime,
) -> Option<DownlinkSlot> {
    let state = dev.mac_state.as_ref()?;
    if let Some(slot) = class_a_slot(state, now) {
        return Some(slot);
    }
    let class = state.device_class;
    if class == DeviceClass::A {
        return None;
    }
    let session = dev.session.as_ref()?;
    let head = session.queued_application_downlinks.first()?;

    let mut at = now;
    if let Some(abs) = head.class_b_c.as_ref().and_then(|c| c.absolute_time) {
        at = at.max(abs);
    }
    if head.confirmed && !dev.multicast {
        let timeout = confirmed_timeout(dev, class, defaults);
        if let Some(not_before) = class_c::confirmed_not_before(state, timeout, at) {
            at = not_before;
        }
    }
    let at = match class {
        DeviceClass::B => class_b::next_slot(state, session.dev_addr, at)?,
        _ => at,
    };
    Some(DownlinkSlot::NetworkInitiated { class, at })
}
