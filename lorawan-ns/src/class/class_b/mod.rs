//! Class B ping slot scheduling
//!
//! This module contains the pieces needed to place a class B downlink:
//! - GPS time conversion
//! - Beacon period alignment
//! - Ping slot offset and lookup

/// Beacon period alignment
pub mod beacon;

/// Ping slot offset and lookup
pub mod ping_slot;

/// GPS time conversion
pub mod timing;

use std::time::SystemTime;

use crate::config::device::DevAddr;
use crate::device::MacState;
use crate::lorawan::region::Band;
use crate::messages::RxWindow;

pub use beacon::BeaconPeriod;
pub use ping_slot::next_ping_slot;

/// Ping slot window parameters of a device
///
/// Returns `None` while the ping slot periodicity or data rate is unknown.
pub fn ping_slot_window(
    state: &MacState,
    band: &Band,
    dev_addr: DevAddr,
    at: SystemTime,
) -> Option<RxWindow> {
    let params = &state.current_parameters;
    let data_rate_index = params.ping_slot_data_rate_index?;
    state.ping_slot_periodicity?;
    let frequency = match params.ping_slot_frequency {
        Some(f) => f,
        None => band.ping_slot_frequency(
            dev_addr.to_u32(),
            BeaconPeriod::containing(at).gps_seconds,
        ),
    };
    Some(RxWindow {
        data_rate_index,
        frequency,
    })
}

/// Next ping slot of a device at or after `after`
pub fn next_slot(state: &MacState, dev_addr: DevAddr, after: SystemTime) -> Option<SystemTime> {
    let periodicity = state.ping_slot_periodicity?;
    Some(next_ping_slot(dev_addr, periodicity, after))
}
