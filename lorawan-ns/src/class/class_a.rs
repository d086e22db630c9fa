//! Class A receive windows
//!
//! A class A device only listens in RX1 and RX2 after an uplink. This
//! module computes the windows of a recorded uplink and which of them can
//! still be attempted.

use std::time::SystemTime;

use crate::device::{MacParameters, UplinkRecord};
use crate::error::Result;
use crate::lorawan::region::Band;
use crate::lorawan::TimingParams;
use crate::messages::RxWindow;

/// A receive window that can still be attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxSlot {
    /// Opening time
    pub at: SystemTime,
    /// Data rate and frequency
    pub window: RxWindow,
    /// Maximum MACPayload length at the window data rate
    pub max_mac_payload: u16,
}

/// RX1 and RX2 of an uplink, `None` when not attemptable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxSlots {
    /// First receive window
    pub rx1: Option<RxSlot>,
    /// Second receive window
    pub rx2: Option<RxSlot>,
}

impl RxSlots {
    /// Largest MACPayload any attemptable window accepts
    pub fn max_mac_payload(&self) -> Option<u16> {
        self.rx1
            .iter()
            .chain(self.rx2.iter())
            .map(|s| s.max_mac_payload)
            .max()
    }

    /// Keep only the windows `mac_payload_len` bytes fit in
    pub fn fitting(self, mac_payload_len: usize) -> Self {
        let fits = |s: &RxSlot| mac_payload_len <= s.max_mac_payload as usize;
        Self {
            rx1: self.rx1.filter(fits),
            rx2: self.rx2.filter(fits),
        }
    }

    /// Whether no window is attemptable
    pub fn is_empty(&self) -> bool {
        self.rx1.is_none() && self.rx2.is_none()
    }

    /// Earliest attemptable window
    pub fn first(&self) -> Option<&RxSlot> {
        self.rx1.as_ref().or(self.rx2.as_ref())
    }
}

/// Receive windows following `up` that open after `now`
///
/// Join-accepts use the join-accept delays and no RX1 data rate offset.
/// RX1 is left out when it cannot be computed, or when both windows are
/// available and the RX1 data rate depends on a downlink dwell time that
/// was never negotiated.
pub fn attemptable_slots(
    up: &UplinkRecord,
    params: &MacParameters,
    band: &Band,
    now: SystemTime,
) -> Result<RxSlots> {
    let timing = TimingParams::with_rx1_delay(params.rx1_delay);
    let (rx1_at, rx2_at) = if up.is_join() {
        timing.join_windows(up.received_at)
    } else {
        timing.data_windows(up.received_at)
    };
    let dwell = params.downlink_dwell_time.unwrap_or(false);

    let rx1 = if now < rx1_at {
        let offset = if up.is_join() { 0 } else { params.rx1_data_rate_offset };
        band.rx1_data_rate(up.settings.data_rate_index, offset, dwell)
            .and_then(|dr| Ok((dr, band.rx1_frequency(up.settings.frequency)?)))
            .ok()
            .and_then(|(dr, frequency)| {
                Some(RxSlot {
                    at: rx1_at,
                    window: RxWindow {
                        data_rate_index: dr,
                        frequency,
                    },
                    max_mac_payload: band.max_mac_payload(dr, dwell)?,
                })
            })
    } else {
        None
    };

    let rx2 = if now < rx2_at {
        let dr = params.rx2_data_rate_index;
        let max = band.max_mac_payload(dr, dwell);
        max.map(|max_mac_payload| RxSlot {
            at: rx2_at,
            window: RxWindow {
                data_rate_index: dr,
                frequency: params.rx2_frequency,
            },
            max_mac_payload,
        })
    } else {
        None
    };

    let mut slots = RxSlots { rx1, rx2 };
    if slots.rx1.is_some()
        && slots.rx2.is_some()
        && band.rx1_data_rate_depends_on_dwell_time
        && params.downlink_dwell_time.is_none()
    {
        slots.rx1 = None;
    }
    Ok(slots)
}
