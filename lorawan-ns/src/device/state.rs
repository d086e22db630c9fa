//! Per-device MAC state
//!
//! This module contains the data held between frames:
//! - Current and desired MAC parameters
//! - Pending requests and queued responses
//! - Bounded rings of recent uplinks and downlinks
//! - Join bookkeeping (pending join-request, queued join-accept)

use std::time::SystemTime;

use heapless::Deque;

use crate::config::MacSettingsDefaults;
use crate::device::session::SessionKeys;
use crate::device::{ApplicationDownlink, DeviceClass, MacSettings};
use crate::lorawan::mac::FCtrl;
use crate::lorawan::region::Band;
use crate::lorawan::{MacCommand, MacVersion, MType};
use crate::messages::{JoinRequest, RxMetadata, TxSettings};

/// Number of uplinks kept in [`MacState::recent_uplinks`]
pub const RECENT_UPLINKS: usize = 20;
/// Number of downlinks kept in [`MacState::recent_downlinks`]
pub const RECENT_DOWNLINKS: usize = 5;

/// Fixed-capacity ring; pushing onto a full ring drops the oldest entry
#[derive(Debug, Clone)]
pub struct Ring<T, const N: usize> {
    items: Deque<T, N>,
}

impl<T, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Self {
            items: Deque::new(),
        }
    }
}

impl<T: PartialEq, const N: usize> PartialEq for Ring<T, N> {
    fn eq(&self, other: &Self) -> bool {
        self.items.iter().eq(other.items.iter())
    }
}

impl<T, const N: usize> Ring<T, N> {
    /// Append `item`, evicting the oldest entry when full
    pub fn push(&mut self, item: T) {
        if self.items.is_full() {
            self.items.pop_front();
        }
        // Cannot fail: a slot was freed above.
        let _ = self.items.push_back(item);
    }

    /// Most recent entry
    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    /// Most recent entry, mutably
    pub fn last_mut(&mut self) -> Option<&mut T> {
        self.items.back_mut()
    }

    /// Entries from oldest to newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }

    /// Entries from oldest to newest, mutably
    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut T> {
        self.items.iter_mut()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the ring is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Uplink channel known to the device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacChannel {
    /// Uplink frequency in Hz
    pub uplink_frequency: u64,
    /// RX1 downlink frequency in Hz
    pub downlink_frequency: u64,
    /// Minimum data rate index
    pub min_data_rate_index: u8,
    /// Maximum data rate index
    pub max_data_rate_index: u8,
    /// Whether the channel is enabled for uplink
    pub enable_uplink: bool,
}

/// MAC parameters negotiated with the device
#[derive(Debug, Clone, PartialEq)]
pub struct MacParameters {
    /// Maximum EIRP in dBm
    pub max_eirp: f32,
    /// ADR data rate index
    pub adr_data_rate_index: u8,
    /// ADR TX power index
    pub adr_tx_power_index: u8,
    /// ADR number of transmissions
    pub adr_nb_trans: u8,
    /// ADR_ACK_LIMIT exponent
    pub adr_ack_limit_exponent: Option<u8>,
    /// ADR_ACK_DELAY exponent
    pub adr_ack_delay_exponent: Option<u8>,
    /// RX1 delay in seconds (0 means 1)
    pub rx1_delay: u8,
    /// RX1 data rate offset
    pub rx1_data_rate_offset: u8,
    /// RX2 data rate index
    pub rx2_data_rate_index: u8,
    /// RX2 frequency in Hz
    pub rx2_frequency: u64,
    /// Aggregated duty cycle exponent
    pub max_duty_cycle: u8,
    /// Rejoin time periodicity exponent
    pub rejoin_time_periodicity: Option<u8>,
    /// Rejoin count periodicity exponent
    pub rejoin_count_periodicity: Option<u8>,
    /// Ping slot frequency; `None` means band hopping
    pub ping_slot_frequency: Option<u64>,
    /// Ping slot data rate index
    pub ping_slot_data_rate_index: Option<u8>,
    /// Beacon frequency; `None` means band default
    pub beacon_frequency: Option<u64>,
    /// Uplink channels
    pub channels: Vec<MacChannel>,
    /// Uplink dwell time limitation; `None` if never negotiated
    pub uplink_dwell_time: Option<bool>,
    /// Downlink dwell time limitation; `None` if never negotiated
    pub downlink_dwell_time: Option<bool>,
}

impl MacParameters {
    /// Band defaults
    ///
    /// On fixed-channel bands every channel is enabled when `all_channels`
    /// is set, which is the state of a device right after boot. Otherwise
    /// only the channels of the configured sub-band are.
    pub fn for_band(band: &Band, all_channels: bool) -> Self {
        let channels = if band.has_fixed_channels() {
            let mask = band.default_channel_mask();
            (0..band.max_channels)
                .map(|i| {
                    let (uplink_frequency, min_dr, max_dr) = if i < 64 {
                        (902_300_000 + i as u64 * 200_000, 0, 3)
                    } else {
                        (903_000_000 + (i as u64 - 64) * 1_600_000, 4, 4)
                    };
                    MacChannel {
                        uplink_frequency,
                        downlink_frequency: band
                            .rx1_frequency(uplink_frequency)
                            .unwrap_or(uplink_frequency),
                        min_data_rate_index: min_dr,
                        max_data_rate_index: max_dr,
                        enable_uplink: all_channels || mask.get(i).copied().unwrap_or(false),
                    }
                })
                .collect()
        } else {
            band.channels
                .iter()
                .map(|ch| MacChannel {
                    uplink_frequency: ch.frequency,
                    downlink_frequency: ch.frequency,
                    min_data_rate_index: ch.min_data_rate_index,
                    max_data_rate_index: ch.max_data_rate_index,
                    enable_uplink: true,
                })
                .collect()
        };
        Self {
            max_eirp: band.default_max_eirp,
            adr_data_rate_index: 0,
            adr_tx_power_index: 0,
            adr_nb_trans: 1,
            adr_ack_limit_exponent: None,
            adr_ack_delay_exponent: None,
            rx1_delay: 1,
            rx1_data_rate_offset: 0,
            rx2_data_rate_index: band.rx2_data_rate_index,
            rx2_frequency: band.rx2_frequency,
            max_duty_cycle: 0,
            rejoin_time_periodicity: None,
            rejoin_count_periodicity: None,
            ping_slot_frequency: band.ping_slot_frequency,
            ping_slot_data_rate_index: Some(band.ping_slot_data_rate_index),
            beacon_frequency: None,
            channels,
            uplink_dwell_time: None,
            downlink_dwell_time: None,
        }
    }

    /// Uplink enablement mask indexed by channel
    pub fn channel_mask(&self) -> Vec<bool> {
        self.channels.iter().map(|ch| ch.enable_uplink).collect()
    }
}

/// Recorded uplink
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkRecord {
    /// Message type
    pub m_type: MType,
    /// Frame control; default for join-requests
    pub f_ctrl: FCtrl,
    /// Full frame counter; zero for join-requests
    pub f_cnt: u32,
    /// Port, if any
    pub f_port: Option<u8>,
    /// Raw PHY payload
    pub raw_payload: Vec<u8>,
    /// Merged reception metadata
    pub rx_metadata: Vec<RxMetadata>,
    /// Transmission settings
    pub settings: TxSettings,
    /// Reception time
    pub received_at: SystemTime,
    /// Correlation identifiers
    pub correlation_ids: Vec<String>,
}

impl UplinkRecord {
    /// Whether this is a data uplink
    pub fn is_data(&self) -> bool {
        matches!(self.m_type, MType::UnconfirmedUp | MType::ConfirmedUp)
    }

    /// Whether this is a join- or rejoin-request
    pub fn is_join(&self) -> bool {
        matches!(self.m_type, MType::JoinRequest | MType::RejoinRequest)
    }
}

/// Recorded downlink
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkRecord {
    /// Message type
    pub m_type: MType,
    /// Frame counter; zero for join-accepts
    pub f_cnt: u32,
    /// Port, if any
    pub f_port: Option<u8>,
    /// Class the downlink was sent in
    pub class: DeviceClass,
    /// Expected transmission time
    pub transmit_at: SystemTime,
    /// Correlation identifiers
    pub correlation_ids: Vec<String>,
}

impl DownlinkRecord {
    /// Whether this was a data downlink
    pub fn is_data(&self) -> bool {
        matches!(self.m_type, MType::UnconfirmedDown | MType::ConfirmedDown)
    }
}

/// Join-accept waiting to be scheduled
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJoinAccept {
    /// Encrypted join-accept PHY payload
    pub payload: Vec<u8>,
    /// Keys of the session the join-accept establishes
    pub keys: SessionKeys,
    /// Request the join-accept answers
    pub request: JoinRequest,
    /// Correlation identifiers
    pub correlation_ids: Vec<String>,
}

/// MAC state of a device
#[derive(Debug, Clone, PartialEq)]
pub struct MacState {
    /// Operating class
    pub device_class: DeviceClass,
    /// Negotiated LoRaWAN version
    pub lorawan_version: MacVersion,
    /// Parameters in use by the device
    pub current_parameters: MacParameters,
    /// Parameters the network wants the device to use
    pub desired_parameters: MacParameters,
    /// Answers to send in the next downlink
    pub queued_responses: Vec<MacCommand>,
    /// Requests awaiting an answer
    pub pending_requests: Vec<MacCommand>,
    /// Recent uplinks
    pub recent_uplinks: Ring<UplinkRecord, RECENT_UPLINKS>,
    /// Recent downlinks
    pub recent_downlinks: Ring<DownlinkRecord, RECENT_DOWNLINKS>,
    /// Whether the RX windows of the last uplink are still usable
    pub rx_windows_available: bool,
    /// Time of the last DevStatusAns
    pub last_dev_status_received_at: Option<SystemTime>,
    /// Uplink FCnt at which DevStatusReq was last answered
    pub last_dev_status_f_cnt_up: Option<u32>,
    /// Last reported battery level
    pub last_battery: Option<u8>,
    /// Last reported demodulation margin
    pub last_margin: Option<i8>,
    /// Time of the last downlink
    pub last_downlink_at: Option<SystemTime>,
    /// Time of the last confirmed downlink
    pub last_confirmed_downlink_at: Option<SystemTime>,
    /// Time of the last class B/C downlink
    pub last_network_initiated_downlink_at: Option<SystemTime>,
    /// Confirmed application downlink awaiting acknowledgment
    pub pending_application_downlink: Option<ApplicationDownlink>,
    /// Join-request being answered
    pub pending_join_request: Option<JoinRequest>,
    /// Join-accept waiting to be scheduled
    pub queued_join_accept: Option<QueuedJoinAccept>,
    /// Ping slot periodicity exponent
    pub ping_slot_periodicity: Option<u8>,
}

impl MacState {
    /// Fresh MAC state for a device in `band`
    pub fn new(
        band: &Band,
        lorawan_version: MacVersion,
        settings: &MacSettings,
        defaults: &MacSettingsDefaults,
    ) -> Self {
        let current_parameters = MacParameters::for_band(band, true);
        let mut desired_parameters = MacParameters::for_band(band, false);
        if let Some(delay) = settings.desired_rx1_delay.or(defaults.desired_rx1_delay) {
            desired_parameters.rx1_delay = delay;
        }
        settings.apply_desired(&mut desired_parameters);
        Self {
            device_class: DeviceClass::A,
            lorawan_version,
            current_parameters,
            desired_parameters,
            queued_responses: Vec::new(),
            pending_requests: Vec::new(),
            recent_uplinks: Ring::default(),
            recent_downlinks: Ring::default(),
            rx_windows_available: false,
            last_dev_status_received_at: None,
            last_dev_status_f_cnt_up: None,
            last_battery: None,
            last_margin: None,
            last_downlink_at: None,
            last_confirmed_downlink_at: None,
            last_network_initiated_downlink_at: None,
            pending_application_downlink: None,
            pending_join_request: None,
            queued_join_accept: None,
            ping_slot_periodicity: settings.ping_slot_periodicity,
        }
    }

    /// Most recent uplink
    pub fn last_uplink(&self) -> Option<&UplinkRecord> {
        self.recent_uplinks.last()
    }

    /// Most recent data downlink
    pub fn last_data_downlink(&self) -> Option<&DownlinkRecord> {
        self.recent_downlinks.iter().rev().find(|d| d.is_data())
    }

    /// Record an uplink; correlation identifiers of older entries are dropped
    pub fn record_uplink(&mut self, up: UplinkRecord) {
        if let Some(prev) = self.recent_uplinks.last_mut() {
            prev.correlation_ids.clear();
        }
        self.recent_uplinks.push(up);
    }

    /// Record a downlink
    pub fn record_downlink(&mut self, down: DownlinkRecord) {
        if let Some(prev) = self.recent_downlinks.last_mut() {
            prev.correlation_ids.clear();
        }
        self.recent_downlinks.push(down);
    }

    /// Whether class B ping slot parameters are known
    pub fn ping_slot_known(&self) -> bool {
        self.ping_slot_periodicity.is_some()
            && self.current_parameters.ping_slot_data_rate_index.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::PhyVersion;

    #[test]
    fn test_ring_drops_oldest() {
        let mut ring: Ring<u32, 3> = Ring::default();
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(ring.last(), Some(&4));
    }

    #[test]
    fn test_us915_parameters() {
        let band = Band::for_frequency_plan("US_902_928_FSB_2", PhyVersion::V1_0_3RevA).unwrap();
        let current = MacParameters::for_band(&band, true);
        let desired = MacParameters::for_band(&band, false);
        assert_eq!(current.channels.len(), 72);
        assert!(current.channel_mask().iter().all(|on| *on));
        let enabled: Vec<usize> = desired
            .channel_mask()
            .iter()
            .enumerate()
            .filter_map(|(i, on)| on.then_some(i))
            .collect();
        assert_eq!(enabled, vec![8, 9, 10, 11, 12, 13, 14, 15, 65]);
    }

    #[test]
    fn test_desired_rx1_delay_from_defaults() {
        let band = Band::for_frequency_plan("EU_863_870", PhyVersion::V1_0_3RevA).unwrap();
        let defaults = MacSettingsDefaults {
            desired_rx1_delay: Some(5),
            ..Default::default()
        };
        let state = MacState::new(&band, MacVersion::V1_0_3, &MacSettings::default(), &defaults);
        assert_eq!(state.current_parameters.rx1_delay, 1);
        assert_eq!(state.desired_parameters.rx1_delay, 5);
    }
}
