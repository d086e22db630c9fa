//! End device model
//!
//! This module contains the record the registry stores per device:
//! - Identifiers, frequency plan and versions
//! - MAC settings overriding the network defaults
//! - MAC state and session, plus their pending mirrors used between
//!   join-accept and the first uplink of the new session
//! - Application downlinks queued by the Application Server

/// Device session
pub mod session;

/// Per-device MAC state
pub mod state;

use std::time::{Duration, SystemTime};

use crate::config::device::EndDeviceIdentifiers;
use crate::config::{MacSettingsDefaults, TxPriority};
use crate::error::Result;
use crate::lorawan::region::Band;
use crate::lorawan::{MacVersion, PhyVersion};
use crate::messages::DownlinkPath;

pub use session::{NetworkKeys, Session, SessionKeys};
pub use state::{
    DownlinkRecord, MacChannel, MacParameters, MacState, QueuedJoinAccept, Ring, UplinkRecord,
};

/// LoRaWAN device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceClass {
    /// Class A: downlink only in the receive windows after an uplink
    #[default]
    A,
    /// Class B: additional scheduled ping slots
    B,
    /// Class C: continuously listening
    C,
}

/// Per-device MAC settings; unset fields fall back to the network defaults
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MacSettings {
    /// ADR margin in dB
    pub adr_margin: Option<f32>,
    /// Whether the network controls the data rate
    pub use_adr: Option<bool>,
    /// Desired RX1 delay in seconds
    pub desired_rx1_delay: Option<u8>,
    /// Class B confirmed downlink timeout
    pub class_b_timeout: Option<Duration>,
    /// Class C confirmed downlink timeout
    pub class_c_timeout: Option<Duration>,
    /// Maximum time between device status requests
    pub status_time_periodicity: Option<Duration>,
    /// Maximum number of uplinks between device status requests
    pub status_count_periodicity: Option<u32>,
    /// Whether the device resets its frame counters (ABP)
    pub resets_f_cnt: Option<bool>,
    /// Ping slot periodicity exponent
    pub ping_slot_periodicity: Option<u8>,
    /// Desired RX1 data rate offset
    pub desired_rx1_data_rate_offset: Option<u8>,
    /// Desired RX2 data rate index
    pub desired_rx2_data_rate_index: Option<u8>,
    /// Desired RX2 frequency
    pub desired_rx2_frequency: Option<u64>,
    /// Desired aggregated duty cycle exponent
    pub desired_max_duty_cycle: Option<u8>,
    /// Desired maximum EIRP in dBm
    pub desired_max_eirp: Option<f32>,
    /// Desired uplink dwell time limitation
    pub desired_uplink_dwell_time: Option<bool>,
    /// Desired downlink dwell time limitation
    pub desired_downlink_dwell_time: Option<bool>,
    /// Desired ADR_ACK_LIMIT exponent
    pub desired_adr_ack_limit_exponent: Option<u8>,
    /// Desired ADR_ACK_DELAY exponent
    pub desired_adr_ack_delay_exponent: Option<u8>,
    /// Desired ping slot frequency
    pub desired_ping_slot_frequency: Option<u64>,
    /// Desired ping slot data rate index
    pub desired_ping_slot_data_rate_index: Option<u8>,
    /// Desired beacon frequency
    pub desired_beacon_frequency: Option<u64>,
    /// Desired rejoin time periodicity exponent (1.1)
    pub desired_rejoin_time_periodicity: Option<u8>,
    /// Desired rejoin count periodicity exponent (1.1)
    pub desired_rejoin_count_periodicity: Option<u8>,
}

impl MacSettings {
    /// ADR margin
    pub fn adr_margin(&self, defaults: &MacSettingsDefaults) -> f32 {
        self.adr_margin.unwrap_or(defaults.adr_margin)
    }

    /// Class B confirmed downlink timeout
    pub fn class_b_timeout(&self, defaults: &MacSettingsDefaults) -> Duration {
        self.class_b_timeout.unwrap_or(defaults.class_b_timeout)
    }

    /// Class C confirmed downlink timeout
    pub fn class_c_timeout(&self, defaults: &MacSettingsDefaults) -> Duration {
        self.class_c_timeout.unwrap_or(defaults.class_c_timeout)
    }

    /// Device status time periodicity
    pub fn status_time_periodicity(&self, defaults: &MacSettingsDefaults) -> Duration {
        self.status_time_periodicity
            .unwrap_or(defaults.status_time_periodicity)
    }

    /// Device status count periodicity
    pub fn status_count_periodicity(&self, defaults: &MacSettingsDefaults) -> u32 {
        self.status_count_periodicity
            .unwrap_or(defaults.status_count_periodicity)
    }

    /// Whether frame counter resets are accepted
    pub fn resets_f_cnt(&self) -> bool {
        self.resets_f_cnt.unwrap_or(false)
    }

    /// Whether ADR is enabled
    pub fn use_adr(&self) -> bool {
        self.use_adr.unwrap_or(true)
    }

    /// Copy the desired overrides into `params`
    pub fn apply_desired(&self, params: &mut MacParameters) {
        if let Some(v) = self.desired_rx1_data_rate_offset {
            params.rx1_data_rate_offset = v;
        }
        if let Some(v) = self.desired_rx2_data_rate_index {
            params.rx2_data_rate_index = v;
        }
        if let Some(v) = self.desired_rx2_frequency {
            params.rx2_frequency = v;
        }
        if let Some(v) = self.desired_max_duty_cycle {
            params.max_duty_cycle = v;
        }
        if let Some(v) = self.desired_max_eirp {
            params.max_eirp = v;
        }
        if self.desired_uplink_dwell_time.is_some() {
            params.uplink_dwell_time = self.desired_uplink_dwell_time;
        }
        if self.desired_downlink_dwell_time.is_some() {
            params.downlink_dwell_time = self.desired_downlink_dwell_time;
        }
        if self.desired_adr_ack_limit_exponent.is_some() {
            params.adr_ack_limit_exponent = self.desired_adr_ack_limit_exponent;
        }
        if self.desired_adr_ack_delay_exponent.is_some() {
            params.adr_ack_delay_exponent = self.desired_adr_ack_delay_exponent;
        }
        if self.desired_ping_slot_frequency.is_some() {
            params.ping_slot_frequency = self.desired_ping_slot_frequency;
        }
        if self.desired_ping_slot_data_rate_index.is_some() {
            params.ping_slot_data_rate_index = self.desired_ping_slot_data_rate_index;
        }
        if self.desired_beacon_frequency.is_some() {
            params.beacon_frequency = self.desired_beacon_frequency;
        }
        if self.desired_rejoin_time_periodicity.is_some() {
            params.rejoin_time_periodicity = self.desired_rejoin_time_periodicity;
        }
        if self.desired_rejoin_count_periodicity.is_some() {
            params.rejoin_count_periodicity = self.desired_rejoin_count_periodicity;
        }
    }
}

/// Class B/C scheduling constraints of an application downlink
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClassBcConfig {
    /// Absolute transmission time
    pub absolute_time: Option<SystemTime>,
    /// Fixed gateways; groups are tried in ascending group order
    pub gateways: Vec<ClassBcGateway>,
}

/// Fixed gateway of a class B/C downlink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassBcGateway {
    /// Gateway identifier
    pub gateway_id: String,
    /// Antenna index
    pub antenna_index: u32,
    /// Attempt group
    pub group_index: u32,
}

impl ClassBcGateway {
    /// Downlink path to this gateway
    pub fn path(&self) -> DownlinkPath {
        DownlinkPath::fixed(self.gateway_id.clone(), self.antenna_index)
    }
}

/// Application downlink queued by the Application Server
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApplicationDownlink {
    /// Session the downlink was encrypted for
    pub session_key_id: Vec<u8>,
    /// Port (1..=223)
    pub f_port: u8,
    /// Frame counter the payload was encrypted with
    pub f_cnt: u32,
    /// Encrypted payload
    pub frm_payload: Vec<u8>,
    /// Whether the downlink must be acknowledged
    pub confirmed: bool,
    /// Requested priority
    pub priority: TxPriority,
    /// Class B/C constraints; `None` allows any class
    pub class_b_c: Option<ClassBcConfig>,
    /// Correlation identifiers
    pub correlation_ids: Vec<String>,
}

/// Field of an [`EndDevice`] written by a registry transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldPath {
    /// `ids.dev_addr`
    DevAddr,
    /// `mac_settings`
    MacSettings,
    /// `mac_state`
    MacState,
    /// `pending_mac_state`
    PendingMacState,
    /// `session`, including its queue
    Session,
    /// `pending_session`, including its queue
    PendingSession,
    /// `session.queued_application_downlinks` only
    SessionQueue,
    /// `pending_session.queued_application_downlinks` only
    PendingSessionQueue,
}

/// Registry record of an end device
#[derive(Debug, Clone, PartialEq)]
pub struct EndDevice {
    /// Identifiers
    pub ids: EndDeviceIdentifiers,
    /// Frequency plan identifier
    pub frequency_plan_id: String,
    /// Regional parameters version
    pub lorawan_phy_version: PhyVersion,
    /// LoRaWAN version the device implements
    pub lorawan_version: MacVersion,
    /// Whether the device activates over the air
    pub supports_join: bool,
    /// Whether the device supports class B
    pub supports_class_b: bool,
    /// Whether the device supports class C
    pub supports_class_c: bool,
    /// Multicast group
    pub multicast: bool,
    /// MAC settings
    pub mac_settings: MacSettings,
    /// Current MAC state
    pub mac_state: Option<MacState>,
    /// MAC state of the pending session
    pub pending_mac_state: Option<MacState>,
    /// Current session
    pub session: Option<Session>,
    /// Session established by a join-accept, not yet confirmed by an uplink
    pub pending_session: Option<Session>,
}

impl EndDevice {
    /// Device without state or session
    pub fn new(ids: EndDeviceIdentifiers, frequency_plan_id: impl Into<String>) -> Self {
        Self {
            ids,
            frequency_plan_id: frequency_plan_id.into(),
            lorawan_phy_version: PhyVersion::default(),
            lorawan_version: MacVersion::default(),
            supports_join: true,
            supports_class_b: false,
            supports_class_c: false,
            multicast: false,
            mac_settings: MacSettings::default(),
            mac_state: None,
            pending_mac_state: None,
            session: None,
            pending_session: None,
        }
    }

    /// Band of the device frequency plan
    pub fn band(&self) -> Result<Band> {
        Band::for_frequency_plan(&self.frequency_plan_id, self.lorawan_phy_version)
    }

    /// Registry key
    pub fn uid(&self) -> String {
        self.ids.uid()
    }

    /// Copy the fields named in `paths` from `src`
    pub fn apply_paths(&mut self, src: &EndDevice, paths: &[FieldPath]) {
        for path in paths {
            match path {
                FieldPath::DevAddr => self.ids.dev_addr = src.ids.dev_addr,
                FieldPath::MacSettings => self.mac_settings = src.mac_settings.clone(),
                FieldPath::MacState => self.mac_state = src.mac_state.clone(),
                FieldPath::PendingMacState => self.pending_mac_state = src.pending_mac_state.clone(),
                FieldPath::Session => self.session = src.session.clone(),
                FieldPath::PendingSession => self.pending_session = src.pending_session.clone(),
                FieldPath::SessionQueue => {
                    if let (Some(dst), Some(src)) = (self.session.as_mut(), src.session.as_ref()) {
                        dst.queued_application_downlinks = src.queued_application_downlinks.clone();
                    }
                }
                FieldPath::PendingSessionQueue => {
                    if let (Some(dst), Some(src)) =
                        (self.pending_session.as_mut(), src.pending_session.as_ref())
                    {
                        dst.queued_application_downlinks = src.queued_application_downlinks.clone();
                    }
                }
            }
        }
    }
}
