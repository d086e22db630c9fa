//! Messages exchanged with gateways and adjacent servers

use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime};

use crate::config::device::{DevAddr, EndDeviceIdentifiers, NetId};
use crate::config::TxPriority;
use crate::crypto::KeyEnvelope;
use crate::device::DeviceClass;
use crate::lorawan::MacVersion;

/// Downlink path constraint reported by a gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PathConstraint {
    /// No constraint
    #[default]
    None,
    /// Prefer other paths
    PreferOther,
    /// Never use this gateway for downlink
    Never,
}

/// Reception metadata of a single gateway antenna
///
/// Identity, used for deduplication, is the gateway, antenna, concentrator
/// timestamp and uplink token.
#[derive(Debug, Clone, Default)]
pub struct RxMetadata {
    /// Gateway identifier
    pub gateway_id: String,
    /// Antenna index
    pub antenna_index: u32,
    /// Concentrator timestamp in microseconds
    pub timestamp: u32,
    /// Channel RSSI in dBm
    pub channel_rssi: f32,
    /// Signal-to-noise ratio in dB
    pub snr: f32,
    /// Opaque token used to address the gateway for downlink
    pub uplink_token: Vec<u8>,
    /// Downlink path constraint
    pub downlink_path_constraint: PathConstraint,
    /// Set when the uplink was forwarded by Packet Broker
    pub packet_broker: bool,
}

impl PartialEq for RxMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.gateway_id == other.gateway_id
            && self.antenna_index == other.antenna_index
            && self.timestamp == other.timestamp
            && self.uplink_token == other.uplink_token
    }
}

impl Eq for RxMetadata {}

impl Hash for RxMetadata {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.gateway_id.hash(state);
        self.antenna_index.hash(state);
        self.timestamp.hash(state);
        self.uplink_token.hash(state);
    }
}

/// Uplink transmission settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TxSettings {
    /// Data rate index
    pub data_rate_index: u8,
    /// Frequency in Hz
    pub frequency: u64,
    /// Concentrator timestamp in microseconds
    pub timestamp: u32,
}

/// Uplink message as received from a gateway
#[derive(Debug, Clone, Default)]
pub struct UplinkMessage {
    /// Raw PHY payload
    pub raw_payload: Vec<u8>,
    /// Reception metadata
    pub rx_metadata: Vec<RxMetadata>,
    /// Transmission settings
    pub settings: TxSettings,
    /// Reception time; filled in by the network server when absent
    pub received_at: Option<SystemTime>,
    /// Correlation identifiers
    pub correlation_ids: Vec<String>,
}

/// Reference to a gateway antenna able to transmit a downlink
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DownlinkPath {
    /// Gateway identifier
    pub gateway_id: String,
    /// Antenna index
    pub antenna_index: u32,
    /// Uplink token; `None` for fixed paths
    pub uplink_token: Option<Vec<u8>>,
    /// Whether the path goes through Packet Broker
    pub packet_broker: bool,
}

impl DownlinkPath {
    /// Fixed path to a gateway antenna
    pub fn fixed(gateway_id: impl Into<String>, antenna_index: u32) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            antenna_index,
            uplink_token: None,
            packet_broker: false,
        }
    }
}

/// Receive window parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxWindow {
    /// Data rate index
    pub data_rate_index: u8,
    /// Frequency in Hz
    pub frequency: u64,
}

/// Downlink transmission request
#[derive(Debug, Clone, PartialEq)]
pub struct TxRequest {
    /// Class of the transmission
    pub class: DeviceClass,
    /// Paths to attempt, in order
    pub downlink_paths: Vec<DownlinkPath>,
    /// RX1 delay
    pub rx1_delay: Duration,
    /// RX1 parameters, if attemptable
    pub rx1: Option<RxWindow>,
    /// RX2 (or class B/C window) parameters, if attemptable
    pub rx2: Option<RxWindow>,
    /// Transmission priority
    pub priority: TxPriority,
    /// Absolute transmission time for class B/C
    pub absolute_time: Option<SystemTime>,
    /// Frequency plan of the device
    pub frequency_plan_id: String,
}

/// Downlink message handed to a Gateway Server or Packet Broker Agent
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkMessage {
    /// Raw PHY payload
    pub raw_payload: Vec<u8>,
    /// Target device
    pub end_device_ids: EndDeviceIdentifiers,
    /// Transmission request
    pub request: TxRequest,
    /// Correlation identifiers
    pub correlation_ids: Vec<String>,
}

/// Gateway Server response to a schedule request
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleResponse {
    /// Time until transmission
    pub delay: Duration,
    /// Path that was used
    pub downlink_path: Option<DownlinkPath>,
}

/// Result reported in a TX acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAckResult {
    /// Transmitted
    Success,
    /// Too late for the window
    TooLate,
    /// Too early for the window
    TooEarly,
    /// Collision with another packet
    CollisionPacket,
    /// Transmission failed for another reason
    TxFailed,
}

/// Gateway TX acknowledgment
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayTxAcknowledgment {
    /// Gateway identifier
    pub gateway_id: String,
    /// Correlation identifiers of the downlink
    pub correlation_ids: Vec<String>,
    /// Transmission result
    pub result: TxAckResult,
}

/// Downlink settings sent in the join-accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DlSettings {
    /// Optional negotiation (1.1)
    pub opt_neg: bool,
    /// RX1 data rate offset
    pub rx1_data_rate_offset: u8,
    /// RX2 data rate index
    pub rx2_data_rate_index: u8,
}

/// Join request forwarded to a Join Server
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JoinRequest {
    /// Raw join-request PHY payload
    pub raw_payload: Vec<u8>,
    /// Allocated device address
    pub dev_addr: DevAddr,
    /// Network identifier
    pub net_id: NetId,
    /// MAC version selected for the session
    pub selected_mac_version: MacVersion,
    /// CFList to include in the join-accept
    pub cf_list: Option<Vec<u8>>,
    /// RX1 delay in seconds
    pub rx_delay: u8,
    /// Downlink settings
    pub downlink_settings: DlSettings,
    /// Correlation identifiers
    pub correlation_ids: Vec<String>,
}

/// Session keys returned by a Join Server
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JoinSessionKeys {
    /// Session key identifier
    pub session_key_id: Vec<u8>,
    /// FNwkSIntKey (NwkSKey in 1.0.x)
    pub f_nwk_s_int_key: KeyEnvelope,
    /// SNwkSIntKey (1.1)
    pub s_nwk_s_int_key: Option<KeyEnvelope>,
    /// NwkSEncKey (1.1)
    pub nwk_s_enc_key: Option<KeyEnvelope>,
    /// AppSKey, wrapped for the Application Server
    pub app_s_key: Option<KeyEnvelope>,
}

/// Join Server answer
#[derive(Debug, Clone, PartialEq)]
pub struct JoinResponse {
    /// Encrypted join-accept PHY payload
    pub raw_payload: Vec<u8>,
    /// Session keys
    pub session_keys: JoinSessionKeys,
    /// Session lifetime, if limited
    pub lifetime: Option<Duration>,
}
