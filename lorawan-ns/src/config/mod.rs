//! Network server configuration
//!
//! This module contains the identifier types shared across the crate and
//! the [`NetworkServerConfig`] read once at startup. Option bags are closed
//! enums: unknown values are rejected during deserialization.
//!
//! ```toml
//! net_id = "000013"
//! dev_addr_prefixes = ["26000000/7"]
//! deduplication_window = "200ms"
//! cooldown_window = "1s"
//!
//! [downlink_priorities]
//! join_accept = "highest"
//! mac_commands = "highest"
//! max_application_downlink = "high"
//! ```

/// Identifier and key types
pub mod device;

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Reason, Result};

pub use device::{AesKey, DevAddr, DevAddrPrefix, EndDeviceIdentifiers, Eui64, NetId};

/// Downlink transmission priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TxPriority {
    /// Lowest
    Lowest,
    /// Low
    Low,
    /// Below normal
    BelowNormal,
    /// Normal
    #[default]
    Normal,
    /// Above normal
    AboveNormal,
    /// High
    High,
    /// Highest
    Highest,
}

/// Priorities assigned to network-generated downlinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownlinkPriorities {
    /// Priority of join-accept messages
    pub join_accept: TxPriority,
    /// Minimum priority of downlinks carrying MAC commands
    pub mac_commands: TxPriority,
    /// Upper bound for application downlink priority
    pub max_application_downlink: TxPriority,
}

impl Default for DownlinkPriorities {
    fn default() -> Self {
        Self {
            join_accept: TxPriority::Highest,
            mac_commands: TxPriority::Highest,
            max_application_downlink: TxPriority::High,
        }
    }
}

/// Default MAC settings, applied when a device does not override them
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MacSettingsDefaults {
    /// ADR margin in dB
    pub adr_margin: f32,
    /// Desired RX1 delay in seconds (1..=15)
    pub desired_rx1_delay: Option<u8>,
    /// Class B confirmed downlink timeout
    #[serde(with = "humantime_serde")]
    pub class_b_timeout: Duration,
    /// Class C confirmed downlink timeout
    #[serde(with = "humantime_serde")]
    pub class_c_timeout: Duration,
    /// Maximum time between device status requests (zero disables)
    #[serde(with = "humantime_serde")]
    pub status_time_periodicity: Duration,
    /// Maximum number of uplinks between device status requests (zero disables)
    pub status_count_periodicity: u32,
}

/// Default class B confirmed downlink timeout
pub const DEFAULT_CLASS_B_TIMEOUT: Duration = Duration::from_secs(60);
/// Default class C confirmed downlink timeout
pub const DEFAULT_CLASS_C_TIMEOUT: Duration = Duration::from_secs(300);

impl Default for MacSettingsDefaults {
    fn default() -> Self {
        Self {
            adr_margin: 15.0,
            desired_rx1_delay: None,
            class_b_timeout: DEFAULT_CLASS_B_TIMEOUT,
            class_c_timeout: DEFAULT_CLASS_C_TIMEOUT,
            status_time_periodicity: Duration::from_secs(60 * 60),
            status_count_periodicity: 20,
        }
    }
}

/// Downlink task worker settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownlinkTaskConfig {
    /// Number of task processors
    pub consumers: usize,
    /// Backoff applied to tasks whose attempt asked for a retry
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Delay before a class B/C task is processed after a queue change
    #[serde(with = "humantime_serde")]
    pub schedule_window: Duration,
    /// Directory for the durable task store; in-memory when unset
    pub store_path: Option<std::path::PathBuf>,
}

impl Default for DownlinkTaskConfig {
    fn default() -> Self {
        Self {
            consumers: 4,
            retry_backoff: Duration::from_secs(2),
            schedule_window: Duration::from_secs(1),
            store_path: None,
        }
    }
}

/// Network server configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkServerConfig {
    /// Network identifier
    pub net_id: NetId,
    /// DevAddr allocation pool
    pub dev_addr_prefixes: Vec<DevAddrPrefix>,
    /// Deduplication window (W1)
    #[serde(with = "humantime_serde")]
    pub deduplication_window: Duration,
    /// Cooldown window (W2)
    #[serde(with = "humantime_serde")]
    pub cooldown_window: Duration,
    /// Downlink priorities
    pub downlink_priorities: DownlinkPriorities,
    /// Default MAC settings
    pub default_mac_settings: MacSettingsDefaults,
    /// Downlink task workers
    pub downlink_tasks: DownlinkTaskConfig,
    /// Timeout for a single remote schedule or join call
    #[serde(with = "humantime_serde")]
    pub peer_timeout: Duration,
    /// Delay reported for downlinks published through Packet Broker
    #[serde(with = "humantime_serde")]
    pub packet_broker_peering_delay: Duration,
    /// Extra time after RX2 within which a retransmission is accepted
    #[serde(with = "humantime_serde")]
    pub retransmission_window: Duration,
    /// Time-to-live of scheduled downlink entries awaiting a TX acknowledgment
    #[serde(with = "humantime_serde")]
    pub scheduled_downlink_ttl: Duration,
}

impl Default for NetworkServerConfig {
    fn default() -> Self {
        Self {
            net_id: NetId([0x00, 0x00, 0x13]),
            dev_addr_prefixes: vec![DevAddrPrefix {
                dev_addr: DevAddr([0x26, 0x00, 0x00, 0x00]),
                length: 7,
            }],
            deduplication_window: Duration::from_millis(200),
            cooldown_window: Duration::from_secs(1),
            downlink_priorities: DownlinkPriorities::default(),
            default_mac_settings: MacSettingsDefaults::default(),
            downlink_tasks: DownlinkTaskConfig::default(),
            peer_timeout: Duration::from_secs(5),
            packet_broker_peering_delay: Duration::from_secs(2),
            retransmission_window: Duration::from_secs(10),
            scheduled_downlink_ttl: Duration::from_secs(30),
        }
    }
}

impl NetworkServerConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| {
            Error::invalid_argument(Reason::InvalidConfiguration, e.to_string())
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::invalid_argument(Reason::InvalidConfiguration, msg));
        if self.dev_addr_prefixes.is_empty() {
            return invalid("at least one DevAddr prefix is required");
        }
        if self.deduplication_window.is_zero() {
            return invalid("deduplication window must be positive");
        }
        if self.downlink_tasks.consumers == 0 {
            return invalid("at least one downlink task consumer is required");
        }
        if let Some(delay) = self.default_mac_settings.desired_rx1_delay {
            if !(1..=15).contains(&delay) {
                return invalid("desired RX1 delay must be within 1..=15 seconds");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        NetworkServerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_parse_toml() {
        let config = NetworkServerConfig::from_toml_str(
            r#"
            net_id = "000013"
            dev_addr_prefixes = ["26000000/7", "27000000/8"]
            deduplication_window = "250ms"
            cooldown_window = "2s"

            [downlink_priorities]
            join_accept = "highest"
            mac_commands = "above_normal"
            max_application_downlink = "normal"

            [default_mac_settings]
            class_c_timeout = "30s"
            status_count_periodicity = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.dev_addr_prefixes.len(), 2);
        assert_eq!(config.deduplication_window, Duration::from_millis(250));
        assert_eq!(config.downlink_priorities.mac_commands, TxPriority::AboveNormal);
        assert_eq!(config.default_mac_settings.class_c_timeout, Duration::from_secs(30));
        assert_eq!(config.default_mac_settings.status_count_periodicity, 10);
        assert_eq!(
            config.default_mac_settings.status_time_periodicity,
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_unknown_priority_rejected() {
        let err = NetworkServerConfig::from_toml_str(
            r#"
            [downlink_priorities]
            join_accept = "urgent"
            "#,
        )
        .unwrap_err();
        assert_eq!(err.reason(), Reason::InvalidConfiguration);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TxPriority::Highest > TxPriority::High);
        assert!(TxPriority::Lowest < TxPriority::Normal);
    }
}
