//! Uplink pipeline
//!
//! Every uplink goes through the same stages:
//! - Decode
//! - Deduplication across gateways; only the first arrival continues,
//!   carrying the metadata of every copy
//! - Matching against the sessions using the frame DevAddr, or Join
//!   Server lookup for join-requests
//! - MAC command handling and state update in a registry transaction
//! - Application uplink and downlink task

/// Concurrent set collector
pub mod accumulator;

/// Data uplink handling
pub mod data;

/// Uplink deduplication
pub mod dedup;

/// Join-request handling
pub mod join;

/// Session matching
pub mod matching;

pub use accumulator::Accumulator;
pub use dedup::Deduplicator;
pub use matching::{MatchKind, Matched, UplinkFrame};

use crate::messages::UplinkMessage;

/// Deduplication key of an uplink
///
/// The raw payload includes the MIC. Gateway metadata is left out so that
/// every copy of a transmission maps to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UplinkKey {
    raw_payload: Vec<u8>,
    data_rate_index: u8,
    frequency: u64,
}

impl UplinkKey {
    /// Key of `msg`
    pub fn new(msg: &UplinkMessage) -> Self {
        Self {
            raw_payload: msg.raw_payload.clone(),
            data_rate_index: msg.settings.data_rate_index,
            frequency: msg.settings.frequency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{RxMetadata, TxSettings};

    #[test]
    fn test_key_ignores_gateway_metadata() {
        let a = UplinkMessage {
            raw_payload: vec![0x40, 1, 2, 3],
            rx_metadata: vec![RxMetadata {
                gateway_id: "gw-1".into(),
                ..Default::default()
            }],
            settings: TxSettings {
                data_rate_index: 5,
                frequency: 868_100_000,
                timestamp: 10,
            },
            ..Default::default()
        };
        let mut b = a.clone();
        b.rx_metadata[0].gateway_id = "gw-2".into();
        b.settings.timestamp = 99;
        assert_eq!(UplinkKey::new(&a), UplinkKey::new(&b));

        b.settings.frequency = 868_300_000;
        assert_ne!(UplinkKey::new(&a), UplinkKey::new(&b));
    }
}
