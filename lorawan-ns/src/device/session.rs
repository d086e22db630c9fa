//! Device session
//!
//! A session bundles the DevAddr, the network session keys and the frame
//! counters. It is created on join-accept (as the pending session) and
//! retired on the next activation.

use std::time::SystemTime;

use crate::config::device::{AesKey, DevAddr};
use crate::crypto::{KeyEnvelope, KeyVault};
use crate::device::ApplicationDownlink;
use crate::error::Result;
use crate::lorawan::MacVersion;

/// Network session keys
///
/// In LoRaWAN 1.0.x only `f_nwk_s_int_key` is set and it doubles as
/// SNwkSIntKey and NwkSEncKey.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionKeys {
    /// Session key identifier assigned by the Join Server
    pub session_key_id: Vec<u8>,
    /// FNwkSIntKey (NwkSKey in 1.0.x)
    pub f_nwk_s_int_key: KeyEnvelope,
    /// SNwkSIntKey
    pub s_nwk_s_int_key: Option<KeyEnvelope>,
    /// NwkSEncKey
    pub nwk_s_enc_key: Option<KeyEnvelope>,
}

/// Unwrapped network session keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkKeys {
    /// FNwkSIntKey
    pub f_nwk_s_int: AesKey,
    /// SNwkSIntKey
    pub s_nwk_s_int: AesKey,
    /// NwkSEncKey
    pub nwk_s_enc: AesKey,
}

impl SessionKeys {
    /// Keys for a 1.0.x session
    pub fn legacy(session_key_id: Vec<u8>, nwk_s_key: KeyEnvelope) -> Self {
        Self {
            session_key_id,
            f_nwk_s_int_key: nwk_s_key,
            s_nwk_s_int_key: None,
            nwk_s_enc_key: None,
        }
    }

    /// Unwrap every key needed for `version`
    pub fn unwrap(&self, vault: &dyn KeyVault, version: MacVersion) -> Result<NetworkKeys> {
        let f = vault.unwrap_key(&self.f_nwk_s_int_key)?;
        if !version.is_1_1() {
            return Ok(NetworkKeys {
                f_nwk_s_int: f,
                s_nwk_s_int: f,
                nwk_s_enc: f,
            });
        }
        let s = match &self.s_nwk_s_int_key {
            Some(env) => vault.unwrap_key(env)?,
            None => f,
        };
        let enc = match &self.nwk_s_enc_key {
            Some(env) => vault.unwrap_key(env)?,
            None => f,
        };
        Ok(NetworkKeys {
            f_nwk_s_int: f,
            s_nwk_s_int: s,
            nwk_s_enc: enc,
        })
    }
}

/// Device session state
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Session device address
    pub dev_addr: DevAddr,
    /// Network session keys
    pub keys: SessionKeys,
    /// Last accepted uplink FCnt (full 32 bits)
    pub last_f_cnt_up: u32,
    /// Last network downlink FCnt
    pub last_n_f_cnt_down: u32,
    /// Last confirmed downlink FCnt (1.1)
    pub last_conf_f_cnt_down: u32,
    /// Application downlinks queued for this session
    pub queued_application_downlinks: Vec<ApplicationDownlink>,
    /// Session start time
    pub started_at: SystemTime,
}

impl Session {
    /// Fresh session with zeroed counters
    pub fn new(dev_addr: DevAddr, keys: SessionKeys, started_at: SystemTime) -> Self {
        Self {
            dev_addr,
            keys,
            last_f_cnt_up: 0,
            last_n_f_cnt_down: 0,
            last_conf_f_cnt_down: 0,
            queued_application_downlinks: Vec::new(),
            started_at,
        }
    }

    /// Whether `session_key_id` identifies this session
    pub fn has_key_id(&self, session_key_id: &[u8]) -> bool {
        self.keys.session_key_id == session_key_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MemoryKeyVault;

    #[test]
    fn test_legacy_keys_degenerate() {
        let key = AesKey::new([0x11; 16]);
        let keys = SessionKeys::legacy(vec![1], KeyEnvelope::plain(key));
        let unwrapped = keys.unwrap(&MemoryKeyVault::new(), MacVersion::V1_0_3).unwrap();
        assert_eq!(unwrapped.f_nwk_s_int, key);
        assert_eq!(unwrapped.s_nwk_s_int, key);
        assert_eq!(unwrapped.nwk_s_enc, key);
    }

    #[test]
    fn test_1_1_keys_wrapped() {
        let kek = AesKey::new([0x42; 16]);
        let vault = MemoryKeyVault::new().with_kek("ns", kek);
        let s = AesKey::new([0x22; 16]);
        let keys = SessionKeys {
            session_key_id: vec![2],
            f_nwk_s_int_key: KeyEnvelope::plain(AesKey::new([0x11; 16])),
            s_nwk_s_int_key: Some(vault.wrap("ns", &s).unwrap()),
            nwk_s_enc_key: Some(KeyEnvelope::plain(AesKey::new([0x33; 16]))),
        };
        let unwrapped = keys.unwrap(&vault, MacVersion::V1_1).unwrap();
        assert_eq!(unwrapped.s_nwk_s_int, s);
        assert_eq!(unwrapped.nwk_s_enc, AesKey::new([0x33; 16]));
    }
}
