//! Session key envelopes
//!
//! Session keys handed out by the Join Server are either plaintext or
//! wrapped with a key encryption key (KEK) using AES key wrap (RFC 3394).
//! A [`KeyVault`] resolves the KEK label and unwraps the key.

use std::collections::HashMap;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::config::device::AesKey;
use crate::error::{Error, Reason, Result};

const WRAP_IV: [u8; 8] = [0xA6; 8];

/// A possibly-wrapped AES-128 key
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyEnvelope {
    /// Label of the KEK used for wrapping; empty for plaintext keys
    pub kek_label: String,
    /// Plaintext key
    pub key: Option<AesKey>,
    /// RFC 3394 wrapped key (24 bytes)
    pub encrypted_key: Vec<u8>,
}

impl KeyEnvelope {
    /// Plaintext envelope
    pub fn plain(key: AesKey) -> Self {
        Self {
            key: Some(key),
            ..Default::default()
        }
    }

    /// Whether the envelope holds any key material
    pub fn is_empty(&self) -> bool {
        self.key.is_none() && self.encrypted_key.is_empty()
    }
}

/// Resolves key envelopes to plaintext keys
pub trait KeyVault: Send + Sync {
    /// Unwrap `envelope`
    fn unwrap_key(&self, envelope: &KeyEnvelope) -> Result<AesKey>;
}

/// Key vault holding KEKs in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryKeyVault {
    keks: HashMap<String, AesKey>,
}

impl MemoryKeyVault {
    /// Empty vault; only plaintext envelopes can be resolved
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a KEK
    pub fn with_kek(mut self, label: impl Into<String>, kek: AesKey) -> Self {
        self.keks.insert(label.into(), kek);
        self
    }

    /// Wrap `key` with the KEK registered as `label`
    pub fn wrap(&self, label: &str, key: &AesKey) -> Result<KeyEnvelope> {
        let kek = self.kek(label)?;
        Ok(KeyEnvelope {
            kek_label: label.to_string(),
            key: None,
            encrypted_key: wrap_key(kek, key),
        })
    }

    fn kek(&self, label: &str) -> Result<&AesKey> {
        self.keks
            .get(label)
            .ok_or_else(|| Error::not_found(Reason::KeyNotFound, format!("KEK `{label}` not found")))
    }
}

impl KeyVault for MemoryKeyVault {
    fn unwrap_key(&self, envelope: &KeyEnvelope) -> Result<AesKey> {
        if let Some(key) = envelope.key {
            return Ok(key);
        }
        if envelope.encrypted_key.is_empty() {
            return Err(Error::not_found(Reason::KeyNotFound, "empty key envelope"));
        }
        unwrap_key(self.kek(&envelope.kek_label)?, &envelope.encrypted_key)
    }
}

/// RFC 3394 key wrap of a 128-bit key
pub fn wrap_key(kek: &AesKey, key: &AesKey) -> Vec<u8> {
    let cipher = Aes128::new(GenericArray::from_slice(kek.as_bytes()));
    let mut a = WRAP_IV;
    let mut r = [[0u8; 8]; 2];
    r[0].copy_from_slice(&key.as_bytes()[..8]);
    r[1].copy_from_slice(&key.as_bytes()[8..]);
    for j in 0..6u64 {
        for (i, ri) in r.iter_mut().enumerate() {
            let mut b = [0u8; 16];
            b[..8].copy_from_slice(&a);
            b[8..].copy_from_slice(ri);
            let mut block = GenericArray::clone_from_slice(&b);
            cipher.encrypt_block(&mut block);
            let t = 2 * j + i as u64 + 1;
            a.copy_from_slice(&block[..8]);
            for (x, y) in a.iter_mut().zip(t.to_be_bytes()) {
                *x ^= y;
            }
            ri.copy_from_slice(&block[8..]);
        }
    }
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&a);
    out.extend_from_slice(&r[0]);
    out.extend_from_slice(&r[1]);
    out
}

/// RFC 3394 key unwrap of a 128-bit key
pub fn unwrap_key(kek: &AesKey, wrapped: &[u8]) -> Result<AesKey> {
    if wrapped.len() != 24 {
        return Err(Error::invalid_argument(
            Reason::Crypto,
            format!("wrapped key must be 24 bytes, got {}", wrapped.len()),
        ));
    }
    let cipher = Aes128::new(GenericArray::from_slice(kek.as_bytes()));
    let mut a = [0u8; 8];
    a.copy_from_slice(&wrapped[..8]);
    let mut r = [[0u8; 8]; 2];
    r[0].copy_from_slice(&wrapped[8..16]);
    r[1].copy_from_slice(&wrapped[16..]);
    for j in (0..6u64).rev() {
        for i in (0..2).rev() {
            let t = 2 * j + i as u64 + 1;
            let mut b = [0u8; 16];
            for (k, y) in t.to_be_bytes().iter().enumerate() {
                b[k] = a[k] ^ y;
            }
            b[8..].copy_from_slice(&r[i]);
            let mut block = GenericArray::clone_from_slice(&b);
            cipher.decrypt_block(&mut block);
            a.copy_from_slice(&block[..8]);
            r[i].copy_from_slice(&block[8..]);
        }
    }
    if a != WRAP_IV {
        return Err(Error::invalid_argument(Reason::Crypto, "key unwrap integrity check failed"));
    }
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&r[0]);
    key[8..].copy_from_slice(&r[1]);
    Ok(AesKey::new(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3394_vector() {
        // RFC 3394 section 4.1
        let kek = AesKey::new([
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
            0x0E, 0x0F,
        ]);
        let key = AesKey::new([
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
            0xEE, 0xFF,
        ]);
        let wrapped = wrap_key(&kek, &key);
        assert_eq!(
            wrapped,
            vec![
                0x1F, 0xA6, 0x8B, 0x0A, 0x81, 0x12, 0xB4, 0x47, 0xAE, 0xF3, 0x4B, 0xD8, 0xFB, 0x5A,
                0x7B, 0x82, 0x9D, 0x3E, 0x86, 0x23, 0x71, 0xD2, 0xCF, 0xE5
            ]
        );
        assert_eq!(unwrap_key(&kek, &wrapped).unwrap(), key);
    }

    #[test]
    fn test_vault_resolves_labels() {
        let vault = MemoryKeyVault::new().with_kek("ns", AesKey::new([7; 16]));
        let key = AesKey::new([0x42; 16]);
        let envelope = vault.wrap("ns", &key).unwrap();
        assert_eq!(vault.unwrap_key(&envelope).unwrap(), key);
        assert_eq!(vault.unwrap_key(&KeyEnvelope::plain(key)).unwrap(), key);

        let unknown = KeyEnvelope {
            kek_label: "other".into(),
            ..envelope
        };
        assert_eq!(vault.unwrap_key(&unknown).unwrap_err().reason(), Reason::KeyNotFound);
    }

    #[test]
    fn test_tampered_wrap_rejected() {
        let kek = AesKey::new([1; 16]);
        let mut wrapped = wrap_key(&kek, &AesKey::new([2; 16]));
        wrapped[10] ^= 0xFF;
        assert!(unwrap_key(&kek, &wrapped).is_err());
    }
}
