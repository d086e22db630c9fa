//! LoRaWAN cryptographic operations
//!
//! This module provides the network-side cryptographic functions:
//! - Message Integrity Code (MIC) computation for 1.0.x and 1.1 frames
//! - FRMPayload and FOpts encryption/decryption
//! - Key unwrapping through a [`KeyVault`]

/// Key envelopes and key vaults
pub mod keyvault;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::config::device::{AesKey, DevAddr};
use crate::error::{Error, Reason, Result};

pub use keyvault::{KeyEnvelope, KeyVault, MemoryKeyVault};

/// MIC size in bytes
pub const MIC_SIZE: usize = 4;

/// Block size for AES-128
const BLOCK_SIZE: usize = 16;

/// Direction identifiers for cryptographic operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Uplink (device to network)
    Up = 0,
    /// Downlink (network to device)
    Down = 1,
}

fn cmac(key: &AesKey, blocks: &[&[u8]]) -> Result<[u8; BLOCK_SIZE]> {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key.as_bytes())
        .map_err(|_| Error::internal(Reason::Crypto, "invalid CMAC key length"))?;
    for block in blocks {
        mac.update(block);
    }
    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Encrypt a single block with AES-128-ECB
pub fn encrypt_block(key: &AesKey, block: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut b = GenericArray::clone_from_slice(&block);
    cipher.encrypt_block(&mut b);
    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(&b);
    out
}

fn b0(
    dir: Direction,
    conf_f_cnt: u16,
    tx_dr: u8,
    tx_ch: u8,
    dev_addr: DevAddr,
    f_cnt: u32,
    len: usize,
) -> Result<[u8; BLOCK_SIZE]> {
    if len > u8::MAX as usize {
        return Err(Error::invalid_argument(
            Reason::PayloadTooLong,
            "message too long for MIC computation",
        ));
    }
    let mut b = [0u8; BLOCK_SIZE];
    b[0] = 0x49;
    b[1..3].copy_from_slice(&conf_f_cnt.to_le_bytes());
    b[3] = tx_dr;
    b[4] = tx_ch;
    b[5] = dir as u8;
    b[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    b[10..14].copy_from_slice(&f_cnt.to_le_bytes());
    b[15] = len as u8;
    Ok(b)
}

/// Compute the legacy (LoRaWAN 1.0.x) uplink MIC
///
/// In LoRaWAN 1.1 this is the `cmacF` half, computed with FNwkSIntKey.
///
/// # Arguments
/// * `key` - FNwkSIntKey (NwkSKey in 1.0.x)
/// * `dev_addr` - Device address
/// * `f_cnt` - Full 32-bit uplink frame counter
/// * `msg` - MHDR | FHDR | FPort | FRMPayload
pub fn compute_legacy_uplink_mic(
    key: &AesKey,
    dev_addr: DevAddr,
    f_cnt: u32,
    msg: &[u8],
) -> Result<[u8; MIC_SIZE]> {
    let b0 = b0(Direction::Up, 0, 0, 0, dev_addr, f_cnt, msg.len())?;
    let full = cmac(key, &[&b0, msg])?;
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&full[..MIC_SIZE]);
    Ok(mic)
}

/// Compute the LoRaWAN 1.1 uplink MIC
///
/// # Arguments
/// * `s_nwk_s_int_key` - Serving network session integrity key
/// * `f_nwk_s_int_key` - Forwarding network session integrity key
/// * `conf_f_cnt` - FCnt of the acknowledged downlink, or 0 if ACK is not set
/// * `tx_dr` - Uplink data rate index
/// * `tx_ch` - Uplink channel index
/// * `dev_addr` - Device address
/// * `f_cnt` - Full 32-bit uplink frame counter
/// * `msg` - MHDR | FHDR | FPort | FRMPayload
#[allow(clippy::too_many_arguments)]
pub fn compute_uplink_mic(
    s_nwk_s_int_key: &AesKey,
    f_nwk_s_int_key: &AesKey,
    conf_f_cnt: u32,
    tx_dr: u8,
    tx_ch: u8,
    dev_addr: DevAddr,
    f_cnt: u32,
    msg: &[u8],
) -> Result<[u8; MIC_SIZE]> {
    let cmac_f = compute_legacy_uplink_mic(f_nwk_s_int_key, dev_addr, f_cnt, msg)?;
    let b1 = b0(
        Direction::Up,
        conf_f_cnt as u16,
        tx_dr,
        tx_ch,
        dev_addr,
        f_cnt,
        msg.len(),
    )?;
    let cmac_s = cmac(s_nwk_s_int_key, &[&b1, msg])?;
    Ok([cmac_s[0], cmac_s[1], cmac_f[0], cmac_f[1]])
}

/// Compute the legacy (LoRaWAN 1.0.x) downlink MIC
pub fn compute_legacy_downlink_mic(
    key: &AesKey,
    dev_addr: DevAddr,
    f_cnt: u32,
    msg: &[u8],
) -> Result<[u8; MIC_SIZE]> {
    let b0 = b0(Direction::Down, 0, 0, 0, dev_addr, f_cnt, msg.len())?;
    let full = cmac(key, &[&b0, msg])?;
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&full[..MIC_SIZE]);
    Ok(mic)
}

/// Compute the LoRaWAN 1.1 downlink MIC
///
/// `conf_f_cnt` is the FCnt of the acknowledged confirmed uplink when the
/// ACK bit is set, 0 otherwise.
pub fn compute_downlink_mic(
    s_nwk_s_int_key: &AesKey,
    conf_f_cnt: u32,
    dev_addr: DevAddr,
    f_cnt: u32,
    msg: &[u8],
) -> Result<[u8; MIC_SIZE]> {
    let b0 = b0(Direction::Down, conf_f_cnt as u16, 0, 0, dev_addr, f_cnt, msg.len())?;
    let full = cmac(s_nwk_s_int_key, &[&b0, msg])?;
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&full[..MIC_SIZE]);
    Ok(mic)
}

fn keystream_xor(key: &AesKey, mut a: [u8; BLOCK_SIZE], payload: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(payload.len());
    for (i, chunk) in payload.chunks(BLOCK_SIZE).enumerate() {
        a[15] = (i + 1) as u8;
        let s = encrypt_block(key, a);
        result.extend(chunk.iter().zip(s.iter()).map(|(p, k)| p ^ k));
    }
    result
}

/// Encrypt or decrypt FRMPayload
///
/// # Arguments
/// * `key` - NwkSEncKey for FPort 0, AppSKey otherwise
/// * `dev_addr` - Device address
/// * `f_cnt` - Full 32-bit frame counter
/// * `dir` - Message direction
/// * `payload` - Data to encrypt/decrypt
pub fn encrypt_payload(
    key: &AesKey,
    dev_addr: DevAddr,
    f_cnt: u32,
    dir: Direction,
    payload: &[u8],
) -> Vec<u8> {
    let mut a = [0u8; BLOCK_SIZE];
    a[0] = 0x01;
    a[5] = dir as u8;
    a[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    a[10..14].copy_from_slice(&f_cnt.to_le_bytes());
    keystream_xor(key, a, payload)
}

/// Encrypt or decrypt FOpts (LoRaWAN 1.1)
///
/// `a_f_cnt_down` selects the 1.1 errata variant for downlinks that carry
/// an application FPort, where the counter is AFCntDown.
pub fn encrypt_fopts(
    key: &AesKey,
    dev_addr: DevAddr,
    f_cnt: u32,
    dir: Direction,
    a_f_cnt_down: bool,
    fopts: &[u8],
) -> Vec<u8> {
    let mut a = [0u8; BLOCK_SIZE];
    a[0] = 0x01;
    if a_f_cnt_down {
        a[4] = 0x02;
    } else {
        a[4] = 0x01;
    }
    a[5] = dir as u8;
    a[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    a[10..14].copy_from_slice(&f_cnt.to_le_bytes());
    // FOpts never exceed a single block; the counter byte stays 0x01.
    keystream_xor(key, a, fopts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> AesKey {
        AesKey::new([b; 16])
    }

    #[test]
    fn test_cmac_rfc4493_vector() {
        // RFC 4493, example 2.
        let k = AesKey::new([
            0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf,
            0x4f, 0x3c,
        ]);
        let msg = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93,
            0x17, 0x2a,
        ];
        let out = cmac(&k, &[&msg]).unwrap();
        assert_eq!(
            out,
            [
                0x07, 0x0a, 0x16, 0xb4, 0x6b, 0x4d, 0x41, 0x44, 0xf7, 0x9b, 0xdd, 0x9d, 0xd0, 0x4a,
                0x28, 0x7c
            ]
        );
    }

    #[test]
    fn test_payload_encryption_is_involutive() {
        let addr = DevAddr([0x01, 0x02, 0x03, 0x04]);
        let payload = b"Hello LoRaWAN network server";
        let encrypted = encrypt_payload(&key(1), addr, 7, Direction::Down, payload);
        assert_ne!(&encrypted[..], &payload[..]);
        let decrypted = encrypt_payload(&key(1), addr, 7, Direction::Down, &encrypted);
        assert_eq!(&decrypted[..], &payload[..]);
    }

    #[test]
    fn test_legacy_mic_detects_tampering() {
        let addr = DevAddr([0x26, 0x01, 0x1B, 0xDA]);
        let msg = [0x40, 0xDA, 0x1B, 0x01, 0x26, 0x00, 0x22, 0x00, 0x01, 0xAA, 0xBB];
        let mic = compute_legacy_uplink_mic(&key(2), addr, 34, &msg).unwrap();
        for i in 0..msg.len() {
            let mut tampered = msg;
            tampered[i] ^= 0x01;
            assert_ne!(compute_legacy_uplink_mic(&key(2), addr, 34, &tampered).unwrap(), mic);
        }
        assert_ne!(compute_legacy_uplink_mic(&key(2), addr, 35, &msg).unwrap(), mic);
    }

    #[test]
    fn test_uplink_mic_1_1_embeds_cmac_f() {
        let addr = DevAddr([0x26, 0x01, 0x1B, 0xDA]);
        let msg = [0x40, 0xDA, 0x1B, 0x01, 0x26, 0x00, 0x01, 0x00];
        let legacy = compute_legacy_uplink_mic(&key(3), addr, 1, &msg).unwrap();
        let mic = compute_uplink_mic(&key(4), &key(3), 0, 5, 2, addr, 1, &msg).unwrap();
        assert_eq!(&mic[2..], &legacy[..2]);
        // Changing the TX channel only affects the cmacS half.
        let other = compute_uplink_mic(&key(4), &key(3), 0, 5, 3, addr, 1, &msg).unwrap();
        assert_eq!(&other[2..], &mic[2..]);
        assert_ne!(&other[..2], &mic[..2]);
    }

    #[test]
    fn test_downlink_mic_depends_on_conf_f_cnt() {
        let addr = DevAddr([0x26, 0x01, 0x1B, 0xDA]);
        let msg = [0x60, 0xDA, 0x1B, 0x01, 0x26, 0x20, 0x05, 0x00];
        let a = compute_downlink_mic(&key(5), 0, addr, 5, &msg).unwrap();
        let b = compute_downlink_mic(&key(5), 12, addr, 5, &msg).unwrap();
        assert_ne!(a, b);
        assert_eq!(compute_downlink_mic(&key(5), 0, addr, 5, &msg).unwrap(), a);
    }

    #[test]
    fn test_fopts_encryption_variants_differ() {
        let addr = DevAddr([0x26, 0x01, 0x1B, 0xDA]);
        let fopts = [0x06, 0x03, 0x07];
        let n = encrypt_fopts(&key(6), addr, 3, Direction::Down, false, &fopts);
        let a = encrypt_fopts(&key(6), addr, 3, Direction::Down, true, &fopts);
        assert_ne!(n, a);
        assert_eq!(encrypt_fopts(&key(6), addr, 3, Direction::Down, false, &n), fopts);
    }
}
