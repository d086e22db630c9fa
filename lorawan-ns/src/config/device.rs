use core::fmt;
use core::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Reason};

fn parse_hex<const N: usize>(s: &str) -> Option<[u8; N]> {
    let s = s.trim();
    if s.len() != N * 2 {
        return None;
    }
    let mut out = [0u8; N];
    for (i, b) in out.iter_mut().enumerate() {
        *b = u8::from_str_radix(s.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    Some(out)
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02X}", b)?;
    }
    Ok(())
}

/// EUI-64 (8 bytes, big-endian as displayed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Eui64(pub [u8; 8]);

impl Eui64 {
    /// Wire representation (little-endian)
    pub fn to_le_bytes(&self) -> [u8; 8] {
        let mut b = self.0;
        b.reverse();
        b
    }

    /// Parse from the little-endian wire representation
    pub fn from_le_bytes(mut bytes: [u8; 8]) -> Self {
        bytes.reverse();
        Self(bytes)
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl FromStr for Eui64 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex::<8>(s)
            .map(Self)
            .ok_or_else(|| Error::invalid_argument(Reason::Decode, format!("invalid EUI `{s}`")))
    }
}

/// AES-128 key
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AesKey(pub [u8; 16]);

impl AesKey {
    /// Create a key from raw bytes
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

// Keys never end up in logs.
impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(..)")
    }
}

/// Device address (big-endian as displayed, little-endian on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DevAddr(pub [u8; 4]);

impl DevAddr {
    /// Address as a 32-bit integer
    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Build from a 32-bit integer
    pub fn from_u32(v: u32) -> Self {
        Self(v.to_be_bytes())
    }

    /// Wire representation (little-endian)
    pub fn to_le_bytes(&self) -> [u8; 4] {
        self.to_u32().to_le_bytes()
    }

    /// Parse from the little-endian wire representation
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self::from_u32(u32::from_le_bytes(bytes))
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl FromStr for DevAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex::<4>(s)
            .map(Self)
            .ok_or_else(|| Error::invalid_argument(Reason::Decode, format!("invalid DevAddr `{s}`")))
    }
}

/// Network identifier (3 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NetId(pub [u8; 3]);

impl NetId {
    /// Wire representation (little-endian)
    pub fn to_le_bytes(&self) -> [u8; 3] {
        [self.0[2], self.0[1], self.0[0]]
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl FromStr for NetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex::<3>(s)
            .map(Self)
            .ok_or_else(|| Error::invalid_argument(Reason::Decode, format!("invalid NetID `{s}`")))
    }
}

impl<'de> Deserialize<'de> for NetId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// DevAddr prefix used for address allocation, written as `26000000/7`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevAddrPrefix {
    /// Prefix bits (only the first `length` bits are significant)
    pub dev_addr: DevAddr,
    /// Number of significant bits
    pub length: u8,
}

impl DevAddrPrefix {
    fn mask(&self) -> u32 {
        match self.length {
            0 => 0,
            l if l >= 32 => u32::MAX,
            l => u32::MAX << (32 - l),
        }
    }

    /// Whether `addr` falls within the prefix
    pub fn matches(&self, addr: DevAddr) -> bool {
        addr.to_u32() & self.mask() == self.dev_addr.to_u32() & self.mask()
    }

    /// Random address within the prefix
    pub fn random_address<R: Rng + ?Sized>(&self, rng: &mut R) -> DevAddr {
        let mask = self.mask();
        DevAddr::from_u32((self.dev_addr.to_u32() & mask) | (rng.gen::<u32>() & !mask))
    }
}

impl fmt::Display for DevAddrPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dev_addr, self.length)
    }
}

impl FromStr for DevAddrPrefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::invalid_argument(Reason::Decode, format!("invalid DevAddr prefix `{s}`"));
        let (addr, len) = s.split_once('/').ok_or_else(invalid)?;
        let length: u8 = len.parse().map_err(|_| invalid())?;
        if length > 32 {
            return Err(invalid());
        }
        Ok(Self {
            dev_addr: addr.parse()?,
            length,
        })
    }
}

impl<'de> Deserialize<'de> for DevAddrPrefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// End device identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct EndDeviceIdentifiers {
    /// Application identifier
    pub application_id: String,
    /// Device identifier, unique within the application
    pub device_id: String,
    /// DevEUI
    pub dev_eui: Option<Eui64>,
    /// JoinEUI (AppEUI before 1.1)
    pub join_eui: Option<Eui64>,
    /// Current device address
    pub dev_addr: Option<DevAddr>,
}

impl EndDeviceIdentifiers {
    /// Identifiers with only application and device id set
    pub fn new(application_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    /// Unique identifier used as registry and task queue key
    pub fn uid(&self) -> String {
        format!("{}.{}", self.application_id, self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_addr_wire_order() {
        let addr: DevAddr = "26011BDA".parse().unwrap();
        assert_eq!(addr.to_le_bytes(), [0xDA, 0x1B, 0x01, 0x26]);
        assert_eq!(DevAddr::from_le_bytes([0xDA, 0x1B, 0x01, 0x26]), addr);
        assert_eq!(addr.to_string(), "26011BDA");
    }

    #[test]
    fn test_prefix_allocation() {
        let prefix: DevAddrPrefix = "26000000/7".parse().unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let addr = prefix.random_address(&mut rng);
            assert!(prefix.matches(addr));
            assert_eq!(addr.0[0] & 0xFE, 0x26);
        }
        assert!(!prefix.matches("48000000".parse().unwrap()));
    }

    #[test]
    fn test_invalid_prefix() {
        assert!("26000000".parse::<DevAddrPrefix>().is_err());
        assert!("26000000/40".parse::<DevAddrPrefix>().is_err());
    }
}
