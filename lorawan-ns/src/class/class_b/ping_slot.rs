//! Class B ping slots
//!
//! This module handles ping slot placement including:
//! - Pseudo-random ping offset per beacon period
//! - Ping period from the periodicity exponent
//! - Lookup of the next ping slot after a given time

use std::time::{Duration, SystemTime};

use super::beacon::BeaconPeriod;
use crate::config::device::{AesKey, DevAddr};
use crate::crypto::encrypt_block;

/// Length of a ping slot
pub const SLOT_LENGTH: Duration = Duration::from_millis(30);

/// Number of slots in the ping window of a beacon period
const SLOTS_PER_WINDOW: u32 = 4096;

/// Periodicity exponent (0..=7) to ping period in slots
pub fn ping_period(periodicity: u8) -> u32 {
    1 << (5 + periodicity.min(7))
}

/// Number of ping slots per beacon period
pub fn ping_nb(periodicity: u8) -> u32 {
    SLOTS_PER_WINDOW / ping_period(periodicity)
}

/// Pseudo-random ping offset of a device in a beacon period
///
/// `Rand = aes128_encrypt(0^16, BeaconTime | DevAddr | 0^8)` and the offset
/// is `(Rand[0] + Rand[1] * 256) mod pingPeriod`.
pub fn ping_offset(beacon_time: u32, dev_addr: DevAddr, ping_period: u32) -> u32 {
    let mut block = [0u8; 16];
    block[0..4].copy_from_slice(&beacon_time.to_le_bytes());
    block[4..8].copy_from_slice(&dev_addr.to_le_bytes());
    let rand = encrypt_block(&AesKey::default(), block);
    (rand[0] as u32 + rand[1] as u32 * 256) % ping_period
}

/// Start of ping slot `n` of `period`
fn slot_time(period: BeaconPeriod, offset: u32, ping_period: u32, n: u32) -> SystemTime {
    period.ping_window_start() + SLOT_LENGTH * (offset + n * ping_period)
}

/// First ping slot of the device starting at or after `after`
pub fn next_ping_slot(dev_addr: DevAddr, periodicity: u8, after: SystemTime) -> SystemTime {
    let period_len = ping_period(periodicity);
    let mut period = BeaconPeriod::containing(after);
    loop {
        let offset = ping_offset(period.beacon_time(), dev_addr, period_len);
        for n in 0..ping_nb(periodicity) {
            let t = slot_time(period, offset, period_len, n);
            if t >= after {
                return t;
            }
        }
        period = period.next();
    }
}

#[cfg(test)]
mod tests {
    use super::super::beacon::BEACON_PERIOD;
    use super::super::timing::from_gps;
    use super::*;

    #[test]
    fn test_ping_period() {
        assert_eq!(ping_period(0), 32);
        assert_eq!(ping_nb(0), 128);
        assert_eq!(ping_period(7), 4096);
        assert_eq!(ping_nb(7), 1);
    }

    #[test]
    fn test_offset_within_period() {
        let addr = DevAddr([0x26, 0x01, 0x1B, 0xDA]);
        for periodicity in 0..=7 {
            let p = ping_period(periodicity);
            assert!(ping_offset(123 * 128, addr, p) < p);
        }
    }

    #[test]
    fn test_next_ping_slot_is_after_and_aligned() {
        let addr = DevAddr([0x26, 0x01, 0x1B, 0xDA]);
        let start = from_gps(Duration::from_secs(128 * 10_000));
        let after = start + Duration::from_secs(60);
        let slot = next_ping_slot(addr, 3, after);
        assert!(slot >= after);
        let period = BeaconPeriod::containing(after);
        let offset = ping_offset(period.beacon_time(), addr, ping_period(3));
        let since_window = slot
            .duration_since(period.ping_window_start())
            .unwrap()
            .as_millis() as u32;
        assert_eq!(since_window % 30, 0);
        assert_eq!((since_window / 30 - offset) % ping_period(3), 0);
        assert!(slot < start + BEACON_PERIOD * 2);
    }

    #[test]
    fn test_next_ping_slot_rolls_over_to_next_period() {
        let addr = DevAddr([0x01, 0x02, 0x03, 0x04]);
        let start = from_gps(Duration::from_secs(128 * 20_000));
        // Periodicity 7 has a single slot per period.
        let first = next_ping_slot(addr, 7, start);
        let second = next_ping_slot(addr, 7, first + Duration::from_millis(1));
        assert!(second >= start + BEACON_PERIOD);
    }
}
