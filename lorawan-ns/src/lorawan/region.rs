//! Regional parameters
//!
//! A compact catalog of the bands the network server supports:
//! - EU868 (16 channels, 3 default)
//! - US915 (72 fixed channels, sub-band selected by the frequency plan)
//! - AS923 (RX1 data rate depends on the downlink dwell time)

use crate::error::{Error, Reason, Result};
use crate::lorawan::mac::PhyVersion;

/// Maximum FCnt gap accepted before LoRaWAN 1.0.4
pub const MAX_F_CNT_GAP: u32 = 16384;

/// Data rate definition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataRate {
    /// Spreading factor; 0 for FSK
    pub spreading_factor: u8,
    /// Bandwidth in Hz
    pub bandwidth: u32,
    /// Maximum MACPayload size without dwell time limitation
    pub max_mac_payload: u16,
    /// Maximum MACPayload size with 400 ms dwell time
    pub max_mac_payload_dwell: Option<u16>,
}

impl DataRate {
    const fn lora(sf: u8, bw: u32, m: u16, m_dwell: Option<u16>) -> Option<Self> {
        Some(Self {
            spreading_factor: sf,
            bandwidth: bw,
            max_mac_payload: m,
            max_mac_payload_dwell: m_dwell,
        })
    }

    /// Maximum MACPayload size for the given dwell time setting
    pub fn max_mac_payload(&self, dwell_time: bool) -> Option<u16> {
        if dwell_time {
            self.max_mac_payload_dwell
        } else {
            Some(self.max_mac_payload)
        }
    }

    /// Demodulation floor in dB
    pub fn required_snr(&self) -> f32 {
        match self.spreading_factor {
            7 => -7.5,
            8 => -10.0,
            9 => -12.5,
            10 => -15.0,
            11 => -17.5,
            12 => -20.0,
            _ => 0.0,
        }
    }
}

/// Uplink channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    /// Uplink frequency in Hz
    pub frequency: u64,
    /// Minimum data rate index
    pub min_data_rate_index: u8,
    /// Maximum data rate index
    pub max_data_rate_index: u8,
}

/// Band family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandId {
    /// EU 863-870 MHz
    Eu868,
    /// US 902-928 MHz
    Us915,
    /// AS 923 MHz
    As923,
}

/// Regional band parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Band {
    /// Band family
    pub id: BandId,
    /// Data rates indexed by DR
    pub data_rates: [Option<DataRate>; 16],
    /// Channels enabled by the frequency plan
    pub channels: Vec<Channel>,
    /// Maximum number of channels the band can address
    pub max_channels: usize,
    /// Default RX2 data rate index
    pub rx2_data_rate_index: u8,
    /// Default RX2 frequency in Hz
    pub rx2_frequency: u64,
    /// Default ping slot data rate index
    pub ping_slot_data_rate_index: u8,
    /// Fixed ping slot and beacon frequency; `None` when hopping
    pub ping_slot_frequency: Option<u64>,
    /// Highest data rate ADR may assign
    pub max_adr_data_rate_index: u8,
    /// Highest TX power index
    pub max_tx_power_index: u8,
    /// Default max EIRP in dBm
    pub default_max_eirp: f32,
    /// Whether TxParamSetupReq is implemented
    pub tx_param_setup_req_support: bool,
    /// Whether the RX1 data rate depends on the downlink dwell time
    pub rx1_data_rate_depends_on_dwell_time: bool,
}

impl Band {
    /// Band for a frequency plan identifier such as `EU_863_870` or
    /// `US_902_928_FSB_2`
    pub fn for_frequency_plan(id: &str, phy_version: PhyVersion) -> Result<Self> {
        let mut band = if id.starts_with("EU_863_870") {
            Self::eu868()
        } else if let Some(rest) = id.strip_prefix("US_902_928") {
            let sub_band = match rest.strip_prefix("_FSB_") {
                Some(n) => n.parse::<usize>().ok().filter(|n| (1..=8).contains(n)),
                None if rest.is_empty() => Some(2),
                None => None,
            }
            .ok_or_else(|| {
                Error::not_found(Reason::InvalidConfiguration, format!("unknown frequency plan `{id}`"))
            })?;
            Self::us915(sub_band)
        } else if id.starts_with("AS_923") {
            Self::as923()
        } else {
            return Err(Error::not_found(
                Reason::InvalidConfiguration,
                format!("unknown frequency plan `{id}`"),
            ));
        };
        if phy_version < PhyVersion::V1_0_2RevB {
            band.tx_param_setup_req_support = false;
        }
        Ok(band)
    }

    fn eu868() -> Self {
        let mut data_rates = [None; 16];
        data_rates[0] = DataRate::lora(12, 125_000, 59, None);
        data_rates[1] = DataRate::lora(11, 125_000, 59, None);
        data_rates[2] = DataRate::lora(10, 125_000, 59, None);
        data_rates[3] = DataRate::lora(9, 125_000, 123, None);
        data_rates[4] = DataRate::lora(8, 125_000, 230, None);
        data_rates[5] = DataRate::lora(7, 125_000, 230, None);
        data_rates[6] = DataRate::lora(7, 250_000, 230, None);
        data_rates[7] = DataRate::lora(0, 50_000, 230, None);
        Self {
            id: BandId::Eu868,
            data_rates,
            channels: [868_100_000, 868_300_000, 868_500_000]
                .iter()
                .map(|f| Channel {
                    frequency: *f,
                    min_data_rate_index: 0,
                    max_data_rate_index: 5,
                })
                .collect(),
            max_channels: 16,
            rx2_data_rate_index: 0,
            rx2_frequency: 869_525_000,
            ping_slot_data_rate_index: 3,
            ping_slot_frequency: Some(869_525_000),
            max_adr_data_rate_index: 5,
            max_tx_power_index: 7,
            default_max_eirp: 16.0,
            tx_param_setup_req_support: false,
            rx1_data_rate_depends_on_dwell_time: false,
        }
    }

    fn us915(sub_band: usize) -> Self {
        let mut data_rates = [None; 16];
        data_rates[0] = DataRate::lora(10, 125_000, 19, None);
        data_rates[1] = DataRate::lora(9, 125_000, 61, None);
        data_rates[2] = DataRate::lora(8, 125_000, 133, None);
        data_rates[3] = DataRate::lora(7, 125_000, 250, None);
        data_rates[4] = DataRate::lora(8, 500_000, 250, None);
        data_rates[8] = DataRate::lora(12, 500_000, 61, None);
        data_rates[9] = DataRate::lora(11, 500_000, 137, None);
        data_rates[10] = DataRate::lora(10, 500_000, 250, None);
        data_rates[11] = DataRate::lora(9, 500_000, 250, None);
        data_rates[12] = DataRate::lora(8, 500_000, 250, None);
        data_rates[13] = DataRate::lora(7, 500_000, 250, None);
        let first = (sub_band - 1) * 8;
        let mut channels: Vec<Channel> = (first..first + 8)
            .map(|i| Channel {
                frequency: 902_300_000 + i as u64 * 200_000,
                min_data_rate_index: 0,
                max_data_rate_index: 3,
            })
            .collect();
        channels.push(Channel {
            frequency: 903_000_000 + (sub_band as u64 - 1) * 1_600_000,
            min_data_rate_index: 4,
            max_data_rate_index: 4,
        });
        Self {
            id: BandId::Us915,
            data_rates,
            channels,
            max_channels: 72,
            rx2_data_rate_index: 8,
            rx2_frequency: 923_300_000,
            ping_slot_data_rate_index: 8,
            ping_slot_frequency: None,
            max_adr_data_rate_index: 3,
            max_tx_power_index: 14,
            default_max_eirp: 30.0,
            tx_param_setup_req_support: false,
            rx1_data_rate_depends_on_dwell_time: false,
        }
    }

    fn as923() -> Self {
        let mut data_rates = [None; 16];
        data_rates[0] = DataRate::lora(12, 125_000, 59, None);
        data_rates[1] = DataRate::lora(11, 125_000, 59, None);
        data_rates[2] = DataRate::lora(10, 125_000, 123, Some(19));
        data_rates[3] = DataRate::lora(9, 125_000, 123, Some(61));
        data_rates[4] = DataRate::lora(8, 125_000, 250, Some(133));
        data_rates[5] = DataRate::lora(7, 125_000, 250, Some(250));
        data_rates[6] = DataRate::lora(7, 250_000, 250, Some(250));
        data_rates[7] = DataRate::lora(0, 50_000, 250, Some(250));
        Self {
            id: BandId::As923,
            data_rates,
            channels: [923_200_000, 923_400_000]
                .iter()
                .map(|f| Channel {
                    frequency: *f,
                    min_data_rate_index: 0,
                    max_data_rate_index: 5,
                })
                .collect(),
            max_channels: 16,
            rx2_data_rate_index: 2,
            rx2_frequency: 923_200_000,
            ping_slot_data_rate_index: 3,
            ping_slot_frequency: Some(923_400_000),
            max_adr_data_rate_index: 5,
            max_tx_power_index: 7,
            default_max_eirp: 16.0,
            tx_param_setup_req_support: true,
            rx1_data_rate_depends_on_dwell_time: true,
        }
    }

    /// Data rate by index
    pub fn data_rate(&self, index: u8) -> Result<&DataRate> {
        self.data_rates
            .get(index as usize)
            .and_then(|dr| dr.as_ref())
            .ok_or_else(|| {
                Error::invalid_argument(Reason::InvalidDataRate, format!("data rate {index} not defined"))
            })
    }

    /// Maximum MACPayload size of a data rate, if transmissions are possible
    pub fn max_mac_payload(&self, index: u8, dwell_time: bool) -> Option<u16> {
        self.data_rate(index).ok()?.max_mac_payload(dwell_time)
    }

    /// RX1 downlink data rate for an uplink data rate and offset
    pub fn rx1_data_rate(&self, uplink_index: u8, offset: u8, dwell_time: bool) -> Result<u8> {
        let up = uplink_index as i32;
        let dr = match self.id {
            BandId::Eu868 => {
                if offset > 5 {
                    return Err(Error::invalid_argument(
                        Reason::InvalidDataRate,
                        format!("RX1 data rate offset {offset} out of range"),
                    ));
                }
                (up - offset as i32).max(0)
            }
            BandId::Us915 => {
                if uplink_index > 4 || offset > 3 {
                    return Err(Error::invalid_argument(
                        Reason::InvalidDataRate,
                        format!("no RX1 data rate for DR{uplink_index} offset {offset}"),
                    ));
                }
                (10 + up - offset as i32).clamp(8, 13)
            }
            BandId::As923 => {
                let effective = match offset {
                    0..=5 => offset as i32,
                    6 => -1,
                    7 => -2,
                    _ => {
                        return Err(Error::invalid_argument(
                            Reason::InvalidDataRate,
                            format!("RX1 data rate offset {offset} out of range"),
                        ))
                    }
                };
                let min = if dwell_time { 2 } else { 0 };
                (up - effective).clamp(min, 5)
            }
        };
        Ok(dr as u8)
    }

    /// RX1 downlink frequency for an uplink frequency
    pub fn rx1_frequency(&self, uplink_frequency: u64) -> Result<u64> {
        match self.id {
            BandId::Us915 => {
                let index = self.uplink_channel_index(uplink_frequency)?;
                Ok(923_300_000 + (index as u64 % 8) * 600_000)
            }
            _ => Ok(uplink_frequency),
        }
    }

    /// Global channel index of an uplink frequency in fixed-channel bands
    fn uplink_channel_index(&self, frequency: u64) -> Result<usize> {
        let invalid = || {
            Error::invalid_argument(Reason::Decode, format!("frequency {frequency} is not an uplink channel"))
        };
        if (902_300_000..=914_900_000).contains(&frequency) && (frequency - 902_300_000) % 200_000 == 0 {
            Ok(((frequency - 902_300_000) / 200_000) as usize)
        } else if (903_000_000..=914_200_000).contains(&frequency)
            && (frequency - 903_000_000) % 1_600_000 == 0
        {
            Ok(64 + ((frequency - 903_000_000) / 1_600_000) as usize)
        } else {
            Err(invalid())
        }
    }

    /// Whether the band uses a fixed channel plan (no NewChannelReq)
    pub fn has_fixed_channels(&self) -> bool {
        self.id == BandId::Us915
    }

    /// Default channel enablement mask over `max_channels`
    pub fn default_channel_mask(&self) -> Vec<bool> {
        let mut mask = vec![false; self.max_channels];
        match self.id {
            BandId::Us915 => {
                for ch in &self.channels {
                    if let Ok(i) = self.uplink_channel_index(ch.frequency) {
                        mask[i] = true;
                    }
                }
            }
            _ => {
                for m in mask.iter_mut().take(self.channels.len()) {
                    *m = true;
                }
            }
        }
        mask
    }

    /// Split a channel enablement mask into LinkADRReq `(ChMaskCntl, ChMask)`
    /// blocks
    pub fn link_adr_masks(&self, enabled: &[bool]) -> Vec<(u8, [bool; 16])> {
        let block = |from: usize| {
            let mut m = [false; 16];
            for (i, on) in m.iter_mut().enumerate() {
                *on = enabled.get(from + i).copied().unwrap_or(false);
            }
            m
        };
        if self.max_channels <= 16 {
            return vec![(0, block(0))];
        }
        let mut wide = [false; 16];
        for (i, on) in wide.iter_mut().enumerate().take(8) {
            *on = enabled.get(64 + i).copied().unwrap_or(false);
        }
        if enabled.iter().take(64).all(|on| *on) {
            return vec![(6, wide)];
        }
        // ChMaskCntl 7 disables all 125 kHz channels, then enable the needed blocks.
        let mut blocks = vec![(7, wide)];
        for cntl in 0..4u8 {
            let m = block(cntl as usize * 16);
            if m.iter().any(|on| *on) {
                blocks.push((cntl, m));
            }
        }
        blocks
    }

    /// Ping slot frequency for a beacon period
    pub fn ping_slot_frequency(&self, dev_addr: u32, beacon_time_secs: u64) -> u64 {
        match self.ping_slot_frequency {
            Some(f) => f,
            None => {
                let ch = (dev_addr as u64 + beacon_time_secs / 128) % 8;
                923_300_000 + ch * 600_000
            }
        }
    }

    /// CFList sent in join-accepts
    pub fn cf_list(&self) -> Option<Vec<u8>> {
        match self.id {
            BandId::Us915 => {
                let mask = self.default_channel_mask();
                let mut out = Vec::with_capacity(16);
                for chunk in mask.chunks(16) {
                    let v = chunk
                        .iter()
                        .enumerate()
                        .fold(0u16, |acc, (i, on)| if *on { acc | 1 << i } else { acc });
                    out.extend_from_slice(&v.to_le_bytes());
                }
                out.resize(15, 0);
                out.push(0x01);
                Some(out)
            }
            _ => {
                let defaults = match self.id {
                    BandId::Eu868 => 3,
                    _ => 2,
                };
                if self.channels.len() <= defaults {
                    return None;
                }
                let mut out = Vec::with_capacity(16);
                for ch in self.channels.iter().skip(defaults).take(5) {
                    let v = (ch.frequency / 100) as u32;
                    out.extend_from_slice(&v.to_le_bytes()[..3]);
                }
                out.resize(15, 0);
                out.push(0x00);
                Some(out)
            }
        }
    }
}
