use std::time::Duration;

use crate::device::DeviceClass;

/// MAC command identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cid {
    /// ResetInd / ResetConf
    Reset = 0x01,
    /// LinkCheckReq / LinkCheckAns
    LinkCheck = 0x02,
    /// LinkADRReq / LinkADRAns
    LinkAdr = 0x03,
    /// DutyCycleReq / DutyCycleAns
    DutyCycle = 0x04,
    /// RxParamSetupReq / RxParamSetupAns
    RxParamSetup = 0x05,
    /// DevStatusReq / DevStatusAns
    DevStatus = 0x06,
    /// NewChannelReq / NewChannelAns
    NewChannel = 0x07,
    /// RxTimingSetupReq / RxTimingSetupAns
    RxTimingSetup = 0x08,
    /// TxParamSetupReq / TxParamSetupAns
    TxParamSetup = 0x09,
    /// DlChannelReq / DlChannelAns
    DlChannel = 0x0A,
    /// RekeyInd / RekeyConf
    Rekey = 0x0B,
    /// ADRParamSetupReq / ADRParamSetupAns
    AdrParamSetup = 0x0C,
    /// DeviceTimeReq / DeviceTimeAns
    DeviceTime = 0x0D,
    /// ForceRejoinReq
    ForceRejoin = 0x0E,
    /// RejoinParamSetupReq / RejoinParamSetupAns
    RejoinParamSetup = 0x0F,
    /// PingSlotInfoReq / PingSlotInfoAns
    PingSlotInfo = 0x10,
    /// PingSlotChannelReq / PingSlotChannelAns
    PingSlotChannel = 0x11,
    /// BeaconTimingReq / BeaconTimingAns (deprecated)
    BeaconTiming = 0x12,
    /// BeaconFreqReq / BeaconFreqAns
    BeaconFreq = 0x13,
    /// DeviceModeInd / DeviceModeConf
    DeviceMode = 0x20,
}

impl Cid {
    /// Look up a CID
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => Cid::Reset,
            0x02 => Cid::LinkCheck,
            0x03 => Cid::LinkAdr,
            0x04 => Cid::DutyCycle,
            0x05 => Cid::RxParamSetup,
            0x06 => Cid::DevStatus,
            0x07 => Cid::NewChannel,
            0x08 => Cid::RxTimingSetup,
            0x09 => Cid::TxParamSetup,
            0x0A => Cid::DlChannel,
            0x0B => Cid::Rekey,
            0x0C => Cid::AdrParamSetup,
            0x0D => Cid::DeviceTime,
            0x0E => Cid::ForceRejoin,
            0x0F => Cid::RejoinParamSetup,
            0x10 => Cid::PingSlotInfo,
            0x11 => Cid::PingSlotChannel,
            0x12 => Cid::BeaconTiming,
            0x13 => Cid::BeaconFreq,
            0x20 => Cid::DeviceMode,
            _ => return None,
        })
    }

    /// Payload length of the uplink command, if the device may send it
    pub fn uplink_len(&self) -> Option<usize> {
        Some(match self {
            Cid::Reset => 1,
            Cid::LinkCheck => 0,
            Cid::LinkAdr => 1,
            Cid::DutyCycle => 0,
            Cid::RxParamSetup => 1,
            Cid::DevStatus => 2,
            Cid::NewChannel => 1,
            Cid::RxTimingSetup => 0,
            Cid::TxParamSetup => 0,
            Cid::DlChannel => 1,
            Cid::Rekey => 1,
            Cid::AdrParamSetup => 0,
            Cid::DeviceTime => 0,
            Cid::RejoinParamSetup => 1,
            Cid::PingSlotInfo => 1,
            Cid::PingSlotChannel => 1,
            Cid::BeaconFreq => 1,
            Cid::DeviceMode => 1,
            Cid::ForceRejoin | Cid::BeaconTiming => return None,
        })
    }

    /// Payload length of the downlink command
    pub fn downlink_len(&self) -> usize {
        match self {
            Cid::Reset => 1,
            Cid::LinkCheck => 2,
            Cid::LinkAdr => 4,
            Cid::DutyCycle => 1,
            Cid::RxParamSetup => 4,
            Cid::DevStatus => 0,
            Cid::NewChannel => 5,
            Cid::RxTimingSetup => 1,
            Cid::TxParamSetup => 1,
            Cid::DlChannel => 4,
            Cid::Rekey => 1,
            Cid::AdrParamSetup => 1,
            Cid::DeviceTime => 5,
            Cid::ForceRejoin => 2,
            Cid::RejoinParamSetup => 1,
            Cid::PingSlotInfo => 0,
            Cid::PingSlotChannel => 4,
            Cid::BeaconTiming => 3,
            Cid::BeaconFreq => 3,
            Cid::DeviceMode => 1,
        }
    }
}

/// MAC command, in either direction
#[derive(Debug, Clone, PartialEq)]
pub enum MacCommand {
    // Uplink
    /// ResetInd
    ResetInd {
        /// LoRaWAN minor version of the device
        minor: u8,
    },
    /// LinkCheckReq
    LinkCheckReq,
    /// LinkADRAns
    LinkAdrAns {
        /// Power ACK
        power_ack: bool,
        /// Data rate ACK
        data_rate_ack: bool,
        /// Channel mask ACK
        channel_mask_ack: bool,
    },
    /// DutyCycleAns
    DutyCycleAns,
    /// RxParamSetupAns
    RxParamSetupAns {
        /// RX1 data rate offset ACK
        rx1_data_rate_offset_ack: bool,
        /// RX2 data rate ACK
        rx2_data_rate_index_ack: bool,
        /// RX2 frequency ACK
        rx2_frequency_ack: bool,
    },
    /// DevStatusAns
    DevStatusAns {
        /// Battery level (0 = external power, 1-254 = level, 255 = unknown)
        battery: u8,
        /// Demodulation margin in dB (-32..=31)
        margin: i8,
    },
    /// NewChannelAns
    NewChannelAns {
        /// Frequency ACK
        frequency_ack: bool,
        /// Data rate range ACK
        data_rate_ack: bool,
    },
    /// RxTimingSetupAns
    RxTimingSetupAns,
    /// TxParamSetupAns
    TxParamSetupAns,
    /// DlChannelAns
    DlChannelAns {
        /// Uplink frequency exists
        channel_index_ack: bool,
        /// Frequency ACK
        frequency_ack: bool,
    },
    /// RekeyInd
    RekeyInd {
        /// LoRaWAN minor version of the device
        minor: u8,
    },
    /// ADRParamSetupAns
    AdrParamSetupAns,
    /// DeviceTimeReq
    DeviceTimeReq,
    /// RejoinParamSetupAns
    RejoinParamSetupAns {
        /// Max time exponent ACK
        max_time_exponent_ack: bool,
    },
    /// PingSlotInfoReq
    PingSlotInfoReq {
        /// Ping slot periodicity (0..=7)
        periodicity: u8,
    },
    /// PingSlotChannelAns
    PingSlotChannelAns {
        /// Data rate ACK
        data_rate_index_ack: bool,
        /// Frequency ACK
        frequency_ack: bool,
    },
    /// BeaconFreqAns
    BeaconFreqAns {
        /// Frequency ACK
        frequency_ack: bool,
    },
    /// DeviceModeInd
    DeviceModeInd {
        /// Class requested by the device
        class: DeviceClass,
    },

    // Downlink
    /// ResetConf
    ResetConf {
        /// LoRaWAN minor version of the network
        minor: u8,
    },
    /// LinkCheckAns
    LinkCheckAns {
        /// Link margin in dB
        margin: u8,
        /// Number of gateways that received the request
        gateway_count: u8,
    },
    /// LinkADRReq
    LinkAdrReq {
        /// Data rate index
        data_rate_index: u8,
        /// TX power index
        tx_power_index: u8,
        /// Channel mask
        channel_mask: [bool; 16],
        /// Channel mask control
        channel_mask_control: u8,
        /// Number of transmissions
        nb_trans: u8,
    },
    /// DutyCycleReq
    DutyCycleReq {
        /// Aggregated duty cycle exponent
        max_duty_cycle: u8,
    },
    /// RxParamSetupReq
    RxParamSetupReq {
        /// RX1 data rate offset
        rx1_data_rate_offset: u8,
        /// RX2 data rate index
        rx2_data_rate_index: u8,
        /// RX2 frequency in Hz
        rx2_frequency: u64,
    },
    /// DevStatusReq
    DevStatusReq,
    /// NewChannelReq
    NewChannelReq {
        /// Channel index
        channel_index: u8,
        /// Frequency in Hz; 0 disables the channel
        frequency: u64,
        /// Minimum data rate index
        min_data_rate_index: u8,
        /// Maximum data rate index
        max_data_rate_index: u8,
    },
    /// RxTimingSetupReq
    RxTimingSetupReq {
        /// RX1 delay in seconds
        delay: u8,
    },
    /// TxParamSetupReq
    TxParamSetupReq {
        /// Max EIRP index
        max_eirp_index: u8,
        /// Uplink dwell time limited to 400 ms
        uplink_dwell_time: bool,
        /// Downlink dwell time limited to 400 ms
        downlink_dwell_time: bool,
    },
    /// DlChannelReq
    DlChannelReq {
        /// Channel index
        channel_index: u8,
        /// Downlink frequency in Hz
        frequency: u64,
    },
    /// RekeyConf
    RekeyConf {
        /// LoRaWAN minor version of the network
        minor: u8,
    },
    /// ADRParamSetupReq
    AdrParamSetupReq {
        /// ADR_ACK_LIMIT exponent
        adr_ack_limit_exponent: u8,
        /// ADR_ACK_DELAY exponent
        adr_ack_delay_exponent: u8,
    },
    /// DeviceTimeAns
    DeviceTimeAns {
        /// Time since the GPS epoch
        gps_time: Duration,
    },
    /// ForceRejoinReq
    ForceRejoinReq {
        /// Rejoin type
        rejoin_type: u8,
        /// Data rate index
        data_rate_index: u8,
        /// Maximum number of retries
        max_retries: u8,
        /// Period exponent
        period_exponent: u8,
    },
    /// RejoinParamSetupReq
    RejoinParamSetupReq {
        /// Max time exponent
        max_time_exponent: u8,
        /// Max count exponent
        max_count_exponent: u8,
    },
    /// PingSlotInfoAns
    PingSlotInfoAns,
    /// PingSlotChannelReq
    PingSlotChannelReq {
        /// Ping slot frequency in Hz
        frequency: u64,
        /// Ping slot data rate index
        data_rate_index: u8,
    },
    /// BeaconFreqReq
    BeaconFreqReq {
        /// Beacon frequency in Hz
        frequency: u64,
    },
    /// DeviceModeConf
    DeviceModeConf {
        /// Class confirmed by the network
        class: DeviceClass,
    },

    /// Proprietary command (CID 0x80..=0xFF) with opaque payload
    Proprietary {
        /// Command identifier
        cid: u8,
        /// Raw payload
        payload: Vec<u8>,
    },
}

/// Frequencies are encoded as 24-bit little-endian multiples of 100 Hz.
fn put_frequency(out: &mut Vec<u8>, hz: u64) {
    let v = (hz / 100) as u32;
    out.extend_from_slice(&v.to_le_bytes()[..3]);
}

fn get_frequency(b: &[u8]) -> u64 {
    u32::from_le_bytes([b[0], b[1], b[2], 0]) as u64 * 100
}

fn class_to_byte(class: DeviceClass) -> u8 {
    match class {
        DeviceClass::A => 0,
        DeviceClass::B => 1,
        DeviceClass::C => 2,
    }
}

fn bit(b: u8, n: u8) -> bool {
    b & (1 << n) != 0
}

impl MacCommand {
    /// Command identifier
    pub fn cid(&self) -> Option<Cid> {
        use MacCommand::*;
        Some(match self {
            ResetInd { .. } | ResetConf { .. } => Cid::Reset,
            LinkCheckReq | LinkCheckAns { .. } => Cid::LinkCheck,
            LinkAdrAns { .. } | LinkAdrReq { .. } => Cid::LinkAdr,
            DutyCycleAns | DutyCycleReq { .. } => Cid::DutyCycle,
            RxParamSetupAns { .. } | RxParamSetupReq { .. } => Cid::RxParamSetup,
            DevStatusAns { .. } | DevStatusReq => Cid::DevStatus,
            NewChannelAns { .. } | NewChannelReq { .. } => Cid::NewChannel,
            RxTimingSetupAns | RxTimingSetupReq { .. } => Cid::RxTimingSetup,
            TxParamSetupAns | TxParamSetupReq { .. } => Cid::TxParamSetup,
            DlChannelAns { .. } | DlChannelReq { .. } => Cid::DlChannel,
            RekeyInd { .. } | RekeyConf { .. } => Cid::Rekey,
            AdrParamSetupAns | AdrParamSetupReq { .. } => Cid::AdrParamSetup,
            DeviceTimeReq | DeviceTimeAns { .. } => Cid::DeviceTime,
            ForceRejoinReq { .. } => Cid::ForceRejoin,
            RejoinParamSetupAns { .. } | RejoinParamSetupReq { .. } => Cid::RejoinParamSetup,
            PingSlotInfoReq { .. } | PingSlotInfoAns => Cid::PingSlotInfo,
            PingSlotChannelAns { .. } | PingSlotChannelReq { .. } => Cid::PingSlotChannel,
            BeaconFreqAns { .. } | BeaconFreqReq { .. } => Cid::BeaconFreq,
            DeviceModeInd { .. } | DeviceModeConf { .. } => Cid::DeviceMode,
            Proprietary { .. } => return None,
        })
    }

    /// Encoded length including the CID byte
    pub fn encoded_len(&self) -> usize {
        match self {
            MacCommand::Proprietary { payload, .. } => 1 + payload.len(),
            cmd if cmd.is_uplink() => 1 + cmd.cid().and_then(|c| c.uplink_len()).unwrap_or(0),
            cmd => 1 + cmd.cid().map(|c| c.downlink_len()).unwrap_or(0),
        }
    }

    /// Whether this command is sent by the device
    pub fn is_uplink(&self) -> bool {
        use MacCommand::*;
        matches!(
            self,
            ResetInd { .. }
                | LinkCheckReq
                | LinkAdrAns { .. }
                | DutyCycleAns
                | RxParamSetupAns { .. }
                | DevStatusAns { .. }
                | NewChannelAns { .. }
                | RxTimingSetupAns
                | TxParamSetupAns
                | DlChannelAns { .. }
                | RekeyInd { .. }
                | AdrParamSetupAns
                | DeviceTimeReq
                | RejoinParamSetupAns { .. }
                | PingSlotInfoReq { .. }
                | PingSlotChannelAns { .. }
                | BeaconFreqAns { .. }
                | DeviceModeInd { .. }
        )
    }

    /// Append the wire encoding to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        use MacCommand::*;
        match self {
            Proprietary { cid, payload } => {
                out.push(*cid);
                out.extend_from_slice(payload);
                return;
            }
            cmd => {
                if let Some(cid) = cmd.cid() {
                    out.push(cid as u8);
                }
            }
        }
        match self {
            ResetInd { minor } | ResetConf { minor } | RekeyInd { minor } | RekeyConf { minor } => {
                out.push(minor & 0x0F)
            }
            LinkAdrAns {
                power_ack,
                data_rate_ack,
                channel_mask_ack,
            } => out.push(
                (*power_ack as u8) << 2 | (*data_rate_ack as u8) << 1 | *channel_mask_ack as u8,
            ),
            RxParamSetupAns {
                rx1_data_rate_offset_ack,
                rx2_data_rate_index_ack,
                rx2_frequency_ack,
            } => out.push(
                (*rx1_data_rate_offset_ack as u8) << 2
                    | (*rx2_data_rate_index_ack as u8) << 1
                    | *rx2_frequency_ack as u8,
            ),
            DevStatusAns { battery, margin } => {
                out.push(*battery);
                out.push((*margin as u8) & 0x3F);
            }
            NewChannelAns {
                frequency_ack,
                data_rate_ack,
            } => out.push((*data_rate_ack as u8) << 1 | *frequency_ack as u8),
            DlChannelAns {
                channel_index_ack,
                frequency_ack,
            } => out.push((*channel_index_ack as u8) << 1 | *frequency_ack as u8),
            RejoinParamSetupAns {
                max_time_exponent_ack,
            } => out.push(*max_time_exponent_ack as u8),
            PingSlotInfoReq { periodicity } => out.push(periodicity & 0x07),
            PingSlotChannelAns {
                data_rate_index_ack,
                frequency_ack,
            } => out.push((*data_rate_index_ack as u8) << 1 | *frequency_ack as u8),
            BeaconFreqAns { frequency_ack } => out.push(*frequency_ack as u8),
            DeviceModeInd { class } | DeviceModeConf { class } => out.push(class_to_byte(*class)),
            LinkCheckAns {
                margin,
                gateway_count,
            } => {
                out.push(*margin);
                out.push(*gateway_count);
            }
            LinkAdrReq {
                data_rate_index,
                tx_power_index,
                channel_mask,
                channel_mask_control,
                nb_trans,
            } => {
                out.push((data_rate_index & 0x0F) << 4 | (tx_power_index & 0x0F));
                let mask = channel_mask
                    .iter()
                    .enumerate()
                    .fold(0u16, |acc, (i, on)| if *on { acc | 1 << i } else { acc });
                out.extend_from_slice(&mask.to_le_bytes());
                out.push((channel_mask_control & 0x07) << 4 | (nb_trans & 0x0F));
            }
            DutyCycleReq { max_duty_cycle } => out.push(max_duty_cycle & 0x0F),
            RxParamSetupReq {
                rx1_data_rate_offset,
                rx2_data_rate_index,
                rx2_frequency,
            } => {
                out.push((rx1_data_rate_offset & 0x07) << 4 | (rx2_data_rate_index & 0x0F));
                put_frequency(out, *rx2_frequency);
            }
            NewChannelReq {
                channel_index,
                frequency,
                min_data_rate_index,
                max_data_rate_index,
            } => {
                out.push(*channel_index);
                put_frequency(out, *frequency);
                out.push((max_data_rate_index & 0x0F) << 4 | (min_data_rate_index & 0x0F));
            }
            RxTimingSetupReq { delay } => out.push(delay & 0x0F),
            TxParamSetupReq {
                max_eirp_index,
                uplink_dwell_time,
                downlink_dwell_time,
            } => out.push(
                (*downlink_dwell_time as u8) << 5
                    | (*uplink_dwell_time as u8) << 4
                    | (max_eirp_index & 0x0F),
            ),
            DlChannelReq {
                channel_index,
                frequency,
            } => {
                out.push(*channel_index);
                put_frequency(out, *frequency);
            }
            AdrParamSetupReq {
                adr_ack_limit_exponent,
                adr_ack_delay_exponent,
            } => out.push((adr_ack_limit_exponent & 0x0F) << 4 | (adr_ack_delay_exponent & 0x0F)),
            DeviceTimeAns { gps_time } => {
                out.extend_from_slice(&(gps_time.as_secs() as u32).to_le_bytes());
                out.push(((gps_time.subsec_nanos() as u64 * 256) / 1_000_000_000) as u8);
            }
            ForceRejoinReq {
                rejoin_type,
                data_rate_index,
                max_retries,
                period_exponent,
            } => {
                let v: u16 = ((*period_exponent as u16 & 0x07) << 11)
                    | ((*max_retries as u16 & 0x07) << 8)
                    | ((*rejoin_type as u16 & 0x07) << 4)
                    | (*data_rate_index as u16 & 0x0F);
                out.extend_from_slice(&v.to_le_bytes());
            }
            RejoinParamSetupReq {
                max_time_exponent,
                max_count_exponent,
            } => out.push((max_time_exponent & 0x0F) << 4 | (max_count_exponent & 0x0F)),
            PingSlotChannelReq {
                frequency,
                data_rate_index,
            } => {
                put_frequency(out, *frequency);
                out.push(data_rate_index & 0x0F);
            }
            BeaconFreqReq { frequency } => put_frequency(out, *frequency),
            LinkCheckReq | DutyCycleAns | RxTimingSetupAns | TxParamSetupAns | AdrParamSetupAns
            | DeviceTimeReq | DevStatusReq | PingSlotInfoAns | Proprietary { .. } => {}
        }
    }

    fn decode_uplink(cid: Cid, p: &[u8]) -> Option<Self> {
        use MacCommand::*;
        Some(match cid {
            Cid::Reset => ResetInd { minor: p[0] & 0x0F },
            Cid::LinkCheck => LinkCheckReq,
            Cid::LinkAdr => LinkAdrAns {
                power_ack: bit(p[0], 2),
                data_rate_ack: bit(p[0], 1),
                channel_mask_ack: bit(p[0], 0),
            },
            Cid::DutyCycle => DutyCycleAns,
            Cid::RxParamSetup => RxParamSetupAns {
                rx1_data_rate_offset_ack: bit(p[0], 2),
                rx2_data_rate_index_ack: bit(p[0], 1),
                rx2_frequency_ack: bit(p[0], 0),
            },
            Cid::DevStatus => DevStatusAns {
                battery: p[0],
                // 6-bit two's complement
                margin: ((p[1] << 2) as i8) >> 2,
            },
            Cid::NewChannel => NewChannelAns {
                data_rate_ack: bit(p[0], 1),
                frequency_ack: bit(p[0], 0),
            },
            Cid::RxTimingSetup => RxTimingSetupAns,
            Cid::TxParamSetup => TxParamSetupAns,
            Cid::DlChannel => DlChannelAns {
                channel_index_ack: bit(p[0], 1),
                frequency_ack: bit(p[0], 0),
            },
            Cid::Rekey => RekeyInd { minor: p[0] & 0x0F },
            Cid::AdrParamSetup => AdrParamSetupAns,
            Cid::DeviceTime => DeviceTimeReq,
            Cid::RejoinParamSetup => RejoinParamSetupAns {
                max_time_exponent_ack: bit(p[0], 0),
            },
            Cid::PingSlotInfo => PingSlotInfoReq {
                periodicity: p[0] & 0x07,
            },
            Cid::PingSlotChannel => PingSlotChannelAns {
                data_rate_index_ack: bit(p[0], 1),
                frequency_ack: bit(p[0], 0),
            },
            Cid::BeaconFreq => BeaconFreqAns {
                frequency_ack: bit(p[0], 0),
            },
            Cid::DeviceMode => DeviceModeInd {
                class: match p[0] {
                    0 => DeviceClass::A,
                    2 => DeviceClass::C,
                    _ => return None,
                },
            },
            Cid::ForceRejoin | Cid::BeaconTiming => return None,
        })
    }

    fn decode_downlink(cid: Cid, p: &[u8]) -> Option<Self> {
        use MacCommand::*;
        Some(match cid {
            Cid::Reset => ResetConf { minor: p[0] & 0x0F },
            Cid::LinkCheck => LinkCheckAns {
                margin: p[0],
                gateway_count: p[1],
            },
            Cid::LinkAdr => {
                let mask = u16::from_le_bytes([p[1], p[2]]);
                let mut channel_mask = [false; 16];
                for (i, on) in channel_mask.iter_mut().enumerate() {
                    *on = mask & (1 << i) != 0;
                }
                LinkAdrReq {
                    data_rate_index: p[0] >> 4,
                    tx_power_index: p[0] & 0x0F,
                    channel_mask,
                    channel_mask_control: (p[3] >> 4) & 0x07,
                    nb_trans: p[3] & 0x0F,
                }
            }
            Cid::DutyCycle => DutyCycleReq {
                max_duty_cycle: p[0] & 0x0F,
            },
            Cid::RxParamSetup => RxParamSetupReq {
                rx1_data_rate_offset: (p[0] >> 4) & 0x07,
                rx2_data_rate_index: p[0] & 0x0F,
                rx2_frequency: get_frequency(&p[1..4]),
            },
            Cid::DevStatus => DevStatusReq,
            Cid::NewChannel => NewChannelReq {
                channel_index: p[0],
                frequency: get_frequency(&p[1..4]),
                max_data_rate_index: p[4] >> 4,
                min_data_rate_index: p[4] & 0x0F,
            },
            Cid::RxTimingSetup => RxTimingSetupReq { delay: p[0] & 0x0F },
            Cid::TxParamSetup => TxParamSetupReq {
                downlink_dwell_time: bit(p[0], 5),
                uplink_dwell_time: bit(p[0], 4),
                max_eirp_index: p[0] & 0x0F,
            },
            Cid::DlChannel => DlChannelReq {
                channel_index: p[0],
                frequency: get_frequency(&p[1..4]),
            },
            Cid::Rekey => RekeyConf { minor: p[0] & 0x0F },
            Cid::AdrParamSetup => AdrParamSetupReq {
                adr_ack_limit_exponent: p[0] >> 4,
                adr_ack_delay_exponent: p[0] & 0x0F,
            },
            Cid::DeviceTime => {
                let secs = u32::from_le_bytes([p[0], p[1], p[2], p[3]]) as u64;
                let nanos = (p[4] as u64 * 1_000_000_000) / 256;
                DeviceTimeAns {
                    gps_time: Duration::from_secs(secs) + Duration::from_nanos(nanos),
                }
            }
            Cid::ForceRejoin => {
                let v = u16::from_le_bytes([p[0], p[1]]);
                ForceRejoinReq {
                    period_exponent: ((v >> 11) & 0x07) as u8,
                    max_retries: ((v >> 8) & 0x07) as u8,
                    rejoin_type: ((v >> 4) & 0x07) as u8,
                    data_rate_index: (v & 0x0F) as u8,
                }
            }
            Cid::RejoinParamSetup => RejoinParamSetupReq {
                max_time_exponent: p[0] >> 4,
                max_count_exponent: p[0] & 0x0F,
            },
            Cid::PingSlotInfo => PingSlotInfoAns,
            Cid::PingSlotChannel => PingSlotChannelReq {
                frequency: get_frequency(&p[..3]),
                data_rate_index: p[3] & 0x0F,
            },
            Cid::BeaconFreq => BeaconFreqReq {
                frequency: get_frequency(&p[..3]),
            },
            Cid::DeviceMode => DeviceModeConf {
                class: match p[0] {
                    0 => DeviceClass::A,
                    1 => DeviceClass::B,
                    2 => DeviceClass::C,
                    _ => return None,
                },
            },
            Cid::BeaconTiming => return None,
        })
    }
}

/// Result of parsing a MAC command buffer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedCommands {
    /// Commands decoded before the first failure
    pub commands: Vec<MacCommand>,
    /// CID of the command that could not be decoded, if any
    pub failed_cid: Option<u8>,
}

fn parse(mut buf: &[u8], uplink: bool) -> ParsedCommands {
    let mut parsed = ParsedCommands::default();
    while let Some((&cid_byte, rest)) = buf.split_first() {
        let cmd = Cid::from_u8(cid_byte).and_then(|cid| {
            let len = if uplink {
                cid.uplink_len()?
            } else {
                cid.downlink_len()
            };
            let payload = rest.get(..len)?;
            let cmd = if uplink {
                MacCommand::decode_uplink(cid, payload)?
            } else {
                MacCommand::decode_downlink(cid, payload)?
            };
            Some((cmd, len))
        });
        match cmd {
            Some((cmd, len)) => {
                parsed.commands.push(cmd);
                buf = &rest[len..];
            }
            None => {
                parsed.failed_cid = Some(cid_byte);
                break;
            }
        }
    }
    parsed
}

/// Parse device-originated MAC commands, stopping at the first unreadable one
pub fn parse_uplink(buf: &[u8]) -> ParsedCommands {
    parse(buf, true)
}

/// Parse network-originated MAC commands, stopping at the first unreadable one
pub fn parse_downlink(buf: &[u8]) -> ParsedCommands {
    parse(buf, false)
}

/// Encode a command list
pub fn encode_all(cmds: &[MacCommand]) -> Vec<u8> {
    let mut out = Vec::with_capacity(cmds.iter().map(|c| c.encoded_len()).sum());
    for cmd in cmds {
        cmd.encode(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uplink_commands() {
        let buf = [0x02, 0x03, 0x07, 0x06, 0xFF, 0x3E, 0x0D];
        let parsed = parse_uplink(&buf);
        assert_eq!(parsed.failed_cid, None);
        assert_eq!(
            parsed.commands,
            vec![
                MacCommand::LinkCheckReq,
                MacCommand::LinkAdrAns {
                    power_ack: true,
                    data_rate_ack: true,
                    channel_mask_ack: true
                },
                MacCommand::DevStatusAns {
                    battery: 0xFF,
                    margin: -2
                },
                MacCommand::DeviceTimeReq,
            ]
        );
    }

    #[test]
    fn test_parse_stops_at_unknown_command() {
        // BeaconTimingReq is deprecated and aborts parsing.
        let buf = [0x06, 0x10, 0x05, 0x12, 0x02];
        let parsed = parse_uplink(&buf);
        assert_eq!(
            parsed.commands,
            vec![MacCommand::DevStatusAns {
                battery: 0x10,
                margin: 5
            }]
        );
        assert_eq!(parsed.failed_cid, Some(0x12));
    }

    #[test]
    fn test_parse_stops_at_truncated_command() {
        let parsed = parse_uplink(&[0x02, 0x06, 0x01]);
        assert_eq!(parsed.commands, vec![MacCommand::LinkCheckReq]);
        assert_eq!(parsed.failed_cid, Some(0x06));
    }

    #[test]
    fn test_encode_downlink_commands() {
        let cmds = vec![
            MacCommand::LinkAdrReq {
                data_rate_index: 5,
                tx_power_index: 1,
                channel_mask: [
                    true, true, true, false, false, false, false, false, false, false, false, false,
                    false, false, false, false,
                ],
                channel_mask_control: 0,
                nb_trans: 1,
            },
            MacCommand::RxParamSetupReq {
                rx1_data_rate_offset: 1,
                rx2_data_rate_index: 3,
                rx2_frequency: 869_525_000,
            },
            MacCommand::DevStatusReq,
        ];
        let buf = encode_all(&cmds);
        assert_eq!(
            buf,
            vec![0x03, 0x51, 0x07, 0x00, 0x01, 0x05, 0x13, 0xD2, 0xAD, 0x84, 0x06]
        );
        assert_eq!(buf.len(), cmds.iter().map(|c| c.encoded_len()).sum::<usize>());
        assert_eq!(parse_downlink(&buf).commands, cmds);
    }

    #[test]
    fn test_device_time_fraction() {
        let cmd = MacCommand::DeviceTimeAns {
            gps_time: Duration::from_millis(1_000_500),
        };
        let mut buf = Vec::new();
        cmd.encode(&mut buf);
        assert_eq!(buf, vec![0x0D, 0xE8, 0x03, 0x00, 0x00, 0x80]);
    }
}
