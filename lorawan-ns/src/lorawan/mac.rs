use heapless::Vec as HVec;
use thiserror::Error;

use crate::config::device::{DevAddr, Eui64, NetId};
use crate::crypto::MIC_SIZE;
use crate::error::{Error, Reason};

/// Maximum FOpts length
pub const MAX_FOPTS_LEN: usize = 15;

/// MAC layer codec error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MacError {
    /// Frame shorter than its fixed fields
    #[error("frame too short")]
    InvalidLength,
    /// MHDR major version is not LoRaWAN R1
    #[error("unsupported major version {0}")]
    UnsupportedMajor(u8),
    /// MType not valid for the decoded direction
    #[error("message type {0:?} not valid in this direction")]
    InvalidMType(MType),
    /// FOpts longer than 15 bytes
    #[error("FOpts too long")]
    FOptsTooLong,
    /// FOpts present while FPort is 0
    #[error("FOpts and FPort 0 are mutually exclusive")]
    FOptsWithPortZero,
}

impl From<MacError> for Error {
    fn from(err: MacError) -> Self {
        let reason = match err {
            MacError::UnsupportedMajor(_) => Reason::UnsupportedMajor,
            MacError::InvalidMType(_) => Reason::InvalidMType,
            _ => Reason::Decode,
        };
        Error::invalid_argument(reason, err.to_string())
    }
}

/// MAC header message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MType {
    /// Join-request
    JoinRequest = 0,
    /// Join-accept
    JoinAccept = 1,
    /// Unconfirmed data uplink
    UnconfirmedUp = 2,
    /// Unconfirmed data downlink
    UnconfirmedDown = 3,
    /// Confirmed data uplink
    ConfirmedUp = 4,
    /// Confirmed data downlink
    ConfirmedDown = 5,
    /// Rejoin-request
    RejoinRequest = 6,
    /// Proprietary
    Proprietary = 7,
}

impl MType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => MType::JoinRequest,
            1 => MType::JoinAccept,
            2 => MType::UnconfirmedUp,
            3 => MType::UnconfirmedDown,
            4 => MType::ConfirmedUp,
            5 => MType::ConfirmedDown,
            6 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }

    /// Whether this is an uplink message type
    pub fn is_uplink(&self) -> bool {
        matches!(
            self,
            MType::JoinRequest
                | MType::UnconfirmedUp
                | MType::ConfirmedUp
                | MType::RejoinRequest
                | MType::Proprietary
        )
    }
}

/// MAC header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MHDR {
    /// Message type
    pub m_type: MType,
    /// Major version; only LoRaWAN R1 (0) is defined
    pub major: u8,
}

impl MHDR {
    /// Header for LoRaWAN R1
    pub fn new(m_type: MType) -> Self {
        Self { m_type, major: 0 }
    }

    fn to_byte(self) -> u8 {
        ((self.m_type as u8) << 5) | (self.major & 0x03)
    }

    fn from_byte(byte: u8) -> Self {
        Self {
            m_type: MType::from_bits(byte >> 5),
            major: byte & 0x03,
        }
    }
}

/// Frame control flags
///
/// Bit 4 is ClassB in uplinks and FPending in downlinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FCtrl {
    /// ADR enabled
    pub adr: bool,
    /// ADR acknowledgment request (uplink only)
    pub adr_ack_req: bool,
    /// Acknowledges the last confirmed frame
    pub ack: bool,
    /// More data pending (downlink only)
    pub f_pending: bool,
    /// Device is in class B (uplink only)
    pub class_b: bool,
}

impl FCtrl {
    fn to_byte(self, uplink: bool, f_opts_len: usize) -> u8 {
        let mut byte = (f_opts_len as u8) & 0x0F;
        if self.adr {
            byte |= 0x80;
        }
        if uplink && self.adr_ack_req {
            byte |= 0x40;
        }
        if self.ack {
            byte |= 0x20;
        }
        if (uplink && self.class_b) || (!uplink && self.f_pending) {
            byte |= 0x10;
        }
        byte
    }

    fn from_byte(byte: u8, uplink: bool) -> Self {
        Self {
            adr: byte & 0x80 != 0,
            adr_ack_req: uplink && byte & 0x40 != 0,
            ack: byte & 0x20 != 0,
            f_pending: !uplink && byte & 0x10 != 0,
            class_b: uplink && byte & 0x10 != 0,
        }
    }
}

/// Frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FHDR {
    /// Device address
    pub dev_addr: DevAddr,
    /// Frame control
    pub f_ctrl: FCtrl,
    /// Frame counter; only the lower 16 bits go on the wire
    pub f_cnt: u32,
    /// Piggybacked MAC commands
    pub f_opts: HVec<u8, MAX_FOPTS_LEN>,
}

/// Data frame payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MACPayload {
    /// Frame header
    pub f_hdr: FHDR,
    /// Port; absent when there is no FRMPayload
    pub f_port: Option<u8>,
    /// Frame payload (encrypted)
    pub frm_payload: Vec<u8>,
}

/// Join-request payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRequestPayload {
    /// JoinEUI
    pub join_eui: Eui64,
    /// DevEUI
    pub dev_eui: Eui64,
    /// DevNonce
    pub dev_nonce: u16,
}

/// Rejoin-request payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejoinRequestPayload {
    /// Type 0 or 2
    NetId {
        /// Rejoin type
        rejoin_type: u8,
        /// NetID
        net_id: NetId,
        /// DevEUI
        dev_eui: Eui64,
        /// RJcount0
        count: u16,
    },
    /// Type 1
    JoinEui {
        /// JoinEUI
        join_eui: Eui64,
        /// DevEUI
        dev_eui: Eui64,
        /// RJcount1
        count: u16,
    },
}

/// PHY payload contents by message type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Data frame
    Mac(MACPayload),
    /// Join-request
    JoinRequest(JoinRequestPayload),
    /// Rejoin-request
    RejoinRequest(RejoinRequestPayload),
    /// Encrypted join-accept body (opaque to the network server)
    JoinAccept(Vec<u8>),
    /// Proprietary payload
    Proprietary(Vec<u8>),
}

/// LoRaWAN PHY payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PHYPayload {
    /// MAC header
    pub mhdr: MHDR,
    /// Message body
    pub payload: Payload,
    /// Message integrity code
    pub mic: [u8; MIC_SIZE],
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], MacError> {
        if self.buf.len() < n {
            return Err(MacError::InvalidLength);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u16_le(&mut self) -> Result<u16, MacError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn eui(&mut self) -> Result<Eui64, MacError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(Eui64::from_le_bytes(b))
    }
}

impl PHYPayload {
    /// Build a data frame
    pub fn data(m_type: MType, mac: MACPayload) -> Self {
        Self {
            mhdr: MHDR::new(m_type),
            payload: Payload::Mac(mac),
            mic: [0; MIC_SIZE],
        }
    }

    /// Decode a frame received in the given direction
    pub fn decode(raw: &[u8], uplink: bool) -> Result<Self, MacError> {
        if raw.len() < 1 + MIC_SIZE {
            return Err(MacError::InvalidLength);
        }
        let mhdr = MHDR::from_byte(raw[0]);
        if mhdr.major != 0 {
            return Err(MacError::UnsupportedMajor(mhdr.major));
        }
        if mhdr.m_type != MType::Proprietary && mhdr.m_type.is_uplink() != uplink {
            return Err(MacError::InvalidMType(mhdr.m_type));
        }
        let body = &raw[1..raw.len() - MIC_SIZE];
        let mut mic = [0u8; MIC_SIZE];
        mic.copy_from_slice(&raw[raw.len() - MIC_SIZE..]);
        let mut r = Reader { buf: body };

        let payload = match mhdr.m_type {
            MType::JoinRequest => {
                let join_eui = r.eui()?;
                let dev_eui = r.eui()?;
                let dev_nonce = r.u16_le()?;
                Payload::JoinRequest(JoinRequestPayload {
                    join_eui,
                    dev_eui,
                    dev_nonce,
                })
            }
            MType::RejoinRequest => {
                let rejoin_type = r.take(1)?[0];
                if rejoin_type == 1 {
                    let join_eui = r.eui()?;
                    let dev_eui = r.eui()?;
                    let count = r.u16_le()?;
                    Payload::RejoinRequest(RejoinRequestPayload::JoinEui {
                        join_eui,
                        dev_eui,
                        count,
                    })
                } else {
                    let n = r.take(3)?;
                    let net_id = NetId([n[2], n[1], n[0]]);
                    let dev_eui = r.eui()?;
                    let count = r.u16_le()?;
                    Payload::RejoinRequest(RejoinRequestPayload::NetId {
                        rejoin_type,
                        net_id,
                        dev_eui,
                        count,
                    })
                }
            }
            MType::JoinAccept => Payload::JoinAccept(body.to_vec()),
            MType::Proprietary => Payload::Proprietary(body.to_vec()),
            _ => {
                let mut addr = [0u8; 4];
                addr.copy_from_slice(r.take(4)?);
                let f_ctrl_byte = r.take(1)?[0];
                let f_cnt = r.u16_le()? as u32;
                let f_opts_len = (f_ctrl_byte & 0x0F) as usize;
                let f_opts = HVec::from_slice(r.take(f_opts_len)?)
                    .map_err(|_| MacError::FOptsTooLong)?;
                let (f_port, frm_payload) = match r.buf.split_first() {
                    Some((port, rest)) => (Some(*port), rest.to_vec()),
                    None => (None, Vec::new()),
                };
                if f_port == Some(0) && !f_opts.is_empty() {
                    return Err(MacError::FOptsWithPortZero);
                }
                Payload::Mac(MACPayload {
                    f_hdr: FHDR {
                        dev_addr: DevAddr::from_le_bytes(addr),
                        f_ctrl: FCtrl::from_byte(f_ctrl_byte, uplink),
                        f_cnt,
                        f_opts,
                    },
                    f_port,
                    frm_payload,
                })
            }
        };
        Ok(Self { mhdr, payload, mic })
    }

    /// Encode everything but the MIC
    pub fn encode_without_mic(&self) -> Result<Vec<u8>, MacError> {
        let mut out = vec![self.mhdr.to_byte()];
        match &self.payload {
            Payload::Mac(mac) => {
                let uplink = self.mhdr.m_type.is_uplink();
                if mac.f_port == Some(0) && !mac.f_hdr.f_opts.is_empty() {
                    return Err(MacError::FOptsWithPortZero);
                }
                out.extend_from_slice(&mac.f_hdr.dev_addr.to_le_bytes());
                out.push(mac.f_hdr.f_ctrl.to_byte(uplink, mac.f_hdr.f_opts.len()));
                out.extend_from_slice(&(mac.f_hdr.f_cnt as u16).to_le_bytes());
                out.extend_from_slice(&mac.f_hdr.f_opts);
                if let Some(port) = mac.f_port {
                    out.push(port);
                    out.extend_from_slice(&mac.frm_payload);
                }
            }
            Payload::JoinRequest(jr) => {
                out.extend_from_slice(&jr.join_eui.to_le_bytes());
                out.extend_from_slice(&jr.dev_eui.to_le_bytes());
                out.extend_from_slice(&jr.dev_nonce.to_le_bytes());
            }
            Payload::RejoinRequest(RejoinRequestPayload::NetId {
                rejoin_type,
                net_id,
                dev_eui,
                count,
            }) => {
                out.push(*rejoin_type);
                out.extend_from_slice(&net_id.to_le_bytes());
                out.extend_from_slice(&dev_eui.to_le_bytes());
                out.extend_from_slice(&count.to_le_bytes());
            }
            Payload::RejoinRequest(RejoinRequestPayload::JoinEui {
                join_eui,
                dev_eui,
                count,
            }) => {
                out.push(1);
                out.extend_from_slice(&join_eui.to_le_bytes());
                out.extend_from_slice(&dev_eui.to_le_bytes());
                out.extend_from_slice(&count.to_le_bytes());
            }
            Payload::JoinAccept(b) | Payload::Proprietary(b) => out.extend_from_slice(b),
        }
        Ok(out)
    }

    /// Encode the full frame
    pub fn encode(&self) -> Result<Vec<u8>, MacError> {
        let mut out = self.encode_without_mic()?;
        out.extend_from_slice(&self.mic);
        Ok(out)
    }

    /// Data frame payload, if any
    pub fn mac_payload(&self) -> Option<&MACPayload> {
        match &self.payload {
            Payload::Mac(mac) => Some(mac),
            _ => None,
        }
    }
}

/// LoRaWAN MAC version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum MacVersion {
    /// 1.0
    V1_0,
    /// 1.0.1
    V1_0_1,
    /// 1.0.2
    V1_0_2,
    /// 1.0.3
    #[default]
    V1_0_3,
    /// 1.0.4
    V1_0_4,
    /// 1.1
    V1_1,
}

impl MacVersion {
    /// Whether the version uses the split 1.1 key hierarchy and MIC
    pub fn is_1_1(&self) -> bool {
        *self >= MacVersion::V1_1
    }

    /// Whether FOpts are encrypted with NwkSEncKey
    pub fn encrypts_f_opts(&self) -> bool {
        self.is_1_1()
    }

    /// Whether uplinks with an FCnt gap above the band limit are rejected
    pub fn has_max_f_cnt_gap(&self) -> bool {
        *self < MacVersion::V1_0_4
    }

    /// Whether the uplink payload size is checked against the data rate
    pub fn checks_uplink_payload_size(&self) -> bool {
        *self >= MacVersion::V1_0_4
    }

    /// Whether LinkADRAns is duplicated for every LinkADRReq in a block
    pub fn duplicates_link_adr_ans(&self) -> bool {
        matches!(self, MacVersion::V1_0_2 | MacVersion::V1_0_3)
    }
}

/// Regional parameters version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PhyVersion {
    /// LoRaWAN 1.0 regional parameters
    V1_0,
    /// 1.0.1
    V1_0_1,
    /// 1.0.2 revision B
    V1_0_2RevB,
    /// 1.0.3 revision A
    #[default]
    V1_0_3RevA,
    /// RP001 1.1 revision B
    Rp001V1_1RevB,
}
