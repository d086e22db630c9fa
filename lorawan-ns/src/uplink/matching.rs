//! Data uplink matching
//!
//! A data uplink carries only the 16 least significant bits of its frame
//! counter and a DevAddr that may be shared by several devices. Matching
//! reconstructs the full counter against each candidate session and checks
//! the FNwkSIntKey part of the MIC. The outcome also says how the uplink
//! relates to the session: a new frame, a retransmission, a counter reset,
//! or the first frame of the pending session.

use std::time::{Duration, SystemTime};

use tracing::trace;

use crate::clock::saturating_elapsed;
use crate::crypto::{compute_legacy_uplink_mic, compute_uplink_mic, KeyVault, MIC_SIZE};
use crate::device::{EndDevice, MacState, NetworkKeys, Session};
use crate::error::{Error, Reason, Result};
use crate::lorawan::mac::MACPayload;
use crate::lorawan::region::MAX_F_CNT_GAP;
use crate::lorawan::{MacVersion, PHYPayload};
use crate::messages::TxSettings;

/// Lower bound of the retransmission cap
pub const MIN_RETRANSMISSIONS: u8 = 5;

/// Relation of a matched uplink to the device session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// New frame on the current session
    CurrentOriginal,
    /// Repetition of the last frame on the current session
    CurrentRetransmission,
    /// Frame after a device frame counter reset
    CurrentReset,
    /// First frame of the pending session
    Pending,
}

/// Successful match of a data uplink
#[derive(Debug, Clone)]
pub struct Matched {
    /// Relation to the session
    pub kind: MatchKind,
    /// Full uplink frame counter
    pub f_cnt: u32,
    /// MAC version of the matched state
    pub version: MacVersion,
    /// Unwrapped network session keys
    pub keys: NetworkKeys,
}

/// Decoded data uplink
#[derive(Debug, Clone, Copy)]
pub struct UplinkFrame<'a> {
    /// Decoded PHY payload
    pub phy: &'a PHYPayload,
    /// MAC payload of `phy`
    pub mac: &'a MACPayload,
    /// Raw PHY payload
    pub raw: &'a [u8],
    /// Transmission settings
    pub settings: TxSettings,
    /// Reception time
    pub received_at: SystemTime,
}

impl UplinkFrame<'_> {
    /// Bytes covered by the MIC
    pub fn signed(&self) -> &[u8] {
        &self.raw[..self.raw.len().saturating_sub(MIC_SIZE)]
    }
}

/// Reconstruct a full frame counter from its 16 wire bits
pub fn full_f_cnt(last: u32, wire: u32) -> u32 {
    let f_cnt = (last & 0xFFFF_0000) | (wire & 0xFFFF);
    if f_cnt < last {
        f_cnt.wrapping_add(0x1_0000)
    } else {
        f_cnt
    }
}

fn cmac_f_matches(
    frame: &UplinkFrame<'_>,
    version: MacVersion,
    keys: &NetworkKeys,
    session: &Session,
    f_cnt: u32,
) -> Result<bool> {
    let cmac_f = compute_legacy_uplink_mic(&keys.f_nwk_s_int, session.dev_addr, f_cnt, frame.signed())?;
    let mic = frame.phy.mic;
    if version.is_1_1() {
        Ok(mic[2..] == cmac_f[..2])
    } else {
        Ok(mic == cmac_f)
    }
}

/// Frame counter under which the MIC matches `session`
///
/// Returns the counter and whether it is a counter reset.
fn match_f_cnt(
    frame: &UplinkFrame<'_>,
    version: MacVersion,
    keys: &NetworkKeys,
    session: &Session,
    resets_f_cnt: bool,
) -> Result<Option<(u32, bool)>> {
    let wire = frame.mac.f_hdr.f_cnt & 0xFFFF;
    let f_cnt = full_f_cnt(session.last_f_cnt_up, wire);
    if cmac_f_matches(frame, version, keys, session, f_cnt)? {
        return Ok(Some((f_cnt, false)));
    }
    if resets_f_cnt && f_cnt != wire && cmac_f_matches(frame, version, keys, session, wire)? {
        return Ok(Some((wire, true)));
    }
    Ok(None)
}

fn same_frame(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.len() >= MIC_SIZE && a[..a.len() - MIC_SIZE] == b[..b.len() - MIC_SIZE]
}

fn classify_retransmission(
    state: &MacState,
    frame: &UplinkFrame<'_>,
    f_cnt: u32,
    retransmission_window: Duration,
) -> Result<MatchKind> {
    let mut previous = state
        .recent_uplinks
        .iter()
        .filter(|up| up.is_data() && up.f_cnt == f_cnt);
    let Some(original) = previous.next() else {
        return Err(Error::invalid_argument(Reason::Replay, format!("frame counter {f_cnt} already used")));
    };
    let count = 1 + previous.count();
    if !same_frame(&original.raw_payload, frame.raw) {
        return Err(Error::invalid_argument(
            Reason::Replay,
            format!("frame counter {f_cnt} reused with a different payload"),
        ));
    }
    let params = &state.current_parameters;
    let window = Duration::from_secs(u64::from(params.rx1_delay.max(1)) + 1) + retransmission_window;
    if saturating_elapsed(frame.received_at, original.received_at) > window {
        return Err(Error::invalid_argument(
            Reason::Replay,
            format!("retransmission of frame {f_cnt} outside the retransmission window"),
        ));
    }
    let cap = params.adr_nb_trans.max(MIN_RETRANSMISSIONS);
    if count >= usize::from(cap) {
        return Err(Error::invalid_argument(
            Reason::Replay,
            format!("frame {f_cnt} retransmitted more than {cap} times"),
        ));
    }
    Ok(MatchKind::CurrentRetransmission)
}

fn classify_current(
    dev: &EndDevice,
    state: &MacState,
    session: &Session,
    frame: &UplinkFrame<'_>,
    f_cnt: u32,
    reset: bool,
    retransmission_window: Duration,
) -> Result<MatchKind> {
    if reset {
        if frame.mac.f_hdr.f_ctrl.ack || dev.pending_session.is_some() {
            return Err(Error::invalid_argument(
                Reason::Replay,
                "frame counter reset not allowed in this state",
            ));
        }
        return Ok(MatchKind::CurrentReset);
    }
    let Some(gap) = f_cnt.checked_sub(session.last_f_cnt_up) else {
        return Err(Error::invalid_argument(Reason::Replay, format!("frame counter {f_cnt} too low")));
    };
    let has_data_uplink = state.recent_uplinks.iter().any(|up| up.is_data());
    if has_data_uplink && gap == 0 {
        return classify_retransmission(state, frame, f_cnt, retransmission_window);
    }
    if state.lorawan_version.has_max_f_cnt_gap() && gap > MAX_F_CNT_GAP {
        return Err(Error::invalid_argument(
            Reason::FCntGap,
            format!("frame counter gap {gap} too large"),
        ));
    }
    Ok(MatchKind::CurrentOriginal)
}

fn match_current(
    dev: &EndDevice,
    frame: &UplinkFrame<'_>,
    vault: &dyn KeyVault,
    retransmission_window: Duration,
) -> Result<Option<Matched>> {
    let (Some(session), Some(state)) = (dev.session.as_ref(), dev.mac_state.as_ref()) else {
        return Ok(None);
    };
    if session.dev_addr != frame.mac.f_hdr.dev_addr {
        return Ok(None);
    }
    let version = state.lorawan_version;
    let keys = session.keys.unwrap(vault, version)?;
    let Some((f_cnt, reset)) =
        match_f_cnt(frame, version, &keys, session, dev.mac_settings.resets_f_cnt())?
    else {
        return Ok(None);
    };
    let kind = classify_current(dev, state, session, frame, f_cnt, reset, retransmission_window)?;
    Ok(Some(Matched {
        kind,
        f_cnt,
        version,
        keys,
    }))
}

fn match_pending(dev: &EndDevice, frame: &UplinkFrame<'_>, vault: &dyn KeyVault) -> Result<Option<Matched>> {
    let (Some(session), Some(state)) = (dev.pending_session.as_ref(), dev.pending_mac_state.as_ref()) else {
        return Ok(None);
    };
    if session.dev_addr != frame.mac.f_hdr.dev_addr || state.pending_join_request.is_none() {
        return Ok(None);
    }
    let version = state.lorawan_version;
    let keys = session.keys.unwrap(vault, version)?;
    let Some((f_cnt, _)) = match_f_cnt(frame, version, &keys, session, false)? else {
        return Ok(None);
    };
    Ok(Some(Matched {
        kind: MatchKind::Pending,
        f_cnt,
        version,
        keys,
    }))
}

/// Match a data uplink against the sessions of `dev`
///
/// The current session is tried before the pending one. `Ok(None)` means
/// neither MIC matched; an error means a session matched but the uplink
/// must be dropped.
pub fn match_device(
    dev: &EndDevice,
    frame: &UplinkFrame<'_>,
    vault: &dyn KeyVault,
    retransmission_window: Duration,
) -> Result<Option<Matched>> {
    if let Some(matched) = match_current(dev, frame, vault, retransmission_window)? {
        trace!(device = %dev.uid(), f_cnt = matched.f_cnt, kind = ?matched.kind, "Matched current session");
        return Ok(Some(matched));
    }
    if let Some(matched) = match_pending(dev, frame, vault)? {
        trace!(device = %dev.uid(), f_cnt = matched.f_cnt, "Matched pending session");
        return Ok(Some(matched));
    }
    Ok(None)
}

/// Verify the full LoRaWAN 1.1 MIC of a matched uplink
///
/// `conf_f_cnt` is the counter of the acknowledged confirmed downlink, or 0
/// if the ACK bit is not set.
pub fn verify_full_mic(
    frame: &UplinkFrame<'_>,
    matched: &Matched,
    state: &MacState,
    dev_addr: crate::config::DevAddr,
    conf_f_cnt: u32,
) -> Result<()> {
    let tx_ch = state
        .current_parameters
        .channels
        .iter()
        .position(|ch| ch.uplink_frequency == frame.settings.frequency)
        .ok_or_else(|| {
            Error::invalid_argument(
                Reason::DeviceNotMatched,
                format!("uplink frequency {} is not a device channel", frame.settings.frequency),
            )
        })?;
    let mic = compute_uplink_mic(
        &matched.keys.s_nwk_s_int,
        &matched.keys.f_nwk_s_int,
        conf_f_cnt,
        frame.settings.data_rate_index,
        tx_ch as u8,
        dev_addr,
        matched.f_cnt,
        frame.signed(),
    )?;
    if mic != frame.phy.mic {
        return Err(Error::invalid_argument(Reason::DeviceNotMatched, "MIC mismatch"));
    }
    Ok(())
}
