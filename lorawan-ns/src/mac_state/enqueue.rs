//! MAC request enqueuers
//!
//! Each enqueuer compares the desired MAC parameters with the current ones
//! and, if they differ and the request and its answer fit, appends a
//! request to the downlink and to the pending requests. Enqueuers run in a
//! fixed order; `LinkADRReq` follows `NewChannelReq` so the channel mask
//! refers to the channels being created.

use std::time::{Duration, SystemTime};

use crate::clock::saturating_elapsed;
use crate::config::MacSettingsDefaults;
use crate::device::{MacSettings, MacState};
use crate::lorawan::region::Band;
use crate::lorawan::{Cid, MacCommand, MacVersion};

/// Max EIRP values addressable by TxParamSetupReq, in dBm
pub const MAX_EIRP_TABLE: [f32; 16] = [
    8.0, 10.0, 12.0, 13.0, 14.0, 16.0, 18.0, 20.0, 21.0, 24.0, 26.0, 27.0, 29.0, 30.0, 33.0, 36.0,
];

/// Largest table index whose EIRP does not exceed `eirp`
pub fn max_eirp_index(eirp: f32) -> u8 {
    MAX_EIRP_TABLE
        .iter()
        .rposition(|v| *v <= eirp)
        .unwrap_or(0) as u8
}

/// Remaining room for commands in the downlink and answers in the next uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    /// Bytes left in the downlink
    pub down: usize,
    /// Bytes left in the next uplink
    pub up: usize,
    /// Something did not fit; the device should be told more is pending
    pub f_pending: bool,
}

impl Budget {
    /// Budget of `down` downlink and `up` uplink bytes
    pub fn new(down: usize, up: usize) -> Self {
        Self {
            down,
            up,
            f_pending: false,
        }
    }

    fn reserve(&mut self, cmds: &[MacCommand], answers: usize) -> bool {
        let down: usize = cmds.iter().map(|c| c.encoded_len()).sum();
        if down > self.down || answers > self.up {
            self.f_pending = true;
            return false;
        }
        self.down -= down;
        self.up -= answers;
        true
    }

    /// Reserve room for one command
    pub fn fit(&mut self, cmd: &MacCommand) -> bool {
        let answer = cmd.cid().and_then(|c| c.uplink_len()).map_or(0, |l| l + 1);
        self.reserve(std::slice::from_ref(cmd), answer)
    }
}

/// Inputs of the enqueuers
#[derive(Debug, Clone, Copy)]
pub struct EnqueueContext<'a> {
    /// Band of the device
    pub band: &'a Band,
    /// Device MAC settings
    pub settings: &'a MacSettings,
    /// Network defaults
    pub defaults: &'a MacSettingsDefaults,
    /// Whether the device supports class B
    pub supports_class_b: bool,
    /// Last uplink frame counter of the session
    pub last_f_cnt_up: u32,
    /// Current time
    pub now: SystemTime,
}

type Enqueuer = fn(&MacState, &EnqueueContext<'_>) -> Vec<MacCommand>;

/// Enqueuers in transmission order
const ENQUEUERS: [(Cid, Enqueuer); 12] = [
    (Cid::DutyCycle, duty_cycle),
    (Cid::RxParamSetup, rx_param_setup),
    (Cid::DevStatus, dev_status),
    (Cid::NewChannel, new_channel),
    (Cid::LinkAdr, link_adr),
    (Cid::RxTimingSetup, rx_timing_setup),
    (Cid::PingSlotChannel, ping_slot_channel),
    (Cid::BeaconFreq, beacon_freq),
    (Cid::TxParamSetup, tx_param_setup),
    (Cid::DlChannel, dl_channel),
    (Cid::AdrParamSetup, adr_param_setup),
    (Cid::RejoinParamSetup, rejoin_param_setup),
];

/// Run all enqueuers, returning the requests added to the downlink
///
/// Requests whose CID is already pending are not sent again.
pub fn enqueue_requests(
    state: &mut MacState,
    ctx: &EnqueueContext<'_>,
    budget: &mut Budget,
) -> Vec<MacCommand> {
    let mut out = Vec::new();
    for (cid, enqueuer) in ENQUEUERS {
        if state.pending_requests.iter().any(|c| c.cid() == Some(cid)) {
            continue;
        }
        let cmds = enqueuer(state, ctx);
        if cmds.is_empty() {
            continue;
        }
        if cid == Cid::LinkAdr {
            // A LinkADRReq block is all or nothing. It is answered once, or
            // once per request on devices that duplicate the answer.
            let answers = if state.lorawan_version.duplicates_link_adr_ans() {
                cmds.len() * 2
            } else {
                2
            };
            if budget.reserve(&cmds, answers) {
                state.pending_requests.extend(cmds.iter().cloned());
                out.extend(cmds);
            }
            continue;
        }
        for cmd in cmds {
            if budget.fit(&cmd) {
                state.pending_requests.push(cmd.clone());
                out.push(cmd);
            }
        }
    }
    out
}

fn duty_cycle(state: &MacState, _: &EnqueueContext<'_>) -> Vec<MacCommand> {
    let (cur, des) = (&state.current_parameters, &state.desired_parameters);
    if cur.max_duty_cycle == des.max_duty_cycle {
        return Vec::new();
    }
    vec![MacCommand::DutyCycleReq {
        max_duty_cycle: des.max_duty_cycle,
    }]
}

fn rx_param_setup(state: &MacState, _: &EnqueueContext<'_>) -> Vec<MacCommand> {
    let (cur, des) = (&state.current_parameters, &state.desired_parameters);
    if cur.rx1_data_rate_offset == des.rx1_data_rate_offset
        && cur.rx2_data_rate_index == des.rx2_data_rate_index
        && cur.rx2_frequency == des.rx2_frequency
    {
        return Vec::new();
    }
    vec![MacCommand::RxParamSetupReq {
        rx1_data_rate_offset: des.rx1_data_rate_offset,
        rx2_data_rate_index: des.rx2_data_rate_index,
        rx2_frequency: des.rx2_frequency,
    }]
}

/// Whether a device status request is due
pub fn dev_status_due(state: &MacState, ctx: &EnqueueContext<'_>) -> bool {
    let count = ctx.settings.status_count_periodicity(ctx.defaults);
    let time = ctx.settings.status_time_periodicity(ctx.defaults);
    if count == 0 && time == Duration::ZERO {
        return false;
    }
    let (Some(at), Some(f_cnt)) = (
        state.last_dev_status_received_at,
        state.last_dev_status_f_cnt_up,
    ) else {
        return true;
    };
    (count > 0 && ctx.last_f_cnt_up.saturating_sub(f_cnt) >= count)
        || (time > Duration::ZERO && saturating_elapsed(ctx.now, at) >= time)
}

fn dev_status(state: &MacState, ctx: &EnqueueContext<'_>) -> Vec<MacCommand> {
    if dev_status_due(state, ctx) {
        vec![MacCommand::DevStatusReq]
    } else {
        Vec::new()
    }
}

fn new_channel(state: &MacState, ctx: &EnqueueContext<'_>) -> Vec<MacCommand> {
    if ctx.band.has_fixed_channels() {
        return Vec::new();
    }
    let (cur, des) = (&state.current_parameters, &state.desired_parameters);
    let n = cur.channels.len().max(des.channels.len()).min(16);
    (0..n)
        .filter_map(|i| {
            let c = cur.channels.get(i);
            let d = des.channels.get(i);
            let same = match (c, d) {
                (Some(c), Some(d)) => {
                    c.uplink_frequency == d.uplink_frequency
                        && c.min_data_rate_index == d.min_data_rate_index
                        && c.max_data_rate_index == d.max_data_rate_index
                }
                (None, None) => true,
                (None, Some(_)) => false,
                (Some(c), None) => c.uplink_frequency == 0,
            };
            if same {
                return None;
            }
            Some(MacCommand::NewChannelReq {
                channel_index: i as u8,
                frequency: d.map_or(0, |d| d.uplink_frequency),
                min_data_rate_index: d.map_or(0, |d| d.min_data_rate_index),
                max_data_rate_index: d.map_or(0, |d| d.max_data_rate_index),
            })
        })
        .collect()
}

fn link_adr(state: &MacState, ctx: &EnqueueContext<'_>) -> Vec<MacCommand> {
    let (cur, des) = (&state.current_parameters, &state.desired_parameters);
    let use_adr = ctx.settings.use_adr();
    let mask = des.channel_mask();
    let adr_changed = use_adr
        && (cur.adr_data_rate_index != des.adr_data_rate_index
            || cur.adr_tx_power_index != des.adr_tx_power_index
            || cur.adr_nb_trans != des.adr_nb_trans);
    if !adr_changed && cur.channel_mask() == mask {
        return Vec::new();
    }
    let src = if use_adr { des } else { cur };
    ctx.band
        .link_adr_masks(&mask)
        .into_iter()
        .map(|(channel_mask_control, channel_mask)| MacCommand::LinkAdrReq {
            data_rate_index: src.adr_data_rate_index,
            tx_power_index: src.adr_tx_power_index,
            channel_mask,
            channel_mask_control,
            nb_trans: src.adr_nb_trans,
        })
        .collect()
}

fn rx_timing_setup(state: &MacState, _: &EnqueueContext<'_>) -> Vec<MacCommand> {
    let (cur, des) = (&state.current_parameters, &state.desired_parameters);
    if cur.rx1_delay == des.rx1_delay {
        return Vec::new();
    }
    vec![MacCommand::RxTimingSetupReq {
        delay: des.rx1_delay,
    }]
}

fn ping_slot_channel(state: &MacState, ctx: &EnqueueContext<'_>) -> Vec<MacCommand> {
    let (cur, des) = (&state.current_parameters, &state.desired_parameters);
    if !ctx.supports_class_b {
        return Vec::new();
    }
    let (Some(frequency), Some(data_rate_index)) =
        (des.ping_slot_frequency, des.ping_slot_data_rate_index)
    else {
        return Vec::new();
    };
    if cur.ping_slot_frequency == Some(frequency)
        && cur.ping_slot_data_rate_index == Some(data_rate_index)
    {
        return Vec::new();
    }
    vec![MacCommand::PingSlotChannelReq {
        frequency,
        data_rate_index,
    }]
}

fn beacon_freq(state: &MacState, ctx: &EnqueueContext<'_>) -> Vec<MacCommand> {
    let (cur, des) = (&state.current_parameters, &state.desired_parameters);
    match des.beacon_frequency {
        Some(frequency) if ctx.supports_class_b && cur.beacon_frequency != Some(frequency) => {
            vec![MacCommand::BeaconFreqReq { frequency }]
        }
        _ => Vec::new(),
    }
}

fn tx_param_setup(state: &MacState, ctx: &EnqueueContext<'_>) -> Vec<MacCommand> {
    let (cur, des) = (&state.current_parameters, &state.desired_parameters);
    if !ctx.band.tx_param_setup_req_support || state.lorawan_version < MacVersion::V1_0_2 {
        return Vec::new();
    }
    if des.uplink_dwell_time.is_none() || des.downlink_dwell_time.is_none() {
        return Vec::new();
    }
    if max_eirp_index(cur.max_eirp) == max_eirp_index(des.max_eirp)
        && cur.uplink_dwell_time == des.uplink_dwell_time
        && cur.downlink_dwell_time == des.downlink_dwell_time
    {
        return Vec::new();
    }
    vec![MacCommand::TxParamSetupReq {
        max_eirp_index: max_eirp_index(des.max_eirp),
        uplink_dwell_time: des.uplink_dwell_time.unwrap_or(false),
        downlink_dwell_time: des.downlink_dwell_time.unwrap_or(false),
    }]
}

fn dl_channel(state: &MacState, ctx: &EnqueueContext<'_>) -> Vec<MacCommand> {
    if ctx.band.has_fixed_channels() || state.lorawan_version < MacVersion::V1_0_2 {
        return Vec::new();
    }
    let (cur, des) = (&state.current_parameters, &state.desired_parameters);
    des.channels
        .iter()
        .enumerate()
        .take(16)
        .filter_map(|(i, d)| {
            let c = cur.channels.get(i)?;
            (c.uplink_frequency != 0 && c.downlink_frequency != d.downlink_frequency).then_some(
                MacCommand::DlChannelReq {
                    channel_index: i as u8,
                    frequency: d.downlink_frequency,
                },
            )
        })
        .collect()
}

fn adr_param_setup(state: &MacState, _: &EnqueueContext<'_>) -> Vec<MacCommand> {
    let (cur, des) = (&state.current_parameters, &state.desired_parameters);
    if !state.lorawan_version.is_1_1() {
        return Vec::new();
    }
    let (Some(limit), Some(delay)) = (des.adr_ack_limit_exponent, des.adr_ack_delay_exponent) else {
        return Vec::new();
    };
    if cur.adr_ack_limit_exponent == Some(limit) && cur.adr_ack_delay_exponent == Some(delay) {
        return Vec::new();
    }
    vec![MacCommand::AdrParamSetupReq {
        adr_ack_limit_exponent: limit,
        adr_ack_delay_exponent: delay,
    }]
}

fn rejoin_param_setup(state: &MacState, _: &EnqueueContext<'_>) -> Vec<MacCommand> {
    let (cur, des) = (&state.current_parameters, &state.desired_parameters);
    if !state.lorawan_version.is_1_1() {
        return Vec::new();
    }
    let (Some(time), Some(count)) = (des.rejoin_time_periodicity, des.rejoin_count_periodicity)
    else {
        return Vec::new();
    };
    if cur.rejoin_time_periodicity == Some(time) && cur.rejoin_count_periodicity == Some(count) {
        return Vec::new();
    }
    vec![MacCommand::RejoinParamSetupReq {
        max_time_exponent: time,
        max_count_exponent: count,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::PhyVersion;

    fn state(fp: &str, version: MacVersion) -> (Band, MacState) {
        let band = Band::for_frequency_plan(fp, PhyVersion::V1_0_3RevA).unwrap();
        let state = MacState::new(
            &band,
            version,
            &MacSettings::default(),
            &MacSettingsDefaults::default(),
        );
        (band, state)
    }

    fn ctx<'a>(band: &'a Band, settings: &'a MacSettings, defaults: &'a MacSettingsDefaults) -> EnqueueContext<'a> {
        EnqueueContext {
            band,
            settings,
            defaults,
            supports_class_b: false,
            last_f_cnt_up: 0,
            now: SystemTime::UNIX_EPOCH + Duration::from_secs(1000),
        }
    }

    #[test]
    fn test_eirp_index() {
        assert_eq!(max_eirp_index(16.0), 5);
        assert_eq!(max_eirp_index(17.0), 5);
        assert_eq!(max_eirp_index(2.0), 0);
        assert_eq!(max_eirp_index(40.0), 15);
    }

    #[test]
    fn test_order_and_pending() {
        let (band, mut state) = state("EU_863_870", MacVersion::V1_0_3);
        state.desired_parameters.rx1_delay = 5;
        state.desired_parameters.max_duty_cycle = 3;
        let settings = MacSettings::default();
        let defaults = MacSettingsDefaults::default();
        let mut budget = Budget::new(15, 51);
        let cmds = enqueue_requests(&mut state, &ctx(&band, &settings, &defaults), &mut budget);
        assert_eq!(
            cmds,
            vec![
                MacCommand::DutyCycleReq { max_duty_cycle: 3 },
                MacCommand::DevStatusReq,
                MacCommand::RxTimingSetupReq { delay: 5 },
            ]
        );
        assert_eq!(state.pending_requests, cmds);
        assert_eq!(budget.down, 15 - 2 - 1 - 2);
        assert!(!budget.f_pending);

        // Already pending requests are not repeated.
        let mut budget = Budget::new(15, 51);
        assert!(enqueue_requests(&mut state, &ctx(&band, &settings, &defaults), &mut budget).is_empty());
    }

    #[test]
    fn test_budget_sets_f_pending() {
        let (band, mut state) = state("EU_863_870", MacVersion::V1_0_3);
        state.desired_parameters.rx1_delay = 5;
        let settings = MacSettings::default();
        let defaults = MacSettingsDefaults::default();
        let mut budget = Budget::new(1, 51);
        let cmds = enqueue_requests(&mut state, &ctx(&band, &settings, &defaults), &mut budget);
        assert_eq!(cmds, vec![MacCommand::DevStatusReq]);
        assert!(budget.f_pending);
    }

    #[test]
    fn test_us915_channel_mask_block() {
        let (band, mut state) = state("US_902_928_FSB_2", MacVersion::V1_0_3);
        let settings = MacSettings {
            status_count_periodicity: Some(0),
            status_time_periodicity: Some(Duration::ZERO),
            ..Default::default()
        };
        let defaults = MacSettingsDefaults::default();
        let mut budget = Budget::new(15, 51);
        let cmds = enqueue_requests(&mut state, &ctx(&band, &settings, &defaults), &mut budget);
        assert!(!cmds.is_empty());
        assert!(cmds
            .iter()
            .all(|c| matches!(c, MacCommand::LinkAdrReq { .. })));
        assert!(matches!(
            cmds[0],
            MacCommand::LinkAdrReq {
                channel_mask_control: 7,
                ..
            }
        ));
    }

    #[test]
    fn test_dev_status_periodicity() {
        let (band, mut state) = state("EU_863_870", MacVersion::V1_0_3);
        let settings = MacSettings {
            status_count_periodicity: Some(10),
            status_time_periodicity: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        let defaults = MacSettingsDefaults::default();
        let mut c = ctx(&band, &settings, &defaults);
        state.last_dev_status_received_at = Some(c.now);
        state.last_dev_status_f_cnt_up = Some(5);
        c.last_f_cnt_up = 14;
        assert!(!dev_status_due(&state, &c));
        c.last_f_cnt_up = 15;
        assert!(dev_status_due(&state, &c));
        c.last_f_cnt_up = 6;
        c.now += Duration::from_secs(3600);
        assert!(dev_status_due(&state, &c));
    }
}
