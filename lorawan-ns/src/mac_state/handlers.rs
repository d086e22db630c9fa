//! Uplink MAC command handlers
//!
//! Answers are matched to the oldest pending request with the same CID and,
//! when acknowledged, the request is applied to the current parameters.
//! Device-initiated requests queue their response for the next downlink.

use std::collections::HashSet;
use std::time::SystemTime;

use tracing::debug;

use crate::class::class_b::timing::to_gps;
use crate::config::device::EndDeviceIdentifiers;
use crate::device::{DeviceClass, MacChannel, MacParameters, MacState};
use crate::error::Result;
use crate::events::{self, Event, EventDefinition};
use crate::lorawan::region::Band;
use crate::lorawan::{Cid, MacCommand};
use crate::mac_state::enqueue::MAX_EIRP_TABLE;
use crate::messages::{RxMetadata, TxSettings};

/// LoRaWAN minor version the network answers ResetInd and RekeyInd with
const NETWORK_MINOR: u8 = 1;

/// Inputs of the handlers
#[derive(Debug, Clone, Copy)]
pub struct HandleContext<'a> {
    /// Device identifiers, for events
    pub ids: &'a EndDeviceIdentifiers,
    /// Uplink correlation identifiers, for events
    pub correlation_ids: &'a [String],
    /// Band of the device
    pub band: &'a Band,
    /// Reception time of the uplink
    pub received_at: SystemTime,
    /// Full uplink frame counter
    pub f_cnt: u32,
    /// Merged reception metadata
    pub rx_metadata: &'a [RxMetadata],
    /// Uplink transmission settings
    pub settings: TxSettings,
    /// Whether the device activates over the air
    pub supports_join: bool,
    /// Whether the device supports class C
    pub supports_class_c: bool,
}

/// Result of handling the commands of an uplink
#[derive(Debug, Default)]
pub struct HandleOutcome {
    /// Events to publish
    pub events: Vec<Event>,
    /// RekeyInd received; the pending session must be promoted
    pub rekeyed: bool,
}

impl HandleOutcome {
    fn push(&mut self, ctx: &HandleContext<'_>, def: EventDefinition, cmd: &MacCommand) {
        self.events.push(
            Event::new(def, ctx.ids, ctx.correlation_ids).with_detail(command_name(cmd)),
        );
    }
}

fn command_name(cmd: &MacCommand) -> String {
    match cmd.cid() {
        Some(cid) => format!("{cid:?}"),
        None => "Proprietary".into(),
    }
}

fn take_pending(state: &mut MacState, cid: Cid) -> Option<MacCommand> {
    let pos = state
        .pending_requests
        .iter()
        .position(|c| c.cid() == Some(cid))?;
    Some(state.pending_requests.remove(pos))
}

/// Handle the MAC commands of an uplink
///
/// Requests still pending afterwards were not answered by the device and
/// are dropped.
pub fn handle_commands(
    state: &mut MacState,
    cmds: &[MacCommand],
    ctx: &HandleContext<'_>,
) -> Result<HandleOutcome> {
    let mut out = HandleOutcome::default();
    let mut i = 0;
    while i < cmds.len() {
        let cmd = &cmds[i];
        i += 1;
        if !cmd.is_uplink() {
            debug!(command = %command_name(cmd), "Ignore non-uplink MAC command");
            continue;
        }
        if let MacCommand::LinkAdrAns { .. } = cmd {
            let mut end = i;
            if state.lorawan_version.duplicates_link_adr_ans() {
                while matches!(cmds.get(end), Some(MacCommand::LinkAdrAns { .. })) {
                    end += 1;
                }
            }
            handle_link_adr_ans(state, &cmds[i - 1..end], ctx, &mut out);
            i = end;
            continue;
        }
        handle_command(state, cmd, ctx, &mut out)?;
    }
    if !state.pending_requests.is_empty() {
        let names: Vec<String> = state.pending_requests.iter().map(command_name).collect();
        debug!(requests = ?names, "Pending MAC requests not answered");
        out.events.push(
            Event::new(events::MAC_UNANSWERED, ctx.ids, ctx.correlation_ids)
                .with_detail(names.join(",")),
        );
        state.pending_requests.clear();
    }
    Ok(out)
}

fn handle_command(
    state: &mut MacState,
    cmd: &MacCommand,
    ctx: &HandleContext<'_>,
    out: &mut HandleOutcome,
) -> Result<()> {
    use MacCommand::*;

    // Device-initiated requests
    match cmd {
        ResetInd { minor } => {
            if ctx.supports_join {
                out.push(ctx, events::MAC_REJECT, cmd);
                return Ok(());
            }
            state.current_parameters = MacParameters::for_band(ctx.band, true);
            state.pending_requests.clear();
            state.queued_responses.push(ResetConf {
                minor: (*minor).min(NETWORK_MINOR),
            });
            out.push(ctx, events::MAC_REQUEST, cmd);
            return Ok(());
        }
        LinkCheckReq => {
            let required = ctx.band.data_rate(ctx.settings.data_rate_index)?.required_snr();
            let max_snr = ctx
                .rx_metadata
                .iter()
                .map(|md| md.snr)
                .fold(f32::NEG_INFINITY, f32::max);
            let margin = if max_snr.is_finite() {
                (max_snr - required).clamp(0.0, 254.0) as u8
            } else {
                0
            };
            let gateways: HashSet<&str> =
                ctx.rx_metadata.iter().map(|md| md.gateway_id.as_str()).collect();
            state.queued_responses.push(LinkCheckAns {
                margin,
                gateway_count: gateways.len().min(255) as u8,
            });
            out.push(ctx, events::MAC_REQUEST, cmd);
            return Ok(());
        }
        DeviceTimeReq => {
            state.queued_responses.push(DeviceTimeAns {
                gps_time: to_gps(ctx.received_at),
            });
            out.push(ctx, events::MAC_REQUEST, cmd);
            return Ok(());
        }
        RekeyInd { minor } => {
            if !state.lorawan_version.is_1_1() {
                out.push(ctx, events::MAC_REJECT, cmd);
                return Ok(());
            }
            state.queued_responses.push(RekeyConf {
                minor: (*minor).min(NETWORK_MINOR),
            });
            out.rekeyed = true;
            out.push(ctx, events::MAC_REQUEST, cmd);
            return Ok(());
        }
        PingSlotInfoReq { periodicity } => {
            state.ping_slot_periodicity = Some(*periodicity);
            state.queued_responses.push(PingSlotInfoAns);
            out.push(ctx, events::MAC_REQUEST, cmd);
            return Ok(());
        }
        DeviceModeInd { class } => {
            if !state.lorawan_version.is_1_1() {
                out.push(ctx, events::MAC_REJECT, cmd);
                return Ok(());
            }
            let allowed = match class {
                DeviceClass::A => true,
                DeviceClass::C => ctx.supports_class_c,
                DeviceClass::B => false,
            };
            if allowed && state.device_class != *class {
                debug!(from = ?state.device_class, to = ?class, "Switch device class");
                state.device_class = *class;
                out.events.push(
                    Event::new(events::CLASS_SWITCH, ctx.ids, ctx.correlation_ids)
                        .with_detail(format!("{class:?}")),
                );
            }
            state.queued_responses.push(DeviceModeConf {
                class: state.device_class,
            });
            out.push(ctx, events::MAC_REQUEST, cmd);
            return Ok(());
        }
        _ => {}
    }

    // Answers
    let Some(req) = cmd.cid().and_then(|cid| take_pending(state, cid)) else {
        debug!(command = %command_name(cmd), "Answer without pending request");
        out.push(ctx, events::MAC_REJECT, cmd);
        return Ok(());
    };
    let params = &mut state.current_parameters;
    match (cmd, &req) {
        (DutyCycleAns, DutyCycleReq { max_duty_cycle }) => {
            params.max_duty_cycle = *max_duty_cycle;
        }
        (
            RxParamSetupAns {
                rx1_data_rate_offset_ack: true,
                rx2_data_rate_index_ack: true,
                rx2_frequency_ack: true,
            },
            RxParamSetupReq {
                rx1_data_rate_offset,
                rx2_data_rate_index,
                rx2_frequency,
            },
        ) => {
            params.rx1_data_rate_offset = *rx1_data_rate_offset;
            params.rx2_data_rate_index = *rx2_data_rate_index;
            params.rx2_frequency = *rx2_frequency;
        }
        (DevStatusAns { battery, margin }, DevStatusReq) => {
            state.last_battery = Some(*battery);
            state.last_margin = Some(*margin);
            state.last_dev_status_received_at = Some(ctx.received_at);
            state.last_dev_status_f_cnt_up = Some(ctx.f_cnt);
        }
        (
            NewChannelAns {
                frequency_ack: true,
                data_rate_ack: true,
            },
            NewChannelReq {
                channel_index,
                frequency,
                min_data_rate_index,
                max_data_rate_index,
            },
        ) => {
            let i = *channel_index as usize;
            if params.channels.len() <= i {
                params.channels.resize(
                    i + 1,
                    MacChannel {
                        uplink_frequency: 0,
                        downlink_frequency: 0,
                        min_data_rate_index: 0,
                        max_data_rate_index: 0,
                        enable_uplink: false,
                    },
                );
            }
            let ch = &mut params.channels[i];
            ch.uplink_frequency = *frequency;
            ch.downlink_frequency = *frequency;
            ch.min_data_rate_index = *min_data_rate_index;
            ch.max_data_rate_index = *max_data_rate_index;
            ch.enable_uplink = *frequency != 0;
        }
        (RxTimingSetupAns, RxTimingSetupReq { delay }) => {
            params.rx1_delay = *delay;
        }
        (
            TxParamSetupAns,
            TxParamSetupReq {
                max_eirp_index,
                uplink_dwell_time,
                downlink_dwell_time,
            },
        ) => {
            params.max_eirp = MAX_EIRP_TABLE[(*max_eirp_index & 0x0F) as usize];
            params.uplink_dwell_time = Some(*uplink_dwell_time);
            params.downlink_dwell_time = Some(*downlink_dwell_time);
        }
        (
            DlChannelAns {
                channel_index_ack: true,
                frequency_ack: true,
            },
            DlChannelReq {
                channel_index,
                frequency,
            },
        ) => {
            if let Some(ch) = params.channels.get_mut(*channel_index as usize) {
                ch.downlink_frequency = *frequency;
            }
        }
        (
            AdrParamSetupAns,
            AdrParamSetupReq {
                adr_ack_limit_exponent,
                adr_ack_delay_exponent,
            },
        ) => {
            params.adr_ack_limit_exponent = Some(*adr_ack_limit_exponent);
            params.adr_ack_delay_exponent = Some(*adr_ack_delay_exponent);
        }
        (
            RejoinParamSetupAns {
                max_time_exponent_ack,
            },
            RejoinParamSetupReq {
                max_time_exponent,
                max_count_exponent,
            },
        ) => {
            params.rejoin_count_periodicity = Some(*max_count_exponent);
            if *max_time_exponent_ack {
                params.rejoin_time_periodicity = Some(*max_time_exponent);
            }
        }
        (
            PingSlotChannelAns {
                data_rate_index_ack: true,
                frequency_ack: true,
            },
            PingSlotChannelReq {
                frequency,
                data_rate_index,
            },
        ) => {
            params.ping_slot_frequency = Some(*frequency);
            params.ping_slot_data_rate_index = Some(*data_rate_index);
        }
        (BeaconFreqAns { frequency_ack: true }, BeaconFreqReq { frequency }) => {
            params.beacon_frequency = Some(*frequency);
        }
        _ => {
            debug!(command = %command_name(cmd), "Request rejected by device");
            out.push(ctx, events::MAC_REJECT, cmd);
            return Ok(());
        }
    }
    out.push(ctx, events::MAC_ANSWER, cmd);
    Ok(())
}

/// Handle a run of LinkADRAns answering the first block of pending
/// LinkADRReq
fn handle_link_adr_ans(
    state: &mut MacState,
    answers: &[MacCommand],
    ctx: &HandleContext<'_>,
    out: &mut HandleOutcome,
) {
    let Some(start) = state
        .pending_requests
        .iter()
        .position(|c| matches!(c, MacCommand::LinkAdrReq { .. }))
    else {
        out.push(ctx, events::MAC_REJECT, &answers[0]);
        return;
    };
    let len = state.pending_requests[start..]
        .iter()
        .take_while(|c| matches!(c, MacCommand::LinkAdrReq { .. }))
        .count();
    let block: Vec<MacCommand> = state.pending_requests.drain(start..start + len).collect();
    let acked = answers.iter().all(|a| {
        matches!(
            a,
            MacCommand::LinkAdrAns {
                power_ack: true,
                data_rate_ack: true,
                channel_mask_ack: true,
            }
        )
    });
    if !acked {
        debug!(requests = block.len(), "LinkADRReq block rejected by device");
        out.push(ctx, events::MAC_REJECT, &answers[0]);
        return;
    }
    apply_link_adr(&mut state.current_parameters, ctx.band, &block);
    out.push(ctx, events::MAC_ANSWER, &answers[0]);
}

/// Apply an acknowledged LinkADRReq block
pub fn apply_link_adr(params: &mut MacParameters, band: &Band, block: &[MacCommand]) {
    let fixed = band.has_fixed_channels();
    for req in block {
        let MacCommand::LinkAdrReq {
            data_rate_index,
            tx_power_index,
            channel_mask,
            channel_mask_control,
            nb_trans,
        } = req
        else {
            continue;
        };
        apply_channel_mask(&mut params.channels, *channel_mask_control, channel_mask, fixed);
        params.adr_data_rate_index = *data_rate_index;
        params.adr_tx_power_index = *tx_power_index;
        params.adr_nb_trans = (*nb_trans).max(1);
    }
}

fn apply_channel_mask(channels: &mut [MacChannel], cntl: u8, mask: &[bool; 16], fixed: bool) {
    let mut set = |range: std::ops::Range<usize>, on: &dyn Fn(usize) -> bool| {
        for (i, ch) in channels.iter_mut().enumerate() {
            if range.contains(&i) {
                ch.enable_uplink = on(i - range.start);
            }
        }
    };
    if !fixed {
        match cntl {
            6 => set(0..16, &|_| true),
            _ => set(0..16, &|i| mask[i]),
        }
        return;
    }
    match cntl {
        0..=3 => {
            let from = cntl as usize * 16;
            set(from..from + 16, &|i| mask[i]);
        }
        4 => set(64..72, &|i| mask[i]),
        6 => {
            set(0..64, &|_| true);
            set(64..72, &|i| mask[i]);
        }
        7 => {
            set(0..64, &|_| false);
            set(64..72, &|i| mask[i]);
        }
        _ => {}
    }
}
