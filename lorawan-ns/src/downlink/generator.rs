//! Data downlink generation
//!
//! A data downlink is composed from, in order:
//! - the MAC responses queued by the last uplink (class A only)
//! - the MAC requests the enqueuers want to send
//! - the first sendable application downlink of the session queue
//!
//! The frame is then numbered, encrypted and signed. Generation works on
//! the device in place; callers run it on a copy and keep the copy only
//! once the downlink is scheduled.

use std::time::SystemTime;

use tracing::debug;

use crate::application::{ApplicationUp, ApplicationUpMessage};
use crate::class::{self, class_c};
use crate::config::device::EndDeviceIdentifiers;
use crate::config::{DownlinkPriorities, MacSettingsDefaults, TxPriority};
use crate::crypto::{self, Direction, KeyVault};
use crate::device::{ApplicationDownlink, DeviceClass, EndDevice};
use crate::error::{Error, Reason, Result};
use crate::events::{self, Event};
use crate::lorawan::commands::encode_all;
use crate::lorawan::mac::{FCtrl, MACPayload, FHDR, MAX_FOPTS_LEN};
use crate::lorawan::region::Band;
use crate::lorawan::{MType, MacCommand, PHYPayload};
use crate::mac_state::{enqueue_requests, Budget, EnqueueContext};

/// FHDR without FOpts plus FPort
const FRAME_OVERHEAD: usize = 8;

/// Shared inputs of the generator
#[derive(Clone, Copy)]
pub struct GeneratorContext<'a> {
    /// Band of the device
    pub band: &'a Band,
    /// Downlink priorities
    pub priorities: &'a DownlinkPriorities,
    /// Network MAC defaults
    pub defaults: &'a MacSettingsDefaults,
    /// Key vault unwrapping session keys
    pub vault: &'a dyn KeyVault,
    /// Current time
    pub now: SystemTime,
}

/// Side effects of generation that stand even if generation fails
#[derive(Debug, Default)]
pub struct Effects {
    /// Application uplinks to submit
    pub application_uplinks: Vec<ApplicationUp>,
    /// Events to publish
    pub events: Vec<Event>,
    /// Application downlinks were dropped from the session queue
    pub queue_changed: bool,
}

/// Encoded data downlink
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedDownlink {
    /// PHY payload
    pub raw_payload: Vec<u8>,
    /// Message type
    pub m_type: MType,
    /// Frame counter
    pub f_cnt: u32,
    /// Port, if any
    pub f_port: Option<u8>,
    /// Transmission priority
    pub priority: TxPriority,
    /// Application downlink carried
    pub application_downlink: Option<ApplicationDownlink>,
    /// MAC commands carried
    pub mac_commands: Vec<MacCommand>,
    /// Whether new MAC requests expect an answer
    pub expects_answer: bool,
    /// Session the downlink belongs to
    pub session_key_id: Vec<u8>,
}

impl GeneratedDownlink {
    /// MACPayload length, for RX window fitting
    pub fn mac_payload_len(&self) -> usize {
        self.raw_payload.len().saturating_sub(1 + crypto::MIC_SIZE)
    }

    /// Whether the device must acknowledge the downlink
    pub fn confirmed(&self) -> bool {
        self.m_type == MType::ConfirmedDown
    }
}

fn drop_downlink(
    ids: &EndDeviceIdentifiers,
    effects: &mut Effects,
    down: ApplicationDownlink,
    error: Error,
) {
    debug!(
        dev_uid = %ids.uid(),
        f_cnt = down.f_cnt,
        reason = ?error.reason(),
        "Drop application downlink"
    );
    let cids = down.correlation_ids.clone();
    effects.application_uplinks.push(ApplicationUp::new(
        ids,
        &cids,
        ApplicationUpMessage::DownlinkFailed {
            downlink: down,
            error,
        },
    ));
    effects.queue_changed = true;
}

/// Outcome of the application downlink scan
#[derive(Debug, Default)]
struct Selection {
    downlink: Option<ApplicationDownlink>,
    more: bool,
}

/// Pick the application downlink to send
///
/// Drops what can never be sent and stops at what may be sent later.
/// `max_len` is the room left next to the MAC commands, `max_frame_len` the
/// room of a frame without them.
fn select_application_downlink(
    dev: &mut EndDevice,
    ctx: &GeneratorContext<'_>,
    class: DeviceClass,
    max_len: usize,
    max_frame_len: usize,
    effects: &mut Effects,
) -> Result<Selection> {
    let Some(state) = dev.mac_state.as_ref() else {
        return Ok(Selection::default());
    };
    let is_1_1 = state.lorawan_version.is_1_1();
    let has_data_downlink = state.last_data_downlink().is_some();
    let timeout = class::confirmed_timeout(dev, class, ctx.defaults);
    let not_before = class_c::confirmed_not_before(state, timeout, ctx.now);
    let multicast = dev.multicast;
    let ids = dev.ids.clone();

    loop {
        let pending_has_key =
            |key: &[u8]| dev.pending_session.as_ref().is_some_and(|p| p.has_key_id(key));
        let Some(session) = dev.session.as_ref() else {
            return Ok(Selection::default());
        };
        let Some(head) = session.queued_application_downlinks.first() else {
            return Ok(Selection::default());
        };

        let drop_reason = if !session.has_key_id(&head.session_key_id) {
            if pending_has_key(&head.session_key_id) {
                // Queued for the session being activated.
                return Ok(Selection::default());
            }
            Some(Error::not_found(
                Reason::UnknownSession,
                "downlink session is unknown",
            ))
        } else if !is_1_1 && has_data_downlink && head.f_cnt <= session.last_n_f_cnt_down {
            None
        } else if head.confirmed && multicast {
            Some(Error::invalid_argument(
                Reason::ConfirmedMulticastDownlink,
                "confirmed downlink to multicast device",
            ))
        } else if head
            .class_b_c
            .as_ref()
            .and_then(|c| c.absolute_time)
            .is_some_and(|t| t < ctx.now)
        {
            Some(Error::failed_precondition(
                Reason::DownlinkExpired,
                "absolute time passed",
            ))
        } else if head.frm_payload.len() > max_frame_len {
            Some(Error::invalid_argument(
                Reason::PayloadTooLong,
                format!(
                    "payload of {} bytes exceeds {max_frame_len}",
                    head.frm_payload.len()
                ),
            ))
        } else {
            let has_absolute_time = head
                .class_b_c
                .as_ref()
                .is_some_and(|c| c.absolute_time.is_some());
            if class == DeviceClass::A && has_absolute_time {
                // Class B/C only; wait for a network-initiated slot.
                return Ok(Selection {
                    downlink: None,
                    more: true,
                });
            }
            if head.frm_payload.len() > max_len {
                // Fits once no MAC commands share the frame.
                return Ok(Selection {
                    downlink: None,
                    more: true,
                });
            }
            if class != DeviceClass::A && head.confirmed && !multicast {
                if let Some(not_before) = not_before {
                    return Err(Error::unavailable(
                        Reason::ConfirmedDownlinkTooSoon,
                        format!("confirmed downlink not before {not_before:?}"),
                    ));
                }
            }
            let Some(session) = dev.session.as_mut() else {
                return Ok(Selection::default());
            };
            let down = session.queued_application_downlinks.remove(0);
            return Ok(Selection {
                downlink: Some(down),
                more: !session.queued_application_downlinks.is_empty(),
            });
        };

        let Some(session) = dev.session.as_mut() else {
            return Ok(Selection::default());
        };
        match drop_reason {
            Some(error) => {
                let down = session.queued_application_downlinks.remove(0);
                drop_downlink(&ids, effects, down, error);
            }
            None => {
                // Frame counter already used: drop the offender and hand the
                // rest of the queue back to the application.
                let last_f_cnt_down = session.last_n_f_cnt_down;
                let session_key_id = session.keys.session_key_id.clone();
                let down = session.queued_application_downlinks.remove(0);
                let rest = session.queued_application_downlinks.clone();
                let cids = down.correlation_ids.clone();
                let error = Error::failed_precondition(
                    Reason::FCntTooLow,
                    format!("FCnt {} not above {last_f_cnt_down}", down.f_cnt),
                );
                drop_downlink(&ids, effects, down, error);
                if !rest.is_empty() {
                    effects.application_uplinks.push(ApplicationUp::new(
                        &ids,
                        &cids,
                        ApplicationUpMessage::DownlinkQueueInvalidated {
                            downlinks: rest,
                            last_f_cnt_down,
                            session_key_id,
                        },
                    ));
                }
            }
        }
    }
}

/// Generate the next data downlink of `dev`
///
/// `max_down_len` is the MACPayload limit of the downlink and `max_up_len`
/// that of the next uplink, which carries the MAC answers. Dropped
/// application downlinks are reported in `effects` whatever the outcome.
pub fn generate(
    dev: &mut EndDevice,
    ctx: &GeneratorContext<'_>,
    class: DeviceClass,
    correlation_ids: &[String],
    max_down_len: usize,
    max_up_len: usize,
    effects: &mut Effects,
) -> Result<GeneratedDownlink> {
    if max_down_len < FRAME_OVERHEAD || max_up_len < FRAME_OVERHEAD {
        return Err(Error::failed_precondition(
            Reason::InvalidDataRate,
            "data rate leaves no room for a frame",
        ));
    }
    let max_down_len = max_down_len - FRAME_OVERHEAD;
    let max_up_len = max_up_len - FRAME_OVERHEAD;

    let session = dev
        .session
        .as_ref()
        .ok_or_else(|| Error::failed_precondition(Reason::EmptySession, "device has no session"))?;
    let dev_addr = session.dev_addr;
    let session_keys = session.keys.clone();
    let last_f_cnt_up = session.last_f_cnt_up;
    let last_n_f_cnt_down = session.last_n_f_cnt_down;
    let app_queued = !session.queued_application_downlinks.is_empty();
    let settings = dev.mac_settings.clone();
    let supports_class_b = dev.supports_class_b;
    let multicast = dev.multicast;
    let ids = dev.ids.clone();

    let state = dev.mac_state.as_mut().ok_or_else(|| {
        Error::failed_precondition(Reason::UnknownMacState, "device has no MAC state")
    })?;
    let version = state.lorawan_version;
    let keys = session_keys.unwrap(ctx.vault, version)?;

    // MAC commands share the frame with application data through FOpts.
    let mac_limit = if app_queued {
        max_down_len.min(MAX_FOPTS_LEN)
    } else {
        max_down_len
    };
    let mut budget = Budget::new(mac_limit, max_up_len);
    let mut mac_commands = Vec::new();
    if class == DeviceClass::A {
        for cmd in std::mem::take(&mut state.queued_responses) {
            if cmd.cid().is_none() || cmd.is_uplink() {
                budget.f_pending = true;
                continue;
            }
            let len = cmd.encoded_len();
            if len > budget.down {
                budget.f_pending = true;
                continue;
            }
            budget.down -= len;
            mac_commands.push(cmd);
        }
        state.pending_requests.clear();
    }
    let enqueue_ctx = EnqueueContext {
        band: ctx.band,
        settings: &settings,
        defaults: ctx.defaults,
        supports_class_b,
        last_f_cnt_up,
        now: ctx.now,
    };
    let requests = enqueue_requests(state, &enqueue_ctx, &mut budget);
    for req in &requests {
        effects.events.push(
            Event::new(events::MAC_ENQUEUE, &ids, correlation_ids)
                .with_detail(req.cid().map_or_else(String::new, |c| format!("{c:?}"))),
        );
    }
    let expects_answer = !requests.is_empty();
    mac_commands.extend(requests);

    let last_up = state.last_uplink().filter(|up| up.is_data());
    let ack = class == DeviceClass::A && last_up.is_some_and(|up| up.m_type == MType::ConfirmedUp);
    let adr_ack_req = class == DeviceClass::A && last_up.is_some_and(|up| up.f_ctrl.adr_ack_req);
    let conf_f_cnt = if ack { last_up.map_or(0, |up| up.f_cnt) } else { 0 };
    let has_data_downlink = state.last_data_downlink().is_some();

    let mac_bytes = encode_all(&mac_commands);
    let mac_in_f_opts = mac_bytes.len() <= MAX_FOPTS_LEN;
    let selection = if mac_in_f_opts {
        select_application_downlink(
            dev,
            ctx,
            class,
            max_down_len - mac_bytes.len(),
            max_down_len,
            effects,
        )?
    } else {
        Selection {
            downlink: None,
            more: app_queued,
        }
    };
    let app = selection.downlink;

    if !ack && !adr_ack_req && mac_commands.is_empty() && app.is_none() {
        return Err(Error::failed_precondition(
            Reason::NoDownlink,
            "nothing to send",
        ));
    }

    let m_type = match &app {
        Some(down) if down.confirmed && !multicast => MType::ConfirmedDown,
        _ => MType::UnconfirmedDown,
    };
    let f_cnt = match &app {
        Some(down) => down.f_cnt,
        None if has_data_downlink => last_n_f_cnt_down.wrapping_add(1),
        None => 0,
    };

    let (f_opts, f_port, frm_payload) = if !mac_in_f_opts {
        let enc = crypto::encrypt_payload(&keys.nwk_s_enc, dev_addr, f_cnt, Direction::Down, &mac_bytes);
        (Vec::new(), Some(0), enc)
    } else {
        let f_opts = if version.encrypts_f_opts() && !mac_bytes.is_empty() {
            crypto::encrypt_fopts(
                &keys.nwk_s_enc,
                dev_addr,
                f_cnt,
                Direction::Down,
                app.is_some(),
                &mac_bytes,
            )
        } else {
            mac_bytes
        };
        match &app {
            Some(down) => (f_opts, Some(down.f_port), down.frm_payload.clone()),
            None => (f_opts, None, Vec::new()),
        }
    };
    let f_opts = heapless::Vec::from_slice(&f_opts)
        .map_err(|_| Error::internal(Reason::MacEncoding, "FOpts too long"))?;

    let mut phy = PHYPayload::data(
        m_type,
        MACPayload {
            f_hdr: FHDR {
                dev_addr,
                f_ctrl: FCtrl {
                    adr: settings.use_adr(),
                    ack,
                    f_pending: budget.f_pending || selection.more,
                    ..Default::default()
                },
                f_cnt,
                f_opts,
            },
            f_port,
            frm_payload,
        },
    );
    let msg = phy
        .encode_without_mic()
        .map_err(|e| Error::internal(Reason::MacEncoding, e.to_string()))?;
    phy.mic = if version.is_1_1() {
        crypto::compute_downlink_mic(&keys.s_nwk_s_int, conf_f_cnt, dev_addr, f_cnt, &msg)?
    } else {
        crypto::compute_legacy_downlink_mic(&keys.s_nwk_s_int, dev_addr, f_cnt, &msg)?
    };
    let mut raw_payload = msg;
    raw_payload.extend_from_slice(&phy.mic);

    let mut priority = TxPriority::Lowest;
    if let Some(down) = &app {
        priority = down.priority.min(ctx.priorities.max_application_downlink);
    }
    if !mac_commands.is_empty() || app.is_none() {
        priority = priority.max(ctx.priorities.mac_commands);
    }

    debug!(
        dev_uid = %ids.uid(),
        f_cnt,
        ?m_type,
        mac_commands = mac_commands.len(),
        application = app.is_some(),
        "Generated data downlink"
    );
    Ok(GeneratedDownlink {
        raw_payload,
        m_type,
        f_cnt,
        f_port,
        priority,
        application_downlink: app,
        mac_commands,
        expects_answer,
        session_key_id: session_keys.session_key_id,
    })
}
