//! Downlink task processing
//!
//! A downlink task is the per-device promise to look at the device again at
//! a given time. Processing a task runs one registry transaction that:
//! - sends a queued join-accept in the join-accept windows, or
//! - computes the next data downlink slot, generates the frame and hands it
//!   to the scheduler
//!
//! The returned time re-arms the task; `None` removes it.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::application::{ApplicationUp, ApplicationUpMessage};
use crate::class::class_a::{attemptable_slots, RxSlots};
use crate::class::{class_b, class_c, next_data_downlink_slot, DownlinkSlot};
use crate::config::TxPriority;
use crate::device::{DeviceClass, DownlinkRecord, EndDevice, FieldPath, UplinkRecord};
use crate::downlink::paths::{from_metadata, group_fixed};
use crate::downlink::{
    generate, new_downlink_correlation_id, Effects, GeneratedDownlink, GeneratorContext, ScheduledDownlink,
    ScheduledRecord,
};
use crate::error::{Error, ErrorKind, Reason, Result};
use crate::events::{self, Event};
use crate::lorawan::region::Band;
use crate::lorawan::{MType, TimingParams};
use crate::messages::{DownlinkMessage, DownlinkPath, RxWindow, TxRequest};
use crate::server::NetworkServer;
use crate::store::registry::{set_by_id, TxBody};

/// Result of one task transaction, acted upon after commit
#[derive(Default)]
struct TaskOutcome {
    next: Option<SystemTime>,
    events: Vec<Event>,
    application_uplinks: Vec<ApplicationUp>,
    scheduled: Option<ScheduledDownlink>,
}

impl TaskOutcome {
    fn rearm(at: SystemTime) -> Self {
        Self {
            next: Some(at),
            ..Default::default()
        }
    }
}

/// Frame to schedule with its transmission parameters
struct Transmission<'a> {
    class: DeviceClass,
    raw_payload: Vec<u8>,
    paths: BTreeMap<u32, Vec<DownlinkPath>>,
    fixed_paths: bool,
    rx1_delay: Duration,
    rx1: Option<RxWindow>,
    rx2: Option<RxWindow>,
    priority: TxPriority,
    absolute_time: Option<SystemTime>,
    correlation_ids: &'a [String],
}

fn single_group(paths: Vec<DownlinkPath>) -> BTreeMap<u32, Vec<DownlinkPath>> {
    BTreeMap::from([(0, paths)])
}

fn last_data_uplink(dev: &EndDevice) -> Option<UplinkRecord> {
    dev.mac_state
        .as_ref()?
        .recent_uplinks
        .iter()
        .rev()
        .find(|up| up.is_data())
        .cloned()
}

impl NetworkServer {
    /// Process the downlink task of a device
    pub(crate) async fn process_downlink_task(&self, uid: &str) -> Result<Option<SystemTime>> {
        let now = self.clock.now();
        let this = self;
        let outcome = set_by_id(&*self.registry, uid, move |stored| this.attempt_downlink(stored, now)).await?;

        if let Some(down) = outcome.scheduled {
            if let Err(err) = self.matcher.add(down) {
                warn!(device = uid, error = %err, "Failed to track scheduled downlink");
            }
        }
        self.publish(outcome.events);
        self.submit(outcome.application_uplinks).await;
        Ok(outcome.next)
    }

    async fn attempt_downlink(&self, stored: Option<EndDevice>, now: SystemTime) -> Result<TxBody<TaskOutcome>> {
        let Some(dev) = stored else {
            debug!("Device deleted, dropping downlink task");
            return Ok(TxBody::read_only(TaskOutcome::default()));
        };
        let band = dev.band()?;
        let join_accept_queued = dev
            .pending_mac_state
            .as_ref()
            .is_some_and(|s| s.queued_join_accept.is_some());
        if join_accept_queued {
            return self.attempt_join_accept(dev, &band, now).await;
        }

        let defaults = &self.config.default_mac_settings;
        let Some(slot) = next_data_downlink_slot(&dev, defaults, now) else {
            debug!(device = %dev.uid(), "No downlink slot");
            return Ok(TxBody::read_only(TaskOutcome::default()));
        };
        match slot {
            DownlinkSlot::ClassA { .. } => self.attempt_class_a(dev, &band, now).await,
            DownlinkSlot::NetworkInitiated { class, at } => {
                let has_absolute_time = dev
                    .session
                    .as_ref()
                    .and_then(|s| s.queued_application_downlinks.first())
                    .and_then(|d| d.class_b_c.as_ref())
                    .is_some_and(|c| c.absolute_time.is_some());
                // Ping slots and absolute times are handed to the gateway ahead of time.
                let lead = if class == DeviceClass::B || has_absolute_time {
                    self.config.downlink_tasks.schedule_window
                } else {
                    Duration::ZERO
                };
                if at > now + lead {
                    return Ok(TxBody::read_only(TaskOutcome::rearm(at - lead)));
                }
                self.attempt_network_initiated(dev, &band, class, at, now).await
            }
        }
    }

    async fn attempt_join_accept(
        &self,
        mut dev: EndDevice,
        band: &Band,
        now: SystemTime,
    ) -> Result<TxBody<TaskOutcome>> {
        let ids = dev.ids.clone();
        let frequency_plan_id = dev.frequency_plan_id.clone();
        let paths = vec![FieldPath::PendingMacState];
        let mut out = TaskOutcome::default();
        let Some(state) = dev.pending_mac_state.as_mut() else {
            return Ok(TxBody::read_only(out));
        };
        let (Some(accept), Some(up)) = (
            state.queued_join_accept.clone(),
            state.last_uplink().filter(|up| up.is_join()).cloned(),
        ) else {
            state.queued_join_accept = None;
            return Ok(TxBody::write(dev, paths, out));
        };
        let cids: Vec<String> = std::iter::once(new_downlink_correlation_id())
            .chain(accept.correlation_ids.iter().cloned())
            .collect();

        let slots = attemptable_slots(&up, &state.current_parameters, band, now)?;
        if slots.is_empty() {
            let err = Error::failed_precondition(Reason::DownlinkExpired, "join-accept windows passed");
            out.events
                .push(Event::new(events::SCHEDULE_JOIN_ACCEPT_FAIL, &ids, &cids).with_error(err));
            state.queued_join_accept = None;
            state.rx_windows_available = false;
            return Ok(TxBody::write(dev, paths, out));
        }

        let msg = DownlinkMessage {
            raw_payload: accept.payload.clone(),
            end_device_ids: ids.clone(),
            request: TxRequest {
                class: DeviceClass::A,
                downlink_paths: from_metadata(&up.rx_metadata),
                rx1_delay: TimingParams::default().join_accept_delay1,
                rx1: slots.rx1.map(|s| s.window),
                rx2: slots.rx2.map(|s| s.window),
                priority: self.config.downlink_priorities.join_accept,
                absolute_time: None,
                frequency_plan_id,
            },
            correlation_ids: cids.clone(),
        };
        let groups = single_group(msg.request.downlink_paths.clone());
        match self.scheduler.schedule_by_paths(&msg, &groups, false).await {
            Ok(record) => {
                state.queued_join_accept = None;
                state.rx_windows_available = false;
                state.last_downlink_at = Some(record.transmit_at);
                state.record_downlink(DownlinkRecord {
                    m_type: MType::JoinAccept,
                    f_cnt: 0,
                    f_port: None,
                    class: DeviceClass::A,
                    transmit_at: record.transmit_at,
                    correlation_ids: cids.clone(),
                });
                out.events.push(Event::new(events::SCHEDULE_JOIN_ACCEPT, &ids, &cids));
                out.scheduled = Some(ScheduledDownlink {
                    ids,
                    correlation_ids: cids,
                    application_downlink: None,
                    transmit_at: record.transmit_at,
                });
                Ok(TxBody::write(dev, paths, out))
            }
            Err(err) => {
                // Kept until its windows pass; the expiry check above drops it.
                warn!(device = %ids.uid(), error = %err, "Failed to schedule join-accept");
                out.events
                    .push(Event::new(events::SCHEDULE_JOIN_ACCEPT_FAIL, &ids, &cids).with_error(err));
                out.next = Some(now + self.config.downlink_tasks.retry_backoff);
                Ok(TxBody::read_only(out))
            }
        }
    }

    fn generator_context<'a>(&'a self, band: &'a Band, now: SystemTime) -> GeneratorContext<'a> {
        GeneratorContext {
            band,
            priorities: &self.config.downlink_priorities,
            defaults: &self.config.default_mac_settings,
            vault: &*self.vault,
            now,
        }
    }

    async fn attempt_class_a(&self, mut dev: EndDevice, band: &Band, now: SystemTime) -> Result<TxBody<TaskOutcome>> {
        let Some(up) = last_data_uplink(&dev) else {
            return Ok(TxBody::read_only(TaskOutcome::default()));
        };
        let Some(state) = dev.mac_state.as_mut() else {
            return Ok(TxBody::read_only(TaskOutcome::default()));
        };
        let params = state.current_parameters.clone();
        let slots = attemptable_slots(&up, &params, band, now)?;
        let Some(max_down) = slots.max_mac_payload() else {
            debug!(device = %dev.ids.uid(), "Receive windows passed");
            state.rx_windows_available = false;
            return Ok(TxBody::write(dev, vec![FieldPath::MacState], TaskOutcome::default()));
        };
        let max_up = band
            .max_mac_payload(up.settings.data_rate_index, params.uplink_dwell_time.unwrap_or(false))
            .unwrap_or(0);

        let cids: Vec<String> = std::iter::once(new_downlink_correlation_id())
            .chain(up.correlation_ids.iter().cloned())
            .collect();
        let mut gen_dev = dev.clone();
        let mut effects = Effects::default();
        let ctx = self.generator_context(band, now);
        let generated = generate(
            &mut gen_dev,
            &ctx,
            DeviceClass::A,
            &cids,
            usize::from(max_down),
            usize::from(max_up),
            &mut effects,
        );
        let generated = match generated {
            Ok(generated) => generated,
            Err(err) => return Ok(self.generation_failed(dev, gen_dev, effects, err, DeviceClass::A, &cids, now)),
        };

        let slots: RxSlots = slots.fitting(generated.mac_payload_len());
        if slots.is_empty() {
            let err = Error::failed_precondition(Reason::PayloadTooLong, "downlink does not fit any window");
            return Ok(self.generation_failed(dev, gen_dev, effects, err, DeviceClass::A, &cids, now));
        }
        let tx = Transmission {
            class: DeviceClass::A,
            raw_payload: generated.raw_payload.clone(),
            paths: single_group(from_metadata(&up.rx_metadata)),
            fixed_paths: false,
            rx1_delay: TimingParams::with_rx1_delay(params.rx1_delay).rx1_delay,
            rx1: slots.rx1.map(|s| s.window),
            rx2: slots.rx2.map(|s| s.window),
            priority: generated.priority,
            absolute_time: None,
            correlation_ids: &cids,
        };
        Ok(self.transmit(dev, gen_dev, effects, generated, tx, now).await)
    }

    async fn attempt_network_initiated(
        &self,
        dev: EndDevice,
        band: &Band,
        class: DeviceClass,
        at: SystemTime,
        now: SystemTime,
    ) -> Result<TxBody<TaskOutcome>> {
        let (Some(state), Some(session)) = (dev.mac_state.as_ref(), dev.session.as_ref()) else {
            return Ok(TxBody::read_only(TaskOutcome::default()));
        };
        let params = &state.current_parameters;
        let window = match class {
            DeviceClass::B => class_b::ping_slot_window(state, band, session.dev_addr, at),
            _ => Some(class_c::window(params)),
        };
        let Some(window) = window else {
            debug!(device = %dev.uid(), "Ping slot parameters unknown");
            return Ok(TxBody::read_only(TaskOutcome::default()));
        };
        let max_down = band
            .max_mac_payload(window.data_rate_index, params.downlink_dwell_time.unwrap_or(false))
            .unwrap_or(0);
        let max_up = band
            .max_mac_payload(params.adr_data_rate_index, params.uplink_dwell_time.unwrap_or(false))
            .unwrap_or(0);
        let metadata_paths = last_data_uplink(&dev)
            .map(|up| from_metadata(&up.rx_metadata))
            .unwrap_or_default();

        let cids = vec![new_downlink_correlation_id()];
        let mut gen_dev = dev.clone();
        let mut effects = Effects::default();
        let ctx = self.generator_context(band, now);
        let generated = generate(
            &mut gen_dev,
            &ctx,
            class,
            &cids,
            usize::from(max_down),
            usize::from(max_up),
            &mut effects,
        );
        let generated = match generated {
            Ok(generated) => generated,
            Err(err) => return Ok(self.generation_failed(dev, gen_dev, effects, err, class, &cids, now)),
        };

        let class_b_c = generated
            .application_downlink
            .as_ref()
            .and_then(|d| d.class_b_c.as_ref());
        let (paths, fixed_paths) = match class_b_c {
            Some(c) if !c.gateways.is_empty() => (group_fixed(&c.gateways), true),
            _ => (single_group(metadata_paths), false),
        };
        let absolute_time = class_b_c
            .and_then(|c| c.absolute_time)
            .or((class == DeviceClass::B).then_some(at));
        let tx = Transmission {
            class,
            raw_payload: generated.raw_payload.clone(),
            paths,
            fixed_paths,
            rx1_delay: Duration::ZERO,
            rx1: None,
            rx2: Some(window),
            priority: generated.priority,
            absolute_time,
            correlation_ids: &cids,
        };
        Ok(self.transmit(dev, gen_dev, effects, generated, tx, now).await)
    }

    /// Outcome when no frame could be generated
    #[allow(clippy::too_many_arguments)]
    fn generation_failed(
        &self,
        mut dev: EndDevice,
        gen_dev: EndDevice,
        effects: Effects,
        err: Error,
        class: DeviceClass,
        cids: &[String],
        now: SystemTime,
    ) -> TxBody<TaskOutcome> {
        let ids = dev.ids.clone();
        let mut out = TaskOutcome {
            events: effects.events,
            application_uplinks: effects.application_uplinks,
            ..Default::default()
        };
        if err.reason() == Reason::NoDownlink {
            debug!(device = %ids.uid(), "Nothing to send");
            if class != DeviceClass::A {
                // The queue head waits for another session or a later time.
                out.next = Some(now + self.config.downlink_tasks.retry_backoff);
            }
        } else {
            if err.reason() == Reason::ConfirmedDownlinkTooSoon {
                out.next = Some(now + self.config.downlink_tasks.retry_backoff);
            }
            out.events
                .push(Event::new(events::SCHEDULE_DATA_DOWNLINK_FAIL, &ids, cids).with_error(err));
        }
        if !effects.queue_changed {
            return TxBody::read_only(out);
        }
        if let (Some(session), Some(generated)) = (dev.session.as_mut(), gen_dev.session) {
            session.queued_application_downlinks = generated.queued_application_downlinks;
        }
        TxBody::write(dev, vec![FieldPath::SessionQueue], out)
    }

    async fn transmit(
        &self,
        mut dev: EndDevice,
        mut gen_dev: EndDevice,
        effects: Effects,
        generated: GeneratedDownlink,
        tx: Transmission<'_>,
        now: SystemTime,
    ) -> TxBody<TaskOutcome> {
        let ids = dev.ids.clone();
        let cids = tx.correlation_ids;
        let msg = DownlinkMessage {
            raw_payload: tx.raw_payload,
            end_device_ids: ids.clone(),
            request: TxRequest {
                class: tx.class,
                downlink_paths: tx.paths.values().flatten().cloned().collect(),
                rx1_delay: tx.rx1_delay,
                rx1: tx.rx1,
                rx2: tx.rx2,
                priority: tx.priority,
                absolute_time: tx.absolute_time,
                frequency_plan_id: dev.frequency_plan_id.clone(),
            },
            correlation_ids: cids.to_vec(),
        };
        let mut out = TaskOutcome {
            events: effects.events,
            application_uplinks: effects.application_uplinks,
            ..Default::default()
        };

        match self.scheduler.schedule_by_paths(&msg, &tx.paths, tx.fixed_paths).await {
            Ok(record) => {
                apply_scheduled(&mut gen_dev, &generated, tx.class, &record, cids);
                out.events.push(
                    Event::new(events::SCHEDULE_DATA_DOWNLINK, &ids, cids)
                        .with_detail(format!("{:?} f_cnt={}", tx.class, generated.f_cnt)),
                );
                out.scheduled = Some(ScheduledDownlink {
                    ids,
                    correlation_ids: cids.to_vec(),
                    application_downlink: generated.application_downlink,
                    transmit_at: record.transmit_at,
                });
                let more = gen_dev
                    .session
                    .as_ref()
                    .is_some_and(|s| !s.queued_application_downlinks.is_empty());
                let class = gen_dev.mac_state.as_ref().map_or(DeviceClass::A, |s| s.device_class);
                if more && class != DeviceClass::A {
                    out.next = Some(now);
                }
                TxBody::write(gen_dev, vec![FieldPath::MacState, FieldPath::Session], out)
            }
            Err(err) => {
                warn!(device = %ids.uid(), error = %err, "Failed to schedule data downlink");
                let terminal =
                    err.kind() == ErrorKind::FailedPrecondition && err.reason() == Reason::ApplicationDownlinkFailed;
                out.events
                    .push(Event::new(events::SCHEDULE_DATA_DOWNLINK_FAIL, &ids, cids).with_error(err.clone()));
                let mut queue = gen_dev
                    .session
                    .take()
                    .map(|s| s.queued_application_downlinks)
                    .unwrap_or_default();
                match generated.application_downlink {
                    Some(down) if terminal => {
                        let down_cids = down.correlation_ids.clone();
                        out.application_uplinks.push(ApplicationUp::new(
                            &ids,
                            &down_cids,
                            ApplicationUpMessage::DownlinkFailed { downlink: down, error: err },
                        ));
                    }
                    Some(down) => queue.insert(0, down),
                    None => {}
                }
                let class = dev.mac_state.as_ref().map_or(DeviceClass::A, |s| s.device_class);
                out.next = if !terminal {
                    Some(now + self.config.downlink_tasks.retry_backoff)
                } else if !queue.is_empty() && class != DeviceClass::A {
                    Some(now)
                } else {
                    None
                };
                if let Some(session) = dev.session.as_mut() {
                    session.queued_application_downlinks = queue;
                }
                TxBody::write(dev, vec![FieldPath::SessionQueue], out)
            }
        }
    }
}

/// Record a scheduled downlink in the device state
fn apply_scheduled(
    dev: &mut EndDevice,
    generated: &GeneratedDownlink,
    class: DeviceClass,
    record: &ScheduledRecord,
    correlation_ids: &[String],
) {
    let confirmed = generated.confirmed();
    if let Some(state) = dev.mac_state.as_mut() {
        let version = state.lorawan_version;
        state.record_downlink(DownlinkRecord {
            m_type: generated.m_type,
            f_cnt: generated.f_cnt,
            f_port: generated.f_port,
            class,
            transmit_at: record.transmit_at,
            correlation_ids: correlation_ids.to_vec(),
        });
        state.last_downlink_at = Some(record.transmit_at);
        if confirmed || generated.expects_answer {
            state.last_confirmed_downlink_at = Some(record.transmit_at);
        }
        if confirmed {
            state.pending_application_downlink = generated.application_downlink.clone();
        }
        if class == DeviceClass::A {
            state.rx_windows_available = false;
        } else {
            state.last_network_initiated_downlink_at = Some(record.transmit_at);
        }
        if let Some(session) = dev.session.as_mut() {
            // 1.1 application downlinks count on AFCntDown, owned by the Application Server.
            if !version.is_1_1() || generated.application_downlink.is_none() {
                session.last_n_f_cnt_down = generated.f_cnt;
            }
            if confirmed {
                session.last_conf_f_cnt_down = generated.f_cnt;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::device::{DevAddr, EndDeviceIdentifiers};
    use crate::config::MacSettingsDefaults;
    use crate::crypto::KeyEnvelope;
    use crate::device::{ApplicationDownlink, MacSettings, MacState, Session, SessionKeys};
    use crate::downlink::Target;
    use crate::lorawan::MacVersion;
    use std::time::UNIX_EPOCH;

    fn device(version: MacVersion) -> EndDevice {
        let mut dev = EndDevice::new(EndDeviceIdentifiers::new("app", "dev"), "EU_863_870");
        let band = dev.band().unwrap();
        dev.mac_state = Some(MacState::new(
            &band,
            version,
            &MacSettings::default(),
            &MacSettingsDefaults::default(),
        ));
        dev.session = Some(Session::new(
            DevAddr([1, 2, 3, 4]),
            SessionKeys::legacy(vec![1], KeyEnvelope::plain(crate::config::AesKey([1; 16]))),
            UNIX_EPOCH,
        ));
        dev
    }

    fn generated(f_cnt: u32, down: Option<ApplicationDownlink>) -> GeneratedDownlink {
        let confirmed = down.as_ref().is_some_and(|d| d.confirmed);
        GeneratedDownlink {
            raw_payload: vec![0x60],
            m_type: if confirmed { MType::ConfirmedDown } else { MType::UnconfirmedDown },
            f_cnt,
            f_port: down.as_ref().map(|d| d.f_port),
            priority: TxPriority::Normal,
            application_downlink: down,
            mac_commands: Vec::new(),
            expects_answer: false,
            session_key_id: vec![1],
        }
    }

    fn record(at: SystemTime) -> ScheduledRecord {
        ScheduledRecord {
            target: Target::GatewayServer("gs".into()),
            delay: Duration::from_secs(1),
            transmit_at: at,
            downlink_path: None,
        }
    }

    #[test]
    fn test_confirmed_class_c_downlink_updates_counters() {
        let mut dev = device(MacVersion::V1_0_3);
        let at = UNIX_EPOCH + Duration::from_secs(100);
        let down = ApplicationDownlink {
            session_key_id: vec![1],
            f_port: 1,
            f_cnt: 7,
            confirmed: true,
            ..Default::default()
        };
        apply_scheduled(&mut dev, &generated(7, Some(down.clone())), DeviceClass::C, &record(at), &[]);

        let state = dev.mac_state.as_ref().unwrap();
        assert_eq!(state.pending_application_downlink, Some(down));
        assert_eq!(state.last_confirmed_downlink_at, Some(at));
        assert_eq!(state.last_network_initiated_downlink_at, Some(at));
        let session = dev.session.as_ref().unwrap();
        assert_eq!(session.last_n_f_cnt_down, 7);
        assert_eq!(session.last_conf_f_cnt_down, 7);
    }

    #[test]
    fn test_1_1_application_downlink_keeps_network_counter() {
        let mut dev = device(MacVersion::V1_1);
        dev.mac_state.as_mut().unwrap().rx_windows_available = true;
        let at = UNIX_EPOCH + Duration::from_secs(100);
        let down = ApplicationDownlink {
            session_key_id: vec![1],
            f_port: 1,
            f_cnt: 3,
            ..Default::default()
        };
        apply_scheduled(&mut dev, &generated(3, Some(down)), DeviceClass::A, &record(at), &[]);
        assert_eq!(dev.session.as_ref().unwrap().last_n_f_cnt_down, 0);
        assert!(!dev.mac_state.as_ref().unwrap().rx_windows_available);

        apply_scheduled(&mut dev, &generated(4, None), DeviceClass::A, &record(at), &[]);
        assert_eq!(dev.session.as_ref().unwrap().last_n_f_cnt_down, 4);
    }
}
