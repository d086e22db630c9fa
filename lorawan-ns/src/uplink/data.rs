//! Data uplink handling
//!
//! After deduplication the uplink is matched against the devices using its
//! DevAddr. The match is repeated inside the registry transaction so that
//! a concurrent write cannot make the device state inconsistent with the
//! uplink.

use std::future::ready;

use tracing::{debug, info};

use crate::application::{ApplicationUp, ApplicationUpMessage};
use crate::config::device::EndDeviceIdentifiers;
use crate::crypto::{encrypt_fopts, encrypt_payload, Direction, MIC_SIZE};
use crate::device::{DeviceClass, EndDevice, FieldPath, MacState, UplinkRecord};
use crate::error::{Error, Reason, Result};
use crate::events::{self, Event};
use crate::lorawan::commands::parse_uplink;
use crate::lorawan::MType;
use crate::mac_state::{adr, handle_commands, HandleContext};
use crate::messages::RxMetadata;
use crate::server::NetworkServer;
use crate::store::registry::{set_by_id, TxBody};
use crate::uplink::matching::{self, MatchKind, Matched, UplinkFrame};

/// Outcome of the uplink transaction
struct Processed {
    ids: EndDeviceIdentifiers,
    kind: MatchKind,
    events: Vec<Event>,
    application_uplinks: Vec<ApplicationUp>,
}

/// Inputs shared by the matching pass and the transaction
struct DataUplink<'a> {
    frame: UplinkFrame<'a>,
    rx_metadata: &'a [RxMetadata],
    correlation_ids: &'a [String],
}

/// Class the device operates in after an uplink with the given class B bit
fn next_class(state: &MacState, class_b_bit: bool, supports_class_b: bool, supports_class_c: bool) -> DeviceClass {
    let current = state.device_class;
    if class_b_bit {
        if supports_class_b && state.ping_slot_known() {
            return DeviceClass::B;
        }
        debug!("Class B bit set without known ping slot parameters");
        return current;
    }
    // 1.0.x devices switch to class C out of band; 1.1 devices announce it with DeviceModeInd.
    if !state.lorawan_version.is_1_1() && supports_class_c {
        return DeviceClass::C;
    }
    if current == DeviceClass::B {
        return DeviceClass::A;
    }
    current
}

fn mac_command_bytes(up: &DataUplink<'_>, matched: &Matched) -> Vec<u8> {
    let mac = up.frame.mac;
    let dev_addr = mac.f_hdr.dev_addr;
    if mac.f_port == Some(0) {
        return encrypt_payload(
            &matched.keys.nwk_s_enc,
            dev_addr,
            matched.f_cnt,
            Direction::Up,
            &mac.frm_payload,
        );
    }
    if matched.version.encrypts_f_opts() && !mac.f_hdr.f_opts.is_empty() {
        return encrypt_fopts(
            &matched.keys.nwk_s_enc,
            dev_addr,
            matched.f_cnt,
            Direction::Up,
            false,
            &mac.f_hdr.f_opts,
        );
    }
    mac.f_hdr.f_opts.to_vec()
}

impl NetworkServer {
    /// Handle a deduplicated data uplink
    pub(crate) async fn handle_data_uplink(
        &self,
        frame: UplinkFrame<'_>,
        rx_metadata: &[RxMetadata],
        correlation_ids: &[String],
    ) -> Result<()> {
        let dev_addr = frame.mac.f_hdr.dev_addr;
        let up = DataUplink {
            frame,
            rx_metadata,
            correlation_ids,
        };
        let window = self.config.retransmission_window;

        let candidates = self.registry.range_by_dev_addr(dev_addr).await?;
        let mut first_err = None;
        let mut matched = None;
        for dev in &candidates {
            match matching::match_device(dev, &up.frame, &*self.vault, window) {
                Ok(Some(_)) => {
                    matched = Some(dev.ids.clone());
                    break;
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(device = %dev.uid(), error = %err, "Candidate rejected uplink");
                    first_err.get_or_insert((dev.ids.clone(), err));
                }
            }
        }
        let Some(ids) = matched else {
            let (ids, err) = first_err.unwrap_or_else(|| {
                (
                    EndDeviceIdentifiers::default(),
                    Error::not_found(
                        Reason::DeviceNotMatched,
                        format!("no device matches DevAddr {dev_addr:?}"),
                    ),
                )
            });
            self.publish(vec![Event::new(events::DROP_DATA_UPLINK, &ids, correlation_ids).with_error(err.clone())]);
            return Err(err);
        };
        let uid = ids.uid();

        let result = set_by_id(&*self.registry, &uid, |stored| ready(self.apply_data_uplink(stored, &up))).await;
        let processed = match result {
            Ok(processed) => processed,
            Err(err) => {
                self.publish(vec![Event::new(events::DROP_DATA_UPLINK, &ids, correlation_ids).with_error(err.clone())]);
                return Err(err);
            }
        };

        let mut published = vec![Event::new(events::RECEIVE_DATA_UPLINK, &processed.ids, correlation_ids)];
        published.extend(processed.events);
        published.push(
            Event::new(events::PROCESS_DATA_UPLINK, &processed.ids, correlation_ids)
                .with_detail(format!("{:?}", processed.kind)),
        );
        self.publish(published);
        self.submit(processed.application_uplinks).await;
        self.tasks.add(&uid, self.clock.now(), false)?;
        info!(device = %uid, kind = ?processed.kind, "Processed data uplink");
        Ok(())
    }

    fn apply_data_uplink(&self, stored: Option<EndDevice>, up: &DataUplink<'_>) -> Result<TxBody<Processed>> {
        let Some(mut dev) = stored else {
            return Err(Error::not_found(Reason::DeviceNotFound, "device deleted"));
        };
        let frame = &up.frame;
        let mac = frame.mac;
        let Some(matched) =
            matching::match_device(&dev, frame, &*self.vault, self.config.retransmission_window)?
        else {
            return Err(Error::outdated_data());
        };
        let band = dev.band()?;
        let ids = dev.ids.clone();
        let cids = up.correlation_ids;
        let mut out = Processed {
            ids: ids.clone(),
            kind: matched.kind,
            events: Vec::new(),
            application_uplinks: Vec::new(),
        };

        if matched.version.checks_uplink_payload_size() {
            let state = match matched.kind {
                MatchKind::Pending => dev.pending_mac_state.as_ref(),
                _ => dev.mac_state.as_ref(),
            };
            let dwell = state
                .and_then(|s| s.current_parameters.uplink_dwell_time)
                .unwrap_or(false);
            let max = band.max_mac_payload(frame.settings.data_rate_index, dwell).unwrap_or(0);
            let len = frame.raw.len().saturating_sub(1 + MIC_SIZE);
            if len > usize::from(max) {
                return Err(Error::invalid_argument(
                    Reason::PayloadTooLong,
                    format!("MACPayload of {len} bytes exceeds {max}"),
                ));
            }
        }

        let mut paths = vec![FieldPath::MacState, FieldPath::Session];
        if matched.kind == MatchKind::Pending {
            let Some(mut state) = dev.pending_mac_state.take() else {
                return Err(Error::internal(Reason::UnknownMacState, "pending MAC state disappeared"));
            };
            // Settings carried by the join-accept apply from the first frame of the session.
            if let Some(req) = state.pending_join_request.take() {
                let params = &mut state.current_parameters;
                params.rx1_delay = req.rx_delay;
                params.rx1_data_rate_offset = req.downlink_settings.rx1_data_rate_offset;
                params.rx2_data_rate_index = req.downlink_settings.rx2_data_rate_index;
            }
            state.queued_join_accept = None;
            dev.mac_state = Some(state);
            if !matched.version.is_1_1() {
                dev.session = dev.pending_session.take();
                dev.ids.dev_addr = dev.session.as_ref().map(|s| s.dev_addr);
                out.events.push(Event::new(events::SESSION_PROMOTE, &ids, cids));
            }
            paths.extend([FieldPath::DevAddr, FieldPath::PendingSession, FieldPath::PendingMacState]);
        } else if dev.pending_session.is_some() || dev.pending_mac_state.is_some() {
            debug!(device = %dev.uid(), "Uplink on current session, dropping pending session");
            dev.pending_session = None;
            dev.pending_mac_state = None;
            paths.extend([FieldPath::PendingSession, FieldPath::PendingMacState]);
        }

        if matched.version.is_1_1() {
            let session = match (matched.kind, dev.session.as_ref(), dev.pending_session.as_ref()) {
                (MatchKind::Pending, _, Some(pending)) => pending,
                (_, Some(current), _) => current,
                _ => return Err(Error::internal(Reason::SessionNotFound, "matched session disappeared")),
            };
            let conf_f_cnt = if mac.f_hdr.f_ctrl.ack {
                session.last_conf_f_cnt_down
            } else {
                0
            };
            let Some(state) = dev.mac_state.as_ref() else {
                return Err(Error::internal(Reason::UnknownMacState, "MAC state disappeared"));
            };
            matching::verify_full_mic(frame, &matched, state, session.dev_addr, conf_f_cnt)?;
        }

        let record = UplinkRecord {
            m_type: frame.phy.mhdr.m_type,
            f_ctrl: mac.f_hdr.f_ctrl,
            f_cnt: matched.f_cnt,
            f_port: mac.f_port,
            raw_payload: frame.raw.to_vec(),
            rx_metadata: up.rx_metadata.to_vec(),
            settings: frame.settings,
            received_at: frame.received_at,
            correlation_ids: cids.to_vec(),
        };
        let supports_join = dev.supports_join;
        let supports_class_b = dev.supports_class_b;
        let supports_class_c = dev.supports_class_c;
        let Some(state) = dev.mac_state.as_mut() else {
            return Err(Error::internal(Reason::UnknownMacState, "MAC state disappeared"));
        };

        if matched.kind == MatchKind::CurrentRetransmission {
            state.record_uplink(record);
            state.rx_windows_available = true;
            debug!(f_cnt = matched.f_cnt, "Retransmission, skipping MAC handling");
            paths.retain(|p| *p != FieldPath::Session);
            return Ok(TxBody::write(dev, paths, out));
        }

        let parsed = parse_uplink(&mac_command_bytes(up, &matched));
        if let Some(cid) = parsed.failed_cid {
            debug!(cid, "Stopped at unreadable MAC command");
        }

        let class = next_class(state, mac.f_hdr.f_ctrl.class_b, supports_class_b, supports_class_c);
        if class != state.device_class {
            out.events.push(
                Event::new(events::CLASS_SWITCH, &ids, cids)
                    .with_detail(format!("{:?} -> {:?}", state.device_class, class)),
            );
            state.device_class = class;
        }

        if let Some(down) = state.pending_application_downlink.take() {
            let message = if mac.f_hdr.f_ctrl.ack {
                ApplicationUpMessage::DownlinkAck(down.clone())
            } else {
                ApplicationUpMessage::DownlinkNack(down.clone())
            };
            out.application_uplinks
                .push(ApplicationUp::new(&ids, &down.correlation_ids, message));
        }

        if matches!(matched.kind, MatchKind::CurrentReset | MatchKind::Pending) {
            state.pending_requests.clear();
        }
        let ctx = HandleContext {
            ids: &ids,
            correlation_ids: cids,
            band: &band,
            received_at: frame.received_at,
            f_cnt: matched.f_cnt,
            rx_metadata: up.rx_metadata,
            settings: frame.settings,
            supports_join,
            supports_class_c,
        };
        let outcome = handle_commands(state, &parsed.commands, &ctx)?;
        out.events.extend(outcome.events);

        state.record_uplink(record);
        state.rx_windows_available = true;
        if dev.mac_settings.use_adr() && mac.f_hdr.f_ctrl.adr {
            let margin = dev.mac_settings.adr_margin(&self.config.default_mac_settings);
            adr::adapt(state, &band, margin)?;
        }

        if matched.kind == MatchKind::Pending && matched.version.is_1_1() {
            if !outcome.rekeyed {
                return Err(Error::invalid_argument(
                    Reason::MissingRekeyInd,
                    "first uplink of the session lacks RekeyInd",
                ));
            }
            dev.session = dev.pending_session.take();
            dev.ids.dev_addr = dev.session.as_ref().map(|s| s.dev_addr);
            out.events.push(Event::new(events::SESSION_PROMOTE, &ids, cids));
        }

        let Some(session) = dev.session.as_mut() else {
            return Err(Error::internal(Reason::SessionNotFound, "matched session disappeared"));
        };
        session.last_f_cnt_up = matched.f_cnt;
        if matched.kind == MatchKind::CurrentReset {
            session.last_n_f_cnt_down = 0;
            session.last_conf_f_cnt_down = 0;
        }

        if let Some(f_port) = mac.f_port.filter(|port| *port > 0) {
            out.application_uplinks.push(ApplicationUp::new(
                &ids,
                cids,
                ApplicationUpMessage::Uplink {
                    session_key_id: session.keys.session_key_id.clone(),
                    f_port,
                    f_cnt: matched.f_cnt,
                    frm_payload: mac.frm_payload.clone(),
                    confirmed: frame.phy.mhdr.m_type == MType::ConfirmedUp,
                    rx_metadata: up.rx_metadata.to_vec(),
                    settings: frame.settings,
                    received_at: frame.received_at,
                },
            ));
        }
        Ok(TxBody::write(dev, paths, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MacSettingsDefaults;
    use crate::device::MacSettings;
    use crate::lorawan::{MacVersion, PhyVersion};
    use crate::lorawan::region::Band;

    fn state(version: MacVersion) -> MacState {
        let band = Band::for_frequency_plan("EU_863_870", PhyVersion::V1_0_3RevA).unwrap();
        MacState::new(&band, version, &MacSettings::default(), &MacSettingsDefaults::default())
    }

    #[test]
    fn test_class_b_needs_ping_slot() {
        let mut s = state(MacVersion::V1_0_3);
        assert_eq!(next_class(&s, true, true, false), DeviceClass::A);
        s.ping_slot_periodicity = Some(0);
        s.current_parameters.ping_slot_data_rate_index = Some(3);
        assert_eq!(next_class(&s, true, true, false), DeviceClass::B);
        assert_eq!(next_class(&s, true, false, false), DeviceClass::A);
    }

    #[test]
    fn test_class_b_bit_cleared() {
        let mut s = state(MacVersion::V1_1);
        s.device_class = DeviceClass::B;
        assert_eq!(next_class(&s, false, true, true), DeviceClass::A);

        let mut s = state(MacVersion::V1_0_3);
        s.device_class = DeviceClass::B;
        assert_eq!(next_class(&s, false, true, true), DeviceClass::C);
        assert_eq!(next_class(&s, false, true, false), DeviceClass::A);
    }

    #[test]
    fn test_1_1_class_c_stays() {
        let mut s = state(MacVersion::V1_1);
        s.device_class = DeviceClass::C;
        assert_eq!(next_class(&s, false, false, true), DeviceClass::C);
    }
}
