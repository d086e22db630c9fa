//! Join-request handling
//!
//! The device is looked up by its EUIs and a DevAddr is allocated from the
//! configured prefixes. The join-request is forwarded to the Join Server and
//! the resulting session is stored as the pending session until the first
//! uplink that uses it. The join-accept itself is sent by the downlink task.

use std::future::ready;
use std::time::SystemTime;

use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::application::{ApplicationUp, ApplicationUpMessage};
use crate::config::device::{DevAddr, EndDeviceIdentifiers};
use crate::device::{
    DeviceClass, EndDevice, FieldPath, MacState, QueuedJoinAccept, Session, SessionKeys, UplinkRecord,
};
use crate::error::{Error, ErrorKind, Reason, Result};
use crate::events::{self, Event};
use crate::lorawan::mac::{FCtrl, JoinRequestPayload};
use crate::lorawan::MType;
use crate::messages::{DlSettings, JoinRequest, RxMetadata, TxSettings};
use crate::server::NetworkServer;
use crate::store::registry::{set_by_id, TxBody};

/// Deduplicated join-request
pub(crate) struct JoinUplink<'a> {
    pub(crate) payload: &'a JoinRequestPayload,
    pub(crate) raw: &'a [u8],
    pub(crate) settings: TxSettings,
    pub(crate) received_at: SystemTime,
    pub(crate) rx_metadata: &'a [RxMetadata],
    pub(crate) correlation_ids: &'a [String],
}

impl NetworkServer {
    /// Handle a deduplicated join-request
    pub(crate) async fn handle_join_request(&self, up: JoinUplink<'_>) -> Result<()> {
        let Some(dev) = self
            .registry
            .get_by_eui(up.payload.join_eui, up.payload.dev_eui)
            .await?
        else {
            let err = Error::not_found(
                Reason::DeviceNotFound,
                format!(
                    "no device with JoinEUI {:?} and DevEUI {:?}",
                    up.payload.join_eui, up.payload.dev_eui
                ),
            );
            self.publish(vec![
                Event::new(events::DROP_JOIN_REQUEST, &EndDeviceIdentifiers::default(), up.correlation_ids)
                    .with_error(err.clone()),
            ]);
            return Err(err);
        };
        let ids = dev.ids.clone();
        self.publish(vec![Event::new(events::RECEIVE_JOIN_REQUEST, &ids, up.correlation_ids)]);
        if let Err(err) = self.join(dev, &up).await {
            self.publish(vec![
                Event::new(events::DROP_JOIN_REQUEST, &ids, up.correlation_ids).with_error(err.clone())
            ]);
            return Err(err);
        }
        Ok(())
    }

    /// Reject a rejoin-request
    pub(crate) fn handle_rejoin_request(&self, correlation_ids: &[String]) -> Result<()> {
        let ids = EndDeviceIdentifiers::default();
        let err = Error::new(
            ErrorKind::Unimplemented,
            Reason::RejoinRequest,
            "rejoin-requests are not supported",
        );
        self.publish(vec![
            Event::new(events::RECEIVE_REJOIN_REQUEST, &ids, correlation_ids),
            Event::new(events::DROP_REJOIN_REQUEST, &ids, correlation_ids).with_error(err.clone()),
        ]);
        Err(err)
    }

    fn allocate_dev_addr(&self) -> Result<DevAddr> {
        let mut rng = rand::thread_rng();
        let prefix = self.config.dev_addr_prefixes.choose(&mut rng).ok_or_else(|| {
            Error::failed_precondition(Reason::InvalidConfiguration, "no DevAddr prefix configured")
        })?;
        Ok(prefix.random_address(&mut rng))
    }

    async fn join(&self, dev: EndDevice, up: &JoinUplink<'_>) -> Result<()> {
        if !dev.supports_join {
            return Err(Error::failed_precondition(
                Reason::JoinNotSupported,
                "device is activated by personalization",
            ));
        }
        let band = dev.band()?;
        let dev_addr = self.allocate_dev_addr()?;
        let version = dev.lorawan_version;
        let mut state = MacState::new(&band, version, &dev.mac_settings, &self.config.default_mac_settings);
        if !version.is_1_1() && dev.supports_class_c {
            state.device_class = DeviceClass::C;
        }

        let desired = &state.desired_parameters;
        let req = JoinRequest {
            raw_payload: up.raw.to_vec(),
            dev_addr,
            net_id: self.config.net_id,
            selected_mac_version: version,
            cf_list: band.cf_list(),
            rx_delay: desired.rx1_delay,
            downlink_settings: DlSettings {
                opt_neg: version.is_1_1(),
                rx1_data_rate_offset: desired.rx1_data_rate_offset,
                rx2_data_rate_index: desired.rx2_data_rate_index,
            },
            correlation_ids: up.correlation_ids.to_vec(),
        };

        self.publish(vec![Event::new(events::FORWARD_JOIN_REQUEST, &dev.ids, up.correlation_ids)]);
        let resp = tokio::time::timeout(self.config.peer_timeout, self.scheduler.peers().handle_join(req.clone()))
            .await
            .map_err(|_| Error::new(ErrorKind::DeadlineExceeded, Reason::Timeout, "Join Server timed out"))??;
        debug!(device = %dev.uid(), dev_addr = %dev_addr, "Join Server accepted join-request");

        let keys = SessionKeys {
            session_key_id: resp.session_keys.session_key_id.clone(),
            f_nwk_s_int_key: resp.session_keys.f_nwk_s_int_key.clone(),
            s_nwk_s_int_key: resp.session_keys.s_nwk_s_int_key.clone(),
            nwk_s_enc_key: resp.session_keys.nwk_s_enc_key.clone(),
        };
        state.pending_join_request = Some(req.clone());
        state.queued_join_accept = Some(QueuedJoinAccept {
            payload: resp.raw_payload.clone(),
            keys: keys.clone(),
            request: req,
            correlation_ids: up.correlation_ids.to_vec(),
        });
        state.record_uplink(UplinkRecord {
            m_type: MType::JoinRequest,
            f_ctrl: FCtrl::default(),
            f_cnt: 0,
            f_port: None,
            raw_payload: up.raw.to_vec(),
            rx_metadata: up.rx_metadata.to_vec(),
            settings: up.settings,
            received_at: up.received_at,
            correlation_ids: up.correlation_ids.to_vec(),
        });
        state.rx_windows_available = true;
        let session = Session::new(dev_addr, keys, up.received_at);

        let uid = dev.uid();
        set_by_id(&*self.registry, &uid, |stored| {
            ready(match stored {
                None => Err(Error::not_found(Reason::DeviceNotFound, "device deleted during join")),
                Some(mut dev) => {
                    dev.pending_session = Some(session.clone());
                    dev.pending_mac_state = Some(state.clone());
                    Ok(TxBody::write(dev, vec![FieldPath::PendingSession, FieldPath::PendingMacState], ()))
                }
            })
        })
        .await?;

        self.publish(vec![Event::new(events::PROCESS_JOIN_REQUEST, &dev.ids, up.correlation_ids)]);
        self.submit(vec![ApplicationUp::new(
            &dev.ids,
            up.correlation_ids,
            ApplicationUpMessage::JoinAccept {
                session_key_id: resp.session_keys.session_key_id,
                app_s_key: resp.session_keys.app_s_key,
                received_at: up.received_at,
            },
        )])
        .await;
        self.tasks.add(&uid, self.clock.now(), false)?;
        info!(device = %uid, dev_addr = %dev_addr, "Processed join-request");
        Ok(())
    }
}
