//! Network server
//!
//! [`NetworkServer`] ties the components together. Gateways hand it
//! uplinks and TX acknowledgments, the Application Server links to it and
//! manages downlink queues, and [`NetworkServer::start`] spawns the
//! downlink task workers.

use std::future::ready;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::{ApplicationLinks, ApplicationUp, ApplicationUpMessage, ApplicationUplinkSink};
use crate::clock::Clock;
use crate::config::device::EndDeviceIdentifiers;
use crate::config::NetworkServerConfig;
use crate::crypto::KeyVault;
use crate::device::{ApplicationDownlink, DeviceClass, EndDevice, FieldPath};
use crate::downlink::{ScheduledDownlinkMatcher, Scheduler};
use crate::error::{Error, ErrorKind, Reason, Result};
use crate::events::{self, Event, EventSink};
use crate::lorawan::mac::Payload;
use crate::lorawan::PHYPayload;
use crate::messages::{GatewayTxAcknowledgment, RxMetadata, TxAckResult, UplinkMessage};
use crate::peers::Peers;
use crate::store::registry::{set_by_id, DeviceRegistry, TxBody};
use crate::store::TaskQueue;
use crate::uplink::join::JoinUplink;
use crate::uplink::{Deduplicator, UplinkFrame, UplinkKey};

/// Prefix of the correlation identifier given to every uplink
pub const UPLINK_CORRELATION_PREFIX: &str = "ns:uplink:";

/// Highest application FPort; 224 is reserved for compliance testing
const MAX_APPLICATION_F_PORT: u8 = 223;

/// LoRaWAN network server
pub struct NetworkServer {
    pub(crate) config: NetworkServerConfig,
    pub(crate) registry: Arc<dyn DeviceRegistry>,
    pub(crate) tasks: TaskQueue,
    pub(crate) deduplicator: Deduplicator<UplinkKey, RxMetadata>,
    pub(crate) matcher: ScheduledDownlinkMatcher,
    pub(crate) scheduler: Scheduler,
    pub(crate) vault: Arc<dyn KeyVault>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) uplinks: Arc<dyn ApplicationUplinkSink>,
    pub(crate) links: Arc<ApplicationLinks>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl NetworkServer {
    /// Create a network server
    ///
    /// The downlink task queue is kept on disk when
    /// `config.downlink_tasks.store_path` is set. Application uplinks go to
    /// the links made with [`NetworkServer::link_application`].
    pub fn new(
        config: NetworkServerConfig,
        registry: Arc<dyn DeviceRegistry>,
        peers: Peers,
        vault: Arc<dyn KeyVault>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let backoff = config.downlink_tasks.retry_backoff;
        let tasks = match &config.downlink_tasks.store_path {
            Some(path) => TaskQueue::open(path, clock.clone(), backoff)?,
            None => TaskQueue::in_memory(clock.clone(), backoff),
        };
        let links = Arc::new(ApplicationLinks::new());
        Ok(Self {
            deduplicator: Deduplicator::new(config.cooldown_window),
            matcher: ScheduledDownlinkMatcher::new(config.scheduled_downlink_ttl, clock.clone()),
            scheduler: Scheduler::new(
                peers,
                config.peer_timeout,
                config.packet_broker_peering_delay,
                clock.clone(),
            ),
            uplinks: links.clone(),
            links,
            tasks,
            registry,
            vault,
            events,
            clock,
            config,
        })
    }

    /// Send application uplinks to `sink` instead of the application links
    pub fn with_application_sink(mut self, sink: Arc<dyn ApplicationUplinkSink>) -> Self {
        self.uplinks = sink;
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &NetworkServerConfig {
        &self.config
    }

    /// Downlink task queue
    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    pub(crate) fn publish(&self, events: Vec<Event>) {
        if !events.is_empty() {
            self.events.publish(events);
        }
    }

    pub(crate) async fn submit(&self, ups: Vec<ApplicationUp>) {
        if ups.is_empty() {
            return;
        }
        if let Err(err) = self.uplinks.submit(ups).await {
            warn!(error = %err, "Failed to submit application uplinks");
        }
    }

    /// Handle an uplink received by a gateway
    ///
    /// Returns once the uplink is processed; copies received by other
    /// gateways return right away after contributing their metadata.
    pub async fn handle_uplink(&self, mut msg: UplinkMessage) -> Result<()> {
        let received_at = *msg.received_at.get_or_insert_with(|| self.clock.now());
        msg.correlation_ids
            .push(format!("{UPLINK_CORRELATION_PREFIX}{}", Uuid::new_v4()));
        let cids = msg.correlation_ids.clone();

        let phy = match PHYPayload::decode(&msg.raw_payload, true) {
            Ok(phy) => phy,
            Err(err) => {
                debug!(error = %err, "Failed to decode uplink");
                return Err(err.into());
            }
        };
        if !phy.mhdr.m_type.is_uplink() {
            return Err(Error::invalid_argument(
                Reason::InvalidMType,
                format!("{:?} is not an uplink message type", phy.mhdr.m_type),
            ));
        }

        let key = UplinkKey::new(&msg);
        let (accumulated, cooldown) = self
            .deduplicator
            .deduplicate(key, msg.rx_metadata.iter().cloned(), self.config.deduplication_window)
            .await?;
        let Some(rx_metadata) = accumulated else {
            debug!(cooldown, "Duplicate uplink");
            self.publish(vec![Event::new(
                events::RECEIVE_DUPLICATE,
                &EndDeviceIdentifiers::default(),
                &cids,
            )]);
            return Ok(());
        };

        match &phy.payload {
            Payload::Mac(mac) => {
                let frame = UplinkFrame {
                    phy: &phy,
                    mac,
                    raw: &msg.raw_payload,
                    settings: msg.settings,
                    received_at,
                };
                self.handle_data_uplink(frame, &rx_metadata, &cids).await
            }
            Payload::JoinRequest(payload) => {
                self.handle_join_request(JoinUplink {
                    payload,
                    raw: &msg.raw_payload,
                    settings: msg.settings,
                    received_at,
                    rx_metadata: &rx_metadata,
                    correlation_ids: &cids,
                })
                .await
            }
            Payload::RejoinRequest(_) => self.handle_rejoin_request(&cids),
            _ => Err(Error::invalid_argument(
                Reason::InvalidMType,
                format!("unexpected {:?} uplink", phy.mhdr.m_type),
            )),
        }
    }

    /// Handle a gateway TX acknowledgment
    pub async fn report_tx_acknowledgment(&self, ack: GatewayTxAcknowledgment) -> Result<()> {
        if ack.result != TxAckResult::Success {
            warn!(gateway_id = %ack.gateway_id, result = ?ack.result, "Downlink not transmitted");
            return Ok(());
        }
        let Some(down) = self.matcher.take(&ack.correlation_ids) else {
            debug!(gateway_id = %ack.gateway_id, "TX acknowledgment for unknown downlink");
            return Ok(());
        };
        self.publish(vec![Event::new(events::TRANSMIT_DOWNLINK, &down.ids, &down.correlation_ids)
            .with_detail(ack.gateway_id.clone())]);
        if let Some(app) = down.application_downlink.filter(|d| d.f_port > 0) {
            let cids = app.correlation_ids.clone();
            let up = ApplicationUp::new(&down.ids, &cids, ApplicationUpMessage::DownlinkSent(app));
            self.submit(vec![up]).await;
        }
        Ok(())
    }

    /// Link an application; uplinks of its devices are delivered to the
    /// returned receiver and a previous link is closed
    pub fn link_application(&self, application_id: &str) -> mpsc::Receiver<ApplicationUp> {
        info!(application_id, "Application linked");
        self.links.link(application_id)
    }

    /// Replace the application downlink queues of a device
    pub async fn downlink_queue_replace(
        &self,
        ids: &EndDeviceIdentifiers,
        downlinks: Vec<ApplicationDownlink>,
    ) -> Result<()> {
        self.modify_queue(ids, downlinks, true).await
    }

    /// Append to the application downlink queues of a device
    pub async fn downlink_queue_push(
        &self,
        ids: &EndDeviceIdentifiers,
        downlinks: Vec<ApplicationDownlink>,
    ) -> Result<()> {
        self.modify_queue(ids, downlinks, false).await
    }

    /// Application downlinks queued for the session, then the pending session
    pub async fn downlink_queue_list(&self, ids: &EndDeviceIdentifiers) -> Result<Vec<ApplicationDownlink>> {
        let Some((dev, _)) = self.registry.get_by_id(&ids.uid()).await? else {
            return Err(Error::not_found(Reason::DeviceNotFound, format!("device {} not found", ids.uid())));
        };
        Ok([dev.session, dev.pending_session]
            .into_iter()
            .flatten()
            .flat_map(|s| s.queued_application_downlinks)
            .collect())
    }

    async fn modify_queue(
        &self,
        ids: &EndDeviceIdentifiers,
        downlinks: Vec<ApplicationDownlink>,
        replace: bool,
    ) -> Result<()> {
        for down in &downlinks {
            if !(1..=MAX_APPLICATION_F_PORT).contains(&down.f_port) {
                return Err(Error::invalid_argument(
                    Reason::InvalidFPort,
                    format!("FPort {} is not an application port", down.f_port),
                ));
            }
        }
        let uid = ids.uid();
        let network_initiated = set_by_id(&*self.registry, &uid, |stored| {
            ready(match stored {
                None => Err(Error::not_found(Reason::DeviceNotFound, format!("device {uid} not found"))),
                Some(dev) => apply_queue(dev, &downlinks, replace),
            })
        })
        .await?;

        if network_initiated {
            let at = self.clock.now() + self.config.downlink_tasks.schedule_window;
            self.tasks.add(&uid, at, false)?;
        }
        debug!(device = %uid, replace, "Updated application downlink queue");
        Ok(())
    }

    /// Spawn the downlink task dispatcher and consumers
    ///
    /// The workers stop when `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.downlink_tasks.consumers + 1);
        let this = Arc::clone(self);
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = this.tasks.dispatch(&token, "dispatcher").await {
                error!(error = %err, "Downlink task dispatcher failed");
            }
        }));
        for i in 0..self.config.downlink_tasks.consumers {
            let this = Arc::clone(self);
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                let consumer = format!("consumer-{i}");
                let server = &this;
                loop {
                    let popped = server
                        .tasks
                        .pop(&token, &consumer, |uid, _at| async move {
                            server.process_downlink_task(&uid).await
                        })
                        .await;
                    match popped {
                        Ok(()) => {}
                        Err(err) if err.kind() == ErrorKind::Canceled => break,
                        Err(err) => error!(consumer = %consumer, error = %err, "Downlink task queue failed"),
                    }
                }
                debug!(consumer = %consumer, "Downlink task consumer stopped");
            }));
        }
        handles
    }
}

/// Split `downlinks` over the session queues of `dev`
///
/// The value is set when the device needs a network-initiated downlink task.
fn apply_queue(mut dev: EndDevice, downlinks: &[ApplicationDownlink], replace: bool) -> Result<TxBody<bool>> {
    if dev.session.is_none() && dev.pending_session.is_none() {
        return Err(Error::failed_precondition(Reason::EmptySession, "device has no session"));
    }
    let class_a_only = !dev.supports_class_b && !dev.supports_class_c;
    let mut current = Vec::new();
    let mut pending = Vec::new();
    for down in downlinks {
        if class_a_only && down.class_b_c.as_ref().is_some_and(|c| c.absolute_time.is_some()) {
            return Err(Error::invalid_argument(
                Reason::InvalidAbsoluteTime,
                "absolute time requires class B or C",
            ));
        }
        if down.confirmed && dev.multicast {
            return Err(Error::invalid_argument(
                Reason::ConfirmedMulticastDownlink,
                "multicast downlinks cannot be confirmed",
            ));
        }
        if dev.session.as_ref().is_some_and(|s| s.has_key_id(&down.session_key_id)) {
            current.push(down.clone());
        } else if dev.pending_session.as_ref().is_some_and(|s| s.has_key_id(&down.session_key_id)) {
            pending.push(down.clone());
        } else {
            return Err(Error::not_found(
                Reason::UnknownSession,
                "downlink session key identifier matches no session",
            ));
        }
    }

    let mut paths = Vec::new();
    for (session, queued, path) in [
        (dev.session.as_mut(), current, FieldPath::SessionQueue),
        (dev.pending_session.as_mut(), pending, FieldPath::PendingSessionQueue),
    ] {
        let Some(session) = session else { continue };
        if replace {
            session.queued_application_downlinks.clear();
        }
        session.queued_application_downlinks.extend(queued);
        paths.push(path);
    }
    let network_initiated = dev.mac_state.as_ref().is_some_and(|s| s.device_class != DeviceClass::A)
        && dev.session.as_ref().is_some_and(|s| !s.queued_application_downlinks.is_empty());
    Ok(TxBody::write(dev, paths, network_initiated))
}
