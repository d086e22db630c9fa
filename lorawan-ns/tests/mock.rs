#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::mpsc;

use lorawan_ns::{
    clock::MockClock,
    config::device::{AesKey, DevAddr, EndDeviceIdentifiers, Eui64},
    config::NetworkServerConfig,
    crypto::{compute_legacy_uplink_mic, KeyEnvelope, MemoryKeyVault},
    device::{EndDevice, MacSettings, MacState, Session, SessionKeys},
    error::{Error, ErrorKind, Reason, Result},
    events::MemoryEventSink,
    lorawan::mac::{FCtrl, JoinRequestPayload, MACPayload, Payload, FHDR, MHDR},
    lorawan::{MType, MacVersion, PHYPayload, PhyVersion},
    messages::{
        DownlinkMessage, DownlinkPath, JoinRequest, JoinResponse, JoinSessionKeys, RxMetadata,
        ScheduleResponse, TxSettings, UplinkMessage,
    },
    peers::{GatewayServer, JoinServer, PacketBrokerAgent, Peers},
    store::{DeviceRegistry, MemoryRegistry},
    NetworkServer,
};

pub const GATEWAY: &str = "gw-1";
pub const FREQUENCY_PLAN: &str = "EU_863_870";
pub const NWK_S_KEY: AesKey = AesKey([0x2B; 16]);
pub const DEV_ADDR: DevAddr = DevAddr([0x26, 0x01, 0x1B, 0xDA]);
pub const JOIN_EUI: Eui64 = Eui64([0x70, 0xB3, 0xD5, 0x7E, 0xD0, 0x00, 0x00, 0x01]);
pub const DEV_EUI: Eui64 = Eui64([0x00, 0x04, 0xA3, 0x0B, 0x00, 0x1C, 0x05, 0x30]);

/// Start of every test timeline
pub fn t0() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

/// Gateway Server recording schedule requests
pub struct MockGatewayServer {
    tx: mpsc::UnboundedSender<DownlinkMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DownlinkMessage>>,
    fail_with: Mutex<Option<ErrorKind>>,
    delay: Duration,
}

impl MockGatewayServer {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            fail_with: Mutex::new(None),
            delay: Duration::from_millis(900),
        }
    }

    /// Make every following schedule request fail with `kind`
    pub fn fail_with(&self, kind: ErrorKind) {
        *self.fail_with.lock().unwrap() = Some(kind);
    }

    /// Next schedule request, waiting up to a minute of test time
    pub async fn next(&self) -> Option<DownlinkMessage> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Schedule request already received, if any
    pub async fn try_next(&self) -> Option<DownlinkMessage> {
        self.rx.lock().await.try_recv().ok()
    }
}

#[async_trait]
impl GatewayServer for MockGatewayServer {
    async fn schedule_downlink(&self, msg: DownlinkMessage) -> Result<ScheduleResponse> {
        let path: Option<DownlinkPath> = msg.request.downlink_paths.first().cloned();
        let _ = self.tx.send(msg);
        if let Some(kind) = *self.fail_with.lock().unwrap() {
            return Err(Error::new(kind, Reason::Peer, "gateway refused downlink"));
        }
        Ok(ScheduleResponse {
            delay: self.delay,
            downlink_path: path,
        })
    }
}

/// Packet Broker Agent recording published downlinks
#[derive(Default)]
pub struct MockPacketBroker {
    pub published: Mutex<Vec<DownlinkMessage>>,
}

#[async_trait]
impl PacketBrokerAgent for MockPacketBroker {
    async fn publish_downlink(&self, msg: DownlinkMessage) -> Result<()> {
        self.published.lock().unwrap().push(msg);
        Ok(())
    }
}

/// Join Server accepting every join-request with fixed keys
pub struct MockJoinServer {
    pub requests: Mutex<Vec<JoinRequest>>,
    pub nwk_s_key: AesKey,
    pub session_key_id: Vec<u8>,
}

impl MockJoinServer {
    pub fn new(nwk_s_key: AesKey, session_key_id: &[u8]) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            nwk_s_key,
            session_key_id: session_key_id.to_vec(),
        }
    }

    /// Encrypted join-accept the mock answers with
    pub fn join_accept_payload() -> Vec<u8> {
        vec![0x20, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A]
    }
}

#[async_trait]
impl JoinServer for MockJoinServer {
    async fn handle_join(&self, req: JoinRequest) -> Result<JoinResponse> {
        self.requests.lock().unwrap().push(req);
        Ok(JoinResponse {
            raw_payload: Self::join_accept_payload(),
            session_keys: JoinSessionKeys {
                session_key_id: self.session_key_id.clone(),
                f_nwk_s_int_key: KeyEnvelope::plain(self.nwk_s_key),
                s_nwk_s_int_key: None,
                nwk_s_enc_key: None,
                app_s_key: Some(KeyEnvelope::plain(AesKey([0x3C; 16]))),
            },
            lifetime: None,
        })
    }
}

/// Network server wired to in-memory mocks
pub struct Harness {
    pub ns: Arc<NetworkServer>,
    pub registry: Arc<MemoryRegistry>,
    pub events: Arc<MemoryEventSink>,
    pub clock: Arc<MockClock>,
    pub gs: Arc<MockGatewayServer>,
    pub pba: Arc<MockPacketBroker>,
    pub js: Arc<MockJoinServer>,
}

/// Configuration with a cooldown short enough to send retransmissions
pub fn config() -> NetworkServerConfig {
    let mut config = NetworkServerConfig::default();
    config.deduplication_window = Duration::from_millis(200);
    config.cooldown_window = Duration::from_millis(100);
    config.downlink_tasks.consumers = 1;
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: NetworkServerConfig) -> Self {
        let registry = Arc::new(MemoryRegistry::new());
        let events = Arc::new(MemoryEventSink::new());
        let clock = Arc::new(MockClock::new(t0()));
        let gs = Arc::new(MockGatewayServer::new());
        let pba = Arc::new(MockPacketBroker::default());
        let js = Arc::new(MockJoinServer::new(AesKey([0x5A; 16]), b"session-2"));
        let peers = Peers::new()
            .with_gateway_server("gs-1", gs.clone())
            .with_gateway(GATEWAY, "gs-1")
            .with_packet_broker(pba.clone())
            .with_cluster_join_server(js.clone());
        let ns = NetworkServer::new(
            config,
            registry.clone(),
            peers,
            Arc::new(MemoryKeyVault::new()),
            events.clone(),
            clock.clone(),
        )
        .unwrap();
        Self {
            ns: Arc::new(ns),
            registry,
            events,
            clock,
            gs,
            pba,
            js,
        }
    }

    pub async fn create(&self, dev: EndDevice) {
        self.registry.create(dev).await.unwrap();
    }

    pub async fn device(&self, uid: &str) -> EndDevice {
        self.registry.get_by_id(uid).await.unwrap().unwrap().0
    }
}

/// MAC settings that keep periodic status requests out of the way
pub fn quiet_settings() -> MacSettings {
    MacSettings {
        status_count_periodicity: Some(0),
        status_time_periodicity: Some(Duration::ZERO),
        ..Default::default()
    }
}

/// Activated-by-personalization device with a running session
pub fn abp_device(device_id: &str, version: MacVersion, last_f_cnt_up: u32) -> EndDevice {
    let mut ids = EndDeviceIdentifiers::new("app", device_id);
    ids.dev_addr = Some(DEV_ADDR);
    let mut dev = EndDevice::new(ids, FREQUENCY_PLAN);
    dev.lorawan_version = version;
    dev.lorawan_phy_version = PhyVersion::V1_0_3RevA;
    dev.supports_join = false;
    dev.mac_settings = quiet_settings();
    let band = dev.band().unwrap();
    dev.mac_state = Some(MacState::new(&band, version, &dev.mac_settings, &config().default_mac_settings));
    let mut session = Session::new(
        DEV_ADDR,
        SessionKeys::legacy(b"session-1".to_vec(), KeyEnvelope::plain(NWK_S_KEY)),
        t0() - Duration::from_secs(3600),
    );
    session.last_f_cnt_up = last_f_cnt_up;
    dev.session = Some(session);
    dev
}

/// Over-the-air activated device, optionally with a previous session
pub fn otaa_device(device_id: &str, version: MacVersion) -> EndDevice {
    let mut dev = abp_device(device_id, version, 0);
    dev.supports_join = true;
    dev.ids.join_eui = Some(JOIN_EUI);
    dev.ids.dev_eui = Some(DEV_EUI);
    dev
}

/// Reception metadata of the test gateway
pub fn metadata(timestamp: u32) -> RxMetadata {
    RxMetadata {
        gateway_id: GATEWAY.into(),
        timestamp,
        channel_rssi: -90.0,
        snr: 7.5,
        uplink_token: vec![0x01, 0x02, timestamp as u8],
        ..Default::default()
    }
}

pub fn settings() -> TxSettings {
    TxSettings {
        data_rate_index: 5,
        frequency: 868_100_000,
        timestamp: 0,
    }
}

/// Unconfirmed 1.0.x data uplink signed with `key`
pub fn data_uplink(addr: DevAddr, key: &AesKey, f_cnt: u32, f_port: u8, payload: &[u8]) -> Vec<u8> {
    let mut phy = PHYPayload::data(
        MType::UnconfirmedUp,
        MACPayload {
            f_hdr: FHDR {
                dev_addr: addr,
                f_ctrl: FCtrl::default(),
                f_cnt: f_cnt & 0xFFFF,
                f_opts: Default::default(),
            },
            f_port: Some(f_port),
            frm_payload: payload.to_vec(),
        },
    );
    let msg = phy.encode_without_mic().unwrap();
    phy.mic = compute_legacy_uplink_mic(key, addr, f_cnt, &msg).unwrap();
    phy.encode().unwrap()
}

/// Join-request of the test device
pub fn join_request(dev_nonce: u16) -> Vec<u8> {
    PHYPayload {
        mhdr: MHDR::new(MType::JoinRequest),
        payload: Payload::JoinRequest(JoinRequestPayload {
            join_eui: JOIN_EUI,
            dev_eui: DEV_EUI,
            dev_nonce,
        }),
        mic: [0x01, 0x02, 0x03, 0x04],
    }
    .encode()
    .unwrap()
}

/// Uplink message as a gateway would deliver it
pub fn uplink(raw: Vec<u8>, received_at: SystemTime, timestamp: u32) -> UplinkMessage {
    UplinkMessage {
        raw_payload: raw,
        rx_metadata: vec![metadata(timestamp)],
        settings: settings(),
        received_at: Some(received_at),
        correlation_ids: vec!["gs:uplink:test".into()],
    }
}

/// Poll `cond` every 100ms of test time, for at most a minute
pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..600 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    cond()
}

impl Harness {
    /// Whether an event named after `def` was published
    pub fn has_event(&self, def: lorawan_ns::events::EventDefinition) -> bool {
        self.events.names().contains(&def.name)
    }

    /// Number of events named after `def`
    pub fn count_events(&self, def: lorawan_ns::events::EventDefinition) -> usize {
        self.events.names().iter().filter(|n| **n == def.name).count()
    }
}
