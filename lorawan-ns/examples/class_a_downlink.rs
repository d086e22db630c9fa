//! Class A Uplink and Downlink Example
//!
//! This example runs a network server in-process against a logging Gateway
//! Server:
//! - ABP device provisioned in the in-memory registry
//! - Data uplink handed to the server as a gateway would
//! - Application downlink queued and sent in the device's RX windows
//! - Transmission acknowledgment reported back by the gateway
//!
//! Run with `RUST_LOG=debug cargo run --example class_a_downlink` to follow
//! the events the server emits.

use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use lorawan_ns::{
    application::ApplicationUpMessage,
    clock::SystemClock,
    config::device::{AesKey, DevAddr, EndDeviceIdentifiers},
    config::{NetworkServerConfig, TxPriority},
    crypto::{compute_legacy_uplink_mic, KeyEnvelope, MemoryKeyVault},
    device::{ApplicationDownlink, EndDevice, MacState, Session, SessionKeys},
    events::TracingEventSink,
    lorawan::mac::{FCtrl, MACPayload, FHDR},
    lorawan::{MType, MacVersion, PHYPayload},
    messages::{
        DownlinkMessage, GatewayTxAcknowledgment, RxMetadata, ScheduleResponse, TxAckResult,
        TxSettings, UplinkMessage,
    },
    peers::{GatewayServer, Peers},
    store::{DeviceRegistry, MemoryRegistry},
    NetworkServer, Reason, Result,
};

const GATEWAY: &str = "eui-0016c001ff1e5e23";
const DEV_ADDR: DevAddr = DevAddr([0x26, 0x0B, 0x5C, 0x11]);
const NWK_S_KEY: AesKey = AesKey([
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10,
]);

/// Gateway Server forwarding schedule requests to the example's main task
struct LoggingGatewayServer {
    tx: mpsc::UnboundedSender<DownlinkMessage>,
}

#[async_trait]
impl GatewayServer for LoggingGatewayServer {
    async fn schedule_downlink(&self, msg: DownlinkMessage) -> Result<ScheduleResponse> {
        info!(
            gateway = %GATEWAY,
            class = ?msg.request.class,
            len = msg.raw_payload.len(),
            "schedule downlink"
        );
        let path = msg.request.downlink_paths.first().cloned();
        let _ = self.tx.send(msg);
        Ok(ScheduleResponse {
            delay: Duration::from_millis(950),
            downlink_path: path,
        })
    }
}

fn provision(config: &NetworkServerConfig) -> Result<EndDevice> {
    let mut ids = EndDeviceIdentifiers::new("example-app", "sensor-1");
    ids.dev_addr = Some(DEV_ADDR);
    let mut dev = EndDevice::new(ids, "EU_863_870");
    dev.lorawan_version = MacVersion::V1_0_3;
    dev.supports_join = false;
    let band = dev.band()?;
    dev.mac_state = Some(MacState::new(
        &band,
        dev.lorawan_version,
        &dev.mac_settings,
        &config.default_mac_settings,
    ));
    dev.session = Some(Session::new(
        DEV_ADDR,
        SessionKeys::legacy(b"example-session".to_vec(), KeyEnvelope::plain(NWK_S_KEY)),
        SystemTime::now(),
    ));
    Ok(dev)
}

fn data_uplink(f_cnt: u32, payload: &[u8]) -> std::result::Result<Vec<u8>, Box<dyn Error>> {
    let mut phy = PHYPayload::data(
        MType::UnconfirmedUp,
        MACPayload {
            f_hdr: FHDR {
                dev_addr: DEV_ADDR,
                f_ctrl: FCtrl::default(),
                f_cnt: f_cnt & 0xFFFF,
                f_opts: Default::default(),
            },
            f_port: Some(1),
            frm_payload: payload.to_vec(),
        },
    );
    let msg = phy.encode_without_mic()?;
    phy.mic = compute_legacy_uplink_mic(&NWK_S_KEY, DEV_ADDR, f_cnt, &msg)?;
    Ok(phy.encode()?)
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = NetworkServerConfig::from_toml_str(
        r#"
        net_id = "000013"
        deduplication_window = "200ms"
        "#,
    )?;
    let registry = Arc::new(MemoryRegistry::new());
    registry.create(provision(&config)?).await?;

    let (tx, mut scheduled) = mpsc::unbounded_channel();
    let peers = Peers::new()
        .with_gateway_server("gs", Arc::new(LoggingGatewayServer { tx }))
        .with_gateway(GATEWAY, "gs");
    let ns = Arc::new(NetworkServer::new(
        config,
        registry.clone(),
        peers,
        Arc::new(MemoryKeyVault::new()),
        Arc::new(TracingEventSink),
        Arc::new(SystemClock),
    )?);
    let mut app = ns.link_application("example-app");
    let cancel = CancellationToken::new();
    let workers = ns.start(cancel.clone());

    let dev = registry
        .get_by_id("example-app.sensor-1")
        .await?
        .map(|(dev, _)| dev)
        .ok_or_else(|| lorawan_ns::Error::not_found(Reason::DeviceNotFound, "sensor-1"))?;
    ns.downlink_queue_push(
        &dev.ids,
        vec![ApplicationDownlink {
            session_key_id: b"example-session".to_vec(),
            f_port: 1,
            f_cnt: 1,
            frm_payload: b"led=on".to_vec(),
            confirmed: false,
            priority: TxPriority::Normal,
            class_b_c: None,
            correlation_ids: vec!["example:downlink:1".into()],
        }],
    )
    .await?;

    ns.handle_uplink(UplinkMessage {
        raw_payload: data_uplink(1, b"temp=21.5")?,
        rx_metadata: vec![RxMetadata {
            gateway_id: GATEWAY.into(),
            timestamp: 1_000_000,
            channel_rssi: -97.0,
            snr: 8.25,
            uplink_token: vec![0x0A, 0x0B],
            ..Default::default()
        }],
        settings: TxSettings {
            data_rate_index: 5,
            frequency: 868_100_000,
            timestamp: 1_000_000,
        },
        received_at: None,
        correlation_ids: vec!["example:uplink:1".into()],
    })
    .await?;

    if let Some(up) = app.recv().await {
        if let ApplicationUpMessage::Uplink { f_cnt, frm_payload, .. } = up.message {
            info!(f_cnt, payload = ?String::from_utf8_lossy(&frm_payload), "application uplink");
        }
    }

    if let Some(msg) = scheduled.recv().await {
        ns.report_tx_acknowledgment(GatewayTxAcknowledgment {
            gateway_id: GATEWAY.into(),
            correlation_ids: msg.correlation_ids,
            result: TxAckResult::Success,
        })
        .await?;
        if let Some(up) = app.recv().await {
            info!(message = ?up.message, "application downlink sent");
        }
    }

    cancel.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}
