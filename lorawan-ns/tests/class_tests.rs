use std::time::Duration;

use lorawan_ns::{
    application::ApplicationUpMessage,
    config::TxPriority,
    device::{ApplicationDownlink, ClassBcConfig, ClassBcGateway, DeviceClass, EndDevice},
    error::{ErrorKind, Reason},
    events,
    lorawan::MacVersion,
    messages::{GatewayTxAcknowledgment, TxAckResult},
};
use tokio_util::sync::CancellationToken;

mod mock;
use mock::*;

fn downlink(f_cnt: u32, confirmed: bool) -> ApplicationDownlink {
    ApplicationDownlink {
        session_key_id: b"session-1".to_vec(),
        f_port: 10,
        f_cnt,
        frm_payload: vec![0xCA, 0xFE],
        confirmed,
        priority: TxPriority::Normal,
        class_b_c: None,
        correlation_ids: vec![format!("as:downlink:{f_cnt}")],
    }
}

fn fixed_gateway() -> ClassBcConfig {
    ClassBcConfig {
        absolute_time: None,
        gateways: vec![ClassBcGateway {
            gateway_id: GATEWAY.into(),
            antenna_index: 0,
            group_index: 0,
        }],
    }
}

fn class_c_device() -> EndDevice {
    let mut dev = abp_device("dev-c", MacVersion::V1_0_3, 0);
    dev.supports_class_c = true;
    dev.mac_settings.class_c_timeout = Some(Duration::from_secs(30));
    dev.mac_state.as_mut().unwrap().device_class = DeviceClass::C;
    dev
}

#[tokio::test(start_paused = true)]
async fn test_class_a_downlink_and_tx_acknowledgment() {
    let h = Harness::new();
    h.create(abp_device("dev-a", MacVersion::V1_0_3, 5)).await;
    let mut app = h.ns.link_application("app");
    let ids = h.device("app.dev-a").await.ids;

    h.ns.downlink_queue_push(&ids, vec![downlink(1, false)]).await.unwrap();
    assert_eq!(h.ns.tasks().scheduled("app.dev-a"), None);

    let cancel = CancellationToken::new();
    let workers = h.ns.start(cancel.clone());
    let raw = data_uplink(DEV_ADDR, &NWK_S_KEY, 6, 1, b"up");
    h.ns.handle_uplink(uplink(raw, t0(), 4242)).await.unwrap();
    assert!(matches!(app.recv().await.unwrap().message, ApplicationUpMessage::Uplink { f_cnt: 6, .. }));

    let msg = h.gs.next().await.unwrap();
    assert_eq!(msg.request.class, DeviceClass::A);
    assert!(msg.request.rx1.is_some() || msg.request.rx2.is_some());
    assert_eq!(msg.request.rx1_delay, Duration::from_secs(1));
    assert_eq!(msg.request.downlink_paths[0].gateway_id, GATEWAY);
    assert_eq!(msg.request.downlink_paths[0].uplink_token, Some(vec![0x01, 0x02, 4242u32 as u8]));
    assert!(wait_for(|| h.has_event(events::SCHEDULE_DATA_DOWNLINK)).await);

    let dev = h.device("app.dev-a").await;
    assert!(dev.session.as_ref().unwrap().queued_application_downlinks.is_empty());
    assert_eq!(dev.session.as_ref().unwrap().last_n_f_cnt_down, 1);
    assert!(!dev.mac_state.as_ref().unwrap().rx_windows_available);

    h.ns.report_tx_acknowledgment(GatewayTxAcknowledgment {
        gateway_id: GATEWAY.into(),
        correlation_ids: msg.correlation_ids.clone(),
        result: TxAckResult::Success,
    })
    .await
    .unwrap();
    assert!(h.has_event(events::TRANSMIT_DOWNLINK));
    match app.recv().await.unwrap().message {
        ApplicationUpMessage::DownlinkSent(down) => assert_eq!(down.f_cnt, 1),
        other => panic!("unexpected application uplink {other:?}"),
    }

    // A second acknowledgment for the same downlink is ignored.
    h.ns.report_tx_acknowledgment(GatewayTxAcknowledgment {
        gateway_id: GATEWAY.into(),
        correlation_ids: msg.correlation_ids,
        result: TxAckResult::Success,
    })
    .await
    .unwrap();
    assert_eq!(h.count_events(events::TRANSMIT_DOWNLINK), 1);
    assert!(app.try_recv().is_err());

    cancel.cancel();
    for worker in workers {
        worker.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_class_c_confirmed_downlinks_are_spaced() {
    let h = Harness::new();
    h.create(class_c_device()).await;
    let ids = h.device("app.dev-c").await.ids;
    let cancel = CancellationToken::new();
    let workers = h.ns.start(cancel.clone());

    let mut first = downlink(1, true);
    first.class_b_c = Some(fixed_gateway());
    h.ns.downlink_queue_push(&ids, vec![first]).await.unwrap();
    let schedule_window = h.ns.config().downlink_tasks.schedule_window;
    assert_eq!(h.ns.tasks().scheduled("app.dev-c"), Some(t0() + schedule_window));

    let sent_at = t0() + schedule_window;
    h.clock.set(sent_at);
    let msg = h.gs.next().await.unwrap();
    assert_eq!(msg.request.class, DeviceClass::C);
    assert_eq!(msg.request.rx1, None);
    assert!(msg.request.rx2.is_some());
    assert_eq!(msg.request.downlink_paths[0].uplink_token, None);
    assert!(wait_for(|| h.has_event(events::SCHEDULE_DATA_DOWNLINK)).await);

    let dev = h.device("app.dev-c").await;
    let state = dev.mac_state.as_ref().unwrap();
    let transmit_at = sent_at + Duration::from_millis(900);
    assert_eq!(state.last_confirmed_downlink_at, Some(transmit_at));
    assert_eq!(state.pending_application_downlink.as_ref().map(|d| d.f_cnt), Some(1));
    assert_eq!(dev.session.as_ref().unwrap().last_conf_f_cnt_down, 1);

    // The next confirmed downlink waits for the class C timeout.
    let mut second = downlink(2, true);
    second.class_b_c = Some(fixed_gateway());
    h.ns.downlink_queue_push(&ids, vec![second]).await.unwrap();
    h.clock.set(sent_at + schedule_window);
    let not_before = transmit_at + Duration::from_secs(30);
    assert!(wait_for(|| h.ns.tasks().scheduled("app.dev-c") == Some(not_before)).await);
    assert!(h.gs.try_next().await.is_none());

    cancel.cancel();
    for worker in workers {
        worker.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_terminal_failure_drops_downlink_once() {
    let h = Harness::new();
    h.create(class_c_device()).await;
    let ids = h.device("app.dev-c").await.ids;
    let mut app = h.ns.link_application("app");
    h.gs.fail_with(ErrorKind::ResourceExhausted);

    let mut down = downlink(1, false);
    down.class_b_c = Some(ClassBcConfig {
        absolute_time: Some(t0() + Duration::from_millis(1500)),
        ..fixed_gateway()
    });
    h.ns.downlink_queue_push(&ids, vec![down]).await.unwrap();
    h.clock.set(t0() + h.ns.config().downlink_tasks.schedule_window);

    let cancel = CancellationToken::new();
    let workers = h.ns.start(cancel.clone());
    let msg = h.gs.next().await.unwrap();
    assert_eq!(msg.request.absolute_time, Some(t0() + Duration::from_millis(1500)));

    match app.recv().await.unwrap().message {
        ApplicationUpMessage::DownlinkFailed { downlink, error } => {
            assert_eq!(downlink.f_cnt, 1);
            assert_eq!(error.kind(), ErrorKind::FailedPrecondition);
            assert_eq!(error.reason(), Reason::ApplicationDownlinkFailed);
            assert_eq!(error.path_errors()[0].kind, ErrorKind::ResourceExhausted);
        }
        other => panic!("unexpected application uplink {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.gs.try_next().await.is_none());
    assert!(app.try_recv().is_err());
    assert_eq!(h.count_events(events::SCHEDULE_DATA_DOWNLINK_FAIL), 1);
    assert_eq!(h.ns.tasks().scheduled("app.dev-c"), None);
    let dev = h.device("app.dev-c").await;
    assert!(dev.session.unwrap().queued_application_downlinks.is_empty());

    cancel.cancel();
    for worker in workers {
        worker.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failure_keeps_downlink() {
    let h = Harness::new();
    h.create(class_c_device()).await;
    let ids = h.device("app.dev-c").await.ids;
    h.gs.fail_with(ErrorKind::Unavailable);

    let mut down = downlink(1, false);
    down.class_b_c = Some(fixed_gateway());
    h.ns.downlink_queue_push(&ids, vec![down.clone()]).await.unwrap();
    let now = t0() + h.ns.config().downlink_tasks.schedule_window;
    h.clock.set(now);

    let cancel = CancellationToken::new();
    let workers = h.ns.start(cancel.clone());
    assert!(h.gs.next().await.is_some());
    let retry_at = now + h.ns.config().downlink_tasks.retry_backoff;
    assert!(wait_for(|| h.ns.tasks().scheduled("app.dev-c") == Some(retry_at)).await);

    let dev = h.device("app.dev-c").await;
    assert_eq!(dev.session.unwrap().queued_application_downlinks, vec![down]);

    cancel.cancel();
    for worker in workers {
        worker.await.unwrap();
    }
}
