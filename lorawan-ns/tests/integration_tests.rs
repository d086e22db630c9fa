use std::time::Duration;

use lorawan_ns::{
    application::ApplicationUpMessage,
    config::device::{AesKey, NetId},
    error::{ErrorKind, Reason},
    events,
    lorawan::mac::{Payload, RejoinRequestPayload, MHDR},
    lorawan::{MType, MacVersion, PHYPayload},
    messages::UplinkMessage,
};
use tokio_util::sync::CancellationToken;

mod mock;
use mock::*;

#[tokio::test(start_paused = true)]
async fn test_data_uplink_reaches_application() {
    let h = Harness::new();
    h.create(abp_device("dev-1", MacVersion::V1_0_3, 9)).await;
    let mut app = h.ns.link_application("app");

    let raw = data_uplink(DEV_ADDR, &NWK_S_KEY, 10, 7, b"\x01\x02\x03");
    h.ns.handle_uplink(uplink(raw, t0(), 1000)).await.unwrap();

    let up = app.try_recv().unwrap();
    assert_eq!(up.ids.device_id, "dev-1");
    assert!(up.correlation_ids.iter().any(|id| id.starts_with("ns:uplink:")));
    match up.message {
        ApplicationUpMessage::Uplink {
            f_port,
            f_cnt,
            frm_payload,
            session_key_id,
            ..
        } => {
            assert_eq!(f_port, 7);
            assert_eq!(f_cnt, 10);
            assert_eq!(frm_payload, b"\x01\x02\x03");
            assert_eq!(session_key_id, b"session-1");
        }
        other => panic!("unexpected application uplink {other:?}"),
    }

    let dev = h.device("app.dev-1").await;
    assert_eq!(dev.session.unwrap().last_f_cnt_up, 10);
    assert!(dev.mac_state.unwrap().rx_windows_available);
    assert!(h.has_event(events::RECEIVE_DATA_UPLINK));
    assert!(h.has_event(events::PROCESS_DATA_UPLINK));
    assert_eq!(h.ns.tasks().scheduled("app.dev-1"), Some(t0()));
}

#[tokio::test(start_paused = true)]
async fn test_class_a_retransmission() {
    let h = Harness::new();
    h.create(abp_device("dev-1", MacVersion::V1_0_2, 32)).await;
    let mut app = h.ns.link_application("app");

    let raw = data_uplink(DEV_ADDR, &NWK_S_KEY, 34, 1, b"temp=21");
    h.ns.handle_uplink(uplink(raw.clone(), t0(), 1000)).await.unwrap();
    assert!(matches!(
        app.try_recv().unwrap().message,
        ApplicationUpMessage::Uplink { f_cnt: 34, .. }
    ));

    // Past the cooldown, the same frame comes back with another timestamp.
    tokio::time::sleep(Duration::from_millis(500)).await;
    h.clock.advance(Duration::from_millis(500));
    h.ns.handle_uplink(uplink(raw, t0() + Duration::from_millis(500), 501_000))
        .await
        .unwrap();

    let dev = h.device("app.dev-1").await;
    assert_eq!(dev.session.as_ref().unwrap().last_f_cnt_up, 34);
    let state = dev.mac_state.unwrap();
    let nb_trans = state.recent_uplinks.iter().filter(|up| up.f_cnt == 34).count();
    assert_eq!(nb_trans, 2);
    assert!(app.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_frame_counter_never_decreases() {
    let h = Harness::new();
    h.create(abp_device("dev-1", MacVersion::V1_0_3, 0)).await;

    let mut last = 0;
    for (i, f_cnt) in [1u32, 2, 5, 6].into_iter().enumerate() {
        let at = t0() + Duration::from_secs(i as u64 * 30);
        h.clock.set(at);
        let raw = data_uplink(DEV_ADDR, &NWK_S_KEY, f_cnt, 1, &[i as u8]);
        h.ns.handle_uplink(uplink(raw, at, i as u32)).await.unwrap();
        let current = h.device("app.dev-1").await.session.unwrap().last_f_cnt_up;
        assert!(current > last);
        last = current;
    }

    // Replayed frame counter.
    h.clock.set(t0() + Duration::from_secs(300));
    let raw = data_uplink(DEV_ADDR, &NWK_S_KEY, 2, 1, b"replay");
    let err = h
        .ns
        .handle_uplink(uplink(raw, t0() + Duration::from_secs(300), 99))
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::NotFound | ErrorKind::InvalidArgument));
    assert_eq!(h.device("app.dev-1").await.session.unwrap().last_f_cnt_up, 6);
    assert!(h.has_event(events::DROP_DATA_UPLINK));
}

#[tokio::test(start_paused = true)]
async fn test_copies_from_several_gateways_are_merged() {
    let h = Harness::new();
    h.create(abp_device("dev-1", MacVersion::V1_0_3, 0)).await;

    let raw = data_uplink(DEV_ADDR, &NWK_S_KEY, 1, 1, b"hello");
    let first = uplink(raw.clone(), t0(), 100);
    let mut second = uplink(raw, t0(), 200);
    second.rx_metadata[0].gateway_id = "gw-2".into();
    let (a, b) = tokio::join!(h.ns.handle_uplink(first), h.ns.handle_uplink(second));
    a.unwrap();
    b.unwrap();

    assert_eq!(h.count_events(events::RECEIVE_DATA_UPLINK), 1);
    assert_eq!(h.count_events(events::RECEIVE_DUPLICATE), 1);
    let dev = h.device("app.dev-1").await;
    let state = dev.mac_state.unwrap();
    let up = state.last_uplink().unwrap();
    assert_eq!(up.rx_metadata.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_uplink_with_wrong_key_is_dropped() {
    let h = Harness::new();
    h.create(abp_device("dev-1", MacVersion::V1_0_3, 0)).await;
    let before = h.device("app.dev-1").await;

    let raw = data_uplink(DEV_ADDR, &AesKey([0x99; 16]), 1, 1, b"forged");
    let err = h.ns.handle_uplink(uplink(raw, t0(), 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.reason(), Reason::DeviceNotMatched);
    assert_eq!(h.device("app.dev-1").await, before);
    assert!(h.has_event(events::DROP_DATA_UPLINK));
}

#[tokio::test(start_paused = true)]
async fn test_join_and_pending_session_promotion() {
    let h = Harness::new();
    let mut dev = otaa_device("dev-1", MacVersion::V1_0_3);
    dev.session.as_mut().unwrap().last_f_cnt_up = 10;
    h.create(dev).await;
    let mut app = h.ns.link_application("app");
    let cancel = CancellationToken::new();
    let workers = h.ns.start(cancel.clone());

    h.ns.handle_uplink(uplink(join_request(0x0102), t0(), 1000))
        .await
        .unwrap();
    assert_eq!(h.js.requests.lock().unwrap().len(), 1);
    assert!(matches!(app.try_recv().unwrap().message, ApplicationUpMessage::JoinAccept { .. }));

    let accept = h.gs.next().await.unwrap();
    assert_eq!(accept.raw_payload, MockJoinServer::join_accept_payload());
    assert_eq!(accept.request.rx1_delay, Duration::from_secs(5));
    assert!(wait_for(|| h.has_event(events::SCHEDULE_JOIN_ACCEPT)).await);

    let joined = h.device("app.dev-1").await;
    let pending = joined.pending_session.clone().unwrap();
    assert_eq!(joined.session.as_ref().unwrap().dev_addr, DEV_ADDR);
    assert!(joined.pending_mac_state.as_ref().unwrap().queued_join_accept.is_none());
    let new_addr = pending.dev_addr;

    // A frame on the new address with an unknown key changes nothing.
    let at = t0() + Duration::from_secs(10);
    h.clock.set(at);
    let forged = data_uplink(new_addr, &AesKey([0x77; 16]), 1, 1, b"x");
    assert!(h.ns.handle_uplink(uplink(forged, at, 2000)).await.is_err());
    assert_eq!(h.device("app.dev-1").await, joined);

    let raw = data_uplink(new_addr, &h.js.nwk_s_key, 1, 1, b"first");
    h.ns.handle_uplink(uplink(raw, at, 3000)).await.unwrap();

    let dev = h.device("app.dev-1").await;
    let session = dev.session.as_ref().unwrap();
    assert_eq!(session.dev_addr, new_addr);
    assert_eq!(session.keys.session_key_id, b"session-2");
    assert_eq!(session.last_f_cnt_up, 1);
    assert_eq!(dev.ids.dev_addr, Some(new_addr));
    assert!(dev.pending_session.is_none());
    assert!(dev.pending_mac_state.is_none());
    assert!(dev.mac_state.as_ref().unwrap().pending_join_request.is_none());
    assert!(h.has_event(events::SESSION_PROMOTE));

    cancel.cancel();
    for worker in workers {
        worker.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_join_accept_kept_until_windows_pass() {
    let h = Harness::new();
    h.create(otaa_device("dev-1", MacVersion::V1_0_3)).await;
    h.gs.fail_with(ErrorKind::FailedPrecondition);
    let cancel = CancellationToken::new();
    let workers = h.ns.start(cancel.clone());

    h.ns.handle_uplink(uplink(join_request(0x0203), t0(), 1000))
        .await
        .unwrap();
    assert!(h.gs.next().await.is_some());
    assert!(wait_for(|| h.has_event(events::SCHEDULE_JOIN_ACCEPT_FAIL)).await);

    let retry_at = t0() + h.ns.config().downlink_tasks.retry_backoff;
    assert!(wait_for(|| h.ns.tasks().scheduled("app.dev-1") == Some(retry_at)).await);
    let dev = h.device("app.dev-1").await;
    assert!(dev.pending_mac_state.as_ref().unwrap().queued_join_accept.is_some());

    // Past RX2 of the join-request the accept is dropped.
    h.clock.set(t0() + Duration::from_secs(7));
    assert!(wait_for(|| h.count_events(events::SCHEDULE_JOIN_ACCEPT_FAIL) == 2).await);
    assert!(
        wait_for(|| h.ns.tasks().scheduled("app.dev-1").is_none()).await,
        "no retry after expiry"
    );
    let dev = h.device("app.dev-1").await;
    assert!(dev.pending_mac_state.as_ref().unwrap().queued_join_accept.is_none());

    cancel.cancel();
    for worker in workers {
        worker.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_join_request_from_unknown_device() {
    let h = Harness::new();
    let err = h
        .ns
        .handle_uplink(uplink(join_request(1), t0(), 1))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), Reason::DeviceNotFound);
    assert!(h.has_event(events::DROP_JOIN_REQUEST));
    assert!(h.js.requests.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_join_request_from_abp_device() {
    let h = Harness::new();
    let mut dev = otaa_device("dev-1", MacVersion::V1_0_3);
    dev.supports_join = false;
    h.create(dev).await;

    let err = h
        .ns
        .handle_uplink(uplink(join_request(1), t0(), 1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    assert_eq!(err.reason(), Reason::JoinNotSupported);
    assert!(h.has_event(events::RECEIVE_JOIN_REQUEST));
    assert!(h.has_event(events::DROP_JOIN_REQUEST));
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_request_is_unimplemented() {
    let h = Harness::new();
    let raw = PHYPayload {
        mhdr: MHDR::new(MType::RejoinRequest),
        payload: Payload::RejoinRequest(RejoinRequestPayload::NetId {
            rejoin_type: 0,
            net_id: NetId([0x00, 0x00, 0x13]),
            dev_eui: DEV_EUI,
            count: 1,
        }),
        mic: [0; 4],
    }
    .encode()
    .unwrap();

    let err = h.ns.handle_uplink(uplink(raw, t0(), 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unimplemented);
    assert!(h.has_event(events::RECEIVE_REJOIN_REQUEST));
    assert!(h.has_event(events::DROP_REJOIN_REQUEST));
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_uplink() {
    let h = Harness::new();
    let err = h
        .ns
        .handle_uplink(UplinkMessage {
            raw_payload: vec![0x40, 0x01],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(h.events.names().is_empty());
}
