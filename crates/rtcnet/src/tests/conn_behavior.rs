use std::sync::Arc;
use std::time::{Duration, Instant};

use rtcnet_test_macros::rtc_test;

use super::{establish, peers_by_role, read_exact};
use crate::engine::{PeerFactory, PeerState};
use crate::signal::SignalConn;
use crate::testing::{LoopbackEngine, signal_pair};
use crate::{Conn, NetConn, RtcError};

#[rtc_test(10)]
async fn arbitrary_payloads_round_trip() {
    let established = establish(LoopbackEngine::new()).await;
    let client = established.client;
    let server = established.server;

    let payloads: Vec<Vec<u8>> = vec![
        vec![0],
        (0..=255).collect(),
        b"Hello, World!".to_vec(),
        vec![0xAB; 4096],
    ];
    for payload in &payloads {
        assert_eq!(client.write(payload).await.expect("write"), payload.len());
        assert_eq!(&read_exact(server.as_ref(), payload.len()).await, payload);

        assert_eq!(server.write(payload).await.expect("write"), payload.len());
        assert_eq!(&read_exact(&client, payload.len()).await, payload);
    }
}

#[rtc_test(10)]
async fn queued_error_preempts_data() {
    let established = establish(LoopbackEngine::new()).await;
    let client = established.client;
    established.server.write(b"data").await.expect("write");

    client.shared().push_error(RtcError::Stream("injected".into()));
    let mut buf = [0u8; 16];
    assert_eq!(client.read(&mut buf).await, Err(RtcError::Stream("injected".into())));
    let n = client.read(&mut buf).await.expect("data after error");
    assert_eq!(&buf[..n], b"data");
}

#[rtc_test(10)]
async fn concurrent_close_shares_one_result() {
    let established = establish(LoopbackEngine::new()).await;
    let (initiator, _) = peers_by_role(&established.engine);
    let client = Arc::new(established.client);

    let mut closers = Vec::new();
    for _ in 0..8 {
        let client = Arc::clone(&client);
        closers.push(tokio::spawn(async move { client.close().await }));
    }
    for closer in closers {
        assert_eq!(closer.await.expect("join"), Ok(()));
    }
    assert_eq!(client.close().await, Ok(()));
    assert!(client.is_closed());
    assert_eq!(initiator.close_calls(), 1);
    assert_eq!(initiator.channel_close_calls(), 1);
}

#[rtc_test(10)]
async fn close_failures_are_aggregated_and_repeated() {
    let engine = LoopbackEngine::new().fail_peer_close().fail_channel_close();
    let established = establish(engine).await;
    let client = Arc::new(established.client);

    let (first, second) = tokio::join!(client.close(), client.close());
    let err = first.unwrap_err();
    match &err {
        RtcError::Close(failures) => {
            assert_eq!(failures.len(), 2);
            assert!(failures[0].starts_with("data channel:"));
            assert!(failures[1].starts_with("peer connection:"));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(second.unwrap_err(), err);
    assert_eq!(client.close().await.unwrap_err(), err);
}

#[rtc_test(10)]
async fn push_after_close_is_ignored() {
    let established = establish(LoopbackEngine::new()).await;
    let client = established.client;
    client.close().await.expect("close");

    client.shared().push_error(RtcError::PeerFailed);
    let mut buf = [0u8; 4];
    assert_eq!(client.read(&mut buf).await, Err(RtcError::Closed));
    assert_eq!(client.write(b"late").await, Err(RtcError::Closed));
}

#[rtc_test(10)]
async fn failed_peer_reports_then_closes() {
    let established = establish(LoopbackEngine::new()).await;
    let (initiator, _) = peers_by_role(&established.engine);
    let client = established.client;

    initiator.inject_state(PeerState::Failed);
    let mut buf = [0u8; 4];
    let deadline = Instant::now() + Duration::from_secs(2);
    while !client.is_closed() {
        assert!(Instant::now() < deadline, "failed peer did not close the connection");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.read(&mut buf).await, Err(RtcError::PeerFailed));
    assert_eq!(client.read(&mut buf).await, Err(RtcError::Closed));
    assert!(initiator.is_closed());
}

#[rtc_test(10)]
async fn disconnected_peer_is_tolerated() {
    let established = establish(LoopbackEngine::new()).await;
    let (initiator, _) = peers_by_role(&established.engine);
    let client = established.client;

    initiator.inject_state(PeerState::Disconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!client.is_closed());
    client.write(b"still here").await.expect("write");
    assert_eq!(read_exact(established.server.as_ref(), 10).await, b"still here");
}

#[rtc_test(5)]
async fn unestablished_conn_refuses_io() {
    let engine = LoopbackEngine::new();
    let (peer, _events) = engine.new_peer(&[]).await.expect("peer");
    let (local, _remote) = signal_pair();
    let conn = Conn::new(peer, local.local_addr(), local.remote_addr());

    let mut buf = [0u8; 4];
    assert_eq!(conn.read(&mut buf).await, Err(RtcError::NotEstablished));
    assert_eq!(conn.write(b"x").await, Err(RtcError::NotEstablished));
    assert_eq!(conn.close().await, Ok(()));
}

#[rtc_test(5)]
async fn deadlines_are_accepted() {
    let established = establish(LoopbackEngine::new()).await;
    let client: &dyn NetConn = &established.client;
    let soon = Some(Instant::now() + Duration::from_millis(1));
    assert_eq!(client.set_deadline(soon), Ok(()));
    assert_eq!(client.set_read_deadline(None), Ok(()));
    assert_eq!(client.set_write_deadline(soon), Ok(()));
    assert_eq!(client.local_addr(), established.client.local_addr());
}
