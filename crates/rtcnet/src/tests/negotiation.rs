use std::sync::Arc;
use std::time::Duration;

use rtcnet_test_macros::rtc_test;

use super::{establish, peers_by_role, read_exact};
use crate::engine::{PeerFactory, SessionDescription};
use crate::signal::{Signal, SignalConn, SignalMessage};
use crate::testing::{LoopbackEngine, MemorySignalListener, signal_pair};
use crate::{DATA_CHANNEL_LABEL, DialConfig, ListenConfig, Listener, NetConn, RtcError, dial_signal};

fn candidate_names(messages: &[SignalMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|message| message.candidate.as_ref())
        .map(|candidate| candidate.candidate_init.candidate.clone())
        .collect()
}

#[rtc_test(10)]
async fn offer_answer_exchange_carries_an_echo() {
    let engine = LoopbackEngine::new();
    let factory: Arc<dyn PeerFactory> = Arc::new(engine.clone());
    let signaling = MemorySignalListener::new();
    let listener = Listener::from_parts(signaling.clone(), ListenConfig::default(), Arc::clone(&factory));
    let client_signal = signaling.connect();

    let dialing = tokio::spawn(dial_signal(client_signal.clone(), DialConfig::default(), factory));
    let server = listener.accept().await.expect("accept");
    let client = dialing.await.expect("join").expect("dial");

    let sent = client_signal.sent_messages();
    assert_eq!(sent[0].sdp, Some(SessionDescription::offer("o1")));
    assert_eq!(candidate_names(&sent[1..]), ["candidate:o1-0", "candidate:o1-1"]);
    assert!(client_signal.is_closed(), "dial closes its signaling channel");

    let (initiator, responder) = peers_by_role(&engine);
    assert_eq!(initiator.remote_description(), Some(SessionDescription::answer("a1")));
    assert_eq!(responder.local_description(), Some(SessionDescription::answer("a1")));
    assert_eq!(initiator.added_candidates(), ["candidate:a1-0", "candidate:a1-1"]);
    assert_eq!(responder.added_candidates(), ["candidate:o1-0", "candidate:o1-1"]);
    assert_eq!(initiator.requested_channel(), Some((DATA_CHANNEL_LABEL.to_string(), true)));

    let echo = tokio::spawn(async move {
        let request = read_exact(server.as_ref(), 13).await;
        server.write(&request).await.expect("echo write");
        server
    });

    assert_eq!(client.write(b"Hello, World!").await.expect("write"), 13);
    let reply = read_exact(&client, 13).await;
    assert_eq!(reply, b"Hello, World!");
    let _server = echo.await.expect("join echo");
}

#[rtc_test(10)]
async fn buffered_candidates_keep_discovery_order() {
    let engine = LoopbackEngine::new().with_candidates(6);
    let established = establish(engine).await;
    let (initiator, responder) = peers_by_role(&established.engine);
    let expected: Vec<String> = (0..6).map(|i| format!("candidate:o1-{i}")).collect();
    assert_eq!(responder.added_candidates(), expected);
    let expected: Vec<String> = (0..6).map(|i| format!("candidate:a1-{i}")).collect();
    assert_eq!(initiator.added_candidates(), expected);
}

#[rtc_test(10)]
async fn unordered_dial_requests_unordered_channel() {
    let engine = LoopbackEngine::new();
    let signaling = MemorySignalListener::new();
    let listener = Listener::from_parts(signaling.clone(), ListenConfig::default(), Arc::new(engine.clone()));
    let config = DialConfig::default().with_ordered(false);
    let dialing = tokio::spawn(dial_signal(signaling.connect(), config, Arc::new(engine.clone())));
    let _server = listener.accept().await.expect("accept");
    let _client = dialing.await.expect("join").expect("dial");
    let (initiator, _) = peers_by_role(&engine);
    assert_eq!(initiator.requested_channel(), Some(("data".to_string(), false)));
}

#[rtc_test(10)]
async fn malformed_signal_is_skipped() {
    let engine = LoopbackEngine::new();
    let signaling = MemorySignalListener::new();
    let listener = Listener::from_parts(signaling.clone(), ListenConfig::default(), Arc::new(engine.clone()));
    let client_signal = signaling.connect();
    client_signal.inject_before_next_send(&b"{\"SDP\": not json"[..]);
    client_signal.inject_before_next_send(&b"{}"[..]);

    let dialing = tokio::spawn(dial_signal(client_signal, DialConfig::default(), Arc::new(engine)));
    let server = listener.accept().await.expect("accept despite garbage");
    let client = dialing.await.expect("join").expect("dial");

    server.write(b"ping").await.expect("write");
    assert_eq!(read_exact(&client, 4).await, b"ping");
}

#[rtc_test(10)]
async fn dial_deadline_before_answer_times_out() {
    let engine = LoopbackEngine::new();
    let (client_signal, responder_signal) = signal_pair();
    let config = DialConfig::default().with_timeout(Duration::from_millis(200));

    let dialing = tokio::spawn(dial_signal(client_signal.clone(), config, Arc::new(engine.clone())));

    let offer = responder_signal.recv().await.expect("recv").expect("offer frame");
    let offer = SignalMessage::decode(&offer).expect("decode").into_signal();
    assert!(matches!(offer, Signal::Description(ref desc) if desc.sdp == "o1"));

    let err = dialing.await.expect("join").unwrap_err();
    assert_eq!(err, RtcError::Timeout(Duration::from_millis(200)));
    assert!(client_signal.is_closed());

    let late = SignalMessage::description(SessionDescription::answer("a1"))
        .encode()
        .expect("encode");
    let _ = responder_signal.send(late).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.peers().iter().all(|peer| peer.is_closed()));
    assert_eq!(responder_signal.sent_count(), 1);
}

#[rtc_test(10)]
async fn responder_rejects_unknown_offer() {
    let engine = LoopbackEngine::new();
    let signaling = MemorySignalListener::new();
    let listener = Listener::from_parts(signaling.clone(), ListenConfig::default(), Arc::new(engine));
    let client_signal = signaling.connect();

    let bogus = SignalMessage::description(SessionDescription::offer("nobody"))
        .encode()
        .expect("encode");
    client_signal.send(bogus).await.expect("send");

    match listener.accept().await {
        Err(RtcError::Negotiation { stage, .. }) => assert_eq!(stage, "set_remote_description"),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("negotiation should have failed"),
    }
}

#[rtc_test(10)]
async fn responder_gives_up_after_negotiation_timeout() {
    let engine = LoopbackEngine::new();
    let signaling = MemorySignalListener::new();
    let config = ListenConfig::default().with_negotiation_timeout(Duration::from_millis(150));
    let listener = Listener::from_parts(signaling.clone(), config, Arc::new(engine));
    let client_signal = signaling.connect();

    let err = listener.accept().await.err().expect("timeout error");
    assert_eq!(err, RtcError::Timeout(Duration::from_millis(150)));
    assert_eq!(client_signal.recv().await.expect("recv"), None);
}

#[rtc_test(10)]
async fn initiator_fails_when_signaling_drops() {
    let engine = LoopbackEngine::new();
    let (client_signal, responder_signal) = signal_pair();
    let dialing = tokio::spawn(dial_signal(client_signal, DialConfig::default(), Arc::new(engine)));

    let _offer = responder_signal.recv().await.expect("recv").expect("offer");
    responder_signal.close().await.expect("close");
    drop(responder_signal);

    let err = dialing.await.expect("join").unwrap_err();
    assert!(matches!(err, RtcError::Signal(_)), "unexpected error {err}");
}

#[rtc_test(10)]
async fn channel_that_never_opens_times_out() {
    let engine = LoopbackEngine::new().hold_channel();
    let signaling = MemorySignalListener::new();
    let listen = ListenConfig::default().with_negotiation_timeout(Duration::from_secs(5));
    let _listener = Listener::from_parts(signaling.clone(), listen, Arc::new(engine.clone()));
    let config = DialConfig::default().with_timeout(Duration::from_millis(300));

    let err = dial_signal(signaling.connect(), config, Arc::new(engine))
        .await
        .unwrap_err();
    assert!(matches!(err, RtcError::Timeout(_)));
}
