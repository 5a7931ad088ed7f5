mod conn_behavior;
mod negotiation;

use std::sync::Arc;

use crate::engine::SdpType;
use crate::testing::{LoopbackEngine, LoopbackPeer, MemorySignalListener};
use crate::{Conn, DialConfig, ListenConfig, Listener, NetConn, dial_signal};

pub(crate) struct Established {
    pub client: Conn,
    pub server: Box<dyn NetConn>,
    pub listener: Listener,
    pub engine: LoopbackEngine,
}

/// Negotiates one connection through an in-memory listener.
pub(crate) async fn establish(engine: LoopbackEngine) -> Established {
    let signaling = MemorySignalListener::new();
    let listener = Listener::from_parts(signaling.clone(), ListenConfig::default(), Arc::new(engine.clone()));
    let client_signal = signaling.connect();
    let dialing = tokio::spawn(dial_signal(client_signal, DialConfig::default(), Arc::new(engine.clone())));
    let server = listener.accept().await.expect("accept");
    let client = dialing.await.expect("join dial").expect("dial");
    Established {
        client,
        server,
        listener,
        engine,
    }
}

pub(crate) async fn read_exact(conn: &dyn NetConn, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 64];
    while out.len() < len {
        let n = conn.read(&mut buf).await.expect("read");
        assert!(n > 0, "stream ended after {} of {len} bytes", out.len());
        out.extend_from_slice(&buf[..n]);
    }
    out
}

/// The (initiator, responder) peers of the single negotiation on `engine`.
pub(crate) fn peers_by_role(engine: &LoopbackEngine) -> (Arc<LoopbackPeer>, Arc<LoopbackPeer>) {
    let peers = engine.peers();
    let offered = |peer: &&Arc<LoopbackPeer>| {
        peer.local_description()
            .is_some_and(|desc| desc.sdp_type == SdpType::Offer)
    };
    let initiator = peers.iter().find(offered).cloned().expect("initiator peer");
    let responder = peers
        .iter()
        .find(|peer| !offered(peer))
        .cloned()
        .expect("responder peer");
    (initiator, responder)
}
