use std::sync::Arc;

use tokio::time::Instant;

use crate::config::DialConfig;
use crate::conn::Conn;
use crate::engine::{PeerFactory, WebRtcEngine};
use crate::error::{Result, RtcError};
use crate::logging;
use crate::negotiate::{Negotiation, Role, negotiate};
use crate::signal::SignalConn;
use crate::ws::{FALLBACK_PATH, WsConn};

/// Connects to a [`crate::Listener`] at `address` (`host:port[/path]`) and
/// negotiates a data channel with the `webrtc` engine.
pub async fn dial(address: &str, config: DialConfig) -> Result<Conn> {
    dial_with_engine(address, config, Arc::new(WebRtcEngine::new())).await
}

pub async fn dial_with_engine(address: &str, config: DialConfig, factory: Arc<dyn PeerFactory>) -> Result<Conn> {
    let logger = config.logger.clone();
    logging::scoped(logger.as_ref(), async move {
        let deadline = Instant::now() + config.timeout;
        let connect = WsConn::connect(address, None, config.tls.clone());
        let signal = match tokio::time::timeout_at(deadline, connect).await {
            Ok(signal) => signal?,
            Err(_) => return Err(RtcError::Timeout(config.timeout)),
        };
        run_initiator(Arc::new(signal), &config, factory.as_ref(), deadline).await
    })
    .await
}

/// Negotiates over an already connected signaling channel. The channel is
/// closed when this returns.
pub async fn dial_signal(
    signal: Arc<dyn SignalConn>,
    config: DialConfig,
    factory: Arc<dyn PeerFactory>,
) -> Result<Conn> {
    let logger = config.logger.clone();
    logging::scoped(logger.as_ref(), async move {
        let deadline = Instant::now() + config.timeout;
        run_initiator(signal, &config, factory.as_ref(), deadline).await
    })
    .await
}

/// Connects to the listener's fallback path and uses the websocket itself
/// as the stream.
pub async fn dial_fallback(address: &str, config: DialConfig) -> Result<WsConn> {
    let logger = config.logger.clone();
    logging::scoped(logger.as_ref(), async move {
        let connect = WsConn::connect(address, Some(FALLBACK_PATH), config.tls.clone());
        let conn = tokio::time::timeout(config.timeout, connect)
            .await
            .map_err(|_| RtcError::Timeout(config.timeout))??;
        tracing::warn!(target: "rtcnet", remote = %conn.remote_addr(), "using websocket fallback");
        Ok(conn)
    })
    .await
}

async fn run_initiator(
    signal: Arc<dyn SignalConn>,
    config: &DialConfig,
    factory: &dyn PeerFactory,
    deadline: Instant,
) -> Result<Conn> {
    let outcome = negotiate(Negotiation {
        role: Role::Initiator,
        factory,
        signal: Arc::clone(&signal),
        ice_servers: &config.ice_servers,
        ordered: config.ordered,
        deadline,
        timeout: config.timeout,
    })
    .await;
    if let Err(err) = signal.close().await {
        tracing::debug!(target: "rtcnet", error = %err, "closing signaling channel");
    }
    outcome
}
