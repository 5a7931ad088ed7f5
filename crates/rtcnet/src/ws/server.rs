use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use super::origin::{self, OriginPattern};
use super::{FALLBACK_PATH, WsConn};
use crate::error::{Result, RtcError};
use crate::listener::{Incoming, SignalListener};
use crate::logging;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKLOG: usize = 16;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Websocket signaling listener. Handshakes run in their own tasks so a
/// slow client never stalls the accept loop.
pub struct WsListener {
    local_addr: SocketAddr,
    incoming: AsyncMutex<mpsc::Receiver<Result<Incoming>>>,
    shutdown: watch::Sender<bool>,
}

struct HandshakeContext {
    tls: Option<tokio_native_tls::TlsAcceptor>,
    origin_patterns: Vec<OriginPattern>,
    incoming: mpsc::Sender<Result<Incoming>>,
    shutdown: watch::Receiver<bool>,
}

impl WsListener {
    pub async fn bind(
        address: &str,
        tls: Option<native_tls::TlsAcceptor>,
        origin_patterns: Vec<String>,
    ) -> Result<Self> {
        let origin_patterns = OriginPattern::parse_all(&origin_patterns)?;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|err| RtcError::Listener(format!("bind {address}: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| RtcError::Listener(err.to_string()))?;
        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let context = Arc::new(HandshakeContext {
            tls: tls.map(tokio_native_tls::TlsAcceptor::from),
            origin_patterns,
            incoming: incoming_tx,
            shutdown: shutdown_rx,
        });
        tracing::info!(target: "rtcnet", addr = %local_addr, tls = context.tls.is_some(), "websocket signaling listening");
        logging::spawn(serve(listener, context));
        Ok(Self {
            local_addr,
            incoming: AsyncMutex::new(incoming_rx),
            shutdown,
        })
    }
}

#[async_trait]
impl SignalListener for WsListener {
    async fn accept(&self) -> Result<Incoming> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(RtcError::Closed);
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            next = incoming.recv() => next.unwrap_or(Err(RtcError::Closed)),
            _ = shutdown.wait_for(|closed| *closed) => Err(RtcError::Closed),
        }
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        tracing::debug!(target: "rtcnet", addr = %self.local_addr, "websocket signaling stopped");
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn serve(listener: TcpListener, context: Arc<HandshakeContext>) {
    let mut shutdown = context.shutdown.clone();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((tcp, peer)) => {
                let context = Arc::clone(&context);
                logging::spawn(async move {
                    let outcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(tcp, peer, &context))
                        .await
                        .unwrap_or_else(|_| {
                            Err(RtcError::Listener(format!("handshake with {peer} timed out")))
                        });
                    publish(&context, outcome).await;
                });
            }
            Err(err) => {
                tracing::warn!(target: "rtcnet", error = %err, "tcp accept failed");
                publish(&context, Err(RtcError::Listener(format!("accept: {err}")))).await;
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn publish(context: &HandshakeContext, outcome: Result<Incoming>) {
    let mut shutdown = context.shutdown.clone();
    let shut_down = *shutdown.borrow();
    if shut_down {
        discard(outcome).await;
        return;
    }
    let rejected = tokio::select! {
        sent = context.incoming.send(outcome) => sent.err().map(|mpsc::error::SendError(outcome)| outcome),
        _ = shutdown.wait_for(|closed| *closed) => None,
    };
    if let Some(outcome) = rejected {
        discard(outcome).await;
    }
}

async fn discard(outcome: Result<Incoming>) {
    if let Ok(incoming) = outcome {
        let _ = incoming.close().await;
    }
}

async fn handshake(tcp: TcpStream, peer: SocketAddr, context: &HandshakeContext) -> Result<Incoming> {
    let local_addr = tcp
        .local_addr()
        .map_err(|err| RtcError::Listener(err.to_string()))?;
    let stream = match &context.tls {
        Some(acceptor) => {
            let tls = acceptor
                .accept(tcp)
                .await
                .map_err(|err| RtcError::Listener(format!("tls handshake with {peer}: {err}")))?;
            MaybeTlsStream::NativeTls(tls)
        }
        None => MaybeTlsStream::Plain(tcp),
    };

    let mut path = String::new();
    let ws = accept_hdr_async(stream, |request: &Request, response: Response| {
        path = request.uri().path().to_string();
        match origin::authorize(request, &context.origin_patterns) {
            Ok(()) => Ok(response),
            Err(reason) => {
                tracing::warn!(target: "rtcnet", peer = %peer, reason = %reason, "rejecting websocket origin");
                let mut rejection = ErrorResponse::new(Some(reason));
                *rejection.status_mut() = StatusCode::FORBIDDEN;
                Err(rejection)
            }
        }
    })
    .await
    .map_err(|err| RtcError::Listener(format!("websocket handshake with {peer}: {err}")))?;

    let conn = WsConn::new(ws, local_addr, peer);
    if path == FALLBACK_PATH {
        tracing::warn!(target: "rtcnet", peer = %peer, "client requested websocket fallback");
        Ok(Incoming::Fallback(Box::new(conn)))
    } else {
        tracing::debug!(target: "rtcnet", peer = %peer, path = %path, "signaling connection accepted");
        Ok(Incoming::Negotiate(Arc::new(conn)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    fn context(capacity: usize) -> (HandshakeContext, mpsc::Receiver<Result<Incoming>>, watch::Sender<bool>) {
        let (incoming, incoming_rx) = mpsc::channel(capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let context = HandshakeContext {
            tls: None,
            origin_patterns: Vec::new(),
            incoming,
            shutdown: shutdown_rx,
        };
        (context, incoming_rx, shutdown)
    }

    #[test]
    fn publishing_can_run_on_a_spawned_task() {
        let (context, _rx, _shutdown) = context(1);
        assert_send(&publish(&context, Err(RtcError::Listener("refused".into()))));
    }

    #[tokio::test]
    async fn publish_hands_over_until_shutdown() {
        let (context, mut rx, shutdown) = context(1);
        publish(&context, Err(RtcError::Listener("first".into()))).await;
        assert!(matches!(rx.try_recv(), Ok(Err(RtcError::Listener(_)))));

        publish(&context, Err(RtcError::Listener("fills the slot".into()))).await;
        let blocked = tokio::spawn({
            let context = Arc::new(context);
            async move { publish(&context, Err(RtcError::Listener("waits".into()))).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("publish stuck after shutdown")
            .expect("join");
        assert!(matches!(rx.try_recv(), Ok(Err(RtcError::Listener(reason))) if reason == "fills the slot"));
        assert!(rx.try_recv().is_err());
    }
}
