use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::time::Instant;
use tracing::Dispatch;

use crate::config::ListenConfig;
use crate::engine::{PeerFactory, WebRtcEngine};
use crate::error::{Result, RtcError};
use crate::logging;
use crate::negotiate::{Negotiation, Role, negotiate};
use crate::net::NetConn;
use crate::signal::SignalConn;
use crate::ws::WsListener;

/// A freshly accepted signaling connection.
pub enum Incoming {
    /// Run a responder negotiation over this connection.
    Negotiate(Arc<dyn SignalConn>),
    /// The client asked for the websocket itself as the stream.
    Fallback(Box<dyn NetConn>),
}

impl Incoming {
    pub async fn close(&self) -> Result<()> {
        match self {
            Incoming::Negotiate(signal) => signal.close().await,
            Incoming::Fallback(conn) => conn.close().await,
        }
    }
}

/// Source of signaling connections for a [`Listener`].
///
/// `accept` returns [`RtcError::Closed`] once the source has shut down.
#[async_trait]
pub trait SignalListener: Send + Sync {
    async fn accept(&self) -> Result<Incoming>;
    async fn close(&self) -> Result<()>;
    fn local_addr(&self) -> SocketAddr;
}

/// Accepts WebRTC connections negotiated over a signaling listener.
pub struct Listener {
    signaling: Arc<dyn SignalListener>,
    rendezvous: AsyncMutex<Rendezvous>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

struct Rendezvous {
    conns: mpsc::Receiver<Box<dyn NetConn>>,
    errors: mpsc::Receiver<RtcError>,
}

#[derive(Clone)]
struct Publisher {
    conns: mpsc::Sender<Box<dyn NetConn>>,
    errors: mpsc::Sender<RtcError>,
    shutdown: watch::Receiver<bool>,
}

#[derive(Clone)]
struct ResponderSettings {
    factory: Arc<dyn PeerFactory>,
    ice_servers: Arc<[String]>,
    negotiation_timeout: std::time::Duration,
}

impl Listener {
    /// Binds a websocket signaling endpoint on `address` and negotiates
    /// with the `webrtc` engine.
    pub async fn bind(address: &str, config: ListenConfig) -> Result<Self> {
        Self::bind_with_engine(address, config, Arc::new(WebRtcEngine::new())).await
    }

    pub async fn bind_with_engine(
        address: &str,
        config: ListenConfig,
        factory: Arc<dyn PeerFactory>,
    ) -> Result<Self> {
        let logger = config.logger.clone();
        let signaling = logging::scoped(
            logger.as_ref(),
            WsListener::bind(address, config.tls.clone(), config.origin_patterns.clone()),
        )
        .await?;
        Ok(Self::from_parts(Arc::new(signaling), config, factory))
    }

    /// Runs the accept loop over any signaling source.
    pub fn from_parts(
        signaling: Arc<dyn SignalListener>,
        config: ListenConfig,
        factory: Arc<dyn PeerFactory>,
    ) -> Self {
        let (conns_tx, conns_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let publisher = Publisher {
            conns: conns_tx,
            errors: errors_tx,
            shutdown: shutdown_rx,
        };
        let settings = ResponderSettings {
            factory,
            ice_servers: config.ice_servers.into(),
            negotiation_timeout: config.negotiation_timeout,
        };
        spawn_scoped(
            config.logger.as_ref(),
            accept_loop(Arc::clone(&signaling), settings, publisher),
        );
        Self {
            signaling,
            rendezvous: AsyncMutex::new(Rendezvous {
                conns: conns_rx,
                errors: errors_rx,
            }),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    /// Yields the next connection or the next error, never both.
    pub async fn accept(&self) -> Result<Box<dyn NetConn>> {
        let mut shutdown = self.shutdown.subscribe();
        if self.closed.load(Ordering::Acquire) {
            return Err(RtcError::Closed);
        }
        let mut rendezvous = self.rendezvous.lock().await;
        let Rendezvous { conns, errors } = &mut *rendezvous;
        tokio::select! {
            biased;
            Some(conn) = conns.recv() => Ok(conn),
            Some(err) = errors.recv() => Err(err),
            _ = shutdown.wait_for(|closed| *closed) => Err(RtcError::Closed),
            else => Err(RtcError::Closed),
        }
    }

    /// Stops accepting. In-flight negotiations finish on their own and
    /// their results are discarded.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.send_replace(true);
        tracing::debug!(target: "rtcnet", addr = %self.signaling.local_addr(), "listener closed");
        self.signaling.close().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.signaling.local_addr()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

fn spawn_scoped<F>(logger: Option<&Dispatch>, future: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    use tracing::instrument::WithSubscriber;
    match logger {
        Some(dispatch) => {
            tokio::spawn(future.with_subscriber(dispatch.clone()));
        }
        None => {
            logging::spawn(future);
        }
    }
}

async fn accept_loop(signaling: Arc<dyn SignalListener>, settings: ResponderSettings, publisher: Publisher) {
    let mut shutdown = publisher.shutdown.clone();
    loop {
        let incoming = tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => break,
            incoming = signaling.accept() => incoming,
        };
        match incoming {
            Ok(Incoming::Fallback(conn)) => publisher.publish_conn(conn).await,
            Ok(Incoming::Negotiate(signal)) => {
                let settings = settings.clone();
                let publisher = publisher.clone();
                logging::spawn(respond(signal, settings, publisher));
            }
            Err(RtcError::Closed) => break,
            Err(err) => {
                tracing::warn!(target: "rtcnet", error = %err, "signaling accept failed");
                publisher.publish_error(err).await;
            }
        }
    }
    tracing::debug!(target: "rtcnet", "accept loop stopped");
}

async fn respond(signal: Arc<dyn SignalConn>, settings: ResponderSettings, publisher: Publisher) {
    let outcome = negotiate(Negotiation {
        role: Role::Responder,
        factory: settings.factory.as_ref(),
        signal: Arc::clone(&signal),
        ice_servers: &settings.ice_servers,
        ordered: true,
        deadline: Instant::now() + settings.negotiation_timeout,
        timeout: settings.negotiation_timeout,
    })
    .await;

    match outcome {
        Ok(conn) => publisher.publish_conn(Box::new(conn)).await,
        Err(RtcError::Abandoned) => {
            tracing::debug!(target: "rtcnet", remote = %signal.remote_addr(), "client left before negotiating");
            let _ = signal.close().await;
        }
        Err(err) => {
            let _ = signal.close().await;
            publisher.publish_error(err).await;
        }
    }
}

impl Publisher {
    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn publish_conn(&self, conn: Box<dyn NetConn>) {
        if self.is_shut_down() {
            let _ = conn.close().await;
            return;
        }
        let mut shutdown = self.shutdown.clone();
        let rejected = tokio::select! {
            sent = self.conns.send(conn) => sent.err().map(|mpsc::error::SendError(conn)| conn),
            _ = shutdown.wait_for(|closed| *closed) => None,
        };
        if let Some(conn) = rejected {
            let _ = conn.close().await;
        }
    }

    async fn publish_error(&self, err: RtcError) {
        if self.is_shut_down() {
            tracing::debug!(target: "rtcnet", error = %err, "listener closed; dropping error");
            return;
        }
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = self.errors.send(err) => {}
            _ = shutdown.wait_for(|closed| *closed) => {}
        }
    }
}
