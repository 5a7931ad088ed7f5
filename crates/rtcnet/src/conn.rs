use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, OnceCell, mpsc, watch};

use crate::engine::{DataChannel, PeerHandle, RawStream};
use crate::error::{Result, RtcError};
use crate::net::NetConn;

/// Asynchronous errors a connection holds before someone reads them.
pub(crate) const ERROR_QUEUE_CAPACITY: usize = 16;

/// A negotiated WebRTC data channel exposed as a byte stream.
///
/// Dropping a `Conn` that was never closed tears it down in the background.
pub struct Conn {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    peer: Arc<dyn PeerHandle>,
    stream: Mutex<Option<Attached>>,
    errors: ErrorQueue,
    close_result: OnceCell<Result<()>>,
    closed_tx: watch::Sender<bool>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

#[derive(Clone)]
struct Attached {
    channel: Arc<dyn DataChannel>,
    raw: Arc<dyn RawStream>,
}

impl Conn {
    pub(crate) fn new(peer: Arc<dyn PeerHandle>, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            shared: Arc::new(Shared {
                peer,
                stream: Mutex::new(None),
                errors: ErrorQueue::new(ERROR_QUEUE_CAPACITY),
                close_result: OnceCell::new(),
                closed_tx: watch::channel(false).0,
                local_addr,
                remote_addr,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Reads from the data channel. A queued asynchronous error is
    /// returned first.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let raw = self.shared.usable_stream()?;
        raw.read(buf).await
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let raw = self.shared.usable_stream()?;
        raw.write(buf).await
    }

    /// Tears down the data channel, the peer connection and the raw stream.
    /// Every call observes the result of the first.
    pub async fn close(&self) -> Result<()> {
        self.shared.close().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    pub fn is_established(&self) -> bool {
        self.shared.is_established()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.errors.is_closed()
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("local_addr", &self.shared.local_addr)
            .field("remote_addr", &self.shared.remote_addr)
            .field("established", &self.shared.is_established())
            .field("closed", &self.shared.errors.is_closed())
            .finish()
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        if self.shared.close_result.initialized() {
            return;
        }
        if let Ok(handle) = Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            handle.spawn(async move {
                let _ = shared.close().await;
            });
        }
    }
}

#[async_trait]
impl NetConn for Conn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        Conn::read(self, buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        Conn::write(self, buf).await
    }

    async fn close(&self) -> Result<()> {
        Conn::close(self).await
    }

    fn local_addr(&self) -> SocketAddr {
        Conn::local_addr(self)
    }

    fn remote_addr(&self) -> SocketAddr {
        Conn::remote_addr(self)
    }
}

impl Shared {
    fn usable_stream(&self) -> Result<Arc<dyn RawStream>> {
        if let Some(err) = self.errors.try_take() {
            return Err(err);
        }
        if self.errors.is_closed() {
            return Err(RtcError::Closed);
        }
        self.stream
            .lock()
            .as_ref()
            .map(|attached| Arc::clone(&attached.raw))
            .ok_or(RtcError::NotEstablished)
    }

    pub(crate) fn is_established(&self) -> bool {
        self.stream.lock().is_some()
    }

    /// Installs the opened channel. Returns false when the connection is
    /// already closed or established; the caller then owns the channel.
    pub(crate) fn attach(&self, channel: Arc<dyn DataChannel>, raw: Arc<dyn RawStream>) -> bool {
        let mut stream = self.stream.lock();
        if self.errors.is_closed() || stream.is_some() {
            return false;
        }
        *stream = Some(Attached { channel, raw });
        true
    }

    pub(crate) fn push_error(&self, err: RtcError) {
        if !self.errors.push(err.clone()) {
            tracing::debug!(target: "rtcnet", error = %err, "dropping asynchronous error");
        }
    }

    /// Waits for the next asynchronous error, or [`RtcError::Closed`] once
    /// the connection is closed.
    pub(crate) async fn next_error(&self) -> RtcError {
        self.errors.next().await
    }

    /// Resolves once teardown has started. Holding the receiver does not
    /// keep the connection alive.
    pub(crate) fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub(crate) async fn close(&self) -> Result<()> {
        self.close_result
            .get_or_init(|| self.teardown())
            .await
            .clone()
    }

    async fn teardown(&self) -> Result<()> {
        self.errors.close();
        self.closed_tx.send_replace(true);
        let attached = self.stream.lock().take();
        let mut failures = Vec::new();

        if let Some(attached) = &attached {
            if let Err(err) = attached.channel.close().await {
                failures.push(format!("data channel: {err}"));
            }
        }
        if let Err(err) = self.peer.close().await {
            failures.push(format!("peer connection: {err}"));
        }
        if let Some(attached) = &attached {
            if let Err(err) = attached.raw.close().await {
                failures.push(format!("raw stream: {err}"));
            }
        }

        if failures.is_empty() {
            tracing::debug!(target: "rtcnet", remote = %self.remote_addr, "connection closed");
            Ok(())
        } else {
            let err = RtcError::Close(failures);
            tracing::warn!(target: "rtcnet", remote = %self.remote_addr, error = %err, "connection closed with errors");
            Err(err)
        }
    }
}

/// Bounded queue of asynchronous errors. Pushes never block: a full or
/// closed queue drops the error. Errors queued before close stay readable
/// by [`ErrorQueue::next`].
struct ErrorQueue {
    tx: Mutex<Option<mpsc::Sender<RtcError>>>,
    rx: AsyncMutex<mpsc::Receiver<RtcError>>,
}

impl ErrorQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
        }
    }

    fn push(&self, err: RtcError) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.try_send(err).is_ok(),
            None => false,
        }
    }

    /// Skips the check while a waiter holds the receiver; that waiter gets
    /// the error instead.
    fn try_take(&self) -> Option<RtcError> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    fn close(&self) {
        self.tx.lock().take();
    }

    async fn next(&self) -> RtcError {
        self.rx.lock().await.recv().await.unwrap_or(RtcError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn queue_drops_when_full() {
        let queue = ErrorQueue::new(2);
        assert!(queue.push(RtcError::PeerFailed));
        assert!(queue.push(RtcError::Signal("one".into())));
        assert!(!queue.push(RtcError::Signal("two".into())));
        assert_eq!(queue.try_take(), Some(RtcError::PeerFailed));
        assert_eq!(queue.try_take(), Some(RtcError::Signal("one".into())));
        assert_eq!(queue.try_take(), None);
    }

    #[tokio::test]
    async fn closed_queue_ignores_pushes() {
        let queue = ErrorQueue::new(4);
        queue.push(RtcError::PeerFailed);
        queue.close();
        assert!(!queue.push(RtcError::Signal("late".into())));
        assert_eq!(queue.next().await, RtcError::PeerFailed);
        assert_eq!(queue.next().await, RtcError::Closed);
    }

    #[tokio::test]
    async fn waiter_wakes_on_push() {
        let queue = Arc::new(ErrorQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(RtcError::PeerFailed);
        let err = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timed out")
            .expect("join");
        assert_eq!(err, RtcError::PeerFailed);
    }

    #[tokio::test]
    async fn waiter_sees_close() {
        let queue = Arc::new(ErrorQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        let err = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timed out")
            .expect("join");
        assert_eq!(err, RtcError::Closed);
    }
}
