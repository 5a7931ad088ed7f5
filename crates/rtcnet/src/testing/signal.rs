use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

use crate::error::{Result, RtcError};
use crate::listener::{Incoming, SignalListener};
use crate::signal::{SignalConn, SignalMessage};

static NEXT_PORT: AtomicU16 = AtomicU16::new(40_000);

/// One end of an in-memory signaling channel.
pub struct MemorySignal {
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
    sent: Mutex<Vec<Vec<u8>>>,
    injected: Mutex<VecDeque<Vec<u8>>>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

/// Two connected signaling ends, like a websocket client and server.
pub fn signal_pair() -> (Arc<MemorySignal>, Arc<MemorySignal>) {
    let (left_tx, right_rx) = mpsc::unbounded_channel();
    let (right_tx, left_rx) = mpsc::unbounded_channel();
    let left_addr = next_addr();
    let right_addr = next_addr();
    let left = MemorySignal::new(left_tx, left_rx, left_addr, right_addr);
    let right = MemorySignal::new(right_tx, right_rx, right_addr, left_addr);
    (Arc::new(left), Arc::new(right))
}

fn next_addr() -> SocketAddr {
    let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
    SocketAddr::from(([127, 0, 0, 1], port))
}

impl MemorySignal {
    fn new(
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            outbound: Mutex::new(Some(outbound)),
            inbound: AsyncMutex::new(inbound),
            closed: watch::channel(false).0,
            sent: Mutex::new(Vec::new()),
            injected: Mutex::new(VecDeque::new()),
            local_addr,
            remote_addr,
        }
    }

    /// Queues a raw frame that goes out just before the next real one.
    pub fn inject_before_next_send(&self, frame: impl Into<Vec<u8>>) {
        self.injected.lock().push_back(frame.into());
    }

    /// Sends a raw frame to the other end, bypassing the codec.
    pub fn send_raw(&self, frame: impl Into<Vec<u8>>) -> Result<()> {
        let outbound = self.outbound.lock();
        let tx = outbound
            .as_ref()
            .ok_or_else(|| RtcError::signal("signaling channel closed"))?;
        tx.send(frame.into())
            .map_err(|_| RtcError::signal("remote signaling end dropped"))
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Every frame sent so far that decodes as a signaling message.
    pub fn sent_messages(&self) -> Vec<SignalMessage> {
        self.sent
            .lock()
            .iter()
            .filter_map(|frame| SignalMessage::decode(frame).ok())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl SignalConn for MemorySignal {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(RtcError::signal("signaling channel closed"));
        }
        let injected: Vec<Vec<u8>> = self.injected.lock().drain(..).collect();
        for extra in injected {
            self.send_raw(extra)?;
        }
        self.send_raw(frame.clone())?;
        self.sent.lock().push(frame);
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(None);
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            frame = inbound.recv() => Ok(frame),
            _ = closed.wait_for(|closed| *closed) => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        self.outbound.lock().take();
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// Signaling listener fed by the test.
pub struct MemorySignalListener {
    feed: mpsc::UnboundedSender<Result<Incoming>>,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<Result<Incoming>>>,
    closed: watch::Sender<bool>,
    close_calls: AtomicUsize,
    local_addr: SocketAddr,
}

impl MemorySignalListener {
    pub fn new() -> Arc<Self> {
        let (feed, incoming) = mpsc::unbounded_channel();
        Arc::new(Self {
            feed,
            incoming: AsyncMutex::new(incoming),
            closed: watch::channel(false).0,
            close_calls: AtomicUsize::new(0),
            local_addr: next_addr(),
        })
    }

    /// Hands `incoming` to the accept loop. Returns false once closed.
    pub fn push(&self, incoming: Result<Incoming>) -> bool {
        self.feed.send(incoming).is_ok()
    }

    /// Opens a signaling pair, queues the server end for negotiation and
    /// returns the client end.
    pub fn connect(&self) -> Arc<MemorySignal> {
        let (client, server) = signal_pair();
        self.push(Ok(Incoming::Negotiate(server)));
        client
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalListener for MemorySignalListener {
    async fn accept(&self) -> Result<Incoming> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(RtcError::Closed);
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            next = incoming.recv() => next.unwrap_or(Err(RtcError::Closed)),
            _ = closed.wait_for(|closed| *closed) => Err(RtcError::Closed),
        }
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.send_replace(true);
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
