use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

use crate::engine::{
    CandidateInit, DataChannel, PeerEvent, PeerEvents, PeerFactory, PeerHandle, PeerState, RawStream,
    SdpType, SessionDescription,
};
use crate::error::{Result, RtcError};

/// Engine whose peers find each other by SDP body inside one process.
///
/// Offers are named `o1`, `o2`, ... and answers `a1`, `a2`, .... Each peer
/// gathers a fixed number of candidates when its local description is set
/// and rejects remote candidates until its remote description is set. Once
/// both sides hold both descriptions and all of the other side's
/// candidates, the offerer's data channel opens on both ends.
#[derive(Clone, Default)]
pub struct LoopbackEngine {
    board: Arc<Switchboard>,
}

#[derive(Default)]
struct Switchboard {
    offers: AtomicUsize,
    answers: AtomicUsize,
    by_sdp: Mutex<HashMap<String, Weak<LoopbackPeer>>>,
    peers: Mutex<Vec<Weak<LoopbackPeer>>>,
    settings: Mutex<Settings>,
}

#[derive(Clone)]
struct Settings {
    candidates_per_peer: usize,
    hold_channel: bool,
    fail_peer_close: bool,
    fail_channel_close: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            candidates_per_peer: 2,
            hold_channel: false,
            fail_peer_close: false,
            fail_channel_close: false,
        }
    }
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_candidates(self, count: usize) -> Self {
        self.board.settings.lock().candidates_per_peer = count;
        self
    }

    /// Connect peers but never open their data channel.
    pub fn hold_channel(self) -> Self {
        self.board.settings.lock().hold_channel = true;
        self
    }

    pub fn fail_peer_close(self) -> Self {
        self.board.settings.lock().fail_peer_close = true;
        self
    }

    pub fn fail_channel_close(self) -> Self {
        self.board.settings.lock().fail_channel_close = true;
        self
    }

    /// Peers created so far that are still alive, in creation order.
    pub fn peers(&self) -> Vec<Arc<LoopbackPeer>> {
        self.board
            .peers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

#[async_trait]
impl PeerFactory for LoopbackEngine {
    async fn new_peer(&self, _ice_servers: &[String]) -> Result<(Arc<dyn PeerHandle>, PeerEvents)> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let board = Arc::clone(&self.board);
        let peer = Arc::new_cyclic(|me| LoopbackPeer {
            me: me.clone(),
            board,
            events,
            progress: Mutex::new(Progress::default()),
            opened: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            channel_close_calls: Arc::new(AtomicUsize::new(0)),
        });
        self.board.peers.lock().push(Arc::downgrade(&peer));
        let _ = peer.events.send(PeerEvent::StateChanged(PeerState::New));
        let handle: Arc<dyn PeerHandle> = peer;
        Ok((handle, events_rx))
    }
}

pub struct LoopbackPeer {
    me: Weak<LoopbackPeer>,
    board: Arc<Switchboard>,
    events: mpsc::UnboundedSender<PeerEvent>,
    progress: Mutex<Progress>,
    opened: AtomicBool,
    close_calls: AtomicUsize,
    channel_close_calls: Arc<AtomicUsize>,
}

#[derive(Default)]
struct Progress {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<String>,
    channel: Option<(String, bool)>,
    closed: bool,
}

impl LoopbackPeer {
    /// Remote candidates accepted so far, in the order they were added.
    pub fn added_candidates(&self) -> Vec<String> {
        self.progress.lock().remote_candidates.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_sdp()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.progress.lock().remote.clone()
    }

    /// Label and ordering of the data channel this peer asked for.
    pub fn requested_channel(&self) -> Option<(String, bool)> {
        self.progress.lock().channel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.progress.lock().closed
    }

    /// Times `close` was called on this peer.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Times `close` was called on the data channel handed to this peer.
    pub fn channel_close_calls(&self) -> usize {
        self.channel_close_calls.load(Ordering::SeqCst)
    }

    /// Reports `state` as if the connection had changed on its own.
    pub fn inject_state(&self, state: PeerState) {
        let _ = self.events.send(PeerEvent::StateChanged(state));
    }

    fn settings(&self) -> Settings {
        self.board.settings.lock().clone()
    }

    fn check_open(&self) -> Result<()> {
        if self.progress.lock().closed {
            return Err(RtcError::Engine("peer connection is closed".into()));
        }
        Ok(())
    }

    fn register(&self, sdp: &str) {
        self.board.by_sdp.lock().insert(sdp.to_string(), self.me.clone());
    }

    fn ready(&self) -> bool {
        let expected = self.settings().candidates_per_peer;
        let progress = self.progress.lock();
        !progress.closed
            && progress.local.is_some()
            && progress.remote.is_some()
            && progress.remote_candidates.len() >= expected
    }

    fn local_sdp(&self) -> Option<SessionDescription> {
        self.progress.lock().local.clone()
    }

    fn partner(&self) -> Option<Arc<LoopbackPeer>> {
        let remote = self.progress.lock().remote.clone()?;
        let partner = self.board.by_sdp.lock().get(&remote.sdp)?.upgrade()?;
        let mine = self.local_sdp()?;
        let theirs = partner.progress.lock().remote.clone()?;
        (theirs.sdp == mine.sdp).then_some(partner)
    }

    fn try_open(&self) {
        if !self.ready() {
            return;
        }
        let Some(partner) = self.partner() else {
            return;
        };
        if !partner.ready() {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let i_offered = self
            .local_sdp()
            .is_some_and(|desc| desc.sdp_type == SdpType::Offer);
        let (offerer, answerer) = if i_offered { (me, partner) } else { (partner, me) };
        if offerer.opened.swap(true, Ordering::SeqCst) {
            return;
        }
        let settings = self.settings();
        let _ = offerer.events.send(PeerEvent::StateChanged(PeerState::Connected));
        let _ = answerer.events.send(PeerEvent::StateChanged(PeerState::Connected));
        if settings.hold_channel {
            return;
        }
        let Some((label, _ordered)) = offerer.requested_channel() else {
            return;
        };
        let (near, far) = LoopbackStream::pair();
        for (peer, stream) in [(&offerer, near), (&answerer, far)] {
            let channel = LoopbackChannel {
                label: label.clone(),
                stream,
                detached: AtomicBool::new(false),
                fail_close: settings.fail_channel_close,
                close_calls: Arc::clone(&peer.channel_close_calls),
            };
            let _ = peer.events.send(PeerEvent::ChannelOpen(Arc::new(channel)));
        }
    }
}

#[async_trait]
impl PeerHandle for LoopbackPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.check_open()?;
        let n = self.board.offers.fetch_add(1, Ordering::SeqCst) + 1;
        let offer = SessionDescription::offer(format!("o{n}"));
        self.register(&offer.sdp);
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.check_open()?;
        let has_offer = self
            .progress
            .lock()
            .remote
            .as_ref()
            .is_some_and(|desc| desc.sdp_type == SdpType::Offer);
        if !has_offer {
            return Err(RtcError::negotiation("create_answer", "no remote offer"));
        }
        let n = self.board.answers.fetch_add(1, Ordering::SeqCst) + 1;
        let answer = SessionDescription::answer(format!("a{n}"));
        self.register(&answer.sdp);
        Ok(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.check_open()?;
        let sdp = desc.sdp.clone();
        self.progress.lock().local = Some(desc);
        for index in 0..self.settings().candidates_per_peer {
            let candidate = CandidateInit {
                candidate: format!("candidate:{sdp}-{index}"),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            };
            let _ = self.events.send(PeerEvent::Candidate(candidate));
        }
        self.try_open();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.check_open()?;
        if !self.board.by_sdp.lock().contains_key(&desc.sdp) {
            return Err(RtcError::negotiation(
                "set_remote_description",
                format!("unknown session {:?}", desc.sdp),
            ));
        }
        self.progress.lock().remote = Some(desc);
        let _ = self.events.send(PeerEvent::StateChanged(PeerState::Connecting));
        self.try_open();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<()> {
        self.check_open()?;
        {
            let mut progress = self.progress.lock();
            let Some(remote) = progress.remote.as_ref() else {
                return Err(RtcError::negotiation("add_ice_candidate", "remote description not set"));
            };
            let prefix = format!("candidate:{}-", remote.sdp);
            if !candidate.candidate.starts_with(&prefix) {
                return Err(RtcError::negotiation(
                    "add_ice_candidate",
                    format!("candidate {:?} does not belong to {:?}", candidate.candidate, remote.sdp),
                ));
            }
            progress.remote_candidates.push(candidate.candidate);
        }
        self.try_open();
        Ok(())
    }

    async fn create_data_channel(&self, label: &str, ordered: bool) -> Result<()> {
        self.check_open()?;
        self.progress.lock().channel = Some((label.to_string(), ordered));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let first = {
            let mut progress = self.progress.lock();
            !std::mem::replace(&mut progress.closed, true)
        };
        if first {
            let _ = self.events.send(PeerEvent::StateChanged(PeerState::Closed));
        }
        if self.settings().fail_peer_close {
            return Err(RtcError::Engine("peer refused to close".into()));
        }
        Ok(())
    }
}

struct LoopbackChannel {
    label: String,
    stream: Arc<LoopbackStream>,
    detached: AtomicBool,
    fail_close: bool,
    close_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn detach(&self) -> Result<Arc<dyn RawStream>> {
        if self.detached.swap(true, Ordering::SeqCst) {
            return Err(RtcError::negotiation("detach", "data channel already detached"));
        }
        Ok(Arc::clone(&self.stream) as Arc<dyn RawStream>)
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(RtcError::Engine("data channel refused to close".into()));
        }
        Ok(())
    }
}

/// One end of an in-memory byte pipe.
pub struct LoopbackStream {
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound: AsyncMutex<Inbound>,
    closed: watch::Sender<bool>,
}

struct Inbound {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl LoopbackStream {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(a_tx, a_rx)), Arc::new(Self::new(b_tx, b_rx)))
    }

    fn new(outbound: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            outbound: Mutex::new(Some(outbound)),
            inbound: AsyncMutex::new(Inbound {
                rx,
                pending: Vec::new(),
            }),
            closed: watch::channel(false).0,
        }
    }
}

#[async_trait]
impl RawStream for LoopbackStream {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(RtcError::stream("stream closed"));
        }
        let mut inbound = self.inbound.lock().await;
        if inbound.pending.is_empty() {
            let next = tokio::select! {
                next = inbound.rx.recv() => next,
                _ = closed.wait_for(|closed| *closed) => return Err(RtcError::stream("stream closed")),
            };
            match next {
                Some(data) => inbound.pending = data,
                None => return Ok(0),
            }
        }
        let n = inbound.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&inbound.pending[..n]);
        inbound.pending.drain(..n);
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        let outbound = self.outbound.lock();
        let tx = outbound
            .as_ref()
            .ok_or_else(|| RtcError::stream("stream closed"))?;
        tx.send(buf.to_vec())
            .map_err(|_| RtcError::stream("remote end closed"))?;
        Ok(buf.len())
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        self.outbound.lock().take();
        Ok(())
    }
}
