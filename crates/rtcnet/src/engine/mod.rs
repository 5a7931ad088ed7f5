//! Seam between the negotiator and a WebRTC implementation.
//!
//! The negotiator only talks to these traits. [`webrtc`] adapts the
//! `webrtc` crate; tests drive an in-memory engine instead.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

pub mod webrtc;

pub use self::webrtc::WebRtcEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SdpType::Offer => "offer",
            SdpType::Pranswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "Type")]
    pub sdp_type: SdpType,
    #[serde(rename = "SDP")]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl CandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Asynchronous notifications raised by a peer connection.
pub enum PeerEvent {
    /// A local candidate was gathered and must reach the remote side.
    Candidate(CandidateInit),
    StateChanged(PeerState),
    /// A data channel, local or remote, finished opening.
    ChannelOpen(Arc<dyn DataChannel>),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::Candidate(c) => f.debug_tuple("Candidate").field(&c.candidate).finish(),
            PeerEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            PeerEvent::ChannelOpen(dc) => f.debug_tuple("ChannelOpen").field(&dc.label()).finish(),
        }
    }
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// Creates peer connections. One factory may serve many negotiations.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn new_peer(&self, ice_servers: &[String]) -> Result<(Arc<dyn PeerHandle>, PeerEvents)>;
}

#[async_trait]
pub trait PeerHandle: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<()>;
    /// Open a data channel from this side; its readiness arrives as
    /// [`PeerEvent::ChannelOpen`].
    async fn create_data_channel(&self, label: &str, ordered: bool) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    /// Switch the channel to raw stream access.
    async fn detach(&self) -> Result<Arc<dyn RawStream>>;
    async fn close(&self) -> Result<()>;
}

/// Byte stream over a detached data channel.
#[async_trait]
pub trait RawStream: Send + Sync {
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;
    async fn write(&self, buf: &[u8]) -> Result<usize>;
    async fn close(&self) -> Result<()>;
}
