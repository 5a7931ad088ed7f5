use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use ::webrtc::api::setting_engine::SettingEngine;
use ::webrtc::api::{API, APIBuilder};
use ::webrtc::data::data_channel::DataChannel as DetachedChannel;
use ::webrtc::data_channel::RTCDataChannel;
use ::webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use ::webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    CandidateInit, DataChannel, PeerEvent, PeerEvents, PeerFactory, PeerHandle, PeerState,
    RawStream, SdpType, SessionDescription,
};
use crate::error::{Result, RtcError};

/// [`PeerFactory`] backed by the `webrtc` crate with detached data channels.
pub struct WebRtcEngine {
    api: API,
}

impl WebRtcEngine {
    pub fn new() -> Self {
        let mut setting = SettingEngine::default();
        setting.detach_data_channels();
        Self {
            api: APIBuilder::new().with_setting_engine(setting).build(),
        }
    }
}

impl Default for WebRtcEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerFactory for WebRtcEngine {
    async fn new_peer(&self, ice_servers: &[String]) -> Result<(Arc<dyn PeerHandle>, PeerEvents)> {
        let config = RTCConfiguration {
            ice_servers: if ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: ice_servers.to_vec(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|err| RtcError::negotiation("new_peer_connection", err))?;
        let pc = Arc::new(pc);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::Candidate(from_rtc_candidate(init)));
                    }
                    Err(err) => {
                        tracing::warn!(target: "rtcnet", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(state) = from_rtc_state(state) {
                    let _ = tx.send(PeerEvent::StateChanged(state));
                }
            })
        }));

        let tx = events_tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                tracing::debug!(target: "rtcnet", label = %dc.label(), id = dc.id(), "remote data channel announced");
                watch_open(dc, tx);
            })
        }));

        let peer: Arc<dyn PeerHandle> = Arc::new(WebRtcPeer { pc, events: events_tx });
        Ok((peer, events_rx))
    }
}

fn watch_open(dc: Arc<RTCDataChannel>, events: mpsc::UnboundedSender<PeerEvent>) {
    let channel = Arc::clone(&dc);
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            tracing::debug!(
                target: "rtcnet",
                label = %channel.label(),
                id = channel.id(),
                ordered = channel.ordered(),
                negotiated = channel.negotiated(),
                protocol = %channel.protocol(),
                state = ?channel.ready_state(),
                "data channel open"
            );
            let _ = events.send(PeerEvent::ChannelOpen(Arc::new(WebRtcDataChannel { inner: channel })));
        })
    }));
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

#[async_trait]
impl PeerHandle for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| RtcError::negotiation("create_offer", err))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| RtcError::negotiation("create_answer", err))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc, "set_local_description")?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|err| RtcError::negotiation("set_local_description", err))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc, "set_remote_description")?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|err| RtcError::negotiation("set_remote_description", err))
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<()> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(|err| RtcError::negotiation("add_ice_candidate", err))
    }

    async fn create_data_channel(&self, label: &str, ordered: bool) -> Result<()> {
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|err| RtcError::negotiation("create_data_channel", err))?;
        watch_open(dc, self.events.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|err| RtcError::Engine(err.to_string()))
    }
}

struct WebRtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    async fn detach(&self) -> Result<Arc<dyn RawStream>> {
        let raw = self
            .inner
            .detach()
            .await
            .map_err(|err| RtcError::negotiation("detach", err))?;
        Ok(Arc::new(DetachedStream { inner: raw }))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|err| RtcError::Engine(err.to_string()))
    }
}

struct DetachedStream {
    inner: Arc<DetachedChannel>,
}

#[async_trait]
impl RawStream for DetachedStream {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf).await.map_err(RtcError::stream)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.inner
            .write(&Bytes::copy_from_slice(buf))
            .await
            .map_err(RtcError::stream)
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await.map_err(RtcError::stream)
    }
}

fn to_rtc_description(desc: SessionDescription, stage: &'static str) -> Result<RTCSessionDescription> {
    let built = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return Err(RtcError::negotiation(stage, "rollback descriptions are not supported"));
        }
    };
    built.map_err(|err| RtcError::negotiation(stage, err))
}

fn to_rtc_candidate(candidate: CandidateInit) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> CandidateInit {
    CandidateInit {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn from_rtc_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    Some(match state {
        RTCPeerConnectionState::Unspecified => return None,
        RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_fields_survive_conversion() {
        let original = CandidateInit {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some("frag".into()),
        };
        assert_eq!(from_rtc_candidate(to_rtc_candidate(original.clone())), original);
    }

    #[test]
    fn rollback_is_rejected() {
        let desc = SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        };
        let err = to_rtc_description(desc, "set_remote_description").unwrap_err();
        assert!(matches!(err, RtcError::Negotiation { stage: "set_remote_description", .. }));
    }

    #[test]
    fn unspecified_state_is_not_reported() {
        assert_eq!(from_rtc_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(from_rtc_state(RTCPeerConnectionState::Failed), Some(PeerState::Failed));
    }
}
