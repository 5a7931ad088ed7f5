//! Signaling messages and the transport they travel over.
//!
//! Each frame is one JSON object with exactly one of `SDP` or `Candidate`
//! populated:
//!
//! ```text
//! {"SDP":{"Type":"offer","SDP":"v=0..."}}
//! {"Candidate":{"CandidateInit":{"candidate":"candidate:...","sdpMid":"0","sdpMLineIndex":0}}}
//! ```

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::{CandidateInit, SessionDescription};
use crate::error::{Result, RtcError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateMessage {
    #[serde(rename = "CandidateInit")]
    pub candidate_init: CandidateInit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "SDP", default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(rename = "Candidate", default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<CandidateMessage>,
}

/// What a decoded frame asks the receiver to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Description(SessionDescription),
    Candidate(CandidateInit),
    /// Neither field set; receivers skip it.
    Empty,
}

impl SignalMessage {
    pub fn description(desc: SessionDescription) -> Self {
        Self {
            sdp: Some(desc),
            candidate: None,
        }
    }

    pub fn candidate(candidate: CandidateInit) -> Self {
        Self {
            sdp: None,
            candidate: Some(CandidateMessage {
                candidate_init: candidate,
            }),
        }
    }

    /// A description wins when a peer populates both fields.
    pub fn into_signal(self) -> Signal {
        match (self.sdp, self.candidate) {
            (Some(desc), _) => Signal::Description(desc),
            (None, Some(c)) => Signal::Candidate(c.candidate_init),
            (None, None) => Signal::Empty,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(encode_failure)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame).map_err(|err| RtcError::Decode(err.to_string()))
    }
}

/// Outbound failures are signaling errors, never decode errors.
fn encode_failure(err: serde_json::Error) -> RtcError {
    RtcError::signal(format!("failed to encode signaling message: {err}"))
}

/// Reliable, ordered, message-framed channel used only during negotiation.
#[async_trait]
pub trait SignalConn: Send + Sync {
    async fn send(&self, frame: Vec<u8>) -> Result<()>;
    /// Next frame, or `None` once the remote side has gone away.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;
    async fn close(&self) -> Result<()>;
    fn local_addr(&self) -> SocketAddr;
    fn remote_addr(&self) -> SocketAddr;
}

pub(crate) async fn send_message(signal: &dyn SignalConn, message: &SignalMessage) -> Result<()> {
    let frame = message.encode()?;
    signal.send(frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SdpType;

    #[test]
    fn description_uses_capitalized_keys() {
        let frame = SignalMessage::description(SessionDescription::offer("o1"))
            .encode()
            .expect("encode");
        assert_eq!(
            String::from_utf8(frame).expect("utf8"),
            r#"{"SDP":{"Type":"offer","SDP":"o1"}}"#
        );
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let candidate = CandidateInit {
            candidate: "candidate:1 1 udp 1 10.0.0.2 4000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let frame = SignalMessage::candidate(candidate).encode().expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&frame).expect("json");
        let init = &value["Candidate"]["CandidateInit"];
        assert_eq!(init["sdpMid"], "0");
        assert_eq!(init["sdpMLineIndex"], 0);
        assert!(value.get("SDP").is_none());
    }

    #[test]
    fn decodes_go_style_null_fields() {
        let frame = br#"{"SDP":null,"Candidate":{"CandidateInit":{"candidate":"c1","sdpMid":null,"sdpMLineIndex":null,"usernameFragment":null}}}"#;
        let signal = SignalMessage::decode(frame).expect("decode").into_signal();
        assert_eq!(signal, Signal::Candidate(CandidateInit::new("c1")));
    }

    #[test]
    fn decodes_answer() {
        let frame = br#"{"SDP":{"Type":"answer","SDP":"a1"}}"#;
        match SignalMessage::decode(frame).expect("decode").into_signal() {
            Signal::Description(desc) => {
                assert_eq!(desc.sdp_type, SdpType::Answer);
                assert_eq!(desc.sdp, "a1");
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[test]
    fn empty_object_is_ignorable() {
        let signal = SignalMessage::decode(b"{}").expect("decode").into_signal();
        assert_eq!(signal, Signal::Empty);
    }

    #[test]
    fn encode_failures_are_not_reported_as_decode_errors() {
        let err = serde_json::from_str::<u8>("\"x\"").unwrap_err();
        match encode_failure(err) {
            RtcError::Signal(reason) => assert!(reason.starts_with("failed to encode")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn malformed_frame_is_a_decode_error() {
        let err = SignalMessage::decode(b"{\"SDP\":").unwrap_err();
        assert!(matches!(err, RtcError::Decode(_)));
    }
}
