use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by dialing, accepting and using a [`crate::Conn`].
///
/// Every variant carries owned strings so one failure can be handed to
/// several waiters (the dialer, a pending read, the close result).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RtcError {
    #[error("signaling failed: {0}")]
    Signal(String),
    #[error("malformed signaling message: {0}")]
    Decode(String),
    #[error("negotiation failed during {stage}: {reason}")]
    Negotiation { stage: &'static str, reason: String },
    #[error("webrtc engine error: {0}")]
    Engine(String),
    #[error("peer connection failed")]
    PeerFailed,
    /// The remote side hung up before sending an offer.
    #[error("remote hung up before negotiating")]
    Abandoned,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("data channel not established")]
    NotEstablished,
    #[error("stream i/o failed: {0}")]
    Stream(String),
    #[error("failed to close: {}", .0.join("; "))]
    Close(Vec<String>),
    #[error("listener failed: {0}")]
    Listener(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RtcError {
    pub(crate) fn negotiation(stage: &'static str, reason: impl ToString) -> Self {
        RtcError::Negotiation {
            stage,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn signal(reason: impl ToString) -> Self {
        RtcError::Signal(reason.to_string())
    }

    pub(crate) fn stream(reason: impl ToString) -> Self {
        RtcError::Stream(reason.to_string())
    }

    /// True for errors that only report the connection going away.
    pub fn is_closed(&self) -> bool {
        matches!(self, RtcError::Closed)
    }
}

impl From<RtcError> for std::io::Error {
    fn from(err: RtcError) -> Self {
        use std::io::ErrorKind;
        let kind = match &err {
            RtcError::Closed => ErrorKind::NotConnected,
            RtcError::Timeout(_) => ErrorKind::TimedOut,
            RtcError::NotEstablished => ErrorKind::NotConnected,
            RtcError::Decode(_) => ErrorKind::InvalidData,
            RtcError::Abandoned => ErrorKind::ConnectionAborted,
            RtcError::Config(_) => ErrorKind::InvalidInput,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, RtcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_error_lists_every_failure() {
        let err = RtcError::Close(vec![
            "data channel: already gone".into(),
            "peer connection: busy".into(),
        ]);
        assert_eq!(
            err.to_string(),
            "failed to close: data channel: already gone; peer connection: busy"
        );
    }

    #[test]
    fn io_conversion_keeps_timeout_kind() {
        let io: std::io::Error = RtcError::Timeout(Duration::from_secs(10)).into();
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);
    }
}
