use tokio::sync::Mutex as AsyncMutex;

use crate::engine::CandidateInit;
use crate::error::Result;
use crate::signal::{SignalConn, SignalMessage, send_message};

/// Holds local candidates until the remote description is in place, then
/// forwards them (and everything after) in generation order.
///
/// The lock is held across sends so a candidate gathered mid-flush cannot
/// overtake the ones already queued.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    state: AsyncMutex<BufferState>,
}

#[derive(Debug, Default)]
struct BufferState {
    remote_described: bool,
    closed: bool,
    pending: Vec<CandidateInit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Sent,
    Buffered,
    Dropped,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn offer(&self, candidate: CandidateInit, signal: &dyn SignalConn) -> Result<Disposition> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(Disposition::Dropped);
        }
        if !state.remote_described {
            tracing::trace!(target: "rtcnet", candidate = %candidate.candidate, "buffering local candidate");
            state.pending.push(candidate);
            return Ok(Disposition::Buffered);
        }
        send_message(signal, &SignalMessage::candidate(candidate)).await?;
        Ok(Disposition::Sent)
    }

    /// Marks the remote description as set and sends everything buffered.
    pub async fn flush(&self, signal: &dyn SignalConn) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.remote_described = true;
        if state.closed {
            return Ok(0);
        }
        let pending = std::mem::take(&mut state.pending);
        let count = pending.len();
        for candidate in pending {
            send_message(signal, &SignalMessage::candidate(candidate)).await?;
        }
        if count > 0 {
            tracing::debug!(target: "rtcnet", count, "flushed buffered candidates");
        }
        Ok(count)
    }

    /// Drops anything pending; later offers are discarded.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.pending.clear();
    }

    pub async fn pending(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;
    use crate::testing::signal_pair;

    async fn drain_candidates(count: usize, remote: &dyn SignalConn) -> Vec<String> {
        let mut seen = Vec::new();
        for _ in 0..count {
            let frame = remote.recv().await.expect("recv").expect("frame");
            match SignalMessage::decode(&frame).expect("decode").into_signal() {
                Signal::Candidate(c) => seen.push(c.candidate),
                other => panic!("unexpected signal {other:?}"),
            }
        }
        seen
    }

    #[tokio::test]
    async fn buffers_until_flush_then_sends_in_order() {
        let (local, remote) = signal_pair();
        let buffer = CandidateBuffer::new();

        for name in ["c1", "c2", "c3"] {
            let disposition = buffer
                .offer(CandidateInit::new(name), local.as_ref())
                .await
                .expect("offer");
            assert_eq!(disposition, Disposition::Buffered);
        }
        assert_eq!(buffer.pending().await, 3);
        assert_eq!(local.sent_count(), 0);

        assert_eq!(buffer.flush(local.as_ref()).await.expect("flush"), 3);
        let after = buffer
            .offer(CandidateInit::new("c4"), local.as_ref())
            .await
            .expect("offer");
        assert_eq!(after, Disposition::Sent);

        assert_eq!(drain_candidates(4, remote.as_ref()).await, ["c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn closed_buffer_discards() {
        let (local, _remote) = signal_pair();
        let buffer = CandidateBuffer::new();
        buffer
            .offer(CandidateInit::new("c1"), local.as_ref())
            .await
            .expect("offer");
        buffer.close().await;

        let disposition = buffer
            .offer(CandidateInit::new("c2"), local.as_ref())
            .await
            .expect("offer");
        assert_eq!(disposition, Disposition::Dropped);
        assert_eq!(buffer.flush(local.as_ref()).await.expect("flush"), 0);
        assert_eq!(local.sent_count(), 0);
    }

    #[tokio::test]
    async fn send_failure_is_reported() {
        let (local, remote) = signal_pair();
        let buffer = CandidateBuffer::new();
        buffer
            .offer(CandidateInit::new("c1"), local.as_ref())
            .await
            .expect("offer");
        remote.close().await.expect("close");
        local.close().await.expect("close");

        assert!(buffer.flush(local.as_ref()).await.is_err());
    }
}
