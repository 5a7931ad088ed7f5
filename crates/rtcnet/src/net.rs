use std::net::SocketAddr;
use std::time::Instant;

use async_trait::async_trait;

use crate::error::Result;

/// Stream-oriented connection handed out by [`crate::Listener::accept`].
///
/// Implemented by negotiated data channel connections and by fallback
/// websocket connections.
#[async_trait]
pub trait NetConn: Send + Sync {
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;
    async fn write(&self, buf: &[u8]) -> Result<usize>;
    async fn close(&self) -> Result<()>;
    fn local_addr(&self) -> SocketAddr;
    fn remote_addr(&self) -> SocketAddr;

    /// Deadlines are accepted and ignored.
    fn set_deadline(&self, _deadline: Option<Instant>) -> Result<()> {
        Ok(())
    }

    fn set_read_deadline(&self, _deadline: Option<Instant>) -> Result<()> {
        Ok(())
    }

    fn set_write_deadline(&self, _deadline: Option<Instant>) -> Result<()> {
        Ok(())
    }
}
