//! Websocket signaling over `tokio-tungstenite`.
//!
//! A [`WsConn`] is both a message-framed [`SignalConn`] used during
//! negotiation and, on the reserved fallback path, a plain byte stream.

use std::net::SocketAddr;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, client_async_tls_with_config};

use crate::error::{Result, RtcError};
use crate::net::NetConn;
use crate::signal::SignalConn;

mod origin;
mod server;

pub use server::WsListener;

/// Path that skips negotiation and uses the websocket itself as the stream.
pub const FALLBACK_PATH: &str = "/wss";

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsConn {
    sink: AsyncMutex<SplitSink<WsStream, Message>>,
    inbound: AsyncMutex<Inbound>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

struct Inbound {
    stream: SplitStream<WsStream>,
    leftover: Vec<u8>,
    offset: usize,
}

impl Inbound {
    fn take_leftover(&mut self, buf: &mut [u8]) -> usize {
        let remaining = &self.leftover[self.offset..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.offset += n;
        if self.offset >= self.leftover.len() {
            self.leftover.clear();
            self.offset = 0;
        }
        n
    }

    async fn next_frame(&mut self) -> std::result::Result<Option<Vec<u8>>, WsError> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Binary(data)) => return Ok(Some(data)),
                Ok(Message::Text(text)) => return Ok(Some(text.into_bytes())),
                Ok(Message::Close(frame)) => {
                    tracing::trace!(target: "rtcnet", frame = ?frame, "websocket close frame");
                    return Ok(None);
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return Ok(None),
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }
}

impl WsConn {
    pub(crate) fn new(ws: WsStream, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: AsyncMutex::new(sink),
            inbound: AsyncMutex::new(Inbound {
                stream,
                leftover: Vec::new(),
                offset: 0,
            }),
            local_addr,
            remote_addr,
        }
    }

    /// Connects to `address` (`host:port[/path]`), over `wss://` when a
    /// connector is given. `path` replaces any path in the address.
    pub async fn connect(
        address: &str,
        path: Option<&str>,
        tls: Option<native_tls::TlsConnector>,
    ) -> Result<Self> {
        let (authority, address_path) = split_address(address);
        let path = path.unwrap_or(address_path);
        let scheme = if tls.is_some() { "wss" } else { "ws" };
        let url = format!("{scheme}://{authority}{path}");

        let tcp = TcpStream::connect(authority)
            .await
            .map_err(|err| RtcError::signal(format!("connect {authority}: {err}")))?;
        let local_addr = tcp.local_addr().map_err(RtcError::signal)?;
        let remote_addr = tcp.peer_addr().map_err(RtcError::signal)?;
        let connector = match tls {
            Some(connector) => Connector::NativeTls(connector),
            None => Connector::Plain,
        };
        let (ws, _response) = client_async_tls_with_config(url.as_str(), tcp, None, Some(connector))
            .await
            .map_err(|err| RtcError::signal(format!("websocket handshake with {url}: {err}")))?;
        tracing::debug!(target: "rtcnet", url = %url, local = %local_addr, "websocket connected");
        Ok(Self::new(ws, local_addr, remote_addr))
    }

    pub async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(frame)).await.map_err(RtcError::signal)
    }

    pub async fn recv_frame(&self) -> Result<Option<Vec<u8>>> {
        let mut inbound = self.inbound.lock().await;
        if inbound.offset < inbound.leftover.len() {
            let offset = inbound.offset;
            let rest = inbound.leftover.split_off(offset);
            inbound.leftover.clear();
            inbound.offset = 0;
            return Ok(Some(rest));
        }
        inbound.next_frame().await.map_err(RtcError::signal)
    }

    /// Stream read: frames are concatenated, `Ok(0)` marks the end.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inbound = self.inbound.lock().await;
        loop {
            if inbound.offset < inbound.leftover.len() {
                return Ok(inbound.take_leftover(buf));
            }
            match inbound.next_frame().await.map_err(RtcError::stream)? {
                Some(frame) if frame.is_empty() => continue,
                Some(frame) => {
                    inbound.leftover = frame;
                    inbound.offset = 0;
                }
                None => return Ok(0),
            }
        }
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(buf.to_vec()))
            .await
            .map_err(RtcError::stream)?;
        Ok(buf.len())
    }

    pub async fn close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        match sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(RtcError::signal(err)),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

#[async_trait]
impl SignalConn for WsConn {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.send_frame(frame).await
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        self.recv_frame().await
    }

    async fn close(&self) -> Result<()> {
        WsConn::close(self).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

#[async_trait]
impl NetConn for WsConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        WsConn::read(self, buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        WsConn::write(self, buf).await
    }

    async fn close(&self) -> Result<()> {
        WsConn::close(self).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

fn split_address(address: &str) -> (&str, &str) {
    let address = address
        .strip_prefix("wss://")
        .or_else(|| address.strip_prefix("ws://"))
        .unwrap_or(address);
    match address.find('/') {
        Some(index) => address.split_at(index),
        None => (address, "/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_without_path_uses_root() {
        assert_eq!(split_address("127.0.0.1:8080"), ("127.0.0.1:8080", "/"));
    }

    #[test]
    fn address_keeps_explicit_path_and_drops_scheme() {
        assert_eq!(split_address("wss://example.org:443/rtc"), ("example.org:443", "/rtc"));
    }
}
