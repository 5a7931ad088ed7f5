//! WebRTC data channels as ordinary byte streams.
//!
//! [`dial`] and [`Listener`] exchange an SDP offer/answer and ICE
//! candidates over a websocket, then hand back a connection whose
//! `read`/`write` run over the negotiated data channel. A client may also
//! ask for the websocket itself as the stream ([`dial_fallback`]).

mod candidates;
mod config;
mod conn;
mod dial;
pub mod engine;
mod error;
mod listener;
mod logging;
mod negotiate;
mod net;
pub mod signal;
pub mod testing;
pub mod ws;

pub use candidates::{CandidateBuffer, Disposition};
pub use config::{DEFAULT_DIAL_TIMEOUT, DEFAULT_NEGOTIATION_TIMEOUT, DialConfig, ListenConfig};
pub use conn::Conn;
pub use dial::{dial, dial_fallback, dial_signal, dial_with_engine};
pub use error::{Result, RtcError};
pub use listener::{Incoming, Listener, SignalListener};
pub use negotiate::DATA_CHANNEL_LABEL;
pub use net::NetConn;
pub use ws::{FALLBACK_PATH, WsConn, WsListener};

#[cfg(test)]
mod tests;
