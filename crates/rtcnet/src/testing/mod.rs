//! In-memory engine and signaling for exercising negotiation without
//! sockets or ICE.

mod engine;
mod signal;

pub use engine::{LoopbackEngine, LoopbackPeer, LoopbackStream};
pub use signal::{MemorySignal, MemorySignalListener, signal_pair};
