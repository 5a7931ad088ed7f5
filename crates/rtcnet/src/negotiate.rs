use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::Instrument;

use crate::candidates::CandidateBuffer;
use crate::conn::{Conn, Shared};
use crate::engine::{PeerEvent, PeerEvents, PeerFactory, PeerHandle, PeerState, SdpType, SessionDescription};
use crate::error::{Result, RtcError};
use crate::logging;
use crate::signal::{Signal, SignalConn, SignalMessage, send_message};

pub const DATA_CHANNEL_LABEL: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Initiator,
    Responder,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

pub(crate) struct Negotiation<'a> {
    pub role: Role,
    pub factory: &'a dyn PeerFactory,
    pub signal: Arc<dyn SignalConn>,
    pub ice_servers: &'a [String],
    pub ordered: bool,
    pub deadline: Instant,
    pub timeout: Duration,
}

/// Drives one offer/answer exchange until the data channel opens, an
/// error is reported, or the deadline passes. On failure the half-built
/// connection is closed before returning.
pub(crate) async fn negotiate(params: Negotiation<'_>) -> Result<Conn> {
    let span = tracing::debug_span!(
        "negotiate",
        role = params.role.as_str(),
        remote = %params.signal.remote_addr()
    );
    run(params).instrument(span).await
}

async fn run(params: Negotiation<'_>) -> Result<Conn> {
    let Negotiation {
        role,
        factory,
        signal,
        ice_servers,
        ordered,
        deadline,
        timeout,
    } = params;

    let (peer, events) = factory.new_peer(ice_servers).await?;
    let conn = Conn::new(Arc::clone(&peer), signal.local_addr(), signal.remote_addr());
    let candidates = Arc::new(CandidateBuffer::new());
    let (opened_tx, opened_rx) = oneshot::channel();

    logging::spawn(
        pump_events(
            events,
            conn.downgrade(),
            conn.shared().subscribe_closed(),
            Arc::clone(&signal),
            Arc::clone(&candidates),
            opened_tx,
        )
        .in_current_span(),
    );
    logging::spawn(
        read_signals(
            role,
            Arc::clone(&signal),
            Arc::clone(&peer),
            conn.downgrade(),
            conn.shared().subscribe_closed(),
            candidates,
        )
        .in_current_span(),
    );

    let established = async {
        if role == Role::Initiator {
            send_offer(peer.as_ref(), signal.as_ref(), ordered).await?;
        }
        wait_established(conn.shared(), opened_rx).await
    };

    let outcome = match tokio::time::timeout_at(deadline, established).await {
        Ok(result) => result,
        Err(_) => Err(RtcError::Timeout(timeout)),
    };

    match outcome {
        Ok(()) => {
            tracing::info!(target: "rtcnet", remote = %conn.remote_addr(), "data channel established");
            Ok(conn)
        }
        Err(err) => {
            if matches!(err, RtcError::Abandoned) {
                tracing::debug!(target: "rtcnet", "negotiation abandoned");
            } else {
                tracing::warn!(target: "rtcnet", error = %err, "negotiation failed");
            }
            if let Err(close_err) = conn.close().await {
                tracing::debug!(target: "rtcnet", error = %close_err, "close after failed negotiation");
            }
            Err(err)
        }
    }
}

async fn send_offer(peer: &dyn PeerHandle, signal: &dyn SignalConn, ordered: bool) -> Result<()> {
    peer.create_data_channel(DATA_CHANNEL_LABEL, ordered).await?;
    let offer = peer.create_offer().await?;
    peer.set_local_description(offer.clone()).await?;
    send_message(signal, &SignalMessage::description(offer))
        .await
        .map_err(|err| RtcError::negotiation("send_offer", err))?;
    tracing::debug!(target: "rtcnet", ordered, "offer sent");
    Ok(())
}

async fn wait_established(shared: &Shared, opened: oneshot::Receiver<()>) -> Result<()> {
    tokio::select! {
        biased;
        err = shared.next_error() => Err(err),
        opened = opened => opened.map_err(|_| {
            RtcError::Engine("peer events ended before the data channel opened".into())
        }),
    }
}

async fn pump_events(
    mut events: PeerEvents,
    conn: Weak<Shared>,
    mut closed: watch::Receiver<bool>,
    signal: Arc<dyn SignalConn>,
    candidates: Arc<CandidateBuffer>,
    opened: oneshot::Sender<()>,
) {
    let mut opened = Some(opened);
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = closed.wait_for(|closed| *closed) => break,
        };
        let Some(shared) = conn.upgrade() else {
            break;
        };

        match event {
            PeerEvent::Candidate(candidate) => {
                if let Err(err) = candidates.offer(candidate, signal.as_ref()).await {
                    if shared.is_established() {
                        tracing::debug!(target: "rtcnet", error = %err, "late candidate not delivered");
                    } else {
                        shared.push_error(err);
                    }
                }
            }
            PeerEvent::StateChanged(state) => {
                tracing::debug!(target: "rtcnet", state = %state, "peer connection state changed");
                match state {
                    PeerState::Disconnected => {
                        tracing::info!(target: "rtcnet", "peer disconnected; waiting for the engine to recover");
                    }
                    PeerState::Failed => {
                        shared.push_error(RtcError::PeerFailed);
                        let _ = shared.close().await;
                    }
                    PeerState::Closed => {
                        let _ = shared.close().await;
                    }
                    _ => {}
                }
            }
            PeerEvent::ChannelOpen(channel) => match channel.detach().await {
                Ok(raw) => {
                    if shared.attach(Arc::clone(&channel), Arc::clone(&raw)) {
                        tracing::debug!(target: "rtcnet", label = %channel.label(), "data channel attached");
                        if let Some(opened) = opened.take() {
                            let _ = opened.send(());
                        }
                    } else {
                        tracing::debug!(target: "rtcnet", label = %channel.label(), "discarding unused data channel");
                        let _ = channel.close().await;
                        let _ = raw.close().await;
                    }
                }
                Err(err) => shared.push_error(err),
            },
        }
    }
    candidates.close().await;
}

async fn read_signals(
    role: Role,
    signal: Arc<dyn SignalConn>,
    peer: Arc<dyn PeerHandle>,
    conn: Weak<Shared>,
    mut closed: watch::Receiver<bool>,
    candidates: Arc<CandidateBuffer>,
) {
    let mut described = false;
    loop {
        let frame = tokio::select! {
            frame = signal.recv() => frame,
            _ = closed.wait_for(|closed| *closed) => break,
        };
        let Some(shared) = conn.upgrade() else {
            break;
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                signaling_gone(role, &shared, described, None);
                break;
            }
            Err(err) => {
                signaling_gone(role, &shared, described, Some(err));
                break;
            }
        };

        let message = match SignalMessage::decode(&frame) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(target: "rtcnet", error = %err, len = frame.len(), "ignoring malformed signaling message");
                continue;
            }
        };

        let step = match message.into_signal() {
            Signal::Description(desc) => {
                described = true;
                apply_description(role, desc, peer.as_ref(), signal.as_ref(), &candidates).await
            }
            Signal::Candidate(candidate) => {
                tracing::trace!(target: "rtcnet", candidate = %candidate.candidate, "remote candidate");
                peer.add_ice_candidate(candidate).await
            }
            Signal::Empty => {
                tracing::trace!(target: "rtcnet", "ignoring empty signaling message");
                Ok(())
            }
        };

        if let Err(err) = step {
            shared.push_error(err);
            break;
        }
    }
    let _ = signal.close().await;
}

async fn apply_description(
    role: Role,
    desc: SessionDescription,
    peer: &dyn PeerHandle,
    signal: &dyn SignalConn,
    candidates: &CandidateBuffer,
) -> Result<()> {
    tracing::debug!(target: "rtcnet", sdp_type = %desc.sdp_type, "remote description received");
    let is_offer = desc.sdp_type == SdpType::Offer;
    peer.set_remote_description(desc).await?;

    if role == Role::Responder && is_offer {
        let answer = peer.create_answer().await?;
        send_message(signal, &SignalMessage::description(answer.clone()))
            .await
            .map_err(|err| RtcError::negotiation("send_answer", err))?;
        peer.set_local_description(answer).await?;
        tracing::debug!(target: "rtcnet", "answer sent");
    }

    candidates
        .flush(signal)
        .await
        .map_err(|err| RtcError::negotiation("flush_candidates", err))?;
    Ok(())
}

/// An initiator still waiting for its channel fails. A responder that never
/// saw an offer abandons the attempt; any other disconnect is left to the
/// engine and the deadline.
fn signaling_gone(role: Role, shared: &Shared, described: bool, err: Option<RtcError>) {
    match role {
        Role::Initiator if !shared.is_established() => {
            let reason = match err {
                Some(err) => err.to_string(),
                None => "signaling closed before the data channel opened".into(),
            };
            shared.push_error(RtcError::Signal(reason));
            return;
        }
        Role::Responder if !described => {
            tracing::debug!(target: "rtcnet", "signaling closed before an offer arrived");
            shared.push_error(RtcError::Abandoned);
            return;
        }
        _ => {}
    }
    match err {
        Some(err) => tracing::debug!(target: "rtcnet", error = %err, "signaling read stopped"),
        None => tracing::debug!(target: "rtcnet", "signaling closed"),
    }
}
