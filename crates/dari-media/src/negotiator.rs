//! Offer/answer negotiation for one call attempt.
//!
//! A [`Negotiator`] owns one [`PeerTransport`]. Operations are serialised
//! through an async lock, so a remote candidate that arrives while the remote
//! description is being applied waits and then lands after every buffered
//! candidate. [`Negotiator::close`] does not take that lock: it flips the
//! closed flag, and any operation still in flight discards its result.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dari_shared::{IceCandidate, SdpType, SessionDescription};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::candidates::{Admission, CandidateQueue};
use crate::capture::LocalStream;
use crate::transport::{PeerConnectionState, PeerEvent, PeerEvents, PeerTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    New,
    /// Caller, offer created.
    HaveLocalOffer,
    /// Callee, offer applied, answer not yet created.
    HaveRemoteOffer,
    /// Caller, answer applied.
    HaveRemoteAnswer,
    /// Callee, answer created.
    Stable,
    Closed,
}

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("no local media attached")]
    NoLocalMedia,

    #[error("{0} is not allowed in signaling state {1:?}")]
    WrongState(&'static str, SignalingState),

    #[error("invalid remote description: {0}")]
    InvalidRemoteDescription(String),

    #[error("negotiator is closed")]
    Closed,

    #[error("connection not established within {0:?}")]
    ConnectionTimeout(Duration),

    #[error("connection failed")]
    ConnectionFailed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Outcome of [`Negotiator::add_remote_candidate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    /// Held until the remote description is applied.
    Buffered,
    /// The negotiator is closed.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiatorEvent {
    /// Locally discovered candidate, in discovery order.
    LocalCandidate(IceCandidate),
    /// First track of a remote stream. Each stream is reported once.
    RemoteStream { stream_id: String },
    ConnectionState(PeerConnectionState),
}

/// Receiving half of a negotiator's events. Ends after close.
pub struct NegotiatorEvents {
    rx: mpsc::UnboundedReceiver<NegotiatorEvent>,
}

impl NegotiatorEvents {
    pub async fn next(&mut self) -> Option<NegotiatorEvent> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<NegotiatorEvent> {
        self.rx.try_recv().ok()
    }
}

struct Session {
    signaling: SignalingState,
    candidates: CandidateQueue,
    has_local_media: bool,
}

struct Relay {
    task: JoinHandle<()>,
    events: mpsc::UnboundedSender<NegotiatorEvent>,
}

pub struct Negotiator {
    transport: Arc<dyn PeerTransport>,
    session: Mutex<Session>,
    state: Arc<watch::Sender<PeerConnectionState>>,
    closed: Arc<AtomicBool>,
    relay: std::sync::Mutex<Option<Relay>>,
}

impl Negotiator {
    /// Wrap a transport and start relaying its events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        peer_events: PeerEvents,
    ) -> (Arc<Self>, NegotiatorEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(PeerConnectionState::New);
        let state = Arc::new(state_tx);
        let closed = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(relay_events(
            peer_events,
            tx.clone(),
            state.clone(),
            closed.clone(),
        ));

        let negotiator = Arc::new(Self {
            transport,
            session: Mutex::new(Session {
                signaling: SignalingState::New,
                candidates: CandidateQueue::new(),
                has_local_media: false,
            }),
            state,
            closed,
            relay: std::sync::Mutex::new(Some(Relay { task, events: tx })),
        });
        (negotiator, NegotiatorEvents { rx })
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.is_closed() {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Add every track of `stream` to the connection. Call before creating
    /// the offer or answer.
    pub async fn attach_local_media(&self, stream: &LocalStream) -> Result<(), NegotiationError> {
        let mut session = self.session.lock().await;
        self.ensure_open()?;
        if session.signaling != SignalingState::New {
            return Err(NegotiationError::WrongState(
                "attach_local_media",
                session.signaling,
            ));
        }
        for track in stream.tracks() {
            self.transport.add_local_track(track).await?;
        }
        self.ensure_open()?;
        session.has_local_media = !stream.tracks().is_empty();
        debug!(tracks = stream.tracks().len(), "Local media attached");
        Ok(())
    }

    pub async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let mut session = self.session.lock().await;
        self.ensure_open()?;
        if !session.has_local_media {
            return Err(NegotiationError::NoLocalMedia);
        }
        if session.signaling != SignalingState::New {
            return Err(NegotiationError::WrongState("create_offer", session.signaling));
        }

        let offer = self.transport.create_offer().await.map_err(closed_or)?;
        self.ensure_open()?;
        session.signaling = SignalingState::HaveLocalOffer;
        info!("Local offer created");
        Ok(offer)
    }

    /// Apply the caller's offer, flush buffered candidates and produce the
    /// answer.
    pub async fn create_answer(
        &self,
        remote_offer: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        let mut session = self.session.lock().await;
        self.ensure_open()?;
        if session.signaling != SignalingState::New {
            return Err(NegotiationError::InvalidRemoteDescription(format!(
                "not expecting an offer in state {:?}",
                session.signaling
            )));
        }
        remote_offer
            .validate_as(SdpType::Offer)
            .map_err(|e| NegotiationError::InvalidRemoteDescription(e.to_string()))?;

        self.apply_remote(&mut session, remote_offer, SignalingState::HaveRemoteOffer)
            .await?;

        let answer = self.transport.create_answer().await.map_err(closed_or)?;
        self.ensure_open()?;
        session.signaling = SignalingState::Stable;
        info!("Local answer created");
        Ok(answer)
    }

    /// Apply the callee's answer and flush buffered candidates.
    pub async fn accept_answer(
        &self,
        remote_answer: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        let mut session = self.session.lock().await;
        self.ensure_open()?;
        if session.signaling != SignalingState::HaveLocalOffer {
            return Err(NegotiationError::InvalidRemoteDescription(format!(
                "not expecting an answer in state {:?}",
                session.signaling
            )));
        }
        remote_answer
            .validate_as(SdpType::Answer)
            .map_err(|e| NegotiationError::InvalidRemoteDescription(e.to_string()))?;

        self.apply_remote(&mut session, remote_answer, SignalingState::HaveRemoteAnswer)
            .await?;
        info!("Remote answer applied");
        Ok(())
    }

    async fn apply_remote(
        &self,
        session: &mut Session,
        description: &SessionDescription,
        next: SignalingState,
    ) -> Result<(), NegotiationError> {
        self.transport
            .set_remote_description(description)
            .await
            .map_err(|e| match e {
                TransportError::Closed => NegotiationError::Closed,
                other => NegotiationError::InvalidRemoteDescription(other.to_string()),
            })?;
        self.ensure_open()?;
        session.signaling = next;

        let early = session.candidates.open();
        if !early.is_empty() {
            debug!(count = early.len(), "Flushing buffered remote candidates");
        }
        for candidate in early {
            self.ensure_open()?;
            if let Err(e) = self.transport.add_ice_candidate(&candidate).await {
                warn!(error = %e, "Buffered remote candidate rejected");
            }
        }
        Ok(())
    }

    /// Apply a remote candidate now, or hold it until the remote description
    /// is set.
    pub async fn add_remote_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, NegotiationError> {
        let mut session = self.session.lock().await;
        if self.is_closed() {
            return Ok(CandidateDisposition::Discarded);
        }
        match session.candidates.admit(candidate) {
            Admission::Buffered => {
                debug!(pending = session.candidates.len(), "Remote candidate buffered");
                Ok(CandidateDisposition::Buffered)
            }
            Admission::Apply(candidate) => match self.transport.add_ice_candidate(&candidate).await {
                Ok(()) => Ok(CandidateDisposition::Applied),
                Err(TransportError::Closed) => Ok(CandidateDisposition::Discarded),
                Err(e) if self.is_closed() => {
                    debug!(error = %e, "Candidate failed after close");
                    Ok(CandidateDisposition::Discarded)
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Resolve once the connection is `connected`.
    ///
    /// Fails with [`NegotiationError::ConnectionTimeout`] after `limit`, or
    /// early if the connection fails or the negotiator closes.
    pub async fn wait_connected(&self, limit: Duration) -> Result<(), NegotiationError> {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                let current = *rx.borrow_and_update();
                match current {
                    PeerConnectionState::Connected => return Ok(()),
                    PeerConnectionState::Failed => return Err(NegotiationError::ConnectionFailed),
                    PeerConnectionState::Closed => return Err(NegotiationError::Closed),
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(NegotiationError::Closed);
                }
            }
        };
        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| NegotiationError::ConnectionTimeout(limit))?
    }

    pub fn state(&self) -> PeerConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PeerConnectionState> {
        self.state.subscribe()
    }

    pub async fn signaling_state(&self) -> SignalingState {
        if self.is_closed() {
            return SignalingState::Closed;
        }
        self.session.lock().await.signaling
    }

    /// Remote candidates waiting for the remote description.
    pub async fn pending_candidates(&self) -> usize {
        self.session.lock().await.candidates.len()
    }

    /// Close the connection. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let relay = self.take_relay();
        if advance_state(&self.state, PeerConnectionState::Closed) {
            if let Some(relay) = &relay {
                let _ = relay
                    .events
                    .send(NegotiatorEvent::ConnectionState(PeerConnectionState::Closed));
            }
        }
        if let Some(relay) = relay {
            relay.task.abort();
        }

        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "Transport close failed");
        }
        info!("Negotiator closed");
    }

    fn take_relay(&self) -> Option<Relay> {
        match self.relay.lock() {
            Ok(mut relay) => relay.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl Drop for Negotiator {
    fn drop(&mut self) {
        if let Some(relay) = self.take_relay() {
            relay.task.abort();
        }
    }
}

fn closed_or(err: TransportError) -> NegotiationError {
    match err {
        TransportError::Closed => NegotiationError::Closed,
        other => NegotiationError::Transport(other),
    }
}

/// Move to `next` unless already there or closed. Returns whether it moved.
fn advance_state(state: &watch::Sender<PeerConnectionState>, next: PeerConnectionState) -> bool {
    state.send_if_modified(|current| {
        if *current == PeerConnectionState::Closed || *current == next {
            return false;
        }
        *current = next;
        true
    })
}

async fn relay_events(
    mut peer_events: PeerEvents,
    out: mpsc::UnboundedSender<NegotiatorEvent>,
    state: Arc<watch::Sender<PeerConnectionState>>,
    closed: Arc<AtomicBool>,
) {
    let mut streams = HashSet::new();
    while let Some(event) = peer_events.recv().await {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let forwarded = match event {
            PeerEvent::LocalCandidate(candidate) => Some(NegotiatorEvent::LocalCandidate(candidate)),
            PeerEvent::RemoteTrack { stream_id, kind } => {
                if streams.insert(stream_id.clone()) {
                    debug!(stream = %stream_id, %kind, "Remote stream arrived");
                    Some(NegotiatorEvent::RemoteStream { stream_id })
                } else {
                    None
                }
            }
            PeerEvent::StateChanged(next) => {
                if advance_state(&state, next) {
                    info!(state = %next, "Connection state changed");
                    Some(NegotiatorEvent::ConnectionState(next))
                } else {
                    None
                }
            }
        };
        if let Some(event) = forwarded {
            // State keeps tracking even if nobody reads the events.
            let _ = out.send(event);
        }
    }
}
