//! The seam between the negotiator and a concrete peer connection.

use std::sync::Arc;

use async_trait::async_trait;
use dari_shared::{IceCandidate, IceServer, SessionDescription, TrackKind};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::capture::LocalTrack;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("peer connection error: {0}")]
    Backend(String),

    #[error("remote description rejected: {0}")]
    InvalidDescription(String),

    #[error("ICE candidate rejected: {0}")]
    CandidateRejected(String),

    #[error("peer connection is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Disconnected => "disconnected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        })
    }
}

/// Raw notifications from a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    /// One per remote track; several tracks may share a stream.
    RemoteTrack { stream_id: String, kind: TrackKind },
    StateChanged(PeerConnectionState),
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// One peer connection.
///
/// Implementations report candidates, tracks and state through the event
/// channel handed out by their [`TransportFactory`].
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), TransportError>;

    /// Generate an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Generate an answer to the applied remote offer and install it as the
    /// local description.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), TransportError>;

    /// Fails with [`TransportError::CandidateRejected`] before a remote
    /// description is set.
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerTransport>, PeerEvents), TransportError>;
}
