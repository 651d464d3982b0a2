//! What can go wrong with a call, as the UI sees it.
//!
//! Every lower-layer error is folded into [`CallError`] here, so the session
//! controller is the single place that decides between retrying, degrading
//! and aborting.

use dari_media::{MediaError, NegotiationError, SignalingError, TransportError};
use dari_shared::{CallId, ProtocolError, TrackKind};
use thiserror::Error;

/// Something the local user was not allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Microphone,
    Camera,
    /// The shared call mailbox (the session is not signed in).
    Mailbox,
}

impl From<TrackKind> for Resource {
    fn from(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Audio => Resource::Microphone,
            TrackKind::Video => Resource::Camera,
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Resource::Microphone => "microphone",
            Resource::Camera => "camera",
            Resource::Mailbox => "call mailbox",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("access to the {0} was denied")]
    PermissionDenied(Resource),

    #[error("no {} available", .0.device_name())]
    DeviceUnavailable(TrackKind),

    #[error("media device error: {0}")]
    Device(String),

    #[error("call {0} not found")]
    CallNotFound(CallId),

    #[error("call {0} was already answered")]
    AlreadyAnswered(CallId),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("invalid remote description: {0}")]
    InvalidRemoteDescription(String),

    #[error("no media path was established in time")]
    ConnectionTimeout,

    #[error("call mailbox unavailable: {0}")]
    StoreUnavailable(String),

    /// The mailbox failed in a way retrying will not fix.
    #[error("call mailbox error: {0}")]
    Storage(String),

    #[error("a call is already in progress")]
    Busy,

    #[error("not in a call")]
    NotInCall,

    /// The session was hung up while this operation was in flight.
    #[error("call was hung up")]
    Cancelled,
}

impl CallError {
    /// Text for the person in front of the screen.
    pub fn user_message(&self) -> String {
        match self {
            CallError::PermissionDenied(Resource::Mailbox) => {
                "You need to be signed in to place or join calls.".to_string()
            }
            CallError::PermissionDenied(resource) => format!(
                "Access to the {resource} was denied. Allow it in your system settings and try again."
            ),
            CallError::DeviceUnavailable(TrackKind::Video) => {
                "No camera was found. You can start an audio call instead.".to_string()
            }
            CallError::DeviceUnavailable(TrackKind::Audio) => {
                "No microphone was found. Connect one and try again.".to_string()
            }
            CallError::Device(_) => {
                "A media device stopped working. Check your microphone and camera.".to_string()
            }
            CallError::CallNotFound(_) | CallError::AlreadyAnswered(_) => {
                "This call is no longer available.".to_string()
            }
            CallError::Negotiation(_) | CallError::InvalidRemoteDescription(_) => {
                "The call could not be set up. Please try again.".to_string()
            }
            CallError::ConnectionTimeout => {
                "Could not reach the other party. Start a new call to try again.".to_string()
            }
            CallError::StoreUnavailable(_) => {
                "The call service cannot be reached right now. Try again in a moment.".to_string()
            }
            CallError::Storage(_) => {
                "Something went wrong with the call service. The call could not continue.".to_string()
            }
            CallError::Busy => "You are already in a call.".to_string(),
            CallError::NotInCall => "There is no call in progress.".to_string(),
            CallError::Cancelled => "The call was ended.".to_string(),
        }
    }

    /// Whether the UI should offer a one-click retry. A retry always starts
    /// a fresh call.
    pub fn offers_retry(&self) -> bool {
        matches!(
            self,
            CallError::ConnectionTimeout | CallError::StoreUnavailable(_)
        )
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(kind) => CallError::PermissionDenied(kind.into()),
            MediaError::DeviceUnavailable(kind) => CallError::DeviceUnavailable(kind),
            MediaError::Device(msg) => CallError::Device(msg),
        }
    }
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::StoreUnavailable(msg) => CallError::StoreUnavailable(msg),
            SignalingError::PermissionDenied(msg) => {
                tracing::debug!(reason = %msg, "Mailbox refused the request");
                CallError::PermissionDenied(Resource::Mailbox)
            }
            SignalingError::CallNotFound(id) => CallError::CallNotFound(id),
            SignalingError::AlreadyAnswered(id) => CallError::AlreadyAnswered(id),
            SignalingError::Malformed(ProtocolError::InvalidDescription(msg)) => {
                CallError::InvalidRemoteDescription(msg)
            }
            SignalingError::Malformed(other) => CallError::Negotiation(other.to_string()),
            SignalingError::Store(other) => CallError::Storage(other.to_string()),
        }
    }
}

impl From<NegotiationError> for CallError {
    fn from(err: NegotiationError) -> Self {
        match err {
            NegotiationError::InvalidRemoteDescription(msg) => {
                CallError::InvalidRemoteDescription(msg)
            }
            NegotiationError::ConnectionTimeout(_) | NegotiationError::ConnectionFailed => {
                CallError::ConnectionTimeout
            }
            NegotiationError::Closed => CallError::Cancelled,
            other => CallError::Negotiation(other.to_string()),
        }
    }
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        CallError::from(NegotiationError::from(err))
    }
}
