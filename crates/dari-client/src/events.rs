use dari_media::PeerConnectionState;
use serde::Serialize;

use crate::error::CallError;

pub const EVENT_CONNECTION_STATE: &str = "call-connection-state";
pub const EVENT_REMOTE_STREAM: &str = "call-remote-stream";
pub const EVENT_SPEAKING: &str = "call-speaking";
pub const EVENT_FAILED: &str = "call-failed";
pub const EVENT_ENDED: &str = "call-ended";

/// What the UI hears about the current call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    ConnectionState(PeerConnectionState),
    /// A remote stream is ready to be played. Sent once per stream.
    RemoteStream { stream_id: String },
    /// The local speaking indicator changed.
    Speaking(bool),
    /// The attempt hit a fatal error. [`CallEvent::Ended`] follows once
    /// cleanup is done.
    Failed { error: CallError },
    Ended,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatePayload {
    pub state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteStreamPayload {
    pub stream_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeakingPayload {
    pub speaking: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedPayload {
    pub error: String,
    pub message: String,
    pub can_retry: bool,
}

impl CallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::ConnectionState(_) => EVENT_CONNECTION_STATE,
            CallEvent::RemoteStream { .. } => EVENT_REMOTE_STREAM,
            CallEvent::Speaking(_) => EVENT_SPEAKING,
            CallEvent::Failed { .. } => EVENT_FAILED,
            CallEvent::Ended => EVENT_ENDED,
        }
    }

    /// JSON body for a UI bridge.
    pub fn payload(&self) -> serde_json::Value {
        let value = match self {
            CallEvent::ConnectionState(state) => serde_json::to_value(ConnectionStatePayload {
                state: state.to_string(),
            }),
            CallEvent::RemoteStream { stream_id } => serde_json::to_value(RemoteStreamPayload {
                stream_id: stream_id.clone(),
            }),
            CallEvent::Speaking(speaking) => serde_json::to_value(SpeakingPayload {
                speaking: *speaking,
            }),
            CallEvent::Failed { error } => serde_json::to_value(FailedPayload {
                error: error.to_string(),
                message: error.user_message(),
                can_retry: error.offers_retry(),
            }),
            CallEvent::Ended => return serde_json::Value::Null,
        };
        value.unwrap_or_else(|e| {
            tracing::error!(event = self.name(), error = %e, "Failed to encode event");
            serde_json::Value::Null
        })
    }
}
