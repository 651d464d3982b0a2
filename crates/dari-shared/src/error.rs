use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Malformed call record: {0}")]
    MalformedRecord(String),

    #[error("Malformed ICE candidate: {0}")]
    MalformedCandidate(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
