use serde::{Deserialize, Serialize};

use crate::constants::{ANSWER_CANDIDATES, OFFER_CANDIDATES};

/// Identity of an authenticated user, as issued by the auth provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix used in log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one call record, assigned by the mailbox store.
///
/// Treated as opaque: it reaches the other party out-of-band (for example
/// inside a chat message) and is never parsed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn wants_video(self) -> bool {
        matches!(self, CallType::Video)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CallType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audio" => Ok(CallType::Audio),
            "video" => Ok(CallType::Video),
            other => Err(format!("unknown call type: {other}")),
        }
    }
}

/// Which side of the call this party is on.
///
/// The caller owns the call record end to end; the callee mutates it once.
/// Each side writes ICE candidates only to its own subcollection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    /// Subcollection this role appends its candidates to.
    pub fn local_candidates(self) -> &'static str {
        match self {
            Role::Caller => OFFER_CANDIDATES,
            Role::Callee => ANSWER_CANDIDATES,
        }
    }

    /// Subcollection holding the other side's candidates.
    pub fn remote_candidates(self) -> &'static str {
        self.opposite().local_candidates()
    }

    pub fn opposite(self) -> Role {
        match self {
            Role::Caller => Role::Callee,
            Role::Callee => Role::Caller,
        }
    }

    pub fn owns_record(self) -> bool {
        matches!(self, Role::Caller)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    /// Hardware that produces this kind of track.
    pub fn device_name(self) -> &'static str {
        match self {
            TrackKind::Audio => "microphone",
            TrackKind::Video => "camera",
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        })
    }
}
