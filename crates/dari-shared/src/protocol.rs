use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ProtocolError;
use crate::types::{CallId, CallType, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// One side's proposed media configuration, stored as `{ "type", "sdp" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Reject a description of the wrong kind or one without content.
    pub fn validate_as(&self, expected: SdpType) -> Result<(), ProtocolError> {
        if self.sdp_type != expected {
            return Err(ProtocolError::InvalidDescription(format!(
                "expected {expected:?}, got {:?}",
                self.sdp_type
            )));
        }
        if self.sdp.trim().is_empty() {
            return Err(ProtocolError::InvalidDescription("empty SDP".into()));
        }
        Ok(())
    }
}

/// One discovered network path, in the JSON shape browsers produce for
/// `RTCIceCandidate.toJSON()`. Stored verbatim as a candidate document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(value).map_err(|e| ProtocolError::MalformedCandidate(e.to_string()))
    }

    pub fn to_json(&self) -> Result<serde_json::Value, ProtocolError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// A STUN or TURN server a peer connection may use.
///
/// Relay credential services return either a single URL or a list under
/// `urls`; both are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            username: None,
            credential: None,
        }
    }

    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// One call attempt between two parties, as stored in the mailbox.
///
/// `answer` and `callee_id` stay absent until the callee joins. The record's
/// identifier lives outside the document body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub id: CallId,
    pub offer: SessionDescription,
    pub answer: Option<SessionDescription>,
    pub caller_id: UserId,
    pub callee_id: Option<UserId>,
    pub call_type: CallType,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallDocument {
    offer: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    answer: Option<SessionDescription>,
    caller_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    callee_id: Option<UserId>,
    // Records written before call types existed were always video calls.
    #[serde(default = "legacy_call_type")]
    call_type: CallType,
    // Missing timestamps read as the epoch, so such records count as stale.
    #[serde(default)]
    created_at: DateTime<Utc>,
}

fn legacy_call_type() -> CallType {
    CallType::Video
}

impl CallRecord {
    pub fn new(id: CallId, offer: SessionDescription, caller_id: UserId, call_type: CallType) -> Self {
        Self {
            id,
            offer,
            answer: None,
            caller_id,
            callee_id: None,
            call_type,
            created_at: Utc::now(),
        }
    }

    /// Body of a freshly published, unanswered record. The store assigns
    /// the identifier.
    pub fn offer_document(
        offer: &SessionDescription,
        caller_id: &UserId,
        call_type: CallType,
    ) -> Result<serde_json::Value, ProtocolError> {
        let doc = CallDocument {
            offer: offer.clone(),
            answer: None,
            caller_id: caller_id.clone(),
            callee_id: None,
            call_type,
            created_at: Utc::now(),
        };
        Ok(serde_json::to_value(doc)?)
    }

    pub fn is_answered(&self) -> bool {
        self.answer.is_some()
    }

    /// Document body without the identifier.
    pub fn to_document(&self) -> Result<serde_json::Value, ProtocolError> {
        let doc = CallDocument {
            offer: self.offer.clone(),
            answer: self.answer.clone(),
            caller_id: self.caller_id.clone(),
            callee_id: self.callee_id.clone(),
            call_type: self.call_type,
            created_at: self.created_at,
        };
        Ok(serde_json::to_value(doc)?)
    }

    pub fn from_document(id: CallId, data: serde_json::Value) -> Result<Self, ProtocolError> {
        let doc: CallDocument = serde_json::from_value(data)
            .map_err(|e| ProtocolError::MalformedRecord(format!("{id}: {e}")))?;
        Ok(Self {
            id,
            offer: doc.offer,
            answer: doc.answer,
            caller_id: doc.caller_id,
            callee_id: doc.callee_id,
            call_type: doc.call_type,
            created_at: doc.created_at,
        })
    }
}
