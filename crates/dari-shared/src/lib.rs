//! # dari-shared
//!
//! Types shared by every dari crate: identifiers, the call document shape
//! stored in the mailbox, session descriptions, ICE candidates, and relay
//! server descriptors.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{CallRecord, IceCandidate, IceServer, SdpType, SessionDescription};
pub use types::{CallId, CallType, Role, TrackKind, UserId};
