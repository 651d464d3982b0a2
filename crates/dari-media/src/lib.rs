//! # dari-media
//!
//! Everything between the local devices and the mailbox for one call
//! attempt:
//!
//! - [`capture`]: microphone and camera acquisition behind [`MediaDevices`]
//! - [`level`]: the speaking indicator fed by captured audio
//! - [`pcmu`]: µ-law packetization of captured audio for the wire
//! - [`negotiator`]: offer/answer lifecycle over a [`PeerTransport`], with
//!   remote candidates held in a [`CandidateQueue`] until they can be applied
//! - [`webrtc_peer`] and [`simulated`]: the two transport backends
//! - [`signaling`]: the offer, answer and candidates mapped onto a
//!   [`dari_store::DocumentStore`]

pub mod audio;
pub mod candidates;
pub mod capture;
pub mod level;
pub mod negotiator;
pub mod pcmu;
pub mod signaling;
pub mod simulated;
pub mod transport;
pub mod video;
pub mod webrtc_peer;

pub use audio::AudioFrame;
pub use candidates::{Admission, CandidateQueue};
pub use capture::{
    DeviceBehavior, DeviceLease, HostDevices, LocalStream, LocalTrack, MediaDevices, MediaError,
    SyntheticDevices,
};
pub use level::LevelMeter;
pub use negotiator::{
    CandidateDisposition, NegotiationError, Negotiator, NegotiatorEvent, NegotiatorEvents,
    SignalingState,
};
pub use signaling::{
    AnswerWatch, CandidateWatch, MailboxChannel, RemovalWatch, RetryPolicy, SignalingError,
};
pub use simulated::{SimulatedNetwork, SimulatedPeer};
pub use transport::{PeerConnectionState, PeerEvent, PeerTransport, TransportError, TransportFactory};
pub use webrtc_peer::WebRtcFactory;
