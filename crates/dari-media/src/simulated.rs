//! Deterministic in-process peer connections.
//!
//! A [`SimulatedPeer`] follows the same rules a real peer connection
//! enforces on its caller: candidates are rejected until a remote description
//! is set, and an offer can only be answered once. It reports `connecting`
//! once both descriptions are in place and `connected` after the first
//! remote candidate is applied.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dari_shared::{IceCandidate, IceServer, SdpType, SessionDescription, TrackKind};
use tokio::sync::mpsc;
use tracing::debug;

use crate::capture::LocalTrack;
use crate::transport::{
    PeerConnectionState, PeerEvent, PeerEvents, PeerTransport, TransportError, TransportFactory,
};

/// Factory for [`SimulatedPeer`]s. Clones share the list of created peers.
#[derive(Clone, Default)]
pub struct SimulatedNetwork {
    shared: Arc<NetworkShared>,
}

#[derive(Default)]
struct NetworkShared {
    never_connect: bool,
    next_id: AtomicUsize,
    peers: Mutex<Vec<Arc<SimulatedPeer>>>,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers from this network stall in `connecting`.
    pub fn never_connecting() -> Self {
        Self {
            shared: Arc::new(NetworkShared {
                never_connect: true,
                ..NetworkShared::default()
            }),
        }
    }

    /// Every peer created so far, in creation order.
    pub fn peers(&self) -> Vec<Arc<SimulatedPeer>> {
        match self.shared.peers.lock() {
            Ok(peers) => peers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl TransportFactory for SimulatedNetwork {
    async fn connect(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerTransport>, PeerEvents), TransportError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(SimulatedPeer {
            id,
            ice_servers: ice_servers.to_vec(),
            never_connect: self.shared.never_connect,
            events: tx,
            sim: Mutex::new(PeerSim::default()),
        });
        self.shared
            .peers
            .lock()
            .map_err(|_| TransportError::Backend("network lock poisoned".into()))?
            .push(peer.clone());
        debug!(peer = id, "Simulated peer created");
        let transport: Arc<dyn PeerTransport> = peer;
        Ok((transport, rx))
    }
}

struct PeerSim {
    tracks: Vec<LocalTrack>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    connection: PeerConnectionState,
}

impl Default for PeerSim {
    fn default() -> Self {
        Self {
            tracks: Vec::new(),
            local: None,
            remote: None,
            applied: Vec::new(),
            connection: PeerConnectionState::New,
        }
    }
}

pub struct SimulatedPeer {
    id: usize,
    ice_servers: Vec<IceServer>,
    never_connect: bool,
    events: mpsc::UnboundedSender<PeerEvent>,
    sim: Mutex<PeerSim>,
}

impl SimulatedPeer {
    fn sim(&self) -> Result<MutexGuard<'_, PeerSim>, TransportError> {
        self.sim
            .lock()
            .map_err(|_| TransportError::Backend("peer lock poisoned".into()))
    }

    fn open_sim(&self) -> Result<MutexGuard<'_, PeerSim>, TransportError> {
        let sim = self.sim()?;
        if sim.connection == PeerConnectionState::Closed {
            return Err(TransportError::Closed);
        }
        Ok(sim)
    }

    fn emit(&self, event: PeerEvent) {
        // Nobody listening is not an error for a simulated peer.
        let _ = self.events.send(event);
    }

    fn transition(&self, sim: &mut PeerSim, state: PeerConnectionState) {
        if sim.connection != state {
            sim.connection = state;
            self.emit(PeerEvent::StateChanged(state));
        }
    }

    fn advance(&self, sim: &mut PeerSim) {
        if sim.local.is_none() || sim.remote.is_none() {
            return;
        }
        if sim.connection == PeerConnectionState::New {
            self.transition(sim, PeerConnectionState::Connecting);
        }
        if sim.connection == PeerConnectionState::Connecting
            && !self.never_connect
            && !sim.applied.is_empty()
        {
            self.transition(sim, PeerConnectionState::Connected);
        }
    }

    fn describe(&self, sim: &PeerSim, sdp_type: SdpType) -> SessionDescription {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.id
        );
        for (mid, track) in sim.tracks.iter().enumerate() {
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{}\r\na=msid:{} {}\r\n",
                track.kind(),
                mid,
                track.stream_id(),
                track.id()
            ));
        }
        SessionDescription { sdp_type, sdp }
    }

    fn gather(&self) {
        let addresses = [
            format!("192.0.2.{} {} typ host", self.id, 50000 + self.id),
            format!(
                "198.51.100.{} {} typ srflx raddr 192.0.2.{} rport {}",
                self.id,
                60000 + self.id,
                self.id,
                50000 + self.id
            ),
        ];
        for (n, address) in addresses.iter().enumerate() {
            self.emit(PeerEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:{}{} 1 udp 2122260223 {}", self.id, n, address),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: Some(format!("sim{}", self.id)),
            }));
        }
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Remote candidates the peer accepted, in application order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.sim().map(|s| s.applied.clone()).unwrap_or_default()
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.sim()
            .map(|s| s.connection)
            .unwrap_or(PeerConnectionState::Failed)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.sim().ok().and_then(|s| s.local.clone())
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.sim().ok().and_then(|s| s.remote.clone())
    }

    /// Drive the connection state from outside, e.g. a network drop.
    pub fn force_state(&self, state: PeerConnectionState) {
        if let Ok(mut sim) = self.open_sim() {
            self.transition(&mut sim, state);
        }
    }

    /// Report one more local candidate, as ICE restarts and late interfaces do.
    pub fn trickle(&self, candidate: IceCandidate) {
        if self.open_sim().is_ok() {
            self.emit(PeerEvent::LocalCandidate(candidate));
        }
    }
}

/// Remote streams announced by `a=msid:` lines, one entry per track.
fn remote_tracks(sdp: &str) -> Vec<(String, TrackKind)> {
    let mut kind = TrackKind::Audio;
    let mut tracks = Vec::new();
    for line in sdp.lines() {
        if let Some(media) = line.strip_prefix("m=") {
            kind = if media.starts_with("video") {
                TrackKind::Video
            } else {
                TrackKind::Audio
            };
        } else if let Some(msid) = line.strip_prefix("a=msid:") {
            if let Some(stream) = msid.split_whitespace().next() {
                tracks.push((stream.to_string(), kind));
            }
        }
    }
    tracks
}

#[async_trait]
impl PeerTransport for SimulatedPeer {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        self.open_sim()?.tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut sim = self.open_sim()?;
        if sim.local.is_some() || sim.remote.is_some() {
            return Err(TransportError::Backend("offer after negotiation started".into()));
        }
        let offer = self.describe(&sim, SdpType::Offer);
        sim.local = Some(offer.clone());
        self.gather();
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut sim = self.open_sim()?;
        match &sim.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer && sim.local.is_none() => {}
            _ => return Err(TransportError::Backend("no remote offer to answer".into())),
        }
        let answer = self.describe(&sim, SdpType::Answer);
        sim.local = Some(answer.clone());
        self.gather();
        self.advance(&mut sim);
        Ok(answer)
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        let mut sim = self.open_sim()?;
        if !description.sdp.starts_with("v=0") {
            return Err(TransportError::InvalidDescription("not an SDP body".into()));
        }
        if sim.remote.is_some() {
            return Err(TransportError::InvalidDescription(
                "remote description already set".into(),
            ));
        }
        let expected_local = match description.sdp_type {
            SdpType::Offer => None,
            SdpType::Answer => Some(SdpType::Offer),
        };
        if sim.local.as_ref().map(|d| d.sdp_type) != expected_local {
            return Err(TransportError::InvalidDescription(format!(
                "unexpected {:?} in this state",
                description.sdp_type
            )));
        }

        sim.remote = Some(description.clone());
        for (stream_id, kind) in remote_tracks(&description.sdp) {
            self.emit(PeerEvent::RemoteTrack { stream_id, kind });
        }
        self.advance(&mut sim);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let mut sim = self.open_sim()?;
        if sim.remote.is_none() {
            return Err(TransportError::CandidateRejected(
                "remote description not set".into(),
            ));
        }
        if candidate.candidate.trim().is_empty() {
            return Err(TransportError::CandidateRejected("empty candidate".into()));
        }
        sim.applied.push(candidate.clone());
        self.advance(&mut sim);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut sim = self.sim()?;
        self.transition(&mut sim, PeerConnectionState::Closed);
        Ok(())
    }
}
