//! Peer connections backed by the `webrtc` crate.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dari_shared::{IceCandidate, IceServer, SdpType, SessionDescription, TrackKind};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::AudioFrame;
use crate::capture::LocalTrack;
use crate::pcmu;
use crate::transport::{
    PeerConnectionState, PeerEvent, PeerEvents, PeerTransport, TransportError, TransportFactory,
};

fn backend(err: webrtc::Error) -> TransportError {
    TransportError::Backend(err.to_string())
}

/// Builds peer connections with the default codecs and interceptors.
pub struct WebRtcFactory {
    api: API,
}

impl WebRtcFactory {
    pub fn new() -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(backend)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        _ => None,
    }
}

fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_PCMU.to_owned(),
            clock_rate: pcmu::SAMPLE_RATE,
            channels: 1,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn connect(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerTransport>, PeerEvents), TransportError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(backend)?);
        let (tx, rx) = mpsc::unbounded_channel();

        let events = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::LocalCandidate(candidate_from_init(init)));
                    }
                    Err(e) => warn!(error = %e, "Could not serialise local candidate"),
                }
            })
        }));

        let events = tx.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let events = events.clone();
            Box::pin(async move {
                let kind = if track.kind() == RTPCodecType::Video {
                    TrackKind::Video
                } else {
                    TrackKind::Audio
                };
                let stream_id = track.stream_id().to_string();
                info!(stream = %stream_id, %kind, "Remote track received");
                let _ = events.send(PeerEvent::RemoteTrack { stream_id, kind });

                // Playback is outside this crate; keep the receive buffers moving.
                tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
            })
        }));

        let events = tx;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            Box::pin(async move {
                if let Some(state) = map_state(state) {
                    let _ = events.send(PeerEvent::StateChanged(state));
                }
            })
        }));

        info!(servers = ice_servers.len(), "Peer connection created");
        let transport: Arc<dyn PeerTransport> = Arc::new(WebRtcTransport {
            pc,
            senders: Mutex::new(Vec::new()),
        });
        Ok((transport, rx))
    }
}

const PACKET_DURATION: Duration = Duration::from_millis(20);

/// The payload for the next audio packet: the oldest captured frame, or
/// silence when nothing was captured or the track is muted.
fn next_audio_payload(frames: &mut broadcast::Receiver<AudioFrame>, track: &LocalTrack) -> Vec<u8> {
    let frame = loop {
        match frames.try_recv() {
            Ok(frame) => break Some(frame),
            Err(TryRecvError::Lagged(skipped)) => {
                debug!(skipped, "Audio sender fell behind capture");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break None,
        }
    };
    match frame {
        Some(frame) if track.is_enabled() => pcmu::encode(&frame),
        _ => pcmu::silence(PACKET_DURATION),
    }
}

/// Write one packet every [`PACKET_DURATION`] for as long as the connection
/// lives. Sending silence keeps the remote track alive with no microphone.
async fn send_audio(
    sample_track: Arc<TrackLocalStaticSample>,
    track: LocalTrack,
    mut frames: broadcast::Receiver<AudioFrame>,
) {
    let mut ticker = tokio::time::interval(PACKET_DURATION);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let sample = Sample {
            data: next_audio_payload(&mut frames, &track).into(),
            duration: PACKET_DURATION,
            ..Default::default()
        };
        if let Err(e) = sample_track.write_sample(&sample).await {
            debug!(error = %e, "Audio sample not sent");
        }
    }
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<JoinHandle<()>>>,
}

impl WebRtcTransport {
    fn stop_senders(&self) {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        for sender in senders.drain(..) {
            sender.abort();
        }
    }
}

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        self.stop_senders();
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        let local = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            track.stream_id().to_string(),
        ));
        let sender = self
            .pc
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(backend)?;

        // Video has no encoder here; only audio is packetized.
        if track.kind() == TrackKind::Audio {
            let pump = tokio::spawn(send_audio(local, track.clone(), track.frames()));
            self.senders
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(pump);
        }

        // RTCP has to be read for interceptors such as NACK to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        debug!(track = %track.id(), kind = %track.kind(), "Local track added");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(backend)?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await.map_err(backend)?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await.map_err(backend)?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        let sdp = description.sdp.clone();
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(sdp),
            SdpType::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::CandidateRejected(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.stop_senders();
        self.pc.close().await.map_err(backend)
    }
}
