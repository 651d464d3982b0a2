//! Local media capture.
//!
//! [`MediaDevices::open`] acquires the microphone (and the camera for video
//! calls) and hands back a [`LocalStream`]. The stream owns the device
//! leases; [`LocalStream::stop`] releases them and also runs on drop, so an
//! early return anywhere in call setup cannot leave a device held.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dari_shared::{CallType, TrackKind};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::audio::{AudioConfig, AudioFrame, MicrophoneCapture};
use crate::level::LevelMeter;
use crate::video::{CameraCapture, VideoConfig};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("access to the {} was denied", .0.device_name())]
    PermissionDenied(TrackKind),

    #[error("no {} available", .0.device_name())]
    DeviceUnavailable(TrackKind),

    #[error("media device error: {0}")]
    Device(String),
}

/// Exclusive hold on one hardware device.
pub trait DeviceLease: Send + Sync {
    fn kind(&self) -> TrackKind;

    /// Give the device back. Must be idempotent.
    fn release(&self);
}

/// Captured audio frames buffered per subscriber before the oldest are dropped.
const FRAME_BACKLOG: usize = 16;

/// One local track. Clones share the enabled flag and the frame feed.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    stream_id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    frames: broadcast::Sender<AudioFrame>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let (frames, _) = broadcast::channel(FRAME_BACKLOG);
        Self {
            id: format!("{kind}-{}", uuid::Uuid::new_v4().simple()),
            stream_id: stream_id.to_string(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            frames,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        self.enabled.clone()
    }

    /// Frames captured for this track from now on. Synthetic tracks never
    /// produce any.
    pub fn frames(&self) -> broadcast::Receiver<AudioFrame> {
        self.frames.subscribe()
    }

    pub(crate) fn frame_sink(&self) -> broadcast::Sender<AudioFrame> {
        self.frames.clone()
    }
}

/// The local camera/microphone stream for one call attempt.
pub struct LocalStream {
    id: String,
    call_type: CallType,
    tracks: Vec<LocalTrack>,
    leases: Mutex<Vec<Box<dyn DeviceLease>>>,
    stopped: AtomicBool,
    meter: Option<LevelMeter>,
}

impl LocalStream {
    pub fn new(
        id: String,
        call_type: CallType,
        tracks: Vec<LocalTrack>,
        leases: Vec<Box<dyn DeviceLease>>,
        meter: Option<LevelMeter>,
    ) -> Self {
        Self {
            id,
            call_type,
            tracks,
            leases: Mutex::new(leases),
            stopped: AtomicBool::new(false),
            meter,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    /// Disable or re-enable the audio track. The track stays attached.
    pub fn set_muted(&self, muted: bool) {
        if let Some(track) = self.track(TrackKind::Audio) {
            track.set_enabled(!muted);
            if muted {
                if let Some(meter) = &self.meter {
                    meter.silence();
                }
            }
            debug!(muted, "Audio mute state changed");
        }
    }

    pub fn is_muted(&self) -> bool {
        self.track(TrackKind::Audio)
            .map(|t| !t.is_enabled())
            .unwrap_or(true)
    }

    /// Returns the new muted state.
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.is_muted();
        self.set_muted(muted);
        muted
    }

    /// No-op on audio-only streams.
    pub fn set_camera_enabled(&self, enabled: bool) {
        if let Some(track) = self.track(TrackKind::Video) {
            track.set_enabled(enabled);
            debug!(enabled, "Camera state changed");
        }
    }

    pub fn is_camera_enabled(&self) -> bool {
        self.track(TrackKind::Video)
            .map(LocalTrack::is_enabled)
            .unwrap_or(false)
    }

    /// Returns whether the camera is now enabled.
    pub fn toggle_camera(&self) -> bool {
        let enabled = !self.is_camera_enabled();
        self.set_camera_enabled(enabled);
        self.is_camera_enabled()
    }

    /// Speaking indicator, when the backend measures levels.
    pub fn speaking(&self) -> Option<watch::Receiver<bool>> {
        self.meter.as_ref().map(LevelMeter::subscribe)
    }

    /// Release every device. Safe to call any number of times.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for track in &self.tracks {
            track.set_enabled(false);
        }
        let leases = match self.leases.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for lease in &leases {
            lease.release();
        }
        if let Some(meter) = &self.meter {
            meter.silence();
        }
        info!(stream = %self.id, devices = leases.len(), "Local media stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Source of local streams.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Microphone for audio calls, microphone and camera for video calls.
    async fn open(&self, call_type: CallType) -> Result<LocalStream, MediaError>;
}

fn new_stream_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// The machine's real devices.
#[derive(Debug, Clone, Default)]
pub struct HostDevices {
    camera_available: bool,
    audio: AudioConfig,
    video: VideoConfig,
}

impl HostDevices {
    pub fn new(camera_available: bool) -> Self {
        Self {
            camera_available,
            ..Self::default()
        }
    }

    pub fn with_audio_config(mut self, audio: AudioConfig) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_video_config(mut self, video: VideoConfig) -> Self {
        self.video = video;
        self
    }
}

#[async_trait]
impl MediaDevices for HostDevices {
    async fn open(&self, call_type: CallType) -> Result<LocalStream, MediaError> {
        if call_type.wants_video() && !self.camera_available {
            return Err(MediaError::DeviceUnavailable(TrackKind::Video));
        }

        let stream_id = new_stream_id();
        let meter = LevelMeter::new();
        let audio = LocalTrack::new(TrackKind::Audio, &stream_id);
        let microphone = {
            let config = self.audio.clone();
            let track = audio.clone();
            let meter = meter.clone();
            tokio::task::spawn_blocking(move || MicrophoneCapture::start(&config, &track, meter))
                .await
                .map_err(|e| MediaError::Device(e.to_string()))??
        };

        let mut tracks = vec![audio];
        let mut leases: Vec<Box<dyn DeviceLease>> = vec![Box::new(microphone)];
        if call_type.wants_video() {
            tracks.push(LocalTrack::new(TrackKind::Video, &stream_id));
            leases.push(Box::new(CameraCapture::start(self.video.clone())));
        }

        info!(stream = %stream_id, %call_type, "Local media opened");
        Ok(LocalStream::new(stream_id, call_type, tracks, leases, Some(meter)))
    }
}

/// How a synthetic device answers an acquisition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceBehavior {
    Grant,
    Deny,
    Unavailable,
}

/// Scriptable devices for tests and headless runs.
///
/// Counts leases still held so callers can check that every exit path
/// released what it acquired.
pub struct SyntheticDevices {
    microphone: DeviceBehavior,
    camera: DeviceBehavior,
    live: Arc<AtomicUsize>,
    opened: AtomicUsize,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self {
            microphone: DeviceBehavior::Grant,
            camera: DeviceBehavior::Grant,
            live: Arc::new(AtomicUsize::new(0)),
            opened: AtomicUsize::new(0),
        }
    }

    pub fn with_microphone(mut self, behavior: DeviceBehavior) -> Self {
        self.microphone = behavior;
        self
    }

    pub fn with_camera(mut self, behavior: DeviceBehavior) -> Self {
        self.camera = behavior;
        self
    }

    /// Devices acquired and not yet released.
    pub fn live_leases(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Successful `open` calls so far.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn check(behavior: DeviceBehavior, kind: TrackKind) -> Result<(), MediaError> {
        match behavior {
            DeviceBehavior::Grant => Ok(()),
            DeviceBehavior::Deny => Err(MediaError::PermissionDenied(kind)),
            DeviceBehavior::Unavailable => Err(MediaError::DeviceUnavailable(kind)),
        }
    }

    fn lease(&self, kind: TrackKind) -> Box<dyn DeviceLease> {
        self.live.fetch_add(1, Ordering::SeqCst);
        Box::new(SyntheticLease {
            kind,
            live: self.live.clone(),
            held: AtomicBool::new(true),
        })
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open(&self, call_type: CallType) -> Result<LocalStream, MediaError> {
        Self::check(self.microphone, TrackKind::Audio)?;
        if call_type.wants_video() {
            Self::check(self.camera, TrackKind::Video)?;
        }

        let stream_id = new_stream_id();
        let mut tracks = vec![LocalTrack::new(TrackKind::Audio, &stream_id)];
        let mut leases = vec![self.lease(TrackKind::Audio)];
        if call_type.wants_video() {
            tracks.push(LocalTrack::new(TrackKind::Video, &stream_id));
            leases.push(self.lease(TrackKind::Video));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(LocalStream::new(stream_id, call_type, tracks, leases, None))
    }
}

struct SyntheticLease {
    kind: TrackKind,
    live: Arc<AtomicUsize>,
    held: AtomicBool,
}

impl DeviceLease for SyntheticLease {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn release(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SyntheticLease {
    fn drop(&mut self) {
        self.release();
    }
}
