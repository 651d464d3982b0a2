use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use dari_shared::TrackKind;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::capture::{DeviceLease, LocalTrack, MediaError};
use crate::level::LevelMeter;

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            frame_size_ms: 20,
        }
    }
}

impl AudioConfig {
    pub fn frame_size_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_size_ms as usize) / 1000
    }
}

/// One captured frame of interleaved PCM in `[-1.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// A device handle that lives on its own thread.
///
/// Platform audio streams are not `Send`, so the thread that opens one keeps
/// it and drops it when [`DeviceThread::release`] is called or the owner goes
/// away. Dropping the stream is what closes the device.
pub(crate) struct DeviceThread {
    stop: Mutex<Option<mpsc::Sender<()>>>,
    thread: JoinHandle<()>,
}

impl DeviceThread {
    /// Run `open` on a new thread and wait until it has either produced the
    /// device or failed.
    pub(crate) fn spawn<T, F>(name: &str, open: F) -> Result<Self, MediaError>
    where
        F: FnOnce() -> Result<T, MediaError> + Send + 'static,
        T: 'static,
    {
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread_name = name.to_string();

        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let device = match open() {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns once the sender is dropped.
                let _ = stop_rx.recv();
                drop(device);
                debug!(thread = %thread_name, "Device closed");
            })
            .map_err(|e| MediaError::Device(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop: Mutex::new(Some(stop_tx)),
                thread,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MediaError::Device(format!("{name} exited while opening"))),
        }
    }

    /// Ask the owner thread to close the device. Returns whether this call
    /// did it.
    pub(crate) fn release(&self) -> bool {
        self.stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        self.release();
    }
}

/// A running microphone capture on the default input device.
///
/// Frames are cut to [`AudioConfig::frame_size_ms`], fed to the level meter
/// and published on the audio track. While the track is disabled the frames
/// are silence.
pub struct MicrophoneCapture {
    device: DeviceThread,
    active: Arc<AtomicBool>,
    meter: LevelMeter,
}

impl MicrophoneCapture {
    /// Blocks until the input stream is playing.
    pub fn start(
        config: &AudioConfig,
        track: &LocalTrack,
        meter: LevelMeter,
    ) -> Result<Self, MediaError> {
        let active = Arc::new(AtomicBool::new(true));
        let config = config.clone();
        let enabled = track.enabled_flag();
        let frames = track.frame_sink();
        let callback_active = active.clone();
        let callback_meter = meter.clone();

        let device = DeviceThread::spawn("dari-microphone", move || {
            open_input(&config, enabled, callback_active, callback_meter, frames)
        })?;

        debug!("Microphone capture started");
        Ok(Self {
            device,
            active,
            meter,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

fn open_input(
    config: &AudioConfig,
    enabled: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    meter: LevelMeter,
    frames: broadcast::Sender<AudioFrame>,
) -> Result<cpal::Stream, MediaError> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MediaError::DeviceUnavailable(TrackKind::Audio))?;

    info!(device = ?device.name(), "Using input device");

    let stream_config = cpal::StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let frame_size = config.frame_size_samples() * config.channels as usize;
    let sample_rate = config.sample_rate;
    let channels = config.channels;
    let mut buffer: Vec<f32> = Vec::with_capacity(frame_size);

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                if !active.load(Ordering::Relaxed) {
                    return;
                }
                if enabled.load(Ordering::Relaxed) {
                    buffer.extend_from_slice(data);
                } else {
                    buffer.resize(buffer.len() + data.len(), 0.0);
                }
                while buffer.len() >= frame_size {
                    let frame: Arc<[f32]> = buffer.drain(..frame_size).collect();
                    meter.feed(&frame);
                    // No receivers until the track is attached to a connection.
                    let _ = frames.send(AudioFrame {
                        samples: frame,
                        sample_rate,
                        channels,
                    });
                }
            },
            move |err| {
                error!("Audio input error: {err}");
            },
            None,
        )
        .map_err(map_build_error)?;

    stream
        .play()
        .map_err(|e| MediaError::Device(e.to_string()))?;
    Ok(stream)
}

impl DeviceLease for MicrophoneCapture {
    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn release(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.device.release();
            self.meter.silence();
            debug!("Microphone released");
        }
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.release();
    }
}

fn map_build_error(err: cpal::BuildStreamError) -> MediaError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            MediaError::DeviceUnavailable(TrackKind::Audio)
        }
        other => MediaError::Device(other.to_string()),
    }
}
