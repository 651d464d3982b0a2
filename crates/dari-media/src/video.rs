use std::sync::atomic::{AtomicBool, Ordering};

use dari_shared::TrackKind;
use tracing::{debug, info};

use crate::capture::DeviceLease;

/// Video configuration
#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

/// Holds the camera for the duration of a video call.
///
/// Frame capture is platform specific and lives outside this crate; the
/// lease only tracks that the camera is in use so it is released on every
/// exit path.
pub struct CameraCapture {
    config: VideoConfig,
    active: AtomicBool,
}

impl CameraCapture {
    pub fn start(config: VideoConfig) -> Self {
        info!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            "Camera acquired"
        );
        Self {
            config,
            active: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &VideoConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl DeviceLease for CameraCapture {
    fn kind(&self) -> TrackKind {
        TrackKind::Video
    }

    fn release(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            debug!("Camera released");
        }
    }
}

impl Drop for CameraCapture {
    fn drop(&mut self) {
        self.release();
    }
}
