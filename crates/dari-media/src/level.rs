//! Speaking indicator.
//!
//! Captured audio frames are reduced to their mean absolute amplitude; the
//! local user counts as speaking while that exceeds
//! [`SPEAKING_THRESHOLD`] of full scale.

use std::sync::Arc;

use dari_shared::constants::SPEAKING_THRESHOLD;
use tokio::sync::watch;

/// Mean absolute amplitude of `samples`, which are expected in `[-1.0, 1.0]`.
pub fn mean_deviation(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s.abs()).sum();
    sum / samples.len() as f32
}

pub fn is_speaking(samples: &[f32]) -> bool {
    mean_deviation(samples) > SPEAKING_THRESHOLD
}

/// Publishes whether the most recent frame contained speech.
///
/// Cloning shares the underlying channel, so the capture callback and the
/// stream that owns it observe the same state.
#[derive(Clone)]
pub struct LevelMeter {
    tx: Arc<watch::Sender<bool>>,
}

impl LevelMeter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Update from one captured frame. Receivers are only woken on change.
    pub fn feed(&self, frame: &[f32]) {
        self.set(is_speaking(frame));
    }

    /// Force the indicator off, e.g. while muted or after capture stops.
    pub fn silence(&self) {
        self.set(false);
    }

    pub fn is_speaking(&self) -> bool {
        *self.tx.borrow()
    }

    fn set(&self, speaking: bool) {
        self.tx.send_if_modified(|current| {
            if *current == speaking {
                return false;
            }
            *current = speaking;
            true
        });
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_deviation() {
        assert_eq!(mean_deviation(&[]), 0.0);
        assert!((mean_deviation(&[0.5, -0.5, 0.0, 0.0]) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_matches_byte_scale() {
        // 4/128 of full scale is below the threshold, 6/128 above it.
        assert!(!is_speaking(&[4.0 / 128.0; 480]));
        assert!(is_speaking(&[-6.0 / 128.0; 480]));
    }

    #[tokio::test]
    async fn test_meter_notifies_on_change_only() {
        let meter = LevelMeter::new();
        let mut rx = meter.subscribe();

        meter.feed(&[0.5; 64]);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        meter.feed(&[0.4; 64]);
        assert!(!rx.has_changed().unwrap());

        meter.silence();
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert!(!meter.is_speaking());
    }
}
