//! Shared mouth-openness target consumed by the avatar renderer.
//!
//! Only the current value and the time it was last updated are kept. The
//! analyzer publishes through a throttle; the reconciler may force the value to
//! zero at any time.

use crate::config::AnalyzerConfig;
use crate::state::VoiceState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// One published mouth target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MouthFrame {
    /// Openness in `[0, 1]`.
    pub value: f32,
    /// When this value was published.
    pub updated_at: Instant,
}

impl MouthFrame {
    fn closed(now: Instant) -> Self {
        Self {
            value: 0.0,
            updated_at: now,
        }
    }
}

/// Value a renderer should animate toward: zero unless the voice is speaking.
#[must_use]
pub fn effective_mouth_value(state: VoiceState, frame: &MouthFrame) -> f32 {
    if state == VoiceState::Speaking {
        frame.value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn sanitize(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Cloneable handle to the shared mouth target.
#[derive(Debug, Clone)]
pub struct MouthTarget {
    tx: Arc<watch::Sender<MouthFrame>>,
}

impl MouthTarget {
    /// Create a closed mouth target.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(MouthFrame::closed(Instant::now()));
        Self { tx: Arc::new(tx) }
    }

    /// Current frame.
    #[must_use]
    pub fn snapshot(&self) -> MouthFrame {
        *self.tx.borrow()
    }

    /// Receiver that wakes on every publish.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<MouthFrame> {
        self.tx.subscribe()
    }

    /// Force the target closed. Safe to call repeatedly.
    pub fn zero(&self, now: Instant) {
        self.tx.send_if_modified(|frame| {
            if frame.value == 0.0 {
                return false;
            }
            *frame = MouthFrame::closed(now);
            true
        });
    }

    fn publish(&self, value: f32, now: Instant) {
        self.tx.send_replace(MouthFrame {
            value: sanitize(value),
            updated_at: now,
        });
    }
}

impl Default for MouthTarget {
    fn default() -> Self {
        Self::new()
    }
}

/// Rate-limited writer for a [`MouthTarget`].
#[derive(Debug)]
pub struct MouthPublisher {
    target: MouthTarget,
    min_interval: Duration,
    publish_delta: f32,
    last_publish_at: Option<Instant>,
}

impl MouthPublisher {
    #[must_use]
    pub fn new(target: MouthTarget, config: &AnalyzerConfig) -> Self {
        Self {
            target,
            min_interval: config.min_publish_interval(),
            publish_delta: config.publish_delta,
            last_publish_at: None,
        }
    }

    #[must_use]
    pub fn target(&self) -> &MouthTarget {
        &self.target
    }

    /// Offer a new value. Published when the rate ceiling allows it or when the
    /// change since the last publish exceeds the delta threshold.
    ///
    /// A steady non-zero value is re-published at the ceiling rate so its
    /// timestamp stays fresh for staleness checks.
    ///
    /// Returns `true` if the value was published.
    pub fn offer(&mut self, value: f32, now: Instant) -> bool {
        let value = sanitize(value);
        let current = self.target.snapshot().value;
        let change = (value - current).abs();
        if value == 0.0 && change <= f32::EPSILON {
            return false;
        }

        let rate_ok = match self.last_publish_at {
            Some(at) => now.saturating_duration_since(at) >= self.min_interval,
            None => true,
        };
        if rate_ok || change > self.publish_delta {
            self.target.publish(value, now);
            self.last_publish_at = Some(now);
            return true;
        }
        false
    }

    /// Publish zero immediately, bypassing the throttle.
    pub fn force_zero(&mut self, now: Instant) {
        self.target.zero(now);
        self.last_publish_at = Some(now);
    }
}
