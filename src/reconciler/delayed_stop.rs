//! Bounded "did playback really stop" check.
//!
//! Upstream "done" signals routinely arrive while buffered audio is still
//! playing. [`wait_for_playback_stop`] watches the media element itself and
//! resolves once it has stopped advancing, or when the hard cap expires.

use crate::config::ReconcilerConfig;
use crate::media::SharedMedia;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Timing for one delayed-stop check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    /// Window used to decide whether playback is advancing at all.
    pub probe_window: Duration,
    pub poll_interval: Duration,
    /// Hard cap on the whole check.
    pub max_wait: Duration,
}

impl StopPolicy {
    #[must_use]
    pub fn from_config(config: &ReconcilerConfig) -> Self {
        Self {
            probe_window: Duration::from_millis(config.stop_probe_window_ms),
            poll_interval: Duration::from_millis(config.stop_poll_interval_ms.max(1)),
            max_wait: Duration::from_millis(config.stop_max_wait_ms),
        }
    }
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self::from_config(&ReconcilerConfig::default())
    }
}

/// How a delayed-stop check ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Playback was not advancing when the check started.
    Immediate,
    /// Playback was advancing and has since stopped.
    Confirmed,
    /// Playback kept advancing until the hard cap.
    TimedOut,
    Cancelled,
}

impl StopOutcome {
    /// Whether the caller should go idle.
    #[must_use]
    pub fn should_stop(self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

fn is_stalled(media: &SharedMedia) -> bool {
    media.paused() || !media.ready_state().has_data()
}

/// Wait until `media` stops advancing.
///
/// Resolves [`StopOutcome::Immediate`] when there is no element, the element
/// is paused or holds no current data, or `current_time` does not advance over
/// the probe window. Otherwise polls every `poll_interval` until the position
/// stops moving, never waiting longer than `max_wait` in total.
pub async fn wait_for_playback_stop(
    media: Option<SharedMedia>,
    policy: StopPolicy,
    cancel: CancellationToken,
) -> StopOutcome {
    let Some(media) = media else {
        return StopOutcome::Immediate;
    };
    if is_stalled(&media) {
        return StopOutcome::Immediate;
    }

    let started = Instant::now();
    let deadline = started + policy.max_wait;
    let probe_end = (started + policy.probe_window).min(deadline);
    let mut last_position = media.current_time();

    tokio::select! {
        _ = cancel.cancelled() => return StopOutcome::Cancelled,
        _ = tokio::time::sleep_until(probe_end) => {}
    }
    let position = media.current_time();
    if is_stalled(&media) || position <= last_position {
        return StopOutcome::Immediate;
    }
    last_position = position;

    loop {
        if Instant::now() >= deadline {
            return StopOutcome::TimedOut;
        }
        let wake = (Instant::now() + policy.poll_interval).min(deadline);
        tokio::select! {
            _ = cancel.cancelled() => return StopOutcome::Cancelled,
            _ = tokio::time::sleep_until(wake) => {}
        }
        let position = media.current_time();
        if is_stalled(&media) || position <= last_position {
            return StopOutcome::Confirmed;
        }
        last_position = position;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMedia;
    use std::sync::Arc;

    fn policy() -> StopPolicy {
        StopPolicy::default()
    }

    #[tokio::test(start_paused = true)]
    async fn no_media_stops_immediately() {
        let outcome = wait_for_playback_stop(None, policy(), CancellationToken::new()).await;
        assert_eq!(outcome, StopOutcome::Immediate);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_media_stops_immediately() {
        let media = FakeMedia::idle("el");
        let started = Instant::now();
        let outcome =
            wait_for_playback_stop(Some(media), policy(), CancellationToken::new()).await;
        assert_eq!(outcome, StopOutcome::Immediate);
        assert_eq!(Instant::now(), started);
    }

    #[tokio::test(start_paused = true)]
    async fn frozen_position_stops_after_probe() {
        let media = FakeMedia::frozen("el", 3.0);
        let started = Instant::now();
        let outcome =
            wait_for_playback_stop(Some(media), policy(), CancellationToken::new()).await;
        assert_eq!(outcome, StopOutcome::Immediate);
        assert_eq!(Instant::now() - started, policy().probe_window);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_buffered_audio_to_finish() {
        let media = FakeMedia::playing_for("el", Duration::from_millis(1200));
        let started = Instant::now();
        let outcome =
            wait_for_playback_stop(Some(media), policy(), CancellationToken::new()).await;
        assert_eq!(outcome, StopOutcome::Confirmed);
        let waited = Instant::now() - started;
        assert!(waited >= Duration::from_millis(1200), "{waited:?}");
        assert!(waited <= Duration::from_millis(1400), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn endless_playback_hits_hard_cap() {
        let media = FakeMedia::playing_for("el", Duration::from_secs(3600));
        let policy = StopPolicy {
            max_wait: Duration::from_secs(2),
            ..policy()
        };
        let started = Instant::now();
        let outcome =
            wait_for_playback_stop(Some(media), policy, CancellationToken::new()).await;
        assert_eq!(outcome, StopOutcome::TimedOut);
        assert_eq!(Instant::now() - started, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins() {
        let media: SharedMedia = FakeMedia::playing_for("el", Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(wait_for_playback_stop(
            Some(Arc::clone(&media)),
            policy(),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), StopOutcome::Cancelled);
    }
}
