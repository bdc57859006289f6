//! Audio intensity analysis for mouth animation.
//!
//! Turns a live audio source into a single 0..1 openness value using an
//! RMS energy gate with a tracked noise floor and hysteresis. No external VAD
//! is involved.
//!
//! # Pipeline (per tick)
//!
//! 1. RMS of the latest time-domain frame
//! 2. noise floor EMA, updated only while the gate is closed
//! 3. hysteresis gate: open above `floor + open_margin`, close below
//!    `floor + close_margin`
//! 4. excess energy normalized against the remaining headroom
//! 5. attack/release smoothing
//! 6. concave shaping curve
//! 7. throttled publish, with an immediate zero when the gate closes

mod gate;

pub use gate::{GateReading, GateTransition, NoiseGate, compute_rms_energy};

use crate::config::AnalyzerConfig;
use crate::error::{Result, VoxError};
use crate::media::{AudioGraph, AudioTap, MediaId};
use crate::mouth::{MouthPublisher, MouthTarget};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of analysing one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyzerOutput {
    /// Smoothed, shaped openness in `[0, 1]`.
    pub openness: f32,
    /// Gate state after this frame.
    pub speaking: bool,
    /// The gate closed on this frame; publish zero now.
    pub closed_now: bool,
    pub rms: f32,
    pub noise_floor: f32,
}

/// Frame-by-frame openness estimator. Holds no audio history.
#[derive(Debug, Clone)]
pub struct IntensityEstimator {
    gate: NoiseGate,
    smoothed: f32,
    attack: f32,
    release: f32,
    shape_exponent: f32,
}

impl IntensityEstimator {
    #[must_use]
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            gate: NoiseGate::new(config),
            smoothed: 0.0,
            attack: config.attack.clamp(0.0, 1.0),
            release: config.release.clamp(0.0, 1.0),
            shape_exponent: config.shape_exponent.max(f32::EPSILON),
        }
    }

    /// Analyse one time-domain frame.
    pub fn process(&mut self, samples: &[f32]) -> AnalyzerOutput {
        let rms = compute_rms_energy(samples);
        let reading = self.gate.update(rms);

        if reading.transition == Some(GateTransition::Closed) {
            self.smoothed = 0.0;
            return AnalyzerOutput {
                openness: 0.0,
                speaking: false,
                closed_now: true,
                rms,
                noise_floor: reading.noise_floor,
            };
        }

        let target = if reading.speaking {
            reading.normalized
        } else {
            0.0
        };
        let coefficient = if target > self.smoothed {
            self.attack
        } else {
            self.release
        };
        self.smoothed += coefficient * (target - self.smoothed);
        self.smoothed = self.smoothed.clamp(0.0, 1.0);
        if self.smoothed < 1e-4 {
            self.smoothed = 0.0;
        }

        AnalyzerOutput {
            openness: self.smoothed.powf(self.shape_exponent).clamp(0.0, 1.0),
            speaking: reading.speaking,
            closed_now: false,
            rms,
            noise_floor: reading.noise_floor,
        }
    }

    pub fn reset(&mut self) {
        self.gate.reset();
        self.smoothed = 0.0;
    }

    #[must_use]
    pub fn gate(&self) -> &NoiseGate {
        &self.gate
    }
}

/// At most one source node per media element for the element's lifetime.
pub struct SourceNodeCache {
    graph: Arc<dyn AudioGraph>,
    nodes: Mutex<HashMap<MediaId, Arc<dyn AudioTap>>>,
}

impl SourceNodeCache {
    #[must_use]
    pub fn new(graph: Arc<dyn AudioGraph>) -> Arc<Self> {
        Arc::new(Self {
            graph,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    /// Return the cached node for `media`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`VoxError::Analyzer`] if the graph cannot build the node.
    pub fn source_for(&self, media: &MediaId) -> Result<Arc<dyn AudioTap>> {
        let mut nodes = self
            .nodes
            .lock()
            .map_err(|_| VoxError::Analyzer("source node cache poisoned".to_owned()))?;
        if let Some(node) = nodes.get(media) {
            debug!(media = %media, "reusing cached source node");
            return Ok(Arc::clone(node));
        }
        let node = self.graph.create_source(media)?;
        info!(media = %media, "created source node");
        nodes.insert(media.clone(), Arc::clone(&node));
        Ok(node)
    }

    /// Forget the node of an element that no longer exists.
    pub fn release(&self, media: &MediaId) {
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.remove(media);
        }
    }
}

/// Handle to a running analysis loop, scoped to one call session.
#[derive(Debug, Clone)]
pub struct AnalyzerHandle {
    cancel: CancellationToken,
    mouth: MouthTarget,
}

impl AnalyzerHandle {
    /// Cancel the loop and zero the mouth target. Safe to call repeatedly.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            debug!("stopping audio intensity analyzer");
        }
        self.cancel.cancel();
        self.mouth.zero(Instant::now());
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

/// Start analysing `media` and publishing into `mouth`.
///
/// On failure the mouth target is forced to zero and the error is returned
/// for logging; the reconciler keeps running without analyzer input.
///
/// # Errors
///
/// Returns [`VoxError::Analyzer`] if the source node cannot be created.
pub fn start_analyzer(
    cache: &SourceNodeCache,
    media: &MediaId,
    config: &AnalyzerConfig,
    mouth: MouthTarget,
) -> Result<AnalyzerHandle> {
    let tap = match cache.source_for(media) {
        Ok(tap) => tap,
        Err(e) => {
            warn!(media = %media, error = %e, "audio analyzer unavailable");
            mouth.zero(Instant::now());
            return Err(e);
        }
    };

    let cancel = CancellationToken::new();
    let handle = AnalyzerHandle {
        cancel: cancel.clone(),
        mouth: mouth.clone(),
    };
    let publisher = MouthPublisher::new(mouth, config);
    let estimator = IntensityEstimator::new(config);
    tokio::spawn(run_loop(
        tap,
        estimator,
        publisher,
        config.clone(),
        cancel,
    ));
    Ok(handle)
}

async fn run_loop(
    tap: Arc<dyn AudioTap>,
    mut estimator: IntensityEstimator,
    mut publisher: MouthPublisher,
    config: AnalyzerConfig,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buf = vec![0.0_f32; config.frame_size.max(1)];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let n = tap.read_time_domain(&mut buf).min(buf.len());
                let out = estimator.process(&buf[..n]);
                let now = Instant::now();
                if out.closed_now {
                    publisher.force_zero(now);
                } else {
                    publisher.offer(out.openness, now);
                }
            }
        }
    }

    publisher.force_zero(Instant::now());
    debug!("audio intensity analyzer loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    fn config() -> AnalyzerConfig {
        AnalyzerConfig::default()
    }

    fn frame(amplitude: f32) -> Vec<f32> {
        // Square wave: RMS equals the amplitude.
        (0..256)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    #[test]
    fn monotonic_input_never_exceeds_one() {
        let mut est = IntensityEstimator::new(&config());
        let mut amplitude = 0.0_f32;
        for _ in 0..400 {
            amplitude = (amplitude + 0.01).min(5.0);
            let out = est.process(&frame(amplitude));
            assert!((0.0..=1.0).contains(&out.openness), "{}", out.openness);
        }
    }

    #[test]
    fn silence_converges_to_zero() {
        let mut est = IntensityEstimator::new(&config());
        for _ in 0..30 {
            est.process(&frame(0.4));
        }
        let mut last = 1.0;
        for _ in 0..200 {
            last = est.process(&frame(0.0)).openness;
        }
        assert_eq!(last, 0.0);
    }

    #[test]
    fn gate_close_reports_closed_now_once() {
        let mut est = IntensityEstimator::new(&config());
        for _ in 0..10 {
            assert!(!est.process(&frame(0.3)).closed_now);
        }
        assert!(est.process(&frame(0.0)).closed_now);
        assert!(!est.process(&frame(0.0)).closed_now);
    }

    #[test]
    fn shaping_widens_mid_range() {
        let mut cfg = config();
        cfg.attack = 1.0;
        let mut shaped = IntensityEstimator::new(&cfg);
        cfg.shape_exponent = 1.0;
        let mut linear = IntensityEstimator::new(&cfg);
        let a = shaped.process(&frame(0.2)).openness;
        let b = linear.process(&frame(0.2)).openness;
        assert!(a > b, "shaped {a} should exceed linear {b}");
    }

    struct CountingGraph {
        created: AtomicUsize,
        fail: bool,
    }

    impl AudioGraph for CountingGraph {
        fn create_source(&self, _media: &MediaId) -> Result<Arc<dyn AudioTap>> {
            if self.fail {
                return Err(VoxError::Analyzer("graph unavailable".to_owned()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ConstantTap::new(0.3)))
        }
    }

    struct ConstantTap {
        milli_amplitude: AtomicU32,
    }

    impl ConstantTap {
        fn new(amplitude: f32) -> Self {
            Self {
                milli_amplitude: AtomicU32::new((amplitude * 1000.0) as u32),
            }
        }
    }

    impl AudioTap for ConstantTap {
        fn read_time_domain(&self, buf: &mut [f32]) -> usize {
            let a = self.milli_amplitude.load(Ordering::SeqCst) as f32 / 1000.0;
            for (i, s) in buf.iter_mut().enumerate() {
                *s = if i % 2 == 0 { a } else { -a };
            }
            buf.len()
        }
    }

    #[test]
    fn source_node_created_once_per_element() {
        let graph = Arc::new(CountingGraph {
            created: AtomicUsize::new(0),
            fail: false,
        });
        let cache = SourceNodeCache::new(graph.clone());
        let id = MediaId::from("assistant-audio");
        cache.source_for(&id).unwrap();
        cache.source_for(&id).unwrap();
        cache.source_for(&MediaId::from("other")).unwrap();
        assert_eq!(graph.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn running_analyzer_publishes_then_stop_zeroes() {
        let graph = Arc::new(CountingGraph {
            created: AtomicUsize::new(0),
            fail: false,
        });
        let cache = SourceNodeCache::new(graph);
        let mouth = MouthTarget::new();
        let handle =
            start_analyzer(&cache, &MediaId::from("el"), &config(), mouth.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(mouth.snapshot().value > 0.0);

        handle.stop();
        handle.stop();
        assert!(!handle.is_running());
        assert_eq!(mouth.snapshot().value, 0.0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mouth.snapshot().value, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn graph_failure_zeroes_mouth_and_errors() {
        let graph = Arc::new(CountingGraph {
            created: AtomicUsize::new(0),
            fail: true,
        });
        let cache = SourceNodeCache::new(graph);
        let mouth = MouthTarget::new();
        let result = start_analyzer(&cache, &MediaId::from("el"), &config(), mouth.clone());
        assert!(matches!(result, Err(VoxError::Analyzer(_))));
        assert_eq!(mouth.snapshot().value, 0.0);
    }
}
