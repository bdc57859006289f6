//! Configuration types for the reconciler, analyzer, transport and coordinator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoxConfig {
    /// Audio intensity analyzer settings.
    pub analyzer: AnalyzerConfig,
    /// Voice state reconciler settings.
    pub reconciler: ReconcilerConfig,
    /// Peer transport settings.
    pub transport: TransportConfig,
    /// Session coordinator settings.
    pub coordinator: CoordinatorConfig,
    /// Remote speech service settings.
    pub speech: SpeechServiceConfig,
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Agent profiles selectable via `switch_agent`, keyed by agent id.
    pub agents: BTreeMap<String, AgentProfile>,
}

/// Audio intensity analyzer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Interval between analysis ticks in ms.
    pub tick_interval_ms: u64,
    /// Number of time-domain samples read per tick.
    pub frame_size: usize,
    /// Margin above the noise floor that opens the gate.
    pub open_margin: f32,
    /// Margin above the noise floor below which the gate closes.
    ///
    /// Must be smaller than `open_margin`.
    pub close_margin: f32,
    /// EMA coefficient for the noise floor (0..1, small = slow).
    pub noise_floor_alpha: f32,
    /// Initial noise floor estimate.
    pub initial_noise_floor: f32,
    /// Smoothing coefficient while opening (0..1, large = snappy).
    pub attack: f32,
    /// Smoothing coefficient while closing (0..1, small = slow).
    pub release: f32,
    /// Exponent of the perceptual shaping curve. `1.0` disables shaping.
    pub shape_exponent: f32,
    /// Ceiling publish rate in Hz.
    pub max_publish_hz: f32,
    /// Value change that bypasses the publish throttle.
    pub publish_delta: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 16,
            frame_size: 1024,
            open_margin: 0.02,
            close_margin: 0.008,
            noise_floor_alpha: 0.05,
            initial_noise_floor: 0.005,
            attack: 0.6,
            release: 0.15,
            shape_exponent: 0.6,
            max_publish_hz: 30.0,
            publish_delta: 0.08,
        }
    }
}

impl AnalyzerConfig {
    /// Tick interval as a [`Duration`].
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Minimum spacing between throttled publishes.
    pub fn min_publish_interval(&self) -> Duration {
        let hz = if self.max_publish_hz > 0.0 {
            self.max_publish_hz
        } else {
            30.0
        };
        Duration::from_secs_f32(1.0 / hz)
    }
}

/// Voice state reconciler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Window used to decide whether `current_time` is still advancing.
    pub stop_probe_window_ms: u64,
    /// Poll interval of the delayed-stop check.
    pub stop_poll_interval_ms: u64,
    /// Hard cap on the delayed-stop check.
    pub stop_max_wait_ms: u64,
    /// Analyzer silence tolerated while media still plays before forcing idle.
    pub watchdog_silence_ms: u64,
    /// A mouth frame older than this is not considered live analyzer energy.
    pub activity_freshness_ms: u64,
    /// Mouth values above this count as analyzer activity.
    pub activity_threshold: f32,
    /// Interval of the periodic reconciler tick.
    pub tick_interval_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            stop_probe_window_ms: 150,
            stop_poll_interval_ms: 100,
            stop_max_wait_ms: 30_000,
            watchdog_silence_ms: 1_500,
            activity_freshness_ms: 250,
            activity_threshold: 0.02,
            tick_interval_ms: 250,
        }
    }
}

impl ReconcilerConfig {
    pub fn watchdog_silence(&self) -> Duration {
        Duration::from_millis(self.watchdog_silence_ms)
    }

    pub fn activity_freshness(&self) -> Duration {
        Duration::from_millis(self.activity_freshness_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// Peer transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Base URL of the session coordinator.
    pub coordinator_url: String,
    /// Delay after a reset request to let the server tear down.
    pub reset_settle_ms: u64,
    /// Interval of the connection health check.
    pub health_check_interval_secs: u64,
    /// Timeout applied to coordinator HTTP requests.
    pub request_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            coordinator_url: "http://127.0.0.1:8787".to_owned(),
            reset_settle_ms: 1_500,
            health_check_interval_secs: 30,
            request_timeout_secs: 20,
        }
    }
}

impl TransportConfig {
    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }
}

/// Session coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Interval of the scheduled self-restart in seconds.
    pub restart_interval_secs: u64,
    /// Grace period with zero subscribers before an idle reset, in seconds.
    pub idle_grace_secs: u64,
    /// Delays (ms after readiness) of the pending-context replay retries.
    pub context_retry_delays_ms: Vec<u64>,
    /// Where pending context is persisted. `None` keeps it in memory only.
    pub context_store_path: Option<PathBuf>,
    /// Capacity of each subscriber's outbound queue.
    pub subscriber_capacity: usize,
    /// Capacity of the coordinator request queue.
    pub request_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            restart_interval_secs: 30 * 60,
            idle_grace_secs: 10,
            context_retry_delays_ms: vec![1_000, 3_000],
            context_store_path: None,
            subscriber_capacity: 256,
            request_capacity: 64,
        }
    }
}

impl CoordinatorConfig {
    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(self.restart_interval_secs.max(1))
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }
}

/// Remote speech service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechServiceConfig {
    /// HTTP base URL for credential issuance.
    pub base_url: String,
    /// Websocket base URL for the server-side realtime link.
    pub realtime_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Realtime model id.
    pub model: String,
    /// Output voice.
    pub voice: String,
    /// Input audio format.
    pub input_audio_format: String,
    /// Output audio format.
    pub output_audio_format: String,
    /// Transcription model for user audio. `None` disables transcription.
    pub transcription_model: Option<String>,
    /// System instructions.
    pub instructions: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Server VAD threshold.
    pub vad_threshold: f32,
    /// Audio kept before detected speech, in ms.
    pub vad_prefix_padding_ms: u32,
    /// Silence that ends a user turn, in ms.
    pub vad_silence_duration_ms: u32,
}

impl Default for SpeechServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_owned(),
            realtime_url: "wss://api.openai.com/v1/realtime".to_owned(),
            api_key_env: "OPENAI_API_KEY".to_owned(),
            model: "gpt-4o-realtime-preview".to_owned(),
            voice: "alloy".to_owned(),
            input_audio_format: "pcm16".to_owned(),
            output_audio_format: "pcm16".to_owned(),
            transcription_model: Some("whisper-1".to_owned()),
            instructions: "You are a friendly voice assistant. Keep answers short.".to_owned(),
            temperature: 0.8,
            vad_threshold: 0.5,
            vad_prefix_padding_ms: 300,
            vad_silence_duration_ms: 500,
        }
    }
}

impl SpeechServiceConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> crate::error::Result<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .map(|k| k.trim().to_owned())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                crate::error::VoxError::Config(format!(
                    "environment variable {} is not set",
                    self.api_key_env
                ))
            })
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port. `0` picks a free port.
    pub port: u16,
    /// SSE keep-alive interval in seconds.
    pub keep_alive_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8787,
            keep_alive_secs: 15,
        }
    }
}

/// Agent profile applied by `switch_agent`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentProfile {
    /// Replacement instructions.
    pub instructions: String,
    /// Replacement voice. `None` keeps the current voice.
    pub voice: Option<String>,
}

impl VoxConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| crate::error::VoxError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::VoxError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/voxsync/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("voxsync").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("voxsync")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/voxsync-config/config.toml")
        }
    }

    /// Reject settings that would break gate hysteresis or the throttle.
    pub fn validate(&self) -> crate::error::Result<()> {
        let a = &self.analyzer;
        if a.close_margin >= a.open_margin {
            return Err(crate::error::VoxError::Config(format!(
                "analyzer.close_margin ({}) must be below analyzer.open_margin ({})",
                a.close_margin, a.open_margin
            )));
        }
        for (name, v) in [
            ("attack", a.attack),
            ("release", a.release),
            ("noise_floor_alpha", a.noise_floor_alpha),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(crate::error::VoxError::Config(format!(
                    "analyzer.{name} must be within 0..=1, got {v}"
                )));
            }
        }
        if a.shape_exponent <= 0.0 {
            return Err(crate::error::VoxError::Config(
                "analyzer.shape_exponent must be positive".to_owned(),
            ));
        }
        if self.reconciler.stop_poll_interval_ms == 0 {
            return Err(crate::error::VoxError::Config(
                "reconciler.stop_poll_interval_ms must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = VoxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.coordinator.restart_interval(), Duration::from_secs(1800));
        assert_eq!(config.coordinator.context_retry_delays_ms.len(), 2);
        assert_eq!(config.reconciler.stop_max_wait_ms, 30_000);
    }

    #[test]
    fn inverted_margins_rejected() {
        let mut config = VoxConfig::default();
        config.analyzer.close_margin = 0.05;
        config.analyzer.open_margin = 0.01;
        assert!(config.validate().is_err());
    }

    #[test]
    fn roundtrip_through_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = VoxConfig::default();
        config.server.port = 9999;
        config.agents.insert(
            "guide".to_owned(),
            AgentProfile {
                instructions: "You are a tour guide.".to_owned(),
                voice: Some("verse".to_owned()),
            },
        );
        config.save_to_file(&path).unwrap();

        let loaded = VoxConfig::from_file(&path).unwrap();
        assert_eq!(loaded.server.port, 9999);
        assert_eq!(loaded.agents["guide"].voice.as_deref(), Some("verse"));
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[coordinator]\nidle_grace_secs = 3\n").unwrap();
        let loaded = VoxConfig::from_file(&path).unwrap();
        assert_eq!(loaded.coordinator.idle_grace_secs, 3);
        assert_eq!(loaded.server.port, 8787);
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = VoxConfig::default_config_path();
        assert!(path.ends_with("voxsync/config.toml"));
    }

    #[test]
    fn min_publish_interval_matches_rate() {
        let config = AnalyzerConfig::default();
        let interval = config.min_publish_interval();
        assert!(interval > Duration::from_millis(32) && interval < Duration::from_millis(35));
    }
}
