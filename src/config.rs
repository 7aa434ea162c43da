use crate::pipeline::types::{DenoiseMode, Mode};
use crate::utils::path::default_config_path;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Camera location and the day/night boundary tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    pub latitude: f64,
    pub longitude: f64,
    /// Minutes before sunrise at which day mode starts
    pub sunrise_buffer_min: i32,
    /// Minutes after sunset at which night mode starts
    pub sunset_buffer_min: i32,
    /// Sunrise used until the first successful schedule refresh
    pub fallback_sunrise_min: u32,
    /// Sunset used until the first successful schedule refresh
    pub fallback_sunset_min: u32,
    pub schedule_retry_secs: u64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            latitude: 51.4779,
            longitude: -0.0015,
            sunrise_buffer_min: 30,
            sunset_buffer_min: 30,
            fallback_sunrise_min: 6 * 60,
            fallback_sunset_min: 20 * 60,
            schedule_retry_secs: 900,
        }
    }
}

impl LocationConfig {
    pub fn schedule_retry(&self) -> Duration {
        Duration::from_secs(self.schedule_retry_secs)
    }
}

/// Base video settings plus the night overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u32,
    pub keyframe_interval_secs: u32,
    pub day_fps: u32,
    pub night_fps: u32,
    pub night_shutter_us: u32,
    pub night_gain: f32,
    pub day_denoise: DenoiseMode,
    pub night_denoise: DenoiseMode,
    /// Frame rate the publisher re-encodes night footage to
    pub night_output_fps: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            bitrate_bps: 4_500_000,
            keyframe_interval_secs: 2,
            day_fps: 30,
            night_fps: 1,
            night_shutter_us: 1_000_000,
            night_gain: 8.0,
            day_denoise: DenoiseMode::Auto,
            night_denoise: DenoiseMode::CdnHq,
            night_output_fps: 30,
        }
    }
}

impl VideoConfig {
    /// Keyframe interval in frames at `fps`, never below one frame.
    pub fn keyframe_frames(&self, fps: u32) -> u32 {
        fps.saturating_mul(self.keyframe_interval_secs).max(1)
    }
}

/// Destination of the broadcast and the audio bed muxed into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub audio_path: PathBuf,
    pub audio_bitrate_bps: u32,
    pub endpoint_url: String,
    pub stream_key: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            audio_path: PathBuf::from("/usr/share/daycast/ambient.mp3"),
            audio_bitrate_bps: 128_000,
            endpoint_url: String::from("rtmp://a.rtmp.youtube.com/live2"),
            stream_key: String::new(),
        }
    }
}

/// Control loop timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub tick_interval_ms: u64,
    /// Capture processes are cycled after running this long
    pub max_segment_secs: u64,
    pub day_warmup_ms: u64,
    pub night_warmup_ms: u64,
    pub ready_timeout_ms: u64,
    /// Survival time required of a freshly launched publish process
    pub publish_check_ms: u64,
    pub termination_grace_ms: u64,
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    /// No capture output for this long counts as a dead capture, 0 disables
    pub stall_timeout_secs: u64,
    pub health_log_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            max_segment_secs: 30 * 60,
            day_warmup_ms: 5_000,
            night_warmup_ms: 20_000,
            ready_timeout_ms: 60_000,
            publish_check_ms: 5_000,
            termination_grace_ms: 10_000,
            retry_backoff_ms: 5_000,
            max_retry_backoff_ms: 120_000,
            stall_timeout_secs: 90,
            health_log_secs: 300,
        }
    }
}

impl SupervisorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn max_segment(&self) -> Duration {
        Duration::from_secs(self.max_segment_secs)
    }

    /// Capture warm-up for `mode`; long exposures need longer to settle.
    pub fn warmup(&self, mode: Mode) -> Duration {
        match mode {
            Mode::Day => Duration::from_millis(self.day_warmup_ms),
            Mode::Night => Duration::from_millis(self.night_warmup_ms),
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn publish_check(&self) -> Duration {
        Duration::from_millis(self.publish_check_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    /// Delay before build attempt `failures + 1`, doubling up to the cap.
    pub fn retry_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self.retry_backoff_ms.saturating_mul(1 << exponent);
        Duration::from_millis(delay.min(self.max_retry_backoff_ms))
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        (self.stall_timeout_secs > 0).then(|| Duration::from_secs(self.stall_timeout_secs))
    }

    pub fn health_log_interval(&self) -> Duration {
        Duration::from_secs(self.health_log_secs)
    }
}

/// External programs driven by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub capture_program: String,
    pub publish_program: String,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            capture_program: String::from("rpicam-vid"),
            publish_program: String::from("ffmpeg"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub location: LocationConfig,
    pub video: VideoConfig,
    pub publish: PublishConfig,
    pub supervisor: SupervisorConfig,
    pub commands: CommandConfig,
}

impl Config {
    /// Read and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&raw).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default location if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::load(path)
                .with_context(|| format!("failed to load configuration {}", path.display()));
        }

        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path)
                .with_context(|| format!("failed to load configuration {}", path.display())),
            _ => {
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if !(-90.0..=90.0).contains(&self.location.latitude) {
            return invalid("latitude must lie within ±90°");
        }
        if !(-180.0..=180.0).contains(&self.location.longitude) {
            return invalid("longitude must lie within ±180°");
        }
        if self.location.fallback_sunrise_min >= 1440 || self.location.fallback_sunset_min >= 1440 {
            return invalid("fallback sunrise/sunset must be a minute of day below 1440");
        }
        if self.video.width == 0 || self.video.height == 0 {
            return invalid("video dimensions must be non-zero");
        }
        if self.video.day_fps == 0 || self.video.night_fps == 0 || self.video.night_output_fps == 0 {
            return invalid("frame rates must be non-zero");
        }
        if self.video.bitrate_bps == 0 {
            return invalid("video bitrate must be non-zero");
        }
        if self.video.night_shutter_us == 0 {
            return invalid("night shutter must be non-zero");
        }
        if self.supervisor.tick_interval_ms == 0 {
            return invalid("tick interval must be non-zero");
        }
        if self.supervisor.max_segment_secs == 0 {
            return invalid("maximum capture segment must be non-zero");
        }
        let s = &self.supervisor;
        if s.day_warmup_ms > s.ready_timeout_ms
            || s.night_warmup_ms > s.ready_timeout_ms
            || s.publish_check_ms > s.ready_timeout_ms
        {
            return invalid("warm-up durations cannot exceed the readiness timeout");
        }
        if self.commands.capture_program.is_empty() || self.commands.publish_program.is_empty() {
            return invalid("capture and publish programs must be set");
        }
        Ok(())
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
