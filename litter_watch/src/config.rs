// THEORY:
// Every threshold the engine uses lives here. Proximity radii are measured in
// pixels of the source's native resolution, so they must be retuned whenever
// the camera resolution changes; nothing downstream hardcodes them.
//
// The config is a plain serde tree. Missing sections or fields fall back to
// their defaults, so a JSON file only needs to name what it overrides.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming a JSON config file.
pub const CONFIG_ENV_VAR: &str = "LITTER_WATCH_CONFIG";

/// Top-level configuration for the incident engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tracker: TrackerConfig,
    pub cooldown: CooldownConfig,
    pub buffer: BufferConfig,
    pub evidence: EvidenceConfig,
    pub dispatch: DispatchConfig,
    pub pipeline: PipelineConfig,
}

/// Tunables for the subject tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// A companion object closer than this to a person's center counts as "held".
    pub proximity_radius_px: f64,
    /// Maximum distance between a person's center and a face attributed to them.
    pub face_radius_px: f64,
    /// Tracks not updated for longer than this are swept.
    pub track_ttl_secs: f64,
    /// Cell size used to quantize a person's center into a subject key.
    pub quantization_px: f64,
    /// Detections below this confidence are ignored.
    pub min_confidence: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            proximity_radius_px: 150.0,
            face_radius_px: 200.0,
            track_ttl_secs: 5.0,
            quantization_px: 1.0,
            min_confidence: 0.6,
        }
    }
}

impl TrackerConfig {
    pub fn track_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.track_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    pub cooldown_secs: f64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self { cooldown_secs: 10.0 }
    }
}

impl CooldownConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Number of frames retained for clips. 300 is roughly 10 s at 30 fps.
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { capacity: 300 }
    }
}

/// Where and how evidence artifacts are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    pub root_dir: PathBuf,
    pub person_padding_px: u32,
    pub face_padding_px: u32,
    pub jpeg_quality: u8,
    /// Clip frame rate when the buffered frames are too few to measure one.
    pub clip_fps: f64,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./evidence"),
            person_padding_px: 30,
            face_padding_px: 20,
            jpeg_quality: 85,
            clip_fps: 30.0,
        }
    }
}

/// Exponential backoff schedule for downstream calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub workers: usize,
    /// Pending submissions beyond this evict the oldest unstarted one.
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub upload_timeout_ms: u64,
    pub record_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().clamp(1, 4),
            queue_capacity: 64,
            retry: RetryPolicy::default(),
            upload_timeout_ms: 30_000,
            record_timeout_ms: 10_000,
        }
    }
}

impl DispatchConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn record_timeout(&self) -> Duration {
        Duration::from_millis(self.record_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// A live source that yields nothing for this long is treated as failed.
    pub frame_timeout_secs: f64,
    /// Frames queued between the capture thread and the pipeline.
    pub capture_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_timeout_secs: 10.0,
            capture_buffer: 120,
        }
    }
}

impl PipelineConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.frame_timeout_secs)
    }
}

impl EngineConfig {
    /// Reads a JSON config file. Fields absent from the file keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the file named by `LITTER_WATCH_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.tracker;
        if !(t.proximity_radius_px > 0.0) || !(t.face_radius_px > 0.0) {
            return Err(Error::Config("radii must be positive".into()));
        }
        if !(t.quantization_px > 0.0) {
            return Err(Error::Config("quantization_px must be positive".into()));
        }
        if !(t.track_ttl_secs > 0.0) || self.cooldown.cooldown_secs < 0.0 {
            return Err(Error::Config("track_ttl_secs must be positive and cooldown_secs non-negative".into()));
        }
        if self.buffer.capacity == 0 {
            return Err(Error::Config("buffer.capacity must be at least 1".into()));
        }
        if self.dispatch.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.dispatch.workers == 0 || self.dispatch.queue_capacity == 0 {
            return Err(Error::Config("dispatch workers and queue_capacity must be at least 1".into()));
        }
        if !(self.evidence.clip_fps > 0.0) {
            return Err(Error::Config("evidence.clip_fps must be positive".into()));
        }
        if !(1..=100).contains(&self.evidence.jpeg_quality) {
            return Err(Error::Config("evidence.jpeg_quality must be within 1..=100".into()));
        }
        Ok(())
    }
}
