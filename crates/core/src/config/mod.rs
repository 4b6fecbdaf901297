use std::{path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Result, ScriptVideoError};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub segment: SegmentConfig,
    pub captions: CaptionConfig,
    pub generation: GenerationConfig,
    pub render: RenderConfig,
    pub cache: CacheConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing sections fall back to their
    /// defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.segment.max_scene_seconds > 0.0) {
            return Err(ScriptVideoError::config(
                "segment.max_scene_seconds must be positive",
            ));
        }
        if !(self.segment.words_per_second > 0.0) {
            return Err(ScriptVideoError::config(
                "segment.words_per_second must be positive",
            ));
        }
        if self.captions.max_words_per_cue == 0 {
            return Err(ScriptVideoError::config(
                "captions.max_words_per_cue must be at least 1",
            ));
        }
        if self.generation.max_attempts == 0 {
            return Err(ScriptVideoError::config(
                "generation.max_attempts must be at least 1",
            ));
        }
        if self.generation.concurrency == 0 {
            return Err(ScriptVideoError::config(
                "generation.concurrency must be at least 1",
            ));
        }
        if !(self.generation.duration_tolerance >= 0.0) {
            return Err(ScriptVideoError::config(
                "generation.duration_tolerance must not be negative",
            ));
        }
        if !(self.generation.render_tolerance_per_scene >= 0.0) {
            return Err(ScriptVideoError::config(
                "generation.render_tolerance_per_scene must not be negative",
            ));
        }
        if self.render.fps == 0 {
            return Err(ScriptVideoError::config("render.fps must be non-zero"));
        }
        if !(self.render.transition_seconds >= 0.0) {
            return Err(ScriptVideoError::config(
                "render.transition_seconds must not be negative",
            ));
        }
        Ok(())
    }
}

/// How raw script text is cut into scenes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Upper bound on how long a single scene should take to speak.
    pub max_scene_seconds: f64,
    /// Speaking-rate estimate used to turn the bound above into a word budget.
    pub words_per_second: f64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_scene_seconds: 6.0,
            words_per_second: 2.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    pub max_words_per_cue: usize,
    /// Bumped whenever caption layout changes so stale visual cache entries are
    /// never served.
    pub layout_version: u32,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            max_words_per_cue: 4,
            layout_version: 1,
        }
    }
}

/// Retry, backoff and concurrency policy for a generation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Total synthesis attempts per scene, including the first one.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Upper bound on concurrently running per-scene tasks.
    pub concurrency: usize,
    /// Allowed drift, in seconds, between matching durations.
    pub duration_tolerance: f64,
    /// Allowed drift per scene between the planned total and the duration
    /// measured on the rendered file. Encoders round each segment to whole
    /// video and audio frames.
    pub render_tolerance_per_scene: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            concurrency: 4,
            duration_tolerance: 0.001,
            render_tolerance_per_scene: 0.1,
        }
    }
}

impl GenerationConfig {
    /// Delay before the given retry (1-based), doubling each time and capped at
    /// `backoff_max_ms`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let millis = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(millis)
    }

    /// Effective worker count for a job with `scene_count` scenes.
    pub fn workers_for(&self, scene_count: usize) -> usize {
        scene_count.min(self.concurrency).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub fps: u32,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub transition_seconds: f64,
    /// Scratch directory for per-scene segments and layer descriptors.
    pub work_dir: PathBuf,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            transition_seconds: 0.25,
            work_dir: std::env::temp_dir().join("script-video"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Whether the cache index is written back to `dir` after each job.
    pub persist: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".script-video-cache"),
            persist: true,
        }
    }
}
