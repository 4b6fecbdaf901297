use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::{assets::ContentKey, Result, ScriptVideoError};

mod command;

pub use command::CommandSynthesizer;

/// Neural voices the bundled synthesizer knows how to drive.
pub const VOICES: &[&str] = &[
    "en-US-AriaNeural",
    "en-US-GuyNeural",
    "en-US-JennyNeural",
    "en-GB-SoniaNeural",
    "en-GB-RyanNeural",
];

/// Returns the supported voice catalogue.
pub fn voices() -> &'static [&'static str] {
    VOICES
}

pub fn is_known_voice(voice: &str) -> bool {
    VOICES.contains(&voice)
}

/// Synthesized speech for one scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioClip {
    /// Length in seconds.
    pub duration: f64,
    pub key: ContentKey,
    pub location: PathBuf,
}

/// Everything a speech backend needs to voice one scene.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub scene_index: usize,
    pub text: String,
    pub voice: String,
    /// Cache key of the clip; backends use it to name their output so repeated
    /// requests land on the same file.
    pub key: ContentKey,
}

/// Capability interface to a speech-synthesis service.
///
/// Implementations must be idempotent for identical `(text, voice)` input.
/// Transient service faults are reported as [`ScriptVideoError::Synthesis`] and
/// get retried; [`ScriptVideoError::InvalidVoice`] aborts the whole job.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, request: SynthesisRequest) -> Result<AudioClip>;
}

/// Reads a media file's duration in seconds with `ffprobe`.
pub async fn probe_duration(ffprobe: &str, path: &Path) -> Result<f64> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .await?;

    if !output.status.success() {
        return Err(ScriptVideoError::invalid_audio(format!(
            "ffprobe failed on {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    parse_duration(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
        ScriptVideoError::invalid_audio(format!("ffprobe reported no duration for {}", path.display()))
    })
}

fn parse_duration(stdout: &str) -> Option<f64> {
    stdout
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|seconds| seconds.is_finite())
}
