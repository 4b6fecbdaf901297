use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use super::{is_known_voice, probe_duration, AudioClip, SpeechSynthesizer, SynthesisRequest};
use crate::{Result, ScriptVideoError};

/// Drives an `edge-tts` compatible command line program.
///
/// The program is invoked as `<program> --voice V --text T --write-media OUT`
/// and the resulting file is measured with `ffprobe`.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    program: String,
    ffprobe: String,
    out_dir: PathBuf,
}

impl CommandSynthesizer {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: "edge-tts".to_string(),
            ffprobe: "ffprobe".to_string(),
            out_dir: out_dir.into(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_ffprobe(mut self, ffprobe: impl Into<String>) -> Self {
        self.ffprobe = ffprobe.into();
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for CommandSynthesizer {
    async fn synthesize(&self, request: SynthesisRequest) -> Result<AudioClip> {
        if !is_known_voice(&request.voice) {
            return Err(ScriptVideoError::InvalidVoice(request.voice));
        }

        tokio::fs::create_dir_all(&self.out_dir).await?;
        let location = self.out_dir.join(format!("{}.mp3", request.key));

        tracing::debug!(
            scene = request.scene_index,
            voice = %request.voice,
            path = %location.display(),
            "invoking speech synthesizer"
        );

        let output = Command::new(&self.program)
            .arg("--voice")
            .arg(&request.voice)
            .arg("--text")
            .arg(&request.text)
            .arg("--write-media")
            .arg(&location)
            .output()
            .await
            .map_err(|e| {
                ScriptVideoError::synthesis(format!("failed to spawn {}: {e}", self.program))
            })?;

        if !output.status.success() {
            return Err(ScriptVideoError::synthesis(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if !tokio::fs::try_exists(&location).await? {
            return Err(ScriptVideoError::synthesis(format!(
                "{} produced no audio at {}",
                self.program,
                location.display()
            )));
        }

        let duration = probe_duration(&self.ffprobe, &location).await?;
        Ok(AudioClip {
            duration,
            key: request.key,
            location,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assets::ContentKey, project::AspectRatio};

    #[tokio::test]
    async fn unknown_voice_fails_before_spawning() {
        let synth = CommandSynthesizer::new(std::env::temp_dir())
            .with_program("definitely-not-a-real-tts-binary");
        let request = SynthesisRequest {
            scene_index: 0,
            text: "Hello.".to_string(),
            voice: "Voice 1".to_string(),
            key: ContentKey::audio("Hello.", "Voice 1", AspectRatio::Vertical),
        };

        let err = synth.synthesize(request).await.unwrap_err();
        assert!(matches!(err, ScriptVideoError::InvalidVoice(voice) if voice == "Voice 1"));
    }

    #[tokio::test]
    async fn missing_program_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let synth =
            CommandSynthesizer::new(dir.path()).with_program("definitely-not-a-real-tts-binary");
        let request = SynthesisRequest {
            scene_index: 0,
            text: "Hello.".to_string(),
            voice: "en-US-AriaNeural".to_string(),
            key: ContentKey::audio("Hello.", "en-US-AriaNeural", AspectRatio::Vertical),
        };

        let err = synth.synthesize(request).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
