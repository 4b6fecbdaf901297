use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{audio::AudioClip, project::AspectRatio, scene::VisualLayer, Result};

mod ffmpeg;

pub use ffmpeg::FfmpegRenderer;

/// One scene as handed to the render engine.
#[derive(Debug, Clone)]
pub struct RenderScene {
    pub index: usize,
    pub audio: AudioClip,
    pub layer: VisualLayer,
}

/// Every scene of a job in final playback order, plus the output target.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub scenes: Vec<RenderScene>,
    pub aspect: AspectRatio,
    pub output: PathBuf,
}

impl RenderJob {
    pub fn total_duration(&self) -> f64 {
        self.scenes.iter().map(|scene| scene.layer.duration).sum()
    }

    pub fn scene_order(&self) -> Vec<usize> {
        self.scenes.iter().map(|scene| scene.index).collect()
    }
}

/// Result of a successful render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedVideo {
    pub path: PathBuf,
    /// Measured duration of the written file, in seconds.
    pub duration: f64,
    /// Scene indices in the order they appear in the file.
    pub scene_order: Vec<usize>,
}

/// Capability interface to an external render/mux engine.
///
/// Scenes must be emitted in the order given. [`ScriptVideoError::Render`] is
/// never retried; [`ScriptVideoError::PartialWrite`] additionally tells the
/// caller that a partial file may be left at the output path.
///
/// [`ScriptVideoError::Render`]: crate::ScriptVideoError::Render
/// [`ScriptVideoError::PartialWrite`]: crate::ScriptVideoError::PartialWrite
#[async_trait]
pub trait RenderPipeline: Send + Sync {
    async fn render(&self, job: RenderJob) -> Result<RenderedVideo>;

    /// Whether a previously rendered video can be reused as-is.
    fn output_available(&self, video: &RenderedVideo) -> bool {
        video.path.is_file()
    }
}
