use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Background, CaptionOverlay, Scene, Transition, VisualLayer};
use crate::{assets::ContentKey, project::AspectRatio, Result, ScriptVideoError};

const PALETTE: &[&str] = &[
    "0x1d3557", "0x2a9d8f", "0x264653", "0x6d597a", "0x355070", "0x3d405b",
];
const KEN_BURNS_ZOOM: f64 = 1.15;

/// Input for composing one timed scene.
#[derive(Debug, Clone)]
pub struct ComposeRequest {
    pub scene: Scene,
    pub aspect: AspectRatio,
    pub background_image: Option<PathBuf>,
    /// Visual cache key; seeds every stylistic choice so the layer is a pure
    /// function of it.
    pub key: ContentKey,
}

/// Non-fatal layout problem found while placing captions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutWarning {
    pub scene_index: usize,
    pub cue_index: usize,
    pub requested_end: f64,
    pub clamped_end: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    pub layer: VisualLayer,
    pub warnings: Vec<LayoutWarning>,
}

/// Builds the visual stack for a timed scene. The returned layer's duration
/// must equal the scene's target duration.
#[async_trait]
pub trait SceneComposer: Send + Sync {
    async fn compose(&self, request: ComposeRequest) -> Result<Composition>;
}

/// Deterministic composer: a background, one caption overlay per cue and a
/// short fade at both ends.
#[derive(Debug, Clone)]
pub struct LayoutComposer {
    transition_seconds: f64,
    layout_version: u32,
    work_dir: Option<PathBuf>,
}

impl LayoutComposer {
    pub fn new(transition_seconds: f64, layout_version: u32) -> Self {
        Self {
            transition_seconds,
            layout_version,
            work_dir: None,
        }
    }

    /// Also writes every composed layer as a JSON descriptor into `dir`.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn layout_version(&self) -> u32 {
        self.layout_version
    }

    /// Pure layout step, separated from the optional descriptor write.
    pub fn layout(&self, request: &ComposeRequest) -> Result<Composition> {
        let scene = &request.scene;
        let duration = scene.target_duration().ok_or_else(|| {
            ScriptVideoError::consistency(format!(
                "scene {} reached composition without a target duration",
                scene.index()
            ))
        })?;

        let (width, height) = request.aspect.dimensions();
        let font_size = width / 18;
        let baseline = match request.aspect {
            AspectRatio::Vertical => height * 72 / 100,
            AspectRatio::Horizontal => height * 85 / 100,
            AspectRatio::Square => height * 80 / 100,
        };

        let mut warnings = Vec::new();
        let mut overlays = Vec::with_capacity(scene.cues().len());
        for (cue_index, cue) in scene.cues().iter().enumerate() {
            let start = cue.start.clamp(0.0, duration);
            let mut end = cue.end.max(start);
            if end > duration {
                warnings.push(LayoutWarning {
                    scene_index: scene.index(),
                    cue_index,
                    requested_end: cue.end,
                    clamped_end: duration,
                });
                end = duration;
            }
            overlays.push(CaptionOverlay {
                text: cue.text.clone(),
                start,
                end,
                x: width / 2,
                y: baseline,
                font_size,
            });
        }

        let seed = key_seed(&request.key);
        let background = match &request.background_image {
            Some(image) => {
                let (from_zoom, to_zoom) = if seed % 2 == 0 {
                    (1.0, KEN_BURNS_ZOOM)
                } else {
                    (KEN_BURNS_ZOOM, 1.0)
                };
                Background::KenBurns {
                    image: image.clone(),
                    from_zoom,
                    to_zoom,
                }
            }
            None => Background::Solid {
                color: PALETTE[(seed % PALETTE.len() as u64) as usize].to_string(),
            },
        };

        let fade = self.transition_seconds.min(duration / 2.0);
        let transition = if fade > 0.0 {
            Transition::fade(fade)
        } else {
            Transition::cut()
        };

        Ok(Composition {
            layer: VisualLayer {
                duration,
                width,
                height,
                background,
                overlays,
                transition_in: transition,
                transition_out: transition,
                layout_version: self.layout_version,
            },
            warnings,
        })
    }
}

#[async_trait]
impl SceneComposer for LayoutComposer {
    async fn compose(&self, request: ComposeRequest) -> Result<Composition> {
        let composition = self.layout(&request)?;
        for warning in &composition.warnings {
            tracing::warn!(
                scene = warning.scene_index,
                cue = warning.cue_index,
                requested_end = warning.requested_end,
                clamped_end = warning.clamped_end,
                "caption clamped to scene end"
            );
        }

        if let Some(dir) = &self.work_dir {
            tokio::fs::create_dir_all(dir).await?;
            let path = dir.join(format!("{}.layer.json", request.key));
            tokio::fs::write(&path, serde_json::to_vec_pretty(&composition.layer)?).await?;
        }

        Ok(composition)
    }
}

fn key_seed(key: &ContentKey) -> u64 {
    let prefix = &key.as_str()[..key.as_str().len().min(16)];
    u64::from_str_radix(prefix, 16).unwrap_or_else(|_| {
        prefix
            .bytes()
            .fold(0u64, |acc, byte| acc.wrapping_mul(31).wrapping_add(byte as u64))
    })
}
