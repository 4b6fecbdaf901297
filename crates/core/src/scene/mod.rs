use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{timeline::SceneTiming, Result, ScriptVideoError};

mod compose;

pub use compose::{ComposeRequest, Composition, LayoutComposer, LayoutWarning, SceneComposer};

/// One ordered unit of the final video. The index is fixed at segmentation and
/// defines playback order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    index: usize,
    text: String,
    target_duration: Option<f64>,
    cues: Vec<CaptionCue>,
}

impl Scene {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            target_duration: None,
            cues: Vec::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Duration in seconds, known only once the scene's audio is aligned.
    pub fn target_duration(&self) -> Option<f64> {
        self.target_duration
    }

    pub fn cues(&self) -> &[CaptionCue] {
        &self.cues
    }

    /// Attaches the aligned timing. A scene is timed exactly once.
    pub fn apply_timing(&mut self, timing: SceneTiming) -> Result<()> {
        if self.target_duration.is_some() {
            return Err(ScriptVideoError::consistency(format!(
                "scene {} already has a target duration",
                self.index
            )));
        }
        self.target_duration = Some(timing.target_duration);
        self.cues = timing.cues;
        Ok(())
    }
}

/// A caption fragment shown between two offsets relative to the scene start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionCue {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

impl CaptionCue {
    pub fn new(text: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            text: text.into(),
            start,
            end,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Composed visual stack for one scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualLayer {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub background: Background,
    pub overlays: Vec<CaptionOverlay>,
    pub transition_in: Transition,
    pub transition_out: Transition,
    pub layout_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Background {
    /// Flat colour in `0xRRGGBB` form.
    Solid { color: String },
    /// Still image with a slow zoom across the scene.
    KenBurns {
        image: PathBuf,
        from_zoom: f64,
        to_zoom: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionOverlay {
    pub text: String,
    pub start: f64,
    pub end: f64,
    /// Horizontal centre and baseline of the caption box, in pixels.
    pub x: u32,
    pub y: u32,
    pub font_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Cut,
    Fade,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub kind: TransitionKind,
    pub duration: f64,
}

impl Transition {
    pub fn cut() -> Self {
        Self {
            kind: TransitionKind::Cut,
            duration: 0.0,
        }
    }

    pub fn fade(duration: f64) -> Self {
        Self {
            kind: TransitionKind::Fade,
            duration,
        }
    }
}
