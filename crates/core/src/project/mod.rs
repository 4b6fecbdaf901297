use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Result, ScriptVideoError};

/// Output frame shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AspectRatio {
    /// 9:16, the reel/short format.
    Vertical,
    /// 16:9.
    Horizontal,
    /// 1:1.
    Square,
}

impl AspectRatio {
    /// Output frame size in pixels as `(width, height)`.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Vertical => (1080, 1920),
            Self::Horizontal => (1920, 1080),
            Self::Square => (1080, 1080),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vertical => "9:16",
            Self::Horizontal => "16:9",
            Self::Square => "1:1",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = ScriptVideoError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "9:16" | "vertical" | "reel" => Ok(Self::Vertical),
            "16:9" | "horizontal" | "landscape" => Ok(Self::Horizontal),
            "1:1" | "square" => Ok(Self::Square),
            other => Err(ScriptVideoError::config(format!(
                "unknown aspect ratio `{other}`"
            ))),
        }
    }
}

/// Inputs of one generation request. Fields are private so the project cannot
/// change once a job has taken ownership of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    script: String,
    aspect: AspectRatio,
    voice: String,
    background: Option<PathBuf>,
}

impl Project {
    pub fn new(script: impl Into<String>, aspect: AspectRatio, voice: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            aspect,
            voice: voice.into(),
            background: None,
        }
    }

    /// Uses an image as the animated background for every scene.
    pub fn with_background(mut self, image: impl Into<PathBuf>) -> Self {
        self.background = Some(image.into());
        self
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn aspect(&self) -> AspectRatio {
        self.aspect
    }

    pub fn voice(&self) -> &str {
        &self.voice
    }

    pub fn background(&self) -> Option<&PathBuf> {
        self.background.as_ref()
    }
}
