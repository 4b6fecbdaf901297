use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Result alias that carries the custom [`ScriptVideoError`] type.
pub type Result<T> = std::result::Result<T, ScriptVideoError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum ScriptVideoError {
    /// The script was blank or whitespace-only.
    #[error("script text is empty")]
    EmptyInput,
    /// The voice identifier is not usable by the synthesis backend. Retrying
    /// cannot fix a configuration problem, so this is always fatal.
    #[error("invalid voice `{0}`")]
    InvalidVoice(String),
    /// Transient fault reported by the speech-synthesis service.
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),
    /// Audio handed to the aligner was missing or had no usable duration.
    #[error("invalid audio: {0}")]
    InvalidAudio(String),
    /// A write-once cache key was written again with different content.
    #[error("cache conflict for key {key}")]
    CacheConflict { key: String },
    /// Audio and visual durations disagree at the pre-render barrier.
    #[error("consistency error: {0}")]
    Consistency(String),
    #[error("render failed: {0}")]
    Render(String),
    /// The render engine failed after it had started writing the output file.
    #[error("partial write to {}: {detail}", path.display())]
    PartialWrite { path: PathBuf, detail: String },
    #[error("illegal job transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
}

impl ScriptVideoError {
    pub fn synthesis<T: Into<String>>(msg: T) -> Self {
        Self::Synthesis(msg.into())
    }

    pub fn invalid_audio<T: Into<String>>(msg: T) -> Self {
        Self::InvalidAudio(msg.into())
    }

    pub fn consistency<T: Into<String>>(msg: T) -> Self {
        Self::Consistency(msg.into())
    }

    pub fn render<T: Into<String>>(msg: T) -> Self {
        Self::Render(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    /// Classifies the error into the coarse taxonomy reported to callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyInput | Self::InvalidVoice(_) | Self::Config(_) => ErrorKind::Input,
            Self::Synthesis(_) => ErrorKind::TransientService,
            Self::InvalidAudio(_) => ErrorKind::InvalidAudio,
            Self::CacheConflict { .. } => ErrorKind::CacheConflict,
            Self::Consistency(_) | Self::InvalidTransition { .. } => ErrorKind::Consistency,
            Self::Render(_) | Self::PartialWrite { .. } => ErrorKind::Render,
            Self::Io(_) | Self::Serde(_) | Self::Poisoned(_) => ErrorKind::Storage,
        }
    }

    /// Only transient synthesis faults are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Synthesis(_))
    }
}

/// Error classes surfaced on a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Input,
    TransientService,
    InvalidAudio,
    Consistency,
    Render,
    CacheConflict,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "InputError",
            Self::TransientService => "TransientServiceError",
            Self::InvalidAudio => "InvalidAudioError",
            Self::Consistency => "ConsistencyError",
            Self::Render => "RenderError",
            Self::CacheConflict => "CacheConflictError",
            Self::Storage => "StorageError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
