//! Core library for turning a text script into a narrated short-form video.
//!
//! Each module owns one stage of the pipeline (segmenting, synthesis, timing,
//! composition, rendering) and the [`orchestrator`] drives a job through them.
//! External services sit behind async traits so that jobs can be exercised
//! without network access or an encoder installed.

pub mod assets;
pub mod audio;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod project;
pub mod render;
pub mod scene;
pub mod segment;
pub mod timeline;

pub use assets::{AssetCache, CacheEntry, ContentKey};
pub use audio::{voices, AudioClip, CommandSynthesizer, SpeechSynthesizer, SynthesisRequest};
pub use config::AppConfig;
pub use error::{ErrorKind, Result, ScriptVideoError};
pub use orchestrator::{CancelHandle, JobEvent, JobOrchestrator, JobOutcome, JobReport, JobState};
pub use project::{AspectRatio, Project};
pub use render::{FfmpegRenderer, RenderJob, RenderPipeline, RenderedVideo};
pub use scene::{CaptionCue, LayoutComposer, Scene, SceneComposer, VisualLayer};
pub use segment::ScriptSegmenter;
pub use timeline::{SceneTiming, TimingAligner};
