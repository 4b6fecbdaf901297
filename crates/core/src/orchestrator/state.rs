use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::{scene::LayoutWarning, ErrorKind, Result, ScriptVideoError};

/// Lifecycle of one generation job.
///
/// ```text
/// Segmenting -> Synthesizing -> Aligning -> Composing -> Rendering -> Completed
///      \______________\_____________\___________\____________\-----> Failed | Cancelled
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Segmenting,
    Synthesizing,
    Aligning,
    Composing,
    Rendering,
    Completed { output: PathBuf },
    Failed { kind: ErrorKind, detail: String },
    Cancelled,
}

impl JobState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Segmenting => "segmenting",
            Self::Synthesizing => "synthesizing",
            Self::Aligning => "aligning",
            Self::Composing => "composing",
            Self::Rendering => "rendering",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: &JobState) -> bool {
        use JobState::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed { .. })
                | (_, Cancelled)
                | (Segmenting, Synthesizing)
                | (Synthesizing, Aligning)
                | (Aligning, Composing)
                | (Composing, Rendering)
                | (Rendering, Completed { .. })
        )
    }
}

/// Notification sent to the presentation layer on every state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub state: JobState,
}

/// Terminal result of [`JobOrchestrator::run`](super::JobOrchestrator::run).
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(JobReport),
    Failed { kind: ErrorKind, detail: String },
    Cancelled,
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn report(&self) -> Option<&JobReport> {
        match self {
            Self::Completed(report) => Some(report),
            _ => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneReport {
    pub index: usize,
    pub text: String,
    pub duration: f64,
}

/// Counters gathered while running a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub synthesis_calls: u32,
    pub audio_cache_hits: u32,
    pub compose_calls: u32,
    pub visual_cache_hits: u32,
    pub render_calls: u32,
    pub render_cache_hit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub output: PathBuf,
    /// Scenes in the order they were rendered.
    pub scenes: Vec<SceneReport>,
    pub total_duration: f64,
    pub warnings: Vec<LayoutWarning>,
    pub stats: JobStats,
}

/// Current state plus the outbound event channel.
#[derive(Debug)]
pub(crate) struct StateMachine {
    job_id: Uuid,
    state: JobState,
    events: Option<UnboundedSender<JobEvent>>,
}

impl StateMachine {
    pub(crate) fn start(job_id: Uuid, events: Option<UnboundedSender<JobEvent>>) -> Self {
        let machine = Self {
            job_id,
            state: JobState::Segmenting,
            events,
        };
        tracing::info!(state = machine.state.name(), "job started");
        machine.emit();
        machine
    }

    pub(crate) fn state(&self) -> &JobState {
        &self.state
    }

    pub(crate) fn advance(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(&next) {
            return Err(ScriptVideoError::InvalidTransition {
                from: self.state.name().to_string(),
                to: next.name().to_string(),
            });
        }
        tracing::info!(from = self.state.name(), to = next.name(), "job transition");
        self.state = next;
        self.emit();
        Ok(())
    }

    fn emit(&self) {
        let Some(events) = &self.events else {
            return;
        };
        // A closed receiver only means nobody is listening any more.
        let _ = events.send(JobEvent {
            job_id: self.job_id,
            state: self.state.clone(),
        });
    }
}
