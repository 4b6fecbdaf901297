use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use script_video_core::{
    config::AppConfig,
    orchestrator::JobStats,
    scene::{ComposeRequest, Composition},
    AspectRatio, AssetCache, AudioClip, CancelHandle, ErrorKind, JobOrchestrator, JobOutcome,
    JobState, LayoutComposer, Project, RenderJob, RenderPipeline, RenderedVideo, Result,
    SceneComposer, ScriptVideoError, SpeechSynthesizer, SynthesisRequest,
};
use tokio::sync::{mpsc, watch};

const VOICE: &str = "en-US-AriaNeural";

/// Two seconds of audio per scene unless `scene_seconds` says otherwise, with
/// optional transient failures.
#[derive(Default)]
struct MockSynthesizer {
    calls: AtomicU32,
    failures_left: AtomicU32,
    delay: Duration,
    scene_seconds: Vec<f64>,
    /// When set, scenes finish strictly from last to first.
    reverse_gate: Option<watch::Sender<usize>>,
    finished: Mutex<Vec<usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockSynthesizer {
    fn failing(times: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(times),
            ..Default::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn with_seconds(scene_seconds: Vec<f64>) -> Self {
        Self {
            scene_seconds,
            ..Default::default()
        }
    }

    fn finishing_in_reverse(scene_seconds: Vec<f64>) -> Self {
        Self {
            scene_seconds,
            reverse_gate: Some(watch::channel(0).0),
            ..Default::default()
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn finished(&self) -> Vec<usize> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn synthesize(&self, request: SynthesisRequest) -> Result<AudioClip> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.voice == "nobody" {
            return Err(ScriptVideoError::InvalidVoice(request.voice));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ScriptVideoError::synthesis("service unavailable"));
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(gate) = &self.reverse_gate {
            let turn = self.scene_seconds.len() - 1 - request.scene_index;
            let mut done = gate.subscribe();
            let released = done.wait_for(|finished| *finished >= turn).await.is_ok();
            assert!(released);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.finished.lock().unwrap().push(request.scene_index);
        if let Some(gate) = &self.reverse_gate {
            gate.send_modify(|finished| *finished += 1);
        }

        Ok(AudioClip {
            duration: self
                .scene_seconds
                .get(request.scene_index)
                .copied()
                .unwrap_or(2.0),
            location: PathBuf::from(format!("/virtual/{}.mp3", request.key)),
            key: request.key,
        })
    }
}

/// Wraps a [`LayoutComposer`], optionally stretching the layer it returns.
struct StretchingComposer {
    inner: LayoutComposer,
    stretch: f64,
}

impl StretchingComposer {
    fn new() -> Self {
        Self {
            inner: LayoutComposer::new(0.25, 1),
            stretch: 0.0,
        }
    }

    fn stretching(stretch: f64) -> Self {
        Self {
            stretch,
            ..Self::new()
        }
    }
}

#[async_trait]
impl SceneComposer for StretchingComposer {
    async fn compose(&self, request: ComposeRequest) -> Result<Composition> {
        let mut composition = self.inner.compose(request).await?;
        composition.layer.duration += self.stretch;
        Ok(composition)
    }
}

/// Fires the cancel signal from inside composition and never finishes.
struct CancellingComposer {
    cancel: CancelHandle,
}

#[async_trait]
impl SceneComposer for CancellingComposer {
    async fn compose(&self, _request: ComposeRequest) -> Result<Composition> {
        self.cancel.cancel();
        std::future::pending().await
    }
}

#[derive(Default)]
struct MockRenderer {
    calls: AtomicU32,
    /// Fails after writing part of the output.
    partial: bool,
    /// Fails before touching the output.
    broken: bool,
    /// Reports a slightly different duration on every call.
    drifting: bool,
    /// Layer durations of every job, in the order they were handed over.
    received: Mutex<Vec<Vec<f64>>>,
}

impl MockRenderer {
    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderPipeline for MockRenderer {
    async fn render(&self, job: RenderJob) -> Result<RenderedVideo> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.received
            .lock()
            .unwrap()
            .push(job.scenes.iter().map(|scene| scene.layer.duration).collect());
        if self.broken {
            return Err(ScriptVideoError::render("encoder exited with status 1"));
        }
        tokio::fs::write(&job.output, b"not really a video").await?;
        if self.partial {
            return Err(ScriptVideoError::PartialWrite {
                path: job.output.clone(),
                detail: "encoder crashed".into(),
            });
        }
        let drift = if self.drifting { 0.01 * call as f64 } else { 0.0 };
        Ok(RenderedVideo {
            path: job.output.clone(),
            duration: job.total_duration() + drift,
            scene_order: job.scene_order(),
        })
    }
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.generation.backoff_base_ms = 1;
    config.generation.backoff_max_ms = 4;
    config
}

struct Harness {
    orchestrator: JobOrchestrator,
    synthesizer: Arc<MockSynthesizer>,
    renderer: Arc<MockRenderer>,
    cache: Arc<AssetCache>,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new(config: &AppConfig, synthesizer: MockSynthesizer, renderer: MockRenderer) -> Self {
        Self::with_composer(config, synthesizer, Arc::new(StretchingComposer::new()), renderer)
    }

    fn with_composer(
        config: &AppConfig,
        synthesizer: MockSynthesizer,
        composer: Arc<dyn SceneComposer>,
        renderer: MockRenderer,
    ) -> Self {
        let synthesizer = Arc::new(synthesizer);
        let renderer = Arc::new(renderer);
        let cache = Arc::new(AssetCache::new());
        let orchestrator = JobOrchestrator::new(
            config,
            synthesizer.clone(),
            composer,
            renderer.clone(),
            cache.clone(),
        );
        Self {
            orchestrator,
            synthesizer,
            renderer,
            cache,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn output(&self) -> PathBuf {
        self.dir.path().join("out.mp4")
    }

    async fn run(&self, text: &str, voice: &str) -> JobOutcome {
        self.run_project(Project::new(text, AspectRatio::Vertical, voice))
            .await
    }

    async fn run_project(&self, project: Project) -> JobOutcome {
        self.orchestrator
            .run(project, self.output(), &CancelHandle::new(), None)
            .await
    }
}

#[tokio::test]
async fn two_sentences_render_in_order() {
    let harness = Harness::new(&config(), MockSynthesizer::default(), MockRenderer::default());

    let outcome = harness.run("Hello. This is a test.", VOICE).await;
    let report = outcome.report().expect("job should complete");

    assert_eq!(report.scenes.len(), 2);
    assert_eq!(
        report.scenes.iter().map(|s| s.index).collect::<Vec<_>>(),
        vec![0, 1]
    );
    assert!((report.total_duration - 4.0).abs() < 1e-9);
    let scene_total: f64 = report.scenes.iter().map(|s| s.duration).sum();
    assert!((scene_total - report.total_duration).abs() < 1e-9);
    assert_eq!(report.output, harness.output());
    assert!(harness.output().is_file());
    assert_eq!(harness.renderer.calls(), 1);
}

#[tokio::test]
async fn empty_script_fails_before_synthesis() {
    let harness = Harness::new(&config(), MockSynthesizer::default(), MockRenderer::default());

    let outcome = harness.run("  \n\t ", VOICE).await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::Input));
    assert_eq!(harness.synthesizer.calls(), 0);
    assert_eq!(harness.renderer.calls(), 0);
}

#[tokio::test]
async fn transient_failures_below_the_bound_are_retried() {
    let config = config();
    let attempts = config.generation.max_attempts;
    let harness = Harness::new(
        &config,
        MockSynthesizer::failing(attempts - 1),
        MockRenderer::default(),
    );

    let outcome = harness.run("Hello.", VOICE).await;

    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(harness.synthesizer.calls(), attempts);
    assert_eq!(outcome.report().unwrap().stats.synthesis_calls, attempts);
}

#[tokio::test]
async fn exhausting_the_retry_bound_fails_the_job() {
    let config = config();
    let attempts = config.generation.max_attempts;
    let harness = Harness::new(
        &config,
        MockSynthesizer::failing(attempts),
        MockRenderer::default(),
    );

    let outcome = harness.run("Hello.", VOICE).await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::TransientService));
    assert_eq!(harness.synthesizer.calls(), attempts);
    assert_eq!(harness.renderer.calls(), 0);
}

#[tokio::test]
async fn invalid_voice_is_not_retried() {
    let harness = Harness::new(&config(), MockSynthesizer::default(), MockRenderer::default());

    let outcome = harness.run("Hello.", "nobody").await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::Input));
    assert_eq!(harness.synthesizer.calls(), 1);
}

#[tokio::test]
async fn cancelling_during_composition_never_renders() {
    let cancel = CancelHandle::new();
    let composer = Arc::new(CancellingComposer {
        cancel: cancel.clone(),
    });
    let harness = Harness::with_composer(
        &config(),
        MockSynthesizer::default(),
        composer,
        MockRenderer::default(),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();

    let project = Project::new("Hello. This is a test.", AspectRatio::Square, VOICE);
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        harness
            .orchestrator
            .run(project, harness.output(), &cancel, Some(tx)),
    )
    .await
    .expect("cancellation should interrupt composition");

    assert_eq!(outcome, JobOutcome::Cancelled);
    assert_eq!(harness.renderer.calls(), 0);
    let states: Vec<JobState> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|event| event.state)
        .collect();
    assert_eq!(states.last(), Some(&JobState::Cancelled));
    assert!(states.contains(&JobState::Composing));
    assert!(!states.contains(&JobState::Rendering));
}

#[tokio::test]
async fn warm_cache_rerun_calls_no_collaborators() {
    let harness = Harness::new(&config(), MockSynthesizer::default(), MockRenderer::default());
    let text = "Hello. This is a test.";

    let first = harness.run(text, VOICE).await;
    assert!(first.is_completed(), "{first:?}");
    let synth_calls = harness.synthesizer.calls();
    assert_eq!(harness.renderer.calls(), 1);

    let second = harness.run(text, VOICE).await;
    let report = second.report().expect("rerun should complete");

    assert_eq!(harness.synthesizer.calls(), synth_calls);
    assert_eq!(harness.renderer.calls(), 1);
    assert_eq!(
        report.stats,
        JobStats {
            synthesis_calls: 0,
            audio_cache_hits: 2,
            compose_calls: 0,
            visual_cache_hits: 2,
            render_calls: 0,
            render_cache_hit: true,
        }
    );
    assert_eq!(report.total_duration, first.report().unwrap().total_duration);
}

#[tokio::test]
async fn missing_output_is_rendered_again() {
    let harness = Harness::new(&config(), MockSynthesizer::default(), MockRenderer::default());

    assert!(harness.run("Hello.", VOICE).await.is_completed());
    std::fs::remove_file(harness.output()).unwrap();
    let outcome = harness.run("Hello.", VOICE).await;

    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(harness.synthesizer.calls(), 1);
    assert_eq!(harness.renderer.calls(), 2);
}

#[tokio::test]
async fn duration_mismatch_stops_at_the_barrier() {
    let harness = Harness::with_composer(
        &config(),
        MockSynthesizer::default(),
        Arc::new(StretchingComposer::stretching(0.5)),
        MockRenderer::default(),
    );

    let outcome = harness.run("Hello. This is a test.", VOICE).await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::Consistency));
    assert_eq!(harness.renderer.calls(), 0);
}

#[tokio::test]
async fn partial_write_is_removed_before_failing() {
    let renderer = MockRenderer {
        partial: true,
        ..Default::default()
    };
    let harness = Harness::new(&config(), MockSynthesizer::default(), renderer);

    let outcome = harness.run("Hello.", VOICE).await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::Render));
    assert!(!harness.output().exists());
}

#[tokio::test]
async fn emits_each_state_once_with_a_single_terminal_event() {
    let harness = Harness::new(&config(), MockSynthesizer::default(), MockRenderer::default());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let project = Project::new("Hello. This is a test.", AspectRatio::Horizontal, VOICE);
    let outcome = harness
        .orchestrator
        .run(project, harness.output(), &CancelHandle::new(), Some(tx))
        .await;
    assert!(outcome.is_completed());

    let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    let names: Vec<&str> = events.iter().map(|e| e.state.name()).collect();
    assert_eq!(
        names,
        vec![
            "segmenting",
            "synthesizing",
            "aligning",
            "composing",
            "rendering",
            "completed"
        ]
    );
    assert_eq!(events.iter().filter(|e| e.state.is_terminal()).count(), 1);
    let job_id = outcome.report().unwrap().job_id;
    assert!(events.iter().all(|e| e.job_id == job_id));
}

#[tokio::test]
async fn failed_event_carries_error_kind() {
    let harness = Harness::new(&config(), MockSynthesizer::default(), MockRenderer::default());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let project = Project::new("", AspectRatio::Vertical, VOICE);
    harness
        .orchestrator
        .run(project, harness.output(), &CancelHandle::new(), Some(tx))
        .await;

    let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[1].state,
        JobState::Failed { kind: ErrorKind::Input, .. }
    ));
}

#[tokio::test]
async fn per_scene_work_respects_the_concurrency_bound() {
    let mut config = config();
    config.generation.concurrency = 2;
    let harness = Harness::new(
        &config,
        MockSynthesizer::slow(Duration::from_millis(20)),
        MockRenderer::default(),
    );

    let outcome = harness
        .run("One. Two. Three. Four. Five. Six. Seven. Eight.", VOICE)
        .await;
    let report = outcome.report().expect("job should complete");

    assert_eq!(report.scenes.len(), 8);
    assert!((report.total_duration - 16.0).abs() < 1e-9);
    let peak = harness.synthesizer.max_in_flight.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak concurrency was {peak}");
}

#[tokio::test]
async fn changing_the_background_recomposes_and_rerenders() {
    let harness = Harness::new(&config(), MockSynthesizer::default(), MockRenderer::default());
    let text = "Hello. This is a test.";

    let plain = harness.run(text, VOICE).await;
    assert!(plain.is_completed(), "{plain:?}");

    let project =
        Project::new(text, AspectRatio::Vertical, VOICE).with_background("/img/beach.png");
    let outcome = harness.run_project(project).await;
    let report = outcome.report().expect("job should complete");

    assert_eq!(
        report.stats,
        JobStats {
            synthesis_calls: 0,
            audio_cache_hits: 2,
            compose_calls: 2,
            visual_cache_hits: 0,
            render_calls: 1,
            render_cache_hit: false,
        }
    );
    assert_eq!(harness.renderer.calls(), 2);
}

#[tokio::test]
async fn repeated_sentences_are_synthesized_once() {
    let harness = Harness::new(
        &config(),
        MockSynthesizer::slow(Duration::from_millis(10)),
        MockRenderer::default(),
    );

    let outcome = harness.run("Hello. Hello. Goodbye. Hello.", VOICE).await;
    let report = outcome.report().expect("job should complete");

    assert_eq!(report.scenes.len(), 4);
    assert_eq!(harness.synthesizer.calls(), 2);
    assert_eq!(report.stats.synthesis_calls, 2);
    assert_eq!(report.stats.audio_cache_hits, 2);
    assert_eq!(report.stats.compose_calls, 2);
    assert_eq!(report.stats.visual_cache_hits, 2);
    assert!((report.total_duration - 8.0).abs() < 1e-9);
    assert_eq!(harness.cache.len().unwrap(), 2 + 2 + 1);
}

#[tokio::test]
async fn zero_length_audio_fails_as_invalid_audio() {
    let harness = Harness::new(
        &config(),
        MockSynthesizer::with_seconds(vec![0.0]),
        MockRenderer::default(),
    );

    let outcome = harness.run("Hello.", VOICE).await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::InvalidAudio));
    assert_eq!(harness.synthesizer.calls(), 1);
    assert_eq!(harness.renderer.calls(), 0);
}

#[tokio::test]
async fn render_error_is_fatal_without_retry() {
    let renderer = MockRenderer {
        broken: true,
        ..Default::default()
    };
    let harness = Harness::new(&config(), MockSynthesizer::default(), renderer);

    let outcome = harness.run("Hello. This is a test.", VOICE).await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::Render));
    assert_eq!(harness.renderer.calls(), 1);
    assert!(!harness.output().exists());
}

#[tokio::test]
async fn nondeterministic_render_surfaces_cache_conflict() {
    let renderer = MockRenderer {
        drifting: true,
        ..Default::default()
    };
    let harness = Harness::new(&config(), MockSynthesizer::default(), renderer);

    assert!(harness.run("Hello.", VOICE).await.is_completed());
    std::fs::remove_file(harness.output()).unwrap();
    let outcome = harness.run("Hello.", VOICE).await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::CacheConflict));
    assert_eq!(harness.renderer.calls(), 2);
}

#[tokio::test]
async fn scenes_finishing_out_of_order_render_in_index_order() {
    let seconds = vec![1.0, 2.0, 3.0, 4.0];
    let harness = Harness::new(
        &config(),
        MockSynthesizer::finishing_in_reverse(seconds.clone()),
        MockRenderer::default(),
    );

    let outcome = harness.run("One. Two. Three. Four.", VOICE).await;
    let report = outcome.report().expect("job should complete");

    assert_eq!(harness.synthesizer.finished(), vec![3, 2, 1, 0]);
    assert_eq!(
        report.scenes.iter().map(|s| s.index).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    assert_eq!(
        report.scenes.iter().map(|s| s.duration).collect::<Vec<_>>(),
        seconds
    );
    assert_eq!(*harness.renderer.received.lock().unwrap(), vec![seconds]);
    assert!((report.total_duration - 10.0).abs() < 1e-9);
}
