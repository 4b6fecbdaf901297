//! Drives one generation request from script text to a rendered file.
//!
//! Per-scene synthesis and composition run on a bounded set of tasks; each
//! stage ends at a barrier where every scene's result has been slotted back
//! into the job's scene table by index. Rendering only starts after an explicit
//! duration check across all scenes.

use std::{collections::HashMap, future::Future, path::Path, path::PathBuf, sync::Arc};

use tokio::{
    sync::{mpsc::UnboundedSender, Semaphore},
    task::JoinSet,
};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    assets::{AssetCache, CacheEntry, ContentKey},
    audio::{AudioClip, SpeechSynthesizer, SynthesisRequest},
    config::{AppConfig, GenerationConfig},
    project::Project,
    render::{RenderJob, RenderPipeline, RenderScene, RenderedVideo},
    scene::{ComposeRequest, Composition, LayoutWarning, Scene, SceneComposer, VisualLayer},
    segment::ScriptSegmenter,
    timeline::TimingAligner,
    Result, ScriptVideoError,
};

mod cancel;
mod state;

pub use cancel::CancelHandle;
pub use state::{JobEvent, JobOutcome, JobReport, JobState, JobStats, SceneReport};

use state::StateMachine;

/// Why a job stopped before completing.
#[derive(Debug)]
enum Interrupt {
    Cancelled,
    Failed(ScriptVideoError),
}

impl From<ScriptVideoError> for Interrupt {
    fn from(err: ScriptVideoError) -> Self {
        Self::Failed(err)
    }
}

/// Per-scene slot in the job's scene table. Slot `i` always holds scene `i`.
#[derive(Debug)]
struct SceneSlot {
    scene: Scene,
    audio_key: ContentKey,
    visual_key: ContentKey,
    audio: Option<AudioClip>,
    layer: Option<VisualLayer>,
}

struct SynthesisOutcome {
    clip: AudioClip,
    calls: u32,
}

struct ComposeOutcome {
    composition: Composition,
    cached: bool,
}

pub struct JobOrchestrator {
    segmenter: ScriptSegmenter,
    aligner: TimingAligner,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    composer: Arc<dyn SceneComposer>,
    renderer: Arc<dyn RenderPipeline>,
    cache: Arc<AssetCache>,
    generation: GenerationConfig,
    layout_version: u32,
}

impl JobOrchestrator {
    pub fn new(
        config: &AppConfig,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        composer: Arc<dyn SceneComposer>,
        renderer: Arc<dyn RenderPipeline>,
        cache: Arc<AssetCache>,
    ) -> Self {
        Self {
            segmenter: ScriptSegmenter::new(&config.segment),
            aligner: TimingAligner::new(config.captions.max_words_per_cue),
            synthesizer,
            composer,
            renderer,
            cache,
            generation: config.generation.clone(),
            layout_version: config.captions.layout_version,
        }
    }

    pub fn cache(&self) -> &Arc<AssetCache> {
        &self.cache
    }

    /// Runs one job to a terminal state. Every state change is sent on
    /// `events`; errors from inner stages are folded into the outcome.
    pub async fn run(
        &self,
        project: Project,
        output: PathBuf,
        cancel: &CancelHandle,
        events: Option<UnboundedSender<JobEvent>>,
    ) -> JobOutcome {
        let job_id = Uuid::new_v4();
        let span = tracing::info_span!("job", id = %job_id);
        self.execute(job_id, project, output, cancel, events)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        job_id: Uuid,
        project: Project,
        output: PathBuf,
        cancel: &CancelHandle,
        events: Option<UnboundedSender<JobEvent>>,
    ) -> JobOutcome {
        let mut machine = StateMachine::start(job_id, events);

        let interrupt = match self
            .drive(job_id, &project, &output, cancel, &mut machine)
            .await
        {
            Ok(report) => return JobOutcome::Completed(report),
            Err(interrupt) => interrupt,
        };

        let (terminal, outcome) = match interrupt {
            Interrupt::Cancelled => {
                tracing::info!(state = machine.state().name(), "job cancelled");
                (JobState::Cancelled, JobOutcome::Cancelled)
            }
            Interrupt::Failed(err) => {
                let kind = err.kind();
                let detail = err.to_string();
                tracing::error!(state = machine.state().name(), %kind, %detail, "job failed");
                (
                    JobState::Failed {
                        kind,
                        detail: detail.clone(),
                    },
                    JobOutcome::Failed { kind, detail },
                )
            }
        };
        if let Err(err) = machine.advance(terminal) {
            tracing::warn!(error = %err, "could not record terminal state");
        }
        outcome
    }

    async fn drive(
        &self,
        job_id: Uuid,
        project: &Project,
        output: &Path,
        cancel: &CancelHandle,
        machine: &mut StateMachine,
    ) -> std::result::Result<JobReport, Interrupt> {
        let mut stats = JobStats::default();
        let mut warnings = Vec::new();

        check_cancelled(cancel)?;
        let mut slots = self.segment(project)?;
        let workers = self.generation.workers_for(slots.len());
        tracing::info!(scenes = slots.len(), workers, "script segmented");

        enter(machine, cancel, JobState::Synthesizing)?;
        let synthesized = self.synthesize_all(project, &slots, workers, cancel).await?;
        for (slot, outcome) in slots.iter_mut().zip(synthesized) {
            if outcome.calls == 0 {
                stats.audio_cache_hits += 1;
            }
            stats.synthesis_calls += outcome.calls;
            slot.audio = Some(outcome.clip);
        }

        enter(machine, cancel, JobState::Aligning)?;
        for slot in &mut slots {
            let timing = self.aligner.align(&slot.scene, slot.audio.as_ref())?;
            slot.scene.apply_timing(timing)?;
        }

        enter(machine, cancel, JobState::Composing)?;
        let composed = self.compose_all(project, &slots, workers, cancel).await?;
        for (slot, outcome) in slots.iter_mut().zip(composed) {
            if outcome.cached {
                stats.visual_cache_hits += 1;
            } else {
                stats.compose_calls += 1;
            }
            warnings.extend(outcome.composition.warnings);
            slot.layer = Some(outcome.composition.layer);
        }

        let job = self.render_barrier(project, &slots, output)?;

        enter(machine, cancel, JobState::Rendering)?;
        let rendered = self.render(job, &slots, project, cancel, &mut stats).await?;

        machine.advance(JobState::Completed {
            output: rendered.path.clone(),
        })?;

        Ok(JobReport {
            job_id,
            output: rendered.path,
            scenes: slots
                .iter()
                .map(|slot| SceneReport {
                    index: slot.scene.index(),
                    text: slot.scene.text().to_string(),
                    duration: slot.scene.target_duration().unwrap_or_default(),
                })
                .collect(),
            total_duration: rendered.duration,
            warnings,
            stats,
        })
    }

    fn segment(&self, project: &Project) -> Result<Vec<SceneSlot>> {
        let scenes = self.segmenter.segment(project.script())?;
        Ok(scenes
            .into_iter()
            .map(|scene| SceneSlot {
                audio_key: ContentKey::audio(scene.text(), project.voice(), project.aspect()),
                visual_key: ContentKey::visual(
                    scene.text(),
                    project.voice(),
                    project.aspect(),
                    self.layout_version,
                    project.background().map(PathBuf::as_path),
                ),
                scene,
                audio: None,
                layer: None,
            })
            .collect())
    }

    /// Synthesizes each distinct audio key once and hands the clip to every
    /// scene that shares it. Repeated sentences never race on one output file.
    async fn synthesize_all(
        &self,
        project: &Project,
        slots: &[SceneSlot],
        workers: usize,
        cancel: &CancelHandle,
    ) -> std::result::Result<Vec<SynthesisOutcome>, Interrupt> {
        let groups = KeyGroups::new(slots.iter().map(|slot| &slot.audio_key));
        let requests: Vec<SynthesisRequest> = groups
            .firsts
            .iter()
            .map(|&first| {
                let slot = &slots[first];
                SynthesisRequest {
                    scene_index: slot.scene.index(),
                    text: slot.scene.text().to_string(),
                    voice: project.voice().to_string(),
                    key: slot.audio_key.clone(),
                }
            })
            .collect();

        let distinct = run_stage("synthesis", requests.len(), workers, cancel, |index| {
            synthesize_scene(
                self.synthesizer.clone(),
                self.cache.clone(),
                self.generation.clone(),
                requests[index].clone(),
            )
        })
        .await?;

        Ok(groups.fan_out(&distinct, |outcome, owner| SynthesisOutcome {
            clip: outcome.clip.clone(),
            calls: if owner { outcome.calls } else { 0 },
        }))
    }

    async fn compose_all(
        &self,
        project: &Project,
        slots: &[SceneSlot],
        workers: usize,
        cancel: &CancelHandle,
    ) -> std::result::Result<Vec<ComposeOutcome>, Interrupt> {
        let groups = KeyGroups::new(slots.iter().map(|slot| &slot.visual_key));
        let requests: Vec<ComposeRequest> = groups
            .firsts
            .iter()
            .map(|&first| {
                let slot = &slots[first];
                ComposeRequest {
                    scene: slot.scene.clone(),
                    aspect: project.aspect(),
                    background_image: project.background().cloned(),
                    key: slot.visual_key.clone(),
                }
            })
            .collect();

        let distinct = run_stage("composition", requests.len(), workers, cancel, |index| {
            compose_scene(
                self.composer.clone(),
                self.cache.clone(),
                requests[index].clone(),
            )
        })
        .await?;

        Ok(groups.fan_out(&distinct, |outcome, owner| ComposeOutcome {
            composition: Composition {
                layer: outcome.composition.layer.clone(),
                warnings: if owner {
                    outcome.composition.warnings.clone()
                } else {
                    Vec::new()
                },
            },
            cached: outcome.cached || !owner,
        }))
    }

    /// Checks that every scene holds audio and a layer of the same length
    /// before anything is handed to the render engine.
    fn render_barrier(
        &self,
        project: &Project,
        slots: &[SceneSlot],
        output: &Path,
    ) -> Result<RenderJob> {
        let tolerance = self.generation.duration_tolerance;
        let mut scenes = Vec::with_capacity(slots.len());

        for (position, slot) in slots.iter().enumerate() {
            let index = slot.scene.index();
            if index != position {
                return Err(ScriptVideoError::consistency(format!(
                    "scene {index} found in slot {position}"
                )));
            }
            let (Some(audio), Some(layer), Some(target)) =
                (&slot.audio, &slot.layer, slot.scene.target_duration())
            else {
                return Err(ScriptVideoError::consistency(format!(
                    "scene {index} is incomplete at the render barrier"
                )));
            };
            if (audio.duration - target).abs() > tolerance
                || (layer.duration - target).abs() > tolerance
            {
                return Err(ScriptVideoError::consistency(format!(
                    "scene {index} duration mismatch: audio {:.3}s, visual {:.3}s, target {target:.3}s",
                    audio.duration, layer.duration
                )));
            }
            scenes.push(RenderScene {
                index,
                audio: audio.clone(),
                layer: layer.clone(),
            });
        }

        tracing::info!(scenes = scenes.len(), "render barrier passed");
        Ok(RenderJob {
            scenes,
            aspect: project.aspect(),
            output: output.to_path_buf(),
        })
    }

    async fn render(
        &self,
        job: RenderJob,
        slots: &[SceneSlot],
        project: &Project,
        cancel: &CancelHandle,
        stats: &mut JobStats,
    ) -> std::result::Result<RenderedVideo, Interrupt> {
        let visual_keys: Vec<ContentKey> =
            slots.iter().map(|slot| slot.visual_key.clone()).collect();
        let key = ContentKey::render(&visual_keys, project.aspect(), &job.output);

        if let Some(CacheEntry::Render(video)) = self.cache.get(&key)? {
            if self.renderer.output_available(&video) {
                tracing::info!(path = %video.path.display(), "reusing rendered output");
                stats.render_cache_hit = true;
                return Ok(video);
            }
        }

        let output = job.output.clone();
        let expected_order = job.scene_order();
        let planned = job.total_duration();
        stats.render_calls += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                discard_partial_output(&output).await;
                return Err(Interrupt::Cancelled);
            }
            result = self.renderer.render(job) => result,
        };

        let video = match result {
            Ok(video) => video,
            Err(err) => {
                if let ScriptVideoError::PartialWrite { path, .. } = &err {
                    discard_partial_output(path).await;
                }
                return Err(err.into());
            }
        };

        if video.scene_order != expected_order {
            return Err(ScriptVideoError::consistency(format!(
                "render engine reordered scenes: expected {expected_order:?}, got {:?}",
                video.scene_order
            ))
            .into());
        }
        let allowed = self.generation.render_tolerance_per_scene * expected_order.len() as f64;
        if (video.duration - planned).abs() > allowed.max(self.generation.duration_tolerance) {
            return Err(ScriptVideoError::consistency(format!(
                "rendered duration {:.3}s differs from planned {planned:.3}s",
                video.duration
            ))
            .into());
        }

        self.cache.put(key, CacheEntry::Render(video.clone()))?;
        tracing::info!(path = %video.path.display(), duration = video.duration, "render finished");
        Ok(video)
    }
}

/// Slots grouped by content key, so per-key work runs once per job.
struct KeyGroups {
    /// First slot holding each distinct key, in slot order.
    firsts: Vec<usize>,
    /// For every slot, the position of its key in `firsts`.
    group_of: Vec<usize>,
}

impl KeyGroups {
    fn new<'a>(keys: impl Iterator<Item = &'a ContentKey>) -> Self {
        let mut seen: HashMap<&ContentKey, usize> = HashMap::new();
        let mut firsts = Vec::new();
        let mut group_of = Vec::new();
        for (slot, key) in keys.enumerate() {
            let group = *seen.entry(key).or_insert_with(|| {
                firsts.push(slot);
                firsts.len() - 1
            });
            group_of.push(group);
        }
        if firsts.len() < group_of.len() {
            tracing::debug!(
                slots = group_of.len(),
                distinct = firsts.len(),
                "scenes share content keys"
            );
        }
        Self { firsts, group_of }
    }

    /// Expands one result per distinct key back to one per slot. `owner` is
    /// true for the slot whose task produced the result.
    fn fan_out<T, U>(&self, results: &[T], mut expand: impl FnMut(&T, bool) -> U) -> Vec<U> {
        self.group_of
            .iter()
            .enumerate()
            .map(|(slot, &group)| expand(&results[group], self.firsts[group] == slot))
            .collect()
    }
}

fn check_cancelled(cancel: &CancelHandle) -> std::result::Result<(), Interrupt> {
    if cancel.is_cancelled() {
        Err(Interrupt::Cancelled)
    } else {
        Ok(())
    }
}

fn enter(
    machine: &mut StateMachine,
    cancel: &CancelHandle,
    next: JobState,
) -> std::result::Result<(), Interrupt> {
    check_cancelled(cancel)?;
    machine.advance(next)?;
    Ok(())
}

/// Runs `count` per-scene tasks with at most `workers` in flight and returns
/// their results in scene order. The first error or a cancellation aborts every
/// task still running.
async fn run_stage<T, F, Fut>(
    stage: &'static str,
    count: usize,
    workers: usize,
    cancel: &CancelHandle,
    mut make: F,
) -> std::result::Result<Vec<T>, Interrupt>
where
    T: Send + 'static,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(workers));
    let mut tasks = JoinSet::new();
    for index in 0..count {
        let permits = permits.clone();
        let work = make(index);
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            (index, work.await)
        });
    }

    let mut results: Vec<Option<T>> = std::iter::repeat_with(|| None).take(count).collect();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tasks.abort_all();
                tracing::info!(stage, "abandoning in-flight scene tasks");
                return Err(Interrupt::Cancelled);
            }
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok((index, Ok(value)))) => results[index] = Some(value),
                Some(Ok((index, Err(err)))) => {
                    tasks.abort_all();
                    tracing::warn!(stage, scene = index, error = %err, "scene task failed");
                    return Err(Interrupt::Failed(err));
                }
                Some(Err(join_err)) => {
                    tasks.abort_all();
                    return Err(Interrupt::Failed(ScriptVideoError::consistency(format!(
                        "{stage} task did not finish: {join_err}"
                    ))));
                }
            },
        }
    }

    results
        .into_iter()
        .enumerate()
        .map(|(index, result)| {
            result.ok_or_else(|| {
                Interrupt::Failed(ScriptVideoError::consistency(format!(
                    "scene {index} produced no {stage} result"
                )))
            })
        })
        .collect()
}

async fn synthesize_scene(
    synthesizer: Arc<dyn SpeechSynthesizer>,
    cache: Arc<AssetCache>,
    generation: GenerationConfig,
    request: SynthesisRequest,
) -> Result<SynthesisOutcome> {
    if let Some(CacheEntry::Audio(clip)) = cache.get(&request.key)? {
        tracing::debug!(scene = request.scene_index, key = request.key.short(), "audio cache hit");
        return Ok(SynthesisOutcome { clip, calls: 0 });
    }

    let mut attempt = 1;
    loop {
        match synthesizer.synthesize(request.clone()).await {
            Ok(clip) => {
                cache.put(request.key.clone(), CacheEntry::Audio(clip.clone()))?;
                return Ok(SynthesisOutcome {
                    clip,
                    calls: attempt,
                });
            }
            Err(err) if err.is_retryable() && attempt < generation.max_attempts => {
                let delay = generation.backoff(attempt);
                tracing::warn!(
                    scene = request.scene_index,
                    attempt,
                    max_attempts = generation.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "synthesis failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn compose_scene(
    composer: Arc<dyn SceneComposer>,
    cache: Arc<AssetCache>,
    request: ComposeRequest,
) -> Result<ComposeOutcome> {
    let key = request.key.clone();
    if let Some(CacheEntry::Visual(layer)) = cache.get(&key)? {
        tracing::debug!(scene = request.scene.index(), key = key.short(), "visual cache hit");
        return Ok(ComposeOutcome {
            composition: Composition {
                layer,
                warnings: Vec::<LayoutWarning>::new(),
            },
            cached: true,
        });
    }

    let composition = composer.compose(request).await?;
    cache.put(key, CacheEntry::Visual(composition.layer.clone()))?;
    Ok(ComposeOutcome {
        composition,
        cached: false,
    })
}

async fn discard_partial_output(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::info!(path = %path.display(), "removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove partial output"),
    }
}
