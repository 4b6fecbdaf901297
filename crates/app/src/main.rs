use std::{path::Path, path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Args, Parser, Subcommand};
use script_video_core::{
    AppConfig, AspectRatio, AssetCache, CancelHandle, CommandSynthesizer, FfmpegRenderer,
    JobEvent, JobOrchestrator, JobOutcome, JobState, LayoutComposer, Project, ScriptSegmenter,
    ScriptVideoError,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> script_video_core::Result<ExitCode> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate(args) => run_generate(args).await,
        Commands::Segment { input, config } => {
            run_segment(&input, config.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Voices => {
            for voice in script_video_core::voices() {
                println!("{voice}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::ClearCache { cache_dir, config } => {
            run_clear_cache(cache_dir, config.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_generate(args: GenerateArgs) -> script_video_core::Result<ExitCode> {
    let config = load_config(args.config.as_deref())?;
    let aspect: AspectRatio = args.aspect.parse()?;
    let script = args.input.read()?;
    let cache_dir = args.cache_dir.unwrap_or_else(|| config.cache.dir.clone());

    let mut project = Project::new(script, aspect, &args.voice);
    if let Some(image) = &args.background {
        project = project.with_background(image);
    }
    tracing::info!(voice = %args.voice, aspect = %aspect, output = ?args.output, "starting generation");

    let cache = Arc::new(AssetCache::open(&cache_dir)?);
    let synthesizer = CommandSynthesizer::new(cache_dir.join("audio"))
        .with_ffprobe(config.render.ffprobe.clone());
    let composer = LayoutComposer::new(
        config.render.transition_seconds,
        config.captions.layout_version,
    )
    .with_work_dir(config.render.work_dir.join("layers"));
    let renderer = FfmpegRenderer::new(&config.render);
    if !renderer.is_available().await {
        tracing::warn!(ffmpeg = %config.render.ffmpeg, "ffmpeg not found, rendering will fail");
    }

    let orchestrator = JobOrchestrator::new(
        &config,
        Arc::new(synthesizer),
        Arc::new(composer),
        Arc::new(renderer),
        cache.clone(),
    );

    let cancel = CancelHandle::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling job");
                cancel.cancel();
            }
        })
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let progress = tokio::spawn(log_events(rx));

    let outcome = orchestrator.run(project, args.output, &cancel, Some(tx)).await;
    ctrl_c.abort();
    // The sender went away with the job, so this drains and returns.
    let _ = progress.await;

    if config.cache.persist {
        cache.save()?;
    }

    match outcome {
        JobOutcome::Completed(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        JobOutcome::Failed { kind, detail } => {
            eprintln!("generation failed ({kind}): {detail}");
            Ok(ExitCode::FAILURE)
        }
        JobOutcome::Cancelled => {
            eprintln!("generation cancelled");
            Ok(ExitCode::from(130))
        }
    }
}

async fn log_events(mut rx: mpsc::UnboundedReceiver<JobEvent>) {
    while let Some(event) = rx.recv().await {
        match &event.state {
            JobState::Completed { output } => {
                tracing::info!(job = %event.job_id, output = %output.display(), "completed")
            }
            JobState::Failed { kind, detail } => {
                tracing::error!(job = %event.job_id, %kind, %detail, "failed")
            }
            state => tracing::info!(job = %event.job_id, state = state.name(), "progress"),
        }
    }
}

fn run_segment(input: &ScriptInput, config: Option<&Path>) -> script_video_core::Result<()> {
    let config = load_config(config)?;
    let segmenter = ScriptSegmenter::new(&config.segment);
    let scenes = segmenter.segment(&input.read()?)?;
    println!("{}", serde_json::to_string_pretty(&scenes)?);
    Ok(())
}

fn run_clear_cache(
    cache_dir: Option<PathBuf>,
    config: Option<&Path>,
) -> script_video_core::Result<()> {
    let config = load_config(config)?;
    let dir = cache_dir.unwrap_or(config.cache.dir);
    let cache = AssetCache::open(&dir)?;
    let removed = cache.len()?;
    cache.clear()?;
    cache.save()?;

    let audio = dir.join("audio");
    if audio.exists() {
        std::fs::remove_dir_all(&audio)?;
    }
    tracing::info!(dir = %dir.display(), removed, "cache cleared");
    Ok(())
}

fn load_config(path: Option<&Path>) -> script_video_core::Result<AppConfig> {
    match path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading configuration");
            AppConfig::load(path)
        }
        None => Ok(AppConfig::default()),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Turn a text script into a narrated short-form video", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a video from a script.
    Generate(GenerateArgs),
    /// Print how a script would be split into scenes.
    Segment {
        #[command(flatten)]
        input: ScriptInput,
        /// Optional JSON configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List the supported narration voices.
    Voices,
    /// Remove every cached asset.
    ClearCache {
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[command(flatten)]
    input: ScriptInput,
    /// Narration voice, see `voices`.
    #[arg(long)]
    voice: String,
    /// Output aspect ratio: 9:16, 16:9 or 1:1.
    #[arg(long, default_value = "9:16")]
    aspect: String,
    /// Where the final video is written.
    #[arg(short, long)]
    output: PathBuf,
    /// Image slowly zoomed behind the captions.
    #[arg(long)]
    background: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the cache directory from the configuration.
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct ScriptInput {
    /// Script text passed inline.
    #[arg(long)]
    text: Option<String>,
    /// File containing the script.
    #[arg(long)]
    script: Option<PathBuf>,
}

impl ScriptInput {
    fn read(&self) -> script_video_core::Result<String> {
        match (&self.text, &self.script) {
            (Some(text), _) => Ok(text.clone()),
            (None, Some(path)) => Ok(std::fs::read_to_string(path)?),
            (None, None) => Err(ScriptVideoError::EmptyInput),
        }
    }
}
