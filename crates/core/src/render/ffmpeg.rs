use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use super::{RenderJob, RenderPipeline, RenderScene, RenderedVideo};
use crate::{
    audio::probe_duration,
    config::RenderConfig,
    scene::{Background, TransitionKind, VisualLayer},
    Result, ScriptVideoError,
};

/// Renders through the system `ffmpeg` binary: one encoded segment per scene,
/// then a stream-copy concat into the output file.
#[derive(Debug, Clone)]
pub struct FfmpegRenderer {
    ffmpeg: String,
    ffprobe: String,
    fps: u32,
    work_dir: PathBuf,
}

impl FfmpegRenderer {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            ffprobe: config.ffprobe.clone(),
            fps: config.fps,
            work_dir: config.work_dir.clone(),
        }
    }

    pub async fn is_available(&self) -> bool {
        Command::new(&self.ffmpeg)
            .arg("-version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn render_segment(&self, scene: &RenderScene, dir: &Path) -> Result<PathBuf> {
        let mut caption_files = Vec::with_capacity(scene.layer.overlays.len());
        for (cue, overlay) in scene.layer.overlays.iter().enumerate() {
            let path = dir.join(format!("caption-{:04}-{cue:02}.txt", scene.index));
            tokio::fs::write(&path, &overlay.text).await?;
            caption_files.push(path);
        }

        let segment = dir.join(format!("scene-{:04}.mp4", scene.index));
        let args = segment_args(scene, &caption_files, self.fps, &segment);
        tracing::debug!(scene = scene.index, path = %segment.display(), "encoding scene segment");

        let output = Command::new(&self.ffmpeg).args(&args).output().await.map_err(|e| {
            ScriptVideoError::render(format!("failed to spawn {}: {e}", self.ffmpeg))
        })?;
        if !output.status.success() {
            return Err(ScriptVideoError::render(format!(
                "scene {} segment failed: {}",
                scene.index,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(segment)
    }

    async fn concat(&self, segments: &[PathBuf], dir: &Path, output: &Path) -> Result<()> {
        let list = dir.join("segments.txt");
        tokio::fs::write(&list, concat_list(segments)).await?;

        let result = Command::new(&self.ffmpeg)
            .args(["-y", "-loglevel", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list)
            .args(["-c", "copy", "-movflags", "+faststart"])
            .arg(output)
            .output()
            .await;

        let detail = match result {
            Ok(out) if out.status.success() => return Ok(()),
            Ok(out) => String::from_utf8_lossy(&out.stderr).trim().to_string(),
            Err(e) => format!("failed to spawn {}: {e}", self.ffmpeg),
        };
        Err(ScriptVideoError::PartialWrite {
            path: output.to_path_buf(),
            detail,
        })
    }

    async fn render_in(&self, job: &RenderJob, dir: &Path) -> Result<RenderedVideo> {
        let mut segments = Vec::with_capacity(job.scenes.len());
        for scene in &job.scenes {
            segments.push(self.render_segment(scene, dir).await?);
        }
        self.concat(&segments, dir, &job.output).await?;

        let duration = probe_duration(&self.ffprobe, &job.output)
            .await
            .map_err(|e| ScriptVideoError::render(e.to_string()))?;
        Ok(RenderedVideo {
            path: job.output.clone(),
            duration,
            scene_order: job.scene_order(),
        })
    }
}

#[async_trait]
impl RenderPipeline for FfmpegRenderer {
    async fn render(&self, job: RenderJob) -> Result<RenderedVideo> {
        if job.scenes.is_empty() {
            return Err(ScriptVideoError::render("nothing to render"));
        }
        if let Some(parent) = job.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let dir = self
            .work_dir
            .join(format!("render-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&dir).await?;

        let result = self.render_in(&job, &dir).await;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::warn!(path = %dir.display(), error = %e, "failed to remove render scratch dir");
        }
        result
    }
}

fn segment_args(scene: &RenderScene, captions: &[PathBuf], fps: u32, out: &Path) -> Vec<String> {
    let layer = &scene.layer;
    let duration = format!("{:.3}", millis(layer.duration));
    let size = format!("{}x{}", layer.width, layer.height);
    let mut args: Vec<String> = vec!["-y".into(), "-loglevel".into(), "error".into()];

    match &layer.background {
        Background::Solid { color } => {
            args.extend([
                "-f".into(),
                "lavfi".into(),
                "-i".into(),
                format!("color=c={color}:s={size}:r={fps}:d={duration}"),
            ]);
        }
        Background::KenBurns { image, .. } => {
            args.extend([
                "-loop".into(),
                "1".into(),
                "-framerate".into(),
                fps.to_string(),
                "-i".into(),
                image.to_string_lossy().into_owned(),
            ]);
        }
    }
    args.extend(["-i".into(), scene.audio.location.to_string_lossy().into_owned()]);

    args.extend([
        "-filter_complex".into(),
        filter_graph(layer, captions, fps),
        "-map".into(),
        "[v]".into(),
        "-map".into(),
        "[a]".into(),
        "-t".into(),
        duration,
        "-r".into(),
        fps.to_string(),
        "-c:v".into(),
        "libx264".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-c:a".into(),
        "aac".into(),
        "-ar".into(),
        "48000".into(),
    ]);
    args.push(out.to_string_lossy().into_owned());
    args
}

fn filter_graph(layer: &VisualLayer, captions: &[PathBuf], fps: u32) -> String {
    let (w, h) = (layer.width, layer.height);
    let mut video = match &layer.background {
        Background::Solid { .. } => vec!["null".to_string()],
        Background::KenBurns {
            from_zoom, to_zoom, ..
        } => {
            let frames = (layer.duration * fps as f64).ceil().max(1.0);
            vec![
                format!("scale={}:{}:force_original_aspect_ratio=increase", w * 2, h * 2),
                format!("crop={}:{}", w * 2, h * 2),
                format!(
                    "zoompan=z='{from_zoom}+({to_zoom}-{from_zoom})*on/{frames}':x='iw/2-(iw/zoom/2)':y='ih/2-(ih/zoom/2)':d=1:s={w}x{h}:fps={fps}"
                ),
            ]
        }
    };

    for (overlay, file) in layer.overlays.iter().zip(captions) {
        video.push(format!(
            "drawtext=textfile={}:fontsize={}:fontcolor=white:borderw=4:bordercolor=black:x={}-text_w/2:y={}-text_h:enable='between(t,{:.3},{:.3})'",
            escape_filter_path(file),
            overlay.font_size,
            overlay.x,
            overlay.y,
            overlay.start,
            overlay.end,
        ));
    }

    if layer.transition_in.kind == TransitionKind::Fade && layer.transition_in.duration > 0.0 {
        video.push(format!("fade=t=in:st=0:d={:.3}", layer.transition_in.duration));
    }
    if layer.transition_out.kind == TransitionKind::Fade && layer.transition_out.duration > 0.0 {
        let d = millis(layer.transition_out.duration);
        let start = (millis(layer.duration) - d).max(0.0);
        video.push(format!("fade=t=out:st={start:.3}:d={d:.3}"));
    }

    format!("[0:v]{}[v];[1:a]apad[a]", video.join(","))
}

/// Rounds to the millisecond precision used on the command line, so `-t` and
/// fade offsets agree.
fn millis(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

/// Quotes a path for use as a filter option value. The option parser needs
/// `:` and `'` backslash-escaped; the graph parser then gets the result in
/// single quotes, where a quote can only be written as `'\''`.
fn escape_filter_path(path: &Path) -> String {
    let option = path
        .to_string_lossy()
        .replace('\\', "/")
        .replace(':', "\\:")
        .replace('\'', "\\'");
    format!("'{}'", option.replace('\'', "'\\''"))
}

fn concat_list(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|segment| {
            format!(
                "file '{}'\n",
                segment.to_string_lossy().replace('\'', "'\\''")
            )
        })
        .collect()
}
