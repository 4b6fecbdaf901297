use serde::{Deserialize, Serialize};

use crate::{audio::AudioClip, scene::CaptionCue, scene::Scene, Result, ScriptVideoError};

/// Timing derived for one scene from its synthesized audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneTiming {
    pub target_duration: f64,
    pub cues: Vec<CaptionCue>,
}

/// Spreads a scene's words over its audio clip.
///
/// No forced alignment is available, so each caption fragment gets a share of
/// the clip proportional to its character count. Cues are contiguous, start at
/// zero and the last one ends exactly at the clip duration.
#[derive(Debug, Clone)]
pub struct TimingAligner {
    max_words_per_cue: usize,
}

impl TimingAligner {
    pub fn new(max_words_per_cue: usize) -> Self {
        Self {
            max_words_per_cue: max_words_per_cue.max(1),
        }
    }

    pub fn align(&self, scene: &Scene, clip: Option<&AudioClip>) -> Result<SceneTiming> {
        let clip = clip.ok_or_else(|| {
            ScriptVideoError::invalid_audio(format!("scene {} has no audio", scene.index()))
        })?;
        let duration = clip.duration;
        if !duration.is_finite() || duration <= 0.0 {
            return Err(ScriptVideoError::invalid_audio(format!(
                "scene {} audio has unusable duration {duration}",
                scene.index()
            )));
        }

        let fragments = self.fragments(scene.text());
        let weights: Vec<usize> = fragments
            .iter()
            .map(|fragment| fragment.chars().count().max(1))
            .collect();
        let total: usize = weights.iter().sum();

        let mut cues = Vec::with_capacity(fragments.len());
        let mut consumed = 0usize;
        let last = fragments.len().saturating_sub(1);
        for (position, (fragment, weight)) in fragments.into_iter().zip(weights).enumerate() {
            let start = duration * consumed as f64 / total as f64;
            consumed += weight;
            let end = if position == last {
                duration
            } else {
                duration * consumed as f64 / total as f64
            };
            cues.push(CaptionCue::new(fragment, start, end));
        }

        Ok(SceneTiming {
            target_duration: duration,
            cues,
        })
    }

    fn fragments(&self, text: &str) -> Vec<String> {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return vec![text.trim().to_string()];
        }
        words
            .chunks(self.max_words_per_cue)
            .map(|chunk| chunk.join(" "))
            .collect()
    }
}
