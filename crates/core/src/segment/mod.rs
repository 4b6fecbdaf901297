//! Splits a raw script into ordered scenes.
//!
//! Every sentence becomes its own scene. Sentences that would take longer
//! than the configured scene length to speak are broken on word boundaries.

use crate::{config::SegmentConfig, scene::Scene, Result, ScriptVideoError};

/// Deterministic text-to-scene splitter.
#[derive(Debug, Clone)]
pub struct ScriptSegmenter {
    max_words: usize,
}

impl ScriptSegmenter {
    pub fn new(config: &SegmentConfig) -> Self {
        let budget = (config.max_scene_seconds * config.words_per_second).floor();
        let max_words = if budget.is_finite() && budget >= 1.0 {
            budget as usize
        } else {
            1
        };
        Self { max_words }
    }

    /// Word budget for a single scene.
    pub fn max_words(&self) -> usize {
        self.max_words
    }

    /// Produces scenes indexed in script order.
    pub fn segment(&self, text: &str) -> Result<Vec<Scene>> {
        if text.trim().is_empty() {
            return Err(ScriptVideoError::EmptyInput);
        }

        let scenes = split_sentences(text)
            .iter()
            .flat_map(|sentence| split_by_words(sentence, self.max_words))
            .enumerate()
            .map(|(index, text)| Scene::new(index, text))
            .collect();
        Ok(scenes)
    }
}

fn is_sentence_break(ch: char) -> bool {
    matches!(ch, '.' | '!' | '?' | '。' | '！' | '？' | '\n')
}

fn push_trimmed(units: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        units.push(trimmed.to_string());
    }
    current.clear();
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut units = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        current.push(ch);
        if !is_sentence_break(ch) {
            continue;
        }
        // Keep runs like "?!" or "..." attached to their sentence.
        while let Some(&next) = chars.peek() {
            if next == '\n' || !is_sentence_break(next) {
                break;
            }
            current.push(next);
            chars.next();
        }
        push_trimmed(&mut units, &mut current);
    }
    push_trimmed(&mut units, &mut current);
    units
}

fn split_by_words(sentence: &str, max_words: usize) -> Vec<String> {
    let words: Vec<&str> = sentence.split_whitespace().collect();
    if words.len() <= max_words {
        return vec![words.join(" ")];
    }
    words.chunks(max_words).map(|chunk| chunk.join(" ")).collect()
}
