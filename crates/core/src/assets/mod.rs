//! Content-addressed store for synthesized audio, composed layers and
//! rendered outputs.
//!
//! Entries are write-once per key. Writing the same content twice is a no-op;
//! writing different content under an existing key is a [`CacheConflict`]
//! error, since it means some stage stopped being deterministic. Nothing is
//! evicted except through [`AssetCache::clear`].
//!
//! [`CacheConflict`]: crate::ScriptVideoError::CacheConflict

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    audio::AudioClip, project::AspectRatio, render::RenderedVideo, scene::VisualLayer, Result,
    ScriptVideoError,
};

const INDEX_FILE: &str = "index.json";

/// Deterministic key derived from the semantic inputs of an asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentKey(String);

impl ContentKey {
    /// Key for a scene's synthesized audio.
    pub fn audio(text: &str, voice: &str, aspect: AspectRatio) -> Self {
        Self::digest("audio", &[text, voice, aspect.as_str()])
    }

    /// Key for a scene's composed visual layer. The background image path is
    /// part of the key since the layer embeds it.
    pub fn visual(
        text: &str,
        voice: &str,
        aspect: AspectRatio,
        layout_version: u32,
        background: Option<&Path>,
    ) -> Self {
        let version = layout_version.to_string();
        let image = background.map(|path| format!("image:{}", path.to_string_lossy()));
        let mut parts = vec![text, voice, aspect.as_str(), &version];
        parts.extend(image.as_deref());
        Self::digest("visual", &parts)
    }

    /// Key for a whole rendered video: the ordered scene layers plus the target.
    pub fn render(visuals: &[ContentKey], aspect: AspectRatio, output: &Path) -> Self {
        let output = output.to_string_lossy();
        let mut parts: Vec<&str> = visuals.iter().map(ContentKey::as_str).collect();
        parts.push(aspect.as_str());
        parts.push(&output);
        Self::digest("render", &parts)
    }

    /// Wraps an already computed key.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines and file names.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }

    fn digest(kind: &str, parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        for part in parts {
            // Unit separator keeps ("ab", "c") distinct from ("a", "bc").
            hasher.update([0x1f]);
            hasher.update(part.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CacheEntry {
    Audio(AudioClip),
    Visual(VisualLayer),
    Render(RenderedVideo),
}

/// Shared between all per-scene tasks of a job and reusable across jobs.
#[derive(Debug, Default)]
pub struct AssetCache {
    entries: RwLock<HashMap<ContentKey, CacheEntry>>,
    index_path: Option<PathBuf>,
}

impl AssetCache {
    /// Purely in-memory cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a cache backed by an index file inside `dir`, loading any entries
    /// written by earlier runs.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let index_path = dir.join(INDEX_FILE);
        let entries = if index_path.exists() {
            let raw = std::fs::read_to_string(&index_path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };
        tracing::debug!(path = %index_path.display(), entries = entries.len(), "opened asset cache");

        Ok(Self {
            entries: RwLock::new(entries),
            index_path: Some(index_path),
        })
    }

    pub fn get(&self, key: &ContentKey) -> Result<Option<CacheEntry>> {
        Ok(self.read()?.get(key).cloned())
    }

    pub fn put(&self, key: ContentKey, entry: CacheEntry) -> Result<()> {
        let mut entries = self.write()?;
        match entries.get(&key) {
            Some(existing) if *existing == entry => Ok(()),
            Some(_) => Err(ScriptVideoError::CacheConflict {
                key: key.to_string(),
            }),
            None => {
                entries.insert(key, entry);
                Ok(())
            }
        }
    }

    /// Drops every entry. This is the only way entries leave the cache.
    pub fn clear(&self) -> Result<()> {
        self.write()?.clear();
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    /// Writes the index back to disk. In-memory caches ignore this.
    pub fn save(&self) -> Result<()> {
        let Some(index_path) = &self.index_path else {
            return Ok(());
        };
        let json = {
            let entries = self.read()?;
            serde_json::to_vec_pretty(&*entries)?
        };
        let staging = index_path.with_extension("json.tmp");
        std::fs::write(&staging, json)?;
        std::fs::rename(&staging, index_path)?;
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<ContentKey, CacheEntry>>> {
        self.entries
            .read()
            .map_err(|_| ScriptVideoError::Poisoned("asset cache"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<ContentKey, CacheEntry>>> {
        self.entries
            .write()
            .map_err(|_| ScriptVideoError::Poisoned("asset cache"))
    }
}
