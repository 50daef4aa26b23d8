//! Build cache: maps chained step keys to committed layers.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use berth_shared::errors::{BerthError, BerthResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::deps::ResolvedPackage;

/// Key of a step: `sha256(parent | instruction | input)`.
///
/// Chaining the parent key means a change in any earlier step invalidates
/// every later one.
pub fn cache_key(parent: &str, instruction: &str, input_digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.as_bytes());
    hasher.update(b"|");
    hasher.update(instruction.as_bytes());
    hasher.update(b"|");
    hasher.update(input_digest.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Digest of the layer the step produced.
    pub layer: String,

    /// Resolved set recorded by an `INSTALL` step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<ResolvedPackage>,

    /// Instruction text, for humans reading the file.
    pub instruction: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct CacheFile {
    version: String,
    entries: BTreeMap<String, CacheEntry>,
}

/// On-disk build cache (`cache.json`).
#[derive(Debug)]
pub struct BuildCache {
    path: PathBuf,
    entries: BTreeMap<String, CacheEntry>,
    dirty: bool,
}

impl BuildCache {
    /// Load the cache. A missing or corrupt file yields an empty cache.
    pub fn load(path: &Path) -> Self {
        let entries = match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<CacheFile>(&contents) {
                Ok(file) => file.entries,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Corrupted build cache, starting empty: {}", e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to read build cache, starting empty: {}", e);
                BTreeMap::new()
            }
        };

        Self {
            path: path.to_path_buf(),
            entries,
            dirty: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: String, entry: CacheEntry) {
        self.entries.insert(key, entry);
        self.dirty = true;
    }

    /// Distinct layer digests referenced by the cache.
    pub fn layers(&self) -> BTreeSet<String> {
        self.entries.values().map(|e| e.layer.clone()).collect()
    }

    /// Drop entries whose layer fails `keep`. Returns how many were dropped.
    pub fn retain_layers(&mut self, keep: impl Fn(&str) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| keep(&entry.layer));
        let dropped = before - self.entries.len();
        if dropped > 0 {
            self.dirty = true;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist new entries (temp file + rename). No-op when nothing changed.
    pub fn save(&mut self) -> BerthResult<()> {
        if !self.dirty {
            return Ok(());
        }

        let file = CacheFile {
            version: "1.0".to_string(),
            entries: self.entries.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        let temp_path = self
            .path
            .with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));

        std::fs::write(&temp_path, json)
            .map_err(|e| BerthError::Storage(format!("failed to write build cache: {e}")))?;
        std::fs::rename(&temp_path, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            BerthError::Storage(format!("failed to replace build cache: {e}"))
        })?;

        self.dirty = false;
        tracing::debug!(entries = self.entries.len(), "Saved build cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(layer: &str) -> CacheEntry {
        CacheEntry {
            layer: layer.into(),
            packages: Vec::new(),
            instruction: "COPY . .".into(),
        }
    }

    #[test]
    fn test_key_depends_on_every_part() {
        let key = cache_key("p", "COPY . .", "d");
        assert_eq!(key, cache_key("p", "COPY . .", "d"));
        assert_ne!(key, cache_key("q", "COPY . .", "d"));
        assert_ne!(key, cache_key("p", "COPY . /srv", "d"));
        assert_ne!(key, cache_key("p", "COPY . .", "e"));
    }

    #[test]
    fn test_save_and_reload() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("cache.json");

        let mut cache = BuildCache::load(&path);
        assert!(cache.is_empty());
        cache.insert("k".into(), entry("sha256:aa"));
        cache.save().unwrap();

        let reloaded = BuildCache::load(&path);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("k"), Some(&entry("sha256:aa")));
    }

    #[test]
    fn test_entries_with_missing_layers_are_dropped() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("cache.json");

        let mut cache = BuildCache::load(&path);
        cache.insert("a".into(), entry("sha256:aa"));
        cache.insert("b".into(), entry("sha256:bb"));
        cache.insert("c".into(), entry("sha256:bb"));
        cache.save().unwrap();

        let mut cache = BuildCache::load(&path);
        assert_eq!(cache.layers().len(), 2);
        assert_eq!(cache.retain_layers(|layer| layer == "sha256:aa"), 2);
        assert_eq!(cache.retain_layers(|_| true), 0);
        cache.save().unwrap();

        let reloaded = BuildCache::load(&path);
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.get("a").is_some());
        assert!(reloaded.get("b").is_none());
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("cache.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(BuildCache::load(&path).is_empty());
    }
}
