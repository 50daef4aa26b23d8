//! Image index: maps tags to locally stored images.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use berth_shared::errors::{BerthError, BerthResult};

use crate::runtime::constants::filenames;

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// Index of local images.
///
/// Maps tags (e.g., "myservice:1.0", "docker.io/library/python:3.12-slim")
/// to image records. Serialized as JSON for human readability.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImageIndex {
    /// Schema version for future compatibility
    pub version: String,

    /// Map of tag -> image record
    pub images: BTreeMap<String, ImageRecord>,
}

/// Metadata for a tagged image.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// Image id (sha256 of the canonical image config)
    pub image_id: String,

    /// Layer digests in order
    pub layers: Vec<String>,

    /// Registry manifest digest for pulled images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_digest: Option<String>,

    /// When the tag was written (RFC 3339)
    pub created_at: String,

    /// Whether all blobs were committed before tagging
    pub complete: bool,
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

impl Default for ImageIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageIndex {
    pub fn new() -> Self {
        Self {
            version: "1.0".to_string(),
            images: BTreeMap::new(),
        }
    }

    /// Load index from disk
    ///
    /// Returns empty index if file doesn't exist or is corrupted.
    pub fn load(images_dir: &Path) -> Self {
        let index_path = images_dir.join(filenames::IMAGE_INDEX);

        if !index_path.exists() {
            tracing::debug!("Index file not found, creating new index");
            return Self::new();
        }

        match std::fs::read_to_string(&index_path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(index) => {
                    tracing::debug!("Loaded index with {} images", index.len());
                    index
                }
                Err(e) => {
                    tracing::warn!("Corrupted index file, creating new: {}", e);
                    Self::new()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read index file, creating new: {}", e);
                Self::new()
            }
        }
    }

    /// Save index to disk (write to a temp file, then rename).
    pub fn save(&self, images_dir: &Path) -> BerthResult<()> {
        let index_path = images_dir.join(filenames::IMAGE_INDEX);
        let temp_path = index_path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BerthError::Storage(format!("failed to serialize index: {e}")))?;

        std::fs::write(&temp_path, json)
            .map_err(|e| BerthError::Storage(format!("failed to write index: {e}")))?;
        std::fs::rename(&temp_path, &index_path).map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            BerthError::Storage(format!("failed to replace index: {e}"))
        })?;

        tracing::debug!("Saved index with {} images", self.images.len());
        Ok(())
    }

    pub fn get(&self, tag: &str) -> Option<&ImageRecord> {
        self.images.get(tag)
    }

    /// Find a record by full image id or an unambiguous hex prefix of it.
    pub fn find_by_id(&self, id: &str) -> Option<&ImageRecord> {
        let hex = id.strip_prefix("sha256:").unwrap_or(id);
        if hex.is_empty() {
            return None;
        }

        let mut matches = self
            .images
            .values()
            .filter(|r| r.image_id.trim_start_matches("sha256:").starts_with(hex));
        let first = matches.next()?;
        if matches.all(|r| r.image_id == first.image_id) {
            Some(first)
        } else {
            None
        }
    }

    /// Add or move a tag.
    pub fn upsert(&mut self, tag: String, record: ImageRecord) -> Option<ImageRecord> {
        self.images.insert(tag, record)
    }

    pub fn remove(&mut self, tag: &str) -> Option<ImageRecord> {
        self.images.remove(tag)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
