//! Image blob storage operations.
//!
//! Low-level storage of layers, image configs and registry manifests with
//! digest-based naming and integrity verification.
//!
//! Does NOT handle:
//! - Tag bookkeeping (ImageIndex's responsibility)
//! - Registry communication (ImageStore's responsibility)

use std::path::{Path, PathBuf};

use oci_client::manifest::OciManifest;
use sha2::{Digest, Sha256};

use crate::images::config::ImageConfig;
use crate::runtime::layout::ImageFilesystemLayout;
use berth_shared::errors::{BerthError, BerthResult};

// ============================================================================
// IMAGE STORAGE
// ============================================================================

/// Manages persistent storage of image blobs.
pub struct ImageStorage {
    layout: ImageFilesystemLayout,
}

impl std::fmt::Debug for ImageStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageStorage")
            .field("images_dir", &self.layout.root())
            .finish()
    }
}

impl ImageStorage {
    /// Create new image storage for the given images directory
    pub fn new(images_dir: PathBuf) -> BerthResult<Self> {
        let layout = ImageFilesystemLayout::new(images_dir);
        layout.prepare()?;
        Ok(Self { layout })
    }

    // ========================================================================
    // MANIFEST OPERATIONS
    // ========================================================================

    /// Save a registry manifest using its digest as filename.
    pub fn save_manifest(&self, manifest: &OciManifest, digest: &str) -> BerthResult<()> {
        let manifest_path = self.manifest_path(digest);

        if manifest_path.exists() {
            tracing::debug!("Manifest already exists: {}", digest);
            return Ok(());
        }

        let manifest_json = serde_json::to_string_pretty(manifest)
            .map_err(|e| BerthError::Storage(format!("Failed to serialize manifest: {}", e)))?;

        std::fs::write(&manifest_path, manifest_json).map_err(|e| {
            BerthError::Storage(format!(
                "Failed to write manifest to {}: {}",
                manifest_path.display(),
                e
            ))
        })?;

        tracing::debug!("Saved manifest: {}", digest);
        Ok(())
    }

    pub fn manifest_path(&self, digest: &str) -> PathBuf {
        self.layout
            .manifests_dir()
            .join(format!("{}.json", digest.replace(':', "-")))
    }

    // ========================================================================
    // LAYER OPERATIONS
    // ========================================================================

    pub fn has_layer(&self, digest: &str) -> bool {
        self.layer_tarball_path(digest).exists()
    }

    /// Verify layer integrity by recomputing its SHA256.
    pub async fn verify_layer(&self, digest: &str) -> BerthResult<bool> {
        let layer_path = self.layer_tarball_path(digest);
        if !layer_path.exists() {
            return Ok(false);
        }

        let computed = sha256_file(&layer_path).await?;
        if computed != digest {
            tracing::error!(
                expected = %digest,
                computed = %computed,
                "Layer integrity check failed"
            );
            return Ok(false);
        }
        Ok(true)
    }

    pub fn layer_tarball_path(&self, digest: &str) -> PathBuf {
        self.layout
            .layers_dir()
            .join(format!("{}.tar.gz", digest.replace(':', "-")))
    }

    /// Move a locally produced layer into the store under its digest.
    ///
    /// The caller computed `digest` while writing `staged`. If the blob is
    /// already present the staged file is discarded.
    pub fn commit_layer(&self, staged: &Path, digest: &str) -> BerthResult<PathBuf> {
        let final_path = self.layer_tarball_path(digest);

        if final_path.exists() {
            let _ = std::fs::remove_file(staged);
            tracing::trace!("Layer {} already stored", digest);
            return Ok(final_path);
        }

        std::fs::rename(staged, &final_path).map_err(|e| {
            BerthError::Storage(format!(
                "Failed to move {} to {}: {}",
                staged.display(),
                final_path.display(),
                e
            ))
        })?;

        tracing::debug!(digest = %digest, "Committed layer");
        Ok(final_path)
    }

    /// Start a staged download for a layer blob.
    pub async fn stage_layer_download(&self, digest: &str) -> BerthResult<StagedDownload> {
        let final_path = self.layer_tarball_path(digest);
        StagedDownload::create(&self.layout.layers_dir(), digest, final_path).await
    }

    // ========================================================================
    // CONFIG OPERATIONS
    // ========================================================================

    pub fn has_config(&self, digest: &str) -> bool {
        self.config_path(digest).exists()
    }

    pub fn config_path(&self, digest: &str) -> PathBuf {
        self.layout
            .configs_dir()
            .join(format!("{}.json", digest.replace(':', "-")))
    }

    /// Store an image config under its image id and return the id.
    pub fn save_config(&self, config: &ImageConfig) -> BerthResult<String> {
        let image_id = config.image_id()?;
        let config_path = self.config_path(&image_id);
        if config_path.exists() {
            return Ok(image_id);
        }

        std::fs::write(&config_path, config.canonical_bytes()?).map_err(|e| {
            BerthError::Storage(format!(
                "Failed to write config {}: {}",
                config_path.display(),
                e
            ))
        })?;
        Ok(image_id)
    }

    /// Load an image config by image id.
    pub fn load_config(&self, image_id: &str) -> BerthResult<ImageConfig> {
        let raw = self.load_raw_config(image_id)?;
        serde_json::from_str(&raw).map_err(|e| {
            BerthError::Storage(format!("Failed to parse image config {}: {}", image_id, e))
        })
    }

    /// Load a config blob as a string (registry configs are parsed by the caller).
    pub fn load_raw_config(&self, digest: &str) -> BerthResult<String> {
        let config_path = self.config_path(digest);

        if !config_path.exists() {
            return Err(BerthError::NotFound(format!("config blob {}", digest)));
        }

        std::fs::read_to_string(&config_path).map_err(|e| {
            BerthError::Storage(format!(
                "Failed to read config {}: {}",
                config_path.display(),
                e
            ))
        })
    }

    /// Start a staged download for a registry config blob.
    pub async fn stage_config_download(&self, digest: &str) -> BerthResult<StagedDownload> {
        let final_path = self.config_path(digest);
        StagedDownload::create(&self.layout.configs_dir(), digest, final_path).await
    }

    // ========================================================================
    // UTILITY OPERATIONS
    // ========================================================================

    /// Verify all blobs for given layer digests exist on disk.
    pub fn verify_blobs_exist(&self, layer_digests: &[String]) -> bool {
        layer_digests.iter().all(|digest| self.has_layer(digest))
    }

    pub fn images_dir(&self) -> &Path {
        self.layout.root()
    }

    pub fn layers_dir(&self) -> PathBuf {
        self.layout.layers_dir()
    }
}

/// Stream a file through SHA256, returning `sha256:<hex>`.
pub async fn sha256_file(path: &Path) -> BerthResult<String> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| BerthError::Storage(format!("Failed to open {}: {}", path.display(), e)))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buffer)
            .await
            .map_err(|e| BerthError::Storage(format!("Failed to read {}: {}", path.display(), e)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("sha256:{:x}", hasher.finalize()))
}

// ============================================================================
// STAGED DOWNLOAD
// ============================================================================

/// Handle for an in-progress download with atomic commit semantics.
///
/// Downloads to a temp file first, then verifies integrity and atomically
/// moves to the final location. The temp file uses a random suffix so
/// parallel downloads of the same blob cannot collide.
pub struct StagedDownload {
    staged_path: PathBuf,
    final_path: PathBuf,
    expected_digest: String,
    file: Option<tokio::fs::File>,
}

impl StagedDownload {
    async fn create(dir: &Path, digest: &str, final_path: PathBuf) -> BerthResult<Self> {
        if !digest.starts_with("sha256:") {
            return Err(BerthError::Storage(format!(
                "Invalid digest format, expected sha256: got {}",
                digest
            )));
        }

        let staged_path = dir.join(format!(
            "{}.{}.downloading",
            digest.replace(':', "-"),
            uuid::Uuid::new_v4().simple()
        ));

        let file = tokio::fs::File::create(&staged_path).await.map_err(|e| {
            BerthError::Storage(format!(
                "Failed to create temp file {}: {}",
                staged_path.display(),
                e
            ))
        })?;

        Ok(Self {
            staged_path,
            final_path,
            expected_digest: digest.to_string(),
            file: Some(file),
        })
    }

    /// Get mutable reference to the file for writing
    pub fn file(&mut self) -> BerthResult<&mut tokio::fs::File> {
        self.file
            .as_mut()
            .ok_or_else(|| BerthError::InvalidState("staged file already consumed".into()))
    }

    /// Verify integrity and atomically move to final location
    ///
    /// Returns Ok(true) if verification passed and file was committed,
    /// Ok(false) if verification failed (temp file is cleaned up).
    pub async fn commit(mut self) -> BerthResult<bool> {
        // Flush and drop the write handle before reading
        if let Some(mut file) = self.file.take() {
            use tokio::io::AsyncWriteExt;
            file.flush()
                .await
                .map_err(|e| BerthError::Storage(format!("Failed to flush temp file: {}", e)))?;
        }

        let computed = sha256_file(&self.staged_path).await?;
        if computed != self.expected_digest {
            let _ = tokio::fs::remove_file(&self.staged_path).await;
            return Ok(false);
        }

        tokio::fs::rename(&self.staged_path, &self.final_path)
            .await
            .map_err(|e| {
                BerthError::Storage(format!(
                    "Failed to move {} to {}: {}",
                    self.staged_path.display(),
                    self.final_path.display(),
                    e
                ))
            })?;

        Ok(true)
    }

    /// Clean up the temp file without committing
    pub async fn abort(mut self) {
        self.file.take();
        let _ = tokio::fs::remove_file(&self.staged_path).await;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn digest_of(data: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(data)))
    }

    #[test]
    fn test_storage_new_creates_directories() {
        let temp_dir = tempfile::tempdir().unwrap();
        let images_dir = temp_dir.path().join("images");

        let storage = ImageStorage::new(images_dir.clone()).unwrap();

        assert!(images_dir.join("manifests").exists());
        assert!(images_dir.join("layers").exists());
        assert!(images_dir.join("configs").exists());
        assert_eq!(storage.images_dir(), images_dir);
    }

    #[test]
    fn test_blob_paths() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = ImageStorage::new(temp_dir.path().to_path_buf()).unwrap();

        assert_eq!(
            storage.layer_tarball_path("sha256:layer1"),
            temp_dir.path().join("layers/sha256-layer1.tar.gz")
        );
        assert_eq!(
            storage.config_path("sha256:config1"),
            temp_dir.path().join("configs/sha256-config1.json")
        );
        assert_eq!(
            storage.manifest_path("sha256:abc"),
            temp_dir.path().join("manifests/sha256-abc.json")
        );
    }

    #[test]
    fn test_commit_layer_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = ImageStorage::new(temp_dir.path().join("images")).unwrap();

        let staged = temp_dir.path().join("staged");
        std::fs::write(&staged, b"layer").unwrap();
        let digest = digest_of(b"layer");

        storage.commit_layer(&staged, &digest).unwrap();
        assert!(storage.has_layer(&digest));
        assert!(!staged.exists());

        std::fs::write(&staged, b"layer").unwrap();
        storage.commit_layer(&staged, &digest).unwrap();
        assert!(!staged.exists());
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = ImageStorage::new(temp_dir.path().to_path_buf()).unwrap();

        let mut config = ImageConfig::scratch();
        config.working_dir = "/app".into();
        let id = storage.save_config(&config).unwrap();

        assert_eq!(id, config.image_id().unwrap());
        assert_eq!(storage.load_config(&id).unwrap(), config);
        assert!(matches!(
            storage.load_config("sha256:missing"),
            Err(BerthError::NotFound(_))
        ));
    }

    #[test]
    fn test_verify_blobs_exist() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = ImageStorage::new(temp_dir.path().to_path_buf()).unwrap();

        let layer1 = "sha256:layer1".to_string();
        let layer2 = "sha256:layer2".to_string();
        assert!(!storage.verify_blobs_exist(&[layer1.clone(), layer2.clone()]));

        std::fs::write(storage.layer_tarball_path(&layer1), b"data1").unwrap();
        assert!(!storage.verify_blobs_exist(&[layer1.clone(), layer2.clone()]));

        std::fs::write(storage.layer_tarball_path(&layer2), b"data2").unwrap();
        assert!(storage.verify_blobs_exist(&[layer1, layer2]));
    }

    #[tokio::test]
    async fn test_staged_download_verifies_digest() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = ImageStorage::new(temp_dir.path().to_path_buf()).unwrap();
        let digest = digest_of(b"blob");

        let mut staged = storage.stage_layer_download(&digest).await.unwrap();
        staged.file().unwrap().write_all(b"blob").await.unwrap();
        assert!(staged.commit().await.unwrap());
        assert!(storage.verify_layer(&digest).await.unwrap());

        let other = digest_of(b"expected");
        let mut staged = storage.stage_layer_download(&other).await.unwrap();
        staged.file().unwrap().write_all(b"tampered").await.unwrap();
        assert!(!staged.commit().await.unwrap());
        assert!(!storage.has_layer(&other));
    }
}
