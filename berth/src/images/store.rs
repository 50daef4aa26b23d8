//! Thread-safe image store.
//!
//! `ImageStore` is a facade over the tag index and blob storage that handles
//! locking internally:
//! - `ImageStoreInner`: mutable state (index, storage), no locking awareness
//! - `ImageStore`: wrapper with `RwLock<ImageStoreInner>` that releases the
//!   lock during registry I/O

use std::path::{Path, PathBuf};

use berth_shared::errors::{BerthError, BerthResult};
use oci_client::Reference;
use oci_client::manifest::{OciDescriptor, OciImageManifest, OciManifest};
use oci_client::secrets::RegistryAuth;
use tokio::sync::RwLock;

use super::config::ImageConfig;
use super::index::{ImageIndex, ImageRecord};
use super::storage::{ImageStorage, sha256_file};
use super::{ReferenceIter, is_pinned};

/// A tagged image resolved from the local store.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    /// The reference the caller asked for.
    pub reference: String,
    pub record: ImageRecord,
    pub config: ImageConfig,
}

impl ResolvedImage {
    pub fn image_id(&self) -> &str {
        &self.record.image_id
    }
}

/// Layer to download from a registry.
#[derive(Debug, Clone)]
struct LayerInfo {
    digest: String,
    media_type: String,
}

/// Image manifest selected for the host platform.
struct PulledManifest {
    manifest_digest: String,
    config_digest: String,
    layers: Vec<LayerInfo>,
}

// ============================================================================
// INNER STATE (no locking awareness)
// ============================================================================

struct ImageStoreInner {
    index: ImageIndex,
    storage: ImageStorage,
}

impl ImageStoreInner {
    fn lookup(&self, reference: &str) -> Option<(String, ImageRecord)> {
        if let Some(record) = self.index.get(reference) {
            return Some((reference.to_string(), record.clone()));
        }
        self.index
            .find_by_id(reference)
            .map(|record| (reference.to_string(), record.clone()))
    }
}

// ============================================================================
// IMAGE STORE (thread-safe facade)
// ============================================================================

/// Thread-safe image store.
pub struct ImageStore {
    /// OCI registry client (immutable, outside lock)
    client: oci_client::Client,
    /// Registries tried for unqualified references
    registries: Vec<String>,
    inner: RwLock<ImageStoreInner>,
}

impl std::fmt::Debug for ImageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageStore")
            .field("registries", &self.registries)
            .finish()
    }
}

impl ImageStore {
    /// Create a new image store for the given images directory.
    pub fn new(images_dir: PathBuf, registries: Vec<String>) -> BerthResult<Self> {
        let storage = ImageStorage::new(images_dir.clone())?;
        let index = ImageIndex::load(&images_dir);
        Ok(Self {
            client: oci_client::Client::new(Default::default()),
            registries,
            inner: RwLock::new(ImageStoreInner { index, storage }),
        })
    }

    // ========================================================================
    // PUBLIC API
    // ========================================================================

    /// Resolve a tag or image id from the local store.
    ///
    /// Fails with `NotFound` when the image is unknown and with `Image` when
    /// its blobs are missing.
    pub async fn resolve(&self, reference: &str) -> BerthResult<ResolvedImage> {
        let inner = self.inner.read().await;
        let (tag, record) = inner
            .lookup(reference)
            .ok_or_else(|| BerthError::NotFound(format!("image {}", reference)))?;
        Self::load_resolved(&inner, tag, record)
    }

    /// Resolve a base image: local store first, then the registries.
    pub async fn pull(&self, image_ref: &str) -> BerthResult<ResolvedImage> {
        // Fast path: check the local index with a read lock
        {
            let inner = self.inner.read().await;
            if let Some((tag, record)) = inner.lookup(image_ref) {
                match Self::load_resolved(&inner, tag, record) {
                    Ok(resolved) => {
                        tracing::info!("Using local image: {}", image_ref);
                        return Ok(resolved);
                    }
                    Err(e) => {
                        tracing::warn!("Local image {} unusable, pulling again: {}", image_ref, e);
                    }
                }
            }
        } // Read lock released

        tracing::info!("Pulling image from registry: {}", image_ref);
        self.pull_from_registries(image_ref).await
    }

    /// All tags, sorted.
    pub async fn list(&self) -> Vec<(String, ImageRecord)> {
        let inner = self.inner.read().await;
        inner
            .index
            .images
            .iter()
            .map(|(tag, record)| (tag.clone(), record.clone()))
            .collect()
    }

    /// Write an image config and point `tag` at it.
    ///
    /// Every layer must already be committed. The previous image of the tag
    /// (if any) is superseded, not deleted.
    pub async fn tag(
        &self,
        tag: &str,
        config: &ImageConfig,
        manifest_digest: Option<String>,
    ) -> BerthResult<ResolvedImage> {
        let mut inner = self.inner.write().await;

        if !inner.storage.verify_blobs_exist(&config.layers) {
            return Err(BerthError::Image(format!(
                "refusing to tag {}: layer blobs are missing",
                tag
            )));
        }

        let image_id = inner.storage.save_config(config)?;
        let record = ImageRecord {
            image_id: image_id.clone(),
            layers: config.layers.clone(),
            manifest_digest,
            created_at: chrono::Utc::now().to_rfc3339(),
            complete: true,
        };

        let previous = inner.index.upsert(tag.to_string(), record.clone());
        if let Err(e) = inner.index.save(inner.storage.images_dir()) {
            // Roll back the in-memory tag so it never diverges from disk.
            match previous {
                Some(previous) => inner.index.upsert(tag.to_string(), previous),
                None => inner.index.remove(tag),
            };
            return Err(e);
        }

        tracing::debug!(tag = %tag, image_id = %image_id, "Tagged image");

        Ok(ResolvedImage {
            reference: tag.to_string(),
            record,
            config: config.clone(),
        })
    }

    /// Remove a tag. Blobs are left in place.
    pub async fn remove(&self, tag: &str) -> BerthResult<ImageRecord> {
        let mut inner = self.inner.write().await;
        let record = inner
            .index
            .remove(tag)
            .ok_or_else(|| BerthError::NotFound(format!("image {}", tag)))?;
        if let Err(e) = inner.index.save(inner.storage.images_dir()) {
            inner.index.upsert(tag.to_string(), record);
            return Err(e);
        }
        Ok(record)
    }

    /// Get path to a layer tarball.
    pub async fn layer_tarball(&self, digest: &str) -> PathBuf {
        let inner = self.inner.read().await;
        inner.storage.layer_tarball_path(digest)
    }

    pub async fn has_layer(&self, digest: &str) -> bool {
        let inner = self.inner.read().await;
        inner.storage.has_layer(digest)
    }

    /// Move a staged layer tarball into the store.
    pub async fn commit_layer(&self, staged: &Path, digest: &str) -> BerthResult<PathBuf> {
        let inner = self.inner.read().await;
        inner.storage.commit_layer(staged, digest)
    }

    /// Register a root filesystem tarball as a base image under `tag`.
    pub async fn import(&self, tarball: &Path, tag: &str) -> BerthResult<ResolvedImage> {
        if !is_pinned(tag) {
            return Err(BerthError::InvalidArgument(format!(
                "import tag '{}' must name a fixed version (not 'latest')",
                tag
            )));
        }

        let digest = sha256_file(tarball).await?;

        let layers_dir = {
            let inner = self.inner.read().await;
            inner.storage.layers_dir()
        };
        let staged = layers_dir.join(format!(
            "{}.{}.importing",
            digest.replace(':', "-"),
            uuid::Uuid::new_v4().simple()
        ));
        reflink_copy::reflink_or_copy(tarball, &staged).map_err(|e| {
            BerthError::Storage(format!(
                "Failed to copy {} into the layer store: {}",
                tarball.display(),
                e
            ))
        })?;
        self.commit_layer(&staged, &digest).await?;

        let mut config = ImageConfig::scratch();
        config.base = tag.to_string();
        config.layers = vec![digest];

        tracing::info!(tag = %tag, tarball = %tarball.display(), "Imported base image");
        self.tag(tag, &config, None).await
    }

    // ========================================================================
    // INTERNAL: Local lookup
    // ========================================================================

    fn load_resolved(
        inner: &ImageStoreInner,
        reference: String,
        record: ImageRecord,
    ) -> BerthResult<ResolvedImage> {
        if !record.complete || !inner.storage.verify_blobs_exist(&record.layers) {
            return Err(BerthError::Image(format!(
                "image {} is incomplete: layer blobs are missing",
                reference
            )));
        }

        let config = inner.storage.load_config(&record.image_id)?;
        Ok(ResolvedImage {
            reference,
            record,
            config,
        })
    }

    // ========================================================================
    // INTERNAL: Registry Operations (releases lock during I/O)
    // ========================================================================

    async fn pull_from_registries(&self, image_ref: &str) -> BerthResult<ResolvedImage> {
        let candidates = ReferenceIter::new(image_ref, &self.registries)
            .map_err(|e| BerthError::InvalidArgument(format!("invalid image reference: {e}")))?;

        let mut errors = Vec::new();
        for reference in candidates {
            match self.pull_reference(&reference).await {
                Ok((config, manifest_digest)) => {
                    return self.tag(image_ref, &config, Some(manifest_digest)).await;
                }
                Err(e) => {
                    tracing::warn!(reference = %reference.whole(), "Pull failed: {}", e);
                    errors.push(format!("{}: {}", reference.whole(), e));
                }
            }
        }

        Err(BerthError::Network(format!(
            "failed to pull {}: {}",
            image_ref,
            errors.join("; ")
        )))
    }

    async fn pull_reference(&self, reference: &Reference) -> BerthResult<(ImageConfig, String)> {
        let (manifest, manifest_digest) = self
            .client
            .pull_manifest(reference, &RegistryAuth::Anonymous)
            .await
            .map_err(|e| BerthError::Network(format!("failed to pull manifest: {e}")))?;

        {
            let inner = self.inner.read().await;
            inner.storage.save_manifest(&manifest, &manifest_digest)?;
        }

        let pulled = self
            .select_image_manifest(reference, &manifest, manifest_digest)
            .await?;

        self.download_layers(reference, &pulled.layers).await?;
        self.download_config(reference, &pulled.config_digest).await?;

        let raw_config = {
            let inner = self.inner.read().await;
            inner.storage.load_raw_config(&pulled.config_digest)?
        };
        let oci_config: oci_spec::image::ImageConfiguration = serde_json::from_str(&raw_config)
            .map_err(|e| BerthError::Image(format!("invalid image configuration: {e}")))?;

        let config = ImageConfig::from_oci_config(
            &reference.whole(),
            &oci_config,
            pulled.layers.iter().map(|l| l.digest.clone()).collect(),
        )?;

        Ok((config, pulled.manifest_digest))
    }

    async fn select_image_manifest(
        &self,
        reference: &Reference,
        manifest: &OciManifest,
        manifest_digest: String,
    ) -> BerthResult<PulledManifest> {
        match manifest {
            OciManifest::Image(img) => Self::pulled_from_image(img, manifest_digest),
            OciManifest::ImageIndex(index) => {
                let (platform_os, platform_arch) = Self::detect_platform();
                tracing::debug!(
                    "Image index detected, selecting platform: {}/{}",
                    platform_os,
                    platform_arch
                );

                let entry = index
                    .manifests
                    .iter()
                    .find(|m| {
                        m.platform.as_ref().is_some_and(|p| {
                            p.os == platform_os && p.architecture == platform_arch
                        })
                    })
                    .ok_or_else(|| {
                        let available = index
                            .manifests
                            .iter()
                            .filter_map(|m| {
                                m.platform
                                    .as_ref()
                                    .map(|p| format!("{}/{}", p.os, p.architecture))
                            })
                            .collect::<Vec<_>>()
                            .join(", ");
                        BerthError::Image(format!(
                            "no image found for platform {}/{}. Available platforms: {}",
                            platform_os, platform_arch, available
                        ))
                    })?;

                let platform_reference: Reference =
                    format!("{}@{}", reference.whole(), entry.digest)
                        .parse()
                        .map_err(|e| {
                            BerthError::Image(format!("invalid platform reference: {e}"))
                        })?;

                let (platform_image, platform_digest) = self
                    .client
                    .pull_manifest(&platform_reference, &RegistryAuth::Anonymous)
                    .await
                    .map_err(|e| {
                        BerthError::Network(format!("failed to pull platform manifest: {e}"))
                    })?;

                {
                    let inner = self.inner.read().await;
                    inner
                        .storage
                        .save_manifest(&platform_image, &platform_digest)?;
                }

                match platform_image {
                    OciManifest::Image(img) => Self::pulled_from_image(&img, platform_digest),
                    _ => Err(BerthError::Image(
                        "platform manifest is not a valid image".into(),
                    )),
                }
            }
        }
    }

    fn pulled_from_image(
        image: &OciImageManifest,
        manifest_digest: String,
    ) -> BerthResult<PulledManifest> {
        let mut layers = Vec::with_capacity(image.layers.len());
        for layer in &image.layers {
            // The applier understands gzip and plain tar only.
            if layer.media_type.contains("zstd") {
                return Err(BerthError::Unsupported(format!(
                    "layer {} uses {}",
                    layer.digest, layer.media_type
                )));
            }
            layers.push(LayerInfo {
                digest: layer.digest.clone(),
                media_type: layer.media_type.clone(),
            });
        }

        Ok(PulledManifest {
            manifest_digest,
            config_digest: image.config.digest.clone(),
            layers,
        })
    }

    fn detect_platform() -> (&'static str, &'static str) {
        let arch = match std::env::consts::ARCH {
            "aarch64" => "arm64",
            "x86_64" => "amd64",
            "x86" => "386",
            other => other,
        };
        ("linux", arch)
    }

    async fn download_layers(&self, reference: &Reference, layers: &[LayerInfo]) -> BerthResult<()> {
        use futures::future::join_all;

        let layers_to_download: Vec<LayerInfo> = {
            let inner = self.inner.read().await;
            let mut to_download = Vec::new();
            for layer in layers {
                if !inner.storage.has_layer(&layer.digest) {
                    to_download.push(layer.clone());
                } else if !inner.storage.verify_layer(&layer.digest).await.unwrap_or(false) {
                    tracing::warn!(
                        "Stored layer corrupted, will re-download: {}",
                        layer.digest
                    );
                    let _ = std::fs::remove_file(inner.storage.layer_tarball_path(&layer.digest));
                    to_download.push(layer.clone());
                }
            }
            to_download
        }; // Read lock released

        if layers_to_download.is_empty() {
            return Ok(());
        }

        tracing::info!(
            "Downloading {} layers in parallel",
            layers_to_download.len()
        );

        let results = join_all(
            layers_to_download
                .iter()
                .map(|layer| self.download_layer(reference, layer)),
        )
        .await;

        results.into_iter().collect()
    }

    async fn download_layer(&self, reference: &Reference, layer: &LayerInfo) -> BerthResult<()> {
        const MAX_RETRIES: u32 = 3;

        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            if attempt > 1 {
                tracing::info!(
                    "Retrying layer download (attempt {}/{}): {}",
                    attempt,
                    MAX_RETRIES,
                    layer.digest
                );
            }

            let mut staged = {
                let inner = self.inner.read().await;
                match inner.storage.stage_layer_download(&layer.digest).await {
                    Ok(staged) => staged,
                    Err(e) => {
                        last_error = Some(format!("failed to stage layer {}: {e}", layer.digest));
                        continue;
                    }
                }
            };

            let descriptor = OciDescriptor {
                digest: layer.digest.clone(),
                media_type: layer.media_type.clone(),
                size: 0,
                urls: None,
                annotations: None,
            };
            let result = match staged.file() {
                Ok(file) => self
                    .client
                    .pull_blob(reference, &descriptor, file)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match result {
                Ok(()) => match staged.commit().await {
                    Ok(true) => {
                        tracing::info!("Downloaded and verified layer: {}", layer.digest);
                        return Ok(());
                    }
                    Ok(false) => {
                        tracing::warn!(
                            "Layer integrity check failed (attempt {}): {}",
                            attempt,
                            layer.digest
                        );
                        last_error = Some("layer integrity verification failed".to_string());
                    }
                    Err(e) => last_error = Some(format!("layer commit error: {e}")),
                },
                Err(e) => {
                    tracing::warn!("Layer download failed (attempt {}): {}", attempt, e);
                    last_error = Some(format!("failed to pull layer {}: {e}", layer.digest));
                    staged.abort().await;
                }
            }
        }

        Err(BerthError::Network(last_error.unwrap_or_else(|| {
            "download failed after retries".to_string()
        })))
    }

    async fn download_config(&self, reference: &Reference, config_digest: &str) -> BerthResult<()> {
        let mut staged = {
            let inner = self.inner.read().await;
            if inner.storage.has_config(config_digest) {
                tracing::debug!("Config blob already stored: {}", config_digest);
                return Ok(());
            }
            inner.storage.stage_config_download(config_digest).await?
        };

        let descriptor = OciDescriptor {
            digest: config_digest.to_string(),
            media_type: "application/vnd.oci.image.config.v1+json".to_string(),
            size: 0,
            urls: None,
            annotations: None,
        };
        let pulled = self
            .client
            .pull_blob(reference, &descriptor, staged.file()?)
            .await;
        if let Err(e) = pulled {
            staged.abort().await;
            return Err(BerthError::Network(format!("failed to pull config: {e}")));
        }

        if !staged.commit().await? {
            return Err(BerthError::Image(format!(
                "Config blob verification failed for {}",
                config_digest
            )));
        }

        Ok(())
    }
}
