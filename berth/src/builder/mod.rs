//! Image builder.
//!
//! ## Architecture
//!
//! ```text
//! Berthfile ──parse──→ Recipe ──→ Pipeline
//!
//! Stage "base":  FROM
//! Stage "steps": WORKDIR → COPY → INSTALL → COPY → ENV/EXPOSE/CMD
//! ```
//!
//! Filesystem steps write into a per-step diff directory that is packed into
//! a deterministic layer. Each step has a chained cache key; a hit reuses the
//! recorded layer without executing the step. The image is tagged only after
//! every step succeeded, so a failed build leaves no tag behind.

mod cache;
mod context;
mod tasks;

pub use cache::{BuildCache, CacheEntry, cache_key};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use berth_shared::errors::{BerthError, BerthResult};
use tokio::sync::Mutex;

use crate::deps::ResolvedPackage;
use crate::images::{ImageConfig, ImageStore};
use crate::pipeline::{PipelineExecutor, PipelineMetrics};
use crate::recipe::Recipe;
use crate::runtime::constants::recipe as recipe_consts;
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::lock::BuildLock;
use crate::runtime::options::BuildOptions;
use crate::util::run_blocking;
use context::{BuildStaging, BuildState};

/// Outcome of one recipe instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub instruction: String,
    /// Layer digest for filesystem steps.
    pub layer: Option<String>,
    /// Whether the layer came from the build cache.
    pub cached: bool,
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub tag: String,
    pub image_id: String,
    pub config: ImageConfig,
    pub steps: Vec<StepReport>,
    pub metrics: PipelineMetrics,
}

impl BuildReport {
    /// Resolved dependency set of the image.
    pub fn packages(&self) -> &[ResolvedPackage] {
        &self.config.packages
    }

    /// Report of the first step whose instruction starts with `prefix`.
    pub fn step(&self, prefix: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.instruction.starts_with(prefix))
    }
}

/// Builds images from a build context and a recipe.
pub struct ImageBuilder {
    layout: FilesystemLayout,
    store: Arc<ImageStore>,
    trusted_indexes: Vec<PathBuf>,
}

impl ImageBuilder {
    pub fn new(
        layout: FilesystemLayout,
        store: Arc<ImageStore>,
        trusted_indexes: Vec<PathBuf>,
    ) -> Self {
        Self {
            layout,
            store,
            trusted_indexes,
        }
    }

    /// Build `context_dir` and tag the result as `tag`.
    pub async fn build(
        &self,
        context_dir: &Path,
        tag: &str,
        options: &BuildOptions,
    ) -> BerthResult<BuildReport> {
        if tag.trim().is_empty() {
            return Err(BerthError::InvalidArgument("image tag must not be empty".into()));
        }

        let context_dir = context_dir.canonicalize().map_err(|e| {
            BerthError::NotFound(format!("build context {}: {}", context_dir.display(), e))
        })?;
        if !context_dir.is_dir() {
            return Err(BerthError::InvalidArgument(format!(
                "build context {} is not a directory",
                context_dir.display()
            )));
        }

        let recipe_path = match &options.recipe_file {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => context_dir.join(path),
            None => context_dir.join(recipe_consts::DEFAULT_FILE),
        };
        let recipe = Recipe::read(&recipe_path)?;

        let lock_path = self.layout.build_lock_file();
        let _lock = run_blocking(move || BuildLock::acquire(&lock_path)).await?;
        tracing::info!(
            context = %context_dir.display(),
            recipe = %recipe_path.display(),
            tag = %tag,
            "Starting build"
        );

        let mut cache = BuildCache::load(&self.layout.build_cache_file());
        let mut missing = BTreeSet::new();
        for layer in cache.layers() {
            if !self.store.has_layer(&layer).await {
                missing.insert(layer);
            }
        }
        let pruned = cache.retain_layers(|layer| !missing.contains(layer));
        if pruned > 0 {
            tracing::debug!(pruned, "Dropped cache entries for missing layers");
        }

        let staging = BuildStaging::create(&self.layout.temp_dir())?;
        let ctx = Arc::new(Mutex::new(BuildState {
            context_dir,
            store: Arc::clone(&self.store),
            trusted_indexes: self.trusted_indexes.clone(),
            cache,
            use_cache: !options.no_cache,
            staging,
            config: ImageConfig::scratch(),
            parent_key: String::new(),
            steps: Vec::new(),
        }));

        let pipeline = tasks::build_pipeline(&recipe);
        let metrics = PipelineExecutor::execute(pipeline, Arc::clone(&ctx))
            .await
            .inspect_err(|e| tracing::error!(tag = %tag, "Build failed: {}", e))?;

        let mut state = ctx.lock().await;
        let resolved = self.store.tag(tag, &state.config, None).await?;
        if let Err(e) = state.cache.save() {
            tracing::warn!("Failed to save build cache: {}", e);
        }

        let cached = state.steps.iter().filter(|s| s.cached).count();
        tracing::info!(
            tag = %tag,
            image_id = %resolved.image_id(),
            steps = state.steps.len(),
            cached,
            duration_ms = metrics.total_duration.as_millis() as u64,
            "Build finished"
        );

        Ok(BuildReport {
            tag: tag.to_string(),
            image_id: resolved.image_id().to_string(),
            config: resolved.config,
            steps: std::mem::take(&mut state.steps),
            metrics,
        })
    }
}
