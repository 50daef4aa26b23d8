//! Task: `INSTALL` a dependency manifest from trusted package indexes.

use std::path::PathBuf;

use async_trait::async_trait;
use berth_shared::errors::{BerthError, BerthResult};
use sha2::{Digest, Sha256};

use crate::builder::cache::cache_key;
use crate::builder::context::{BuildCtx, host_path};
use crate::deps::{self, DependencyManifest, PackageIndex};
use crate::pipeline::PipelineTask;
use crate::util::run_blocking;

pub struct InstallTask {
    /// Manifest path inside the image.
    pub manifest: String,
    /// Explicit index. Relative paths are resolved against the build context.
    pub index: Option<PathBuf>,
    pub text: String,
}

#[async_trait]
impl PipelineTask<BuildCtx> for InstallTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> BerthResult<()> {
        let mut state = ctx.lock().await;

        let selected = self.index.as_ref().map(|path| {
            if path.is_absolute() {
                path.clone()
            } else {
                state.context_dir.join(path)
            }
        });
        let indexes = deps::open_trusted(&state.trusted_indexes, selected.as_deref())?;

        let manifest_path = state.image_path(&self.manifest)?;
        let rootfs = state.staging.merged_rootfs().await?;
        let manifest_file = host_path(&rootfs, &manifest_path);
        let manifest = DependencyManifest::read(&manifest_file)?;

        if !manifest.is_empty() && indexes.is_empty() {
            return Err(BerthError::Config(
                "no trusted package index configured (use --index or BERTH_INDEXES)".into(),
            ));
        }

        let manifest_bytes = std::fs::read(&manifest_file).map_err(|e| {
            BerthError::Manifest(format!("failed to read {}: {}", manifest_file.display(), e))
        })?;
        let input_digest = install_input_digest(&manifest_bytes, &indexes);
        let key = cache_key(&state.parent_key, &self.text, &input_digest);

        if let Some(entry) = state.lookup(&key).await {
            state.reuse(key, entry).await;
            return Ok(());
        }

        let selections = deps::resolve(&manifest, &indexes)?;
        tracing::info!(
            manifest = %manifest_path,
            requirements = manifest.requirements.len(),
            resolved = selections.len(),
            "Resolved dependencies"
        );

        let (diff, layer_out) = state.staging.next_step()?;
        let target = diff.clone();
        let packages = run_blocking(move || deps::install(&selections, &target)).await?;

        state
            .commit(key, self.text, diff, layer_out, packages)
            .await
    }

    fn name(&self) -> &str {
        &self.text
    }
}

/// Manifest bytes plus the fingerprint of every index consulted, in order.
fn install_input_digest(manifest: &[u8], indexes: &[PackageIndex]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(manifest);
    for index in indexes {
        hasher.update(b"\n");
        hasher.update(index.fingerprint().as_bytes());
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
