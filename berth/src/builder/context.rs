//! Shared state of a running build.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use berth_shared::errors::{BerthError, BerthResult};
use tempfile::TempDir;
use tokio::sync::Mutex;

use super::StepReport;
use super::cache::{BuildCache, CacheEntry, cache_key};
use crate::deps::ResolvedPackage;
use crate::images::archive::{apply_layer_tarball, pack_layer};
use crate::images::{ImageConfig, ImageStore};
use crate::util::run_blocking;

/// Pipeline context handed to every build task.
pub type BuildCtx = Arc<Mutex<BuildState>>;

/// Mode of directories the builder creates itself.
pub(crate) const DIR_MODE: u32 = 0o755;

// ============================================================================
// Staging
// ============================================================================

/// Scratch space of one build, removed on drop.
///
/// `rootfs` is a merged view of every layer so far. It is only brought up to
/// date when a step needs to read it, so fully cached builds never unpack
/// anything. Each executed step writes its changes into a fresh diff
/// directory which becomes the step's layer.
pub struct BuildStaging {
    dir: TempDir,
    rootfs: PathBuf,
    pending: Vec<PathBuf>,
    steps: usize,
}

impl BuildStaging {
    pub fn create(temp_root: &Path) -> BerthResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("build-")
            .tempdir_in(temp_root)
            .map_err(|e| {
                BerthError::Storage(format!(
                    "failed to create build staging in {}: {}",
                    temp_root.display(),
                    e
                ))
            })?;
        let rootfs = dir.path().join("rootfs");
        create_dir_with_mode(&rootfs)?;

        Ok(Self {
            dir,
            rootfs,
            pending: Vec::new(),
            steps: 0,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Queue a layer tarball for the merged view.
    pub fn push_layer(&mut self, tarball: PathBuf) {
        self.pending.push(tarball);
    }

    /// Fresh diff directory and layer output path for the next step.
    pub fn next_step(&mut self) -> BerthResult<(PathBuf, PathBuf)> {
        self.steps += 1;
        let step_dir = self.dir.path().join(format!("step-{}", self.steps));
        let diff = step_dir.join("diff");
        create_dir_with_mode(&step_dir)?;
        create_dir_with_mode(&diff)?;
        Ok((diff, step_dir.join("layer.tar.gz")))
    }

    /// Apply queued layers and return the up-to-date merged rootfs.
    pub async fn merged_rootfs(&mut self) -> BerthResult<PathBuf> {
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            let rootfs = self.rootfs.clone();
            run_blocking(move || {
                for tarball in &pending {
                    apply_layer_tarball(tarball, &rootfs)?;
                }
                Ok(())
            })
            .await?;
        }
        Ok(self.rootfs.clone())
    }
}

// ============================================================================
// Build State
// ============================================================================

pub struct BuildState {
    /// Canonical build context directory.
    pub context_dir: PathBuf,
    pub store: Arc<ImageStore>,
    pub trusted_indexes: Vec<PathBuf>,
    pub cache: BuildCache,
    pub use_cache: bool,
    pub staging: BuildStaging,

    /// Image config being assembled.
    pub config: ImageConfig,
    /// Cache key of the previous step.
    pub parent_key: String,
    pub steps: Vec<StepReport>,
}

impl BuildState {
    /// Look up a reusable layer. Entries whose blob is gone are ignored.
    pub async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        if !self.use_cache {
            return None;
        }
        let entry = self.cache.get(key)?.clone();
        if self.store.has_layer(&entry.layer).await {
            Some(entry)
        } else {
            tracing::debug!(key = %key, layer = %entry.layer, "Cached layer missing, rebuilding");
            None
        }
    }

    /// Record a reused layer.
    pub async fn reuse(&mut self, key: String, entry: CacheEntry) {
        let tarball = self.store.layer_tarball(&entry.layer).await;
        self.staging.push_layer(tarball);
        self.config.layers.push(entry.layer.clone());
        self.merge_packages(&entry.packages);

        tracing::info!(step = %entry.instruction, layer = %entry.layer, "Using cache");
        self.steps.push(StepReport {
            instruction: entry.instruction,
            layer: Some(entry.layer),
            cached: true,
        });
        self.parent_key = key;
    }

    /// Pack `diff` into a layer, commit it and record it under `key`.
    pub async fn commit(
        &mut self,
        key: String,
        instruction: String,
        diff: PathBuf,
        layer_out: PathBuf,
        packages: Vec<ResolvedPackage>,
    ) -> BerthResult<()> {
        let out = layer_out.clone();
        let packed = run_blocking(move || pack_layer(&diff, &out)).await?;
        let tarball = self.store.commit_layer(&layer_out, &packed.digest).await?;

        self.staging.push_layer(tarball);
        self.config.layers.push(packed.digest.clone());
        self.merge_packages(&packages);
        self.cache.insert(
            key.clone(),
            CacheEntry {
                layer: packed.digest.clone(),
                packages,
                instruction: instruction.clone(),
            },
        );

        tracing::info!(step = %instruction, layer = %packed.digest, size = packed.size, "Committed layer");
        self.steps.push(StepReport {
            instruction,
            layer: Some(packed.digest),
            cached: false,
        });
        self.parent_key = key;
        Ok(())
    }

    /// Record a metadata-only step. It still feeds the key chain.
    pub fn record_metadata(&mut self, instruction: String) {
        self.parent_key = cache_key(&self.parent_key, &instruction, "");
        self.steps.push(StepReport {
            instruction,
            layer: None,
            cached: false,
        });
    }

    /// Absolute image path of `path`, relative paths resolved against the
    /// current working directory of the image.
    pub fn image_path(&self, path: &str) -> BerthResult<String> {
        resolve_image_path(&self.config.working_dir, path)
    }

    fn merge_packages(&mut self, packages: &[ResolvedPackage]) {
        for package in packages {
            self.config.packages.retain(|p| p.name != package.name);
            self.config.packages.push(package.clone());
        }
        self.config.packages.sort();
    }
}

// ============================================================================
// Path helpers
// ============================================================================

/// Join `path` onto `base` inside the image and normalize it.
///
/// Fails when `..` would climb above the image root.
pub fn resolve_image_path(base: &str, path: &str) -> BerthResult<String> {
    let joined = if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        Path::new(base).join(path)
    };

    let mut parts: Vec<String> = Vec::new();
    for component in joined.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(BerthError::Recipe(format!(
                        "path '{}' escapes the image root",
                        path
                    )));
                }
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::Prefix(_) => {
                return Err(BerthError::Recipe(format!("invalid image path '{}'", path)));
            }
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Host path of an absolute image path under `root`.
pub fn host_path(root: &Path, image_path: &str) -> PathBuf {
    root.join(image_path.trim_start_matches('/'))
}

/// Create `path` and any missing parents with a fixed mode, so layer
/// digests do not depend on the umask.
pub fn create_dir_with_mode(path: &Path) -> BerthResult<()> {
    let mut missing = Vec::new();
    let mut current = Some(path);
    while let Some(dir) = current {
        if dir.exists() {
            break;
        }
        missing.push(dir);
        current = dir.parent();
    }

    for dir in missing.into_iter().rev() {
        fs::create_dir(dir)
            .or_else(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Ok(())
                } else {
                    Err(e)
                }
            })
            .and_then(|_| fs::set_permissions(dir, fs::Permissions::from_mode(DIR_MODE)))
            .map_err(|e| {
                BerthError::Storage(format!("failed to create {}: {}", dir.display(), e))
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_image_path() {
        assert_eq!(resolve_image_path("/app", ".").unwrap(), "/app");
        assert_eq!(resolve_image_path("/app", "lib/x").unwrap(), "/app/lib/x");
        assert_eq!(resolve_image_path("/app", "/srv/").unwrap(), "/srv");
        assert_eq!(resolve_image_path("/app", "../etc").unwrap(), "/etc");
        assert_eq!(resolve_image_path("/", ".").unwrap(), "/");
        assert!(resolve_image_path("/", "../../x").is_err());
    }

    #[test]
    fn test_create_dir_with_mode_ignores_umask() {
        let temp = tempfile::tempdir().unwrap();
        let nested = temp.path().join("a/b/c");
        create_dir_with_mode(&nested).unwrap();

        for dir in ["a", "a/b", "a/b/c"] {
            let mode = fs::metadata(temp.path().join(dir)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, DIR_MODE);
        }
    }

    #[test]
    fn test_staging_steps_and_cleanup() {
        let temp = tempfile::tempdir().unwrap();
        let mut staging = BuildStaging::create(temp.path()).unwrap();
        let (diff1, out1) = staging.next_step().unwrap();
        let (diff2, _) = staging.next_step().unwrap();
        assert_ne!(diff1, diff2);
        assert!(diff1.is_dir());
        assert_eq!(out1.parent(), diff1.parent());

        let root = staging.path().to_path_buf();
        drop(staging);
        assert!(!root.exists());
    }
}
