//! Task: `COPY` from the build context.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use berth_shared::errors::{BerthError, BerthResult};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::builder::cache::cache_key;
use crate::builder::context::{BuildCtx, create_dir_with_mode, host_path};
use crate::pipeline::PipelineTask;
use crate::util::run_blocking;

pub struct CopyTask {
    pub sources: Vec<String>,
    pub dest: String,
    pub text: String,
}

#[async_trait]
impl PipelineTask<BuildCtx> for CopyTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> BerthResult<()> {
        let mut state = ctx.lock().await;
        let dest = state.image_path(&self.dest)?;
        let into_dir = self.sources.len() > 1
            || self.dest.ends_with('/')
            || self.dest == "."
            || self.dest.ends_with("/.");

        let context_dir = state.context_dir.clone();
        let sources = self.sources.clone();
        let plan = run_blocking(move || plan_copy(&context_dir, &sources, &dest, into_dir)).await?;

        let plan_for_digest = plan.clone();
        let input_digest = run_blocking(move || digest_plan(&plan_for_digest)).await?;
        let key = cache_key(&state.parent_key, &self.text, &input_digest);

        if let Some(entry) = state.lookup(&key).await {
            state.reuse(key, entry).await;
            return Ok(());
        }

        let (diff, layer_out) = state.staging.next_step()?;
        let target = diff.clone();
        let copied = run_blocking(move || execute_copy(&plan, &target)).await?;
        tracing::debug!(step = %self.text, entries = copied, "Copied build context files");

        state
            .commit(key, self.text, diff, layer_out, Vec::new())
            .await
    }

    fn name(&self) -> &str {
        &self.text
    }
}

// ============================================================================
// Copy plan
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File,
    Symlink(PathBuf),
}

/// One filesystem entry to copy into the image.
#[derive(Debug, Clone)]
struct CopyEntry {
    source: PathBuf,
    /// Absolute path inside the image.
    target: String,
    kind: EntryKind,
    mode: u32,
}

/// Expand `sources` into the ordered list of entries to copy.
///
/// A directory source copies its contents. A single file copied to a
/// destination that is not a directory takes the destination name.
fn plan_copy(
    context_dir: &Path,
    sources: &[String],
    dest: &str,
    into_dir: bool,
) -> BerthResult<Vec<CopyEntry>> {
    let mut plan = Vec::new();

    for source in sources {
        let path = context_dir.join(source);
        let metadata = fs::symlink_metadata(&path).map_err(|_| {
            BerthError::NotFound(format!("COPY source '{}' in build context", source))
        })?;

        if metadata.is_dir() {
            for entry in WalkDir::new(&path).follow_links(false).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    BerthError::Storage(format!("failed to walk {}: {}", path.display(), e))
                })?;
                let rel = entry.path().strip_prefix(&path).map_err(|e| {
                    BerthError::Internal(format!("walk escaped {}: {}", path.display(), e))
                })?;
                let target = if rel.as_os_str().is_empty() {
                    dest.to_string()
                } else {
                    join_image_path(dest, &rel.to_string_lossy())
                };
                plan.extend(plan_entry(entry.path(), target)?);
            }
        } else {
            let target = if into_dir {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        BerthError::Recipe(format!("COPY source '{}' has no file name", source))
                    })?;
                join_image_path(dest, &name)
            } else {
                dest.to_string()
            };
            plan.extend(plan_entry(&path, target)?);
        }
    }

    Ok(plan)
}

/// Returns `None` for sockets, fifos and device nodes, which are skipped.
fn plan_entry(source: &Path, target: String) -> BerthResult<Option<CopyEntry>> {
    let metadata = fs::symlink_metadata(source).map_err(|e| {
        BerthError::Storage(format!("failed to stat {}: {}", source.display(), e))
    })?;
    let file_type = metadata.file_type();

    let kind = if file_type.is_dir() {
        EntryKind::Dir
    } else if file_type.is_file() {
        EntryKind::File
    } else if file_type.is_symlink() {
        let link = fs::read_link(source).map_err(|e| {
            BerthError::Storage(format!("failed to read link {}: {}", source.display(), e))
        })?;
        EntryKind::Symlink(link)
    } else {
        tracing::warn!(path = %source.display(), "Skipping special file in build context");
        return Ok(None);
    };

    Ok(Some(CopyEntry {
        source: source.to_path_buf(),
        target,
        kind,
        mode: metadata.permissions().mode() & 0o7777,
    }))
}

fn join_image_path(dir: &str, rel: &str) -> String {
    if dir == "/" {
        format!("/{rel}")
    } else {
        format!("{dir}/{rel}")
    }
}

/// Digest of the copied file set: target paths, modes, link targets and
/// file contents. File contents are hashed in parallel.
fn digest_plan(plan: &[CopyEntry]) -> BerthResult<String> {
    let lines: Vec<String> = plan
        .par_iter()
        .map(|entry| {
            let body = match &entry.kind {
                EntryKind::Dir => "dir".to_string(),
                EntryKind::Symlink(link) => format!("link {}", link.display()),
                EntryKind::File => {
                    let mut file = fs::File::open(&entry.source).map_err(|e| {
                        BerthError::Storage(format!(
                            "failed to open {}: {}",
                            entry.source.display(),
                            e
                        ))
                    })?;
                    let mut hasher = Sha256::new();
                    std::io::copy(&mut file, &mut hasher).map_err(|e| {
                        BerthError::Storage(format!(
                            "failed to read {}: {}",
                            entry.source.display(),
                            e
                        ))
                    })?;
                    format!("file {}", hex::encode(hasher.finalize()))
                }
            };
            Ok(format!("{} {:o} {}\n", entry.target, entry.mode, body))
        })
        .collect::<BerthResult<_>>()?;

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Materialize the plan under `diff`. Returns the number of entries.
fn execute_copy(plan: &[CopyEntry], diff: &Path) -> BerthResult<usize> {
    for entry in plan {
        let target = host_path(diff, &entry.target);
        if let Some(parent) = target.parent() {
            create_dir_with_mode(parent)?;
        }

        match &entry.kind {
            EntryKind::Dir => {
                create_dir_with_mode(&target)?;
            }
            EntryKind::File => {
                if target.exists() {
                    fs::remove_file(&target).map_err(|e| {
                        BerthError::Storage(format!("failed to replace {}: {}", target.display(), e))
                    })?;
                }
                reflink_copy::reflink_or_copy(&entry.source, &target).map_err(|e| {
                    BerthError::Storage(format!(
                        "failed to copy {} to {}: {}",
                        entry.source.display(),
                        target.display(),
                        e
                    ))
                })?;
            }
            EntryKind::Symlink(link) => {
                let _ = fs::remove_file(&target);
                std::os::unix::fs::symlink(link, &target).map_err(|e| {
                    BerthError::Storage(format!("failed to link {}: {}", target.display(), e))
                })?;
            }
        }

        if !matches!(entry.kind, EntryKind::Symlink(_)) {
            fs::set_permissions(&target, fs::Permissions::from_mode(entry.mode)).map_err(|e| {
                BerthError::Storage(format!("failed to chmod {}: {}", target.display(), e))
            })?;
        }
    }
    Ok(plan.len())
}
