//! Streaming layer applier.
//!
//! Applies a layer tarball on top of a root filesystem directory. Handles
//! OCI whiteouts inline so pulled base images with deletions materialize
//! correctly; layers produced by the builder only ever add paths.

use berth_shared::errors::{BerthError, BerthResult};
use filetime::{FileTime, set_file_times, set_symlink_file_times};
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Entry, EntryType};
use tracing::{debug, trace};
use walkdir::WalkDir;

const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const WHITEOUT_PREFIX: &str = ".wh.";

/// Apply a (possibly gzip-compressed) layer tarball into `dest`.
///
/// Returns the total uncompressed size of the applied entries.
pub fn apply_layer_tarball(tarball_path: &Path, dest: &Path) -> BerthResult<u64> {
    let open = || {
        fs::File::open(tarball_path).map_err(|e| {
            BerthError::Storage(format!(
                "Failed to open layer tarball {}: {}",
                tarball_path.display(),
                e
            ))
        })
    };

    // Gzip magic number: 0x1f 0x8b
    let mut header = [0u8; 2];
    let is_gzip = match open()?.take(2).read_exact(&mut header) {
        Ok(()) => header == [0x1f, 0x8b],
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
        Err(e) => {
            return Err(BerthError::Storage(format!(
                "Failed to read layer header: {}",
                e
            )));
        }
    };

    let reader: Box<dyn Read> = if is_gzip {
        Box::new(GzDecoder::new(BufReader::new(open()?)))
    } else {
        debug!(layer = %tarball_path.display(), "Layer is an uncompressed tarball");
        Box::new(BufReader::new(open()?))
    };

    apply_layer(reader, dest)
}

struct DirMeta {
    path: PathBuf,
    mode: u32,
    mtime: u64,
}

/// Hardlink whose target has not been extracted yet.
struct DeferredHardlink {
    link_path: PathBuf,
    target_path: PathBuf,
}

/// Apply a tar stream into `dest`, handling whiteouts inline.
pub fn apply_layer<R: Read>(reader: R, dest: &Path) -> BerthResult<u64> {
    fs::create_dir_all(dest).map_err(|e| {
        BerthError::Storage(format!(
            "Failed to create destination directory {}: {}",
            dest.display(),
            e
        ))
    })?;

    let is_root = unsafe { libc::geteuid() } == 0;
    let mut archive = Archive::new(reader);
    let mut unpacked_paths = HashSet::new();
    let mut total_size = 0u64;
    let mut deferred_dirs: Vec<DirMeta> = Vec::new();
    let mut deferred_hardlinks: Vec<DeferredHardlink> = Vec::new();

    for entry_result in archive
        .entries()
        .map_err(|e| BerthError::Storage(format!("Tar read entries error: {}", e)))?
    {
        let mut entry =
            entry_result.map_err(|e| BerthError::Storage(format!("Tar read entry error: {}", e)))?;
        let raw_path = entry
            .path()
            .map_err(|e| BerthError::Storage(format!("Tar parse header path error: {}", e)))?
            .into_owned();
        let Some(normalized) = normalize_entry_path(&raw_path) else {
            debug!("Skipping path outside root: {}", raw_path.display());
            continue;
        };
        if normalized.as_os_str().is_empty() {
            continue;
        }

        let full_path = dest.join(&normalized);
        let entry_type = entry.header().entry_type();
        let mode = entry.header().mode().unwrap_or(0o755);
        let uid = entry.header().uid().unwrap_or(0);
        let gid = entry.header().gid().unwrap_or(0);
        let mtime = entry.header().mtime().unwrap_or(0);
        total_size = total_size.saturating_add(entry.header().size().unwrap_or(0));

        let link_name = if matches!(entry_type, EntryType::Link | EntryType::Symlink) {
            entry
                .link_name()
                .map_err(|e| BerthError::Storage(format!("Tar read link name error: {}", e)))?
                .map(|p| p.into_owned())
        } else {
            None
        };

        trace!(
            path = %normalized.display(),
            ?entry_type,
            mode = format!("{:o}", mode),
            "Applying entry"
        );

        if handle_whiteout(&full_path, &unpacked_paths, entry_type)? {
            continue;
        }

        ensure_parent_dirs(&full_path, dest)?;
        remove_existing_if_needed(&full_path, entry_type)?;

        match entry_type {
            EntryType::Directory => create_dir(&full_path)?,
            EntryType::Regular | EntryType::GNUSparse => {
                create_regular_file(&mut entry, &full_path, mode)?
            }
            EntryType::Link => {
                let target = link_name.ok_or_else(|| {
                    BerthError::Storage(format!("Hardlink without target: {}", raw_path.display()))
                })?;
                let target_path = resolve_hardlink_target(dest, &target)?;
                if target_path.exists() {
                    create_hardlink(&full_path, &target_path)?;
                } else {
                    trace!(
                        "Deferring hardlink {} -> {} (target not found yet)",
                        full_path.display(),
                        target_path.display()
                    );
                    deferred_hardlinks.push(DeferredHardlink {
                        link_path: full_path.clone(),
                        target_path,
                    });
                    unpacked_paths.insert(full_path);
                    continue;
                }
            }
            EntryType::Symlink => {
                let target = link_name.ok_or_else(|| {
                    BerthError::Storage(format!("Symlink without target: {}", raw_path.display()))
                })?;
                create_symlink(&full_path, &target)?;
            }
            EntryType::Block | EntryType::Char | EntryType::Fifo => {
                // Device nodes are never needed by a served application.
                trace!("Skipping special file {}", raw_path.display());
                continue;
            }
            EntryType::XGlobalHeader | EntryType::XHeader => continue,
            other => {
                return Err(BerthError::Storage(format!(
                    "Unhandled tar entry type {:?} for {}",
                    other,
                    raw_path.display()
                )));
            }
        }

        if is_root {
            std::os::unix::fs::lchown(&full_path, Some(uid as u32), Some(gid as u32)).map_err(
                |e| {
                    BerthError::Storage(format!(
                        "Failed to chown {} to {}:{}: {}",
                        full_path.display(),
                        uid,
                        gid,
                        e
                    ))
                },
            )?;
        }

        if entry_type == EntryType::Directory {
            deferred_dirs.push(DirMeta {
                path: full_path.clone(),
                mode,
                mtime,
            });
        } else {
            apply_permissions_and_times(&full_path, entry_type, mode, mtime)?;
        }

        unpacked_paths.insert(full_path);
    }

    for deferred in deferred_hardlinks {
        if deferred.target_path.exists() {
            create_hardlink(&deferred.link_path, &deferred.target_path)?;
        } else {
            // Target removed by a whiteout later in the same layer.
            trace!(
                "Skipping deferred hardlink {} -> {} (target does not exist)",
                deferred.link_path.display(),
                deferred.target_path.display()
            );
        }
    }

    // Deepest first so a restrictive parent mode cannot block its children.
    deferred_dirs.sort_unstable_by(|a, b| b.path.cmp(&a.path));
    for dir in &deferred_dirs {
        if dir.path.exists() {
            apply_permissions_and_times(&dir.path, EntryType::Directory, dir.mode, dir.mtime)?;
        }
    }

    Ok(total_size)
}

fn normalize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut components = Vec::new();
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) => continue,
            Component::CurDir => {}
            Component::ParentDir => {
                components.pop()?;
            }
            Component::Normal(c) => components.push(c.to_os_string()),
        }
    }
    Some(components.into_iter().collect())
}

/// Create the parent directories of `path`, replacing non-directory
/// obstacles (a later layer may turn a file into a directory). Symlinks that
/// resolve to directories are preserved.
fn ensure_parent_dirs(path: &Path, root: &Path) -> BerthResult<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent == root {
        return Ok(());
    }

    match fs::create_dir_all(parent) {
        Ok(()) => return Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => {}
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) && parent.is_dir() => return Ok(()),
        Err(e) => {
            return Err(BerthError::Storage(format!(
                "Failed to create parent directory {}: {}",
                parent.display(),
                e
            )));
        }
    }

    let mut obstacles = Vec::new();
    let mut current = parent;
    while current != root {
        match fs::symlink_metadata(current) {
            Ok(m) if m.is_dir() => break,
            Ok(m) if m.file_type().is_symlink() && current.is_dir() => break,
            Ok(_) => obstacles.push(current.to_path_buf()),
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    || e.raw_os_error() == Some(libc::ENOTDIR) => {}
            Err(e) => {
                return Err(BerthError::Storage(format!(
                    "Failed to stat parent directory {}: {}",
                    current.display(),
                    e
                )));
            }
        }
        match current.parent() {
            Some(p) => current = p,
            None => break,
        }
    }

    for obstacle in obstacles.iter().rev() {
        trace!("Removing non-directory obstacle: {}", obstacle.display());
        fs::remove_file(obstacle)
            .or_else(|_| fs::remove_dir_all(obstacle))
            .map_err(|e| {
                BerthError::Storage(format!(
                    "Failed to remove obstacle {}: {}",
                    obstacle.display(),
                    e
                ))
            })?;
    }

    fs::create_dir_all(parent).map_err(|e| {
        BerthError::Storage(format!(
            "Failed to create parent directory {}: {}",
            parent.display(),
            e
        ))
    })
}

fn handle_whiteout(
    path: &Path,
    unpacked: &HashSet<PathBuf>,
    entry_type: EntryType,
) -> BerthResult<bool> {
    if entry_type != EntryType::Regular {
        return Ok(false);
    }

    let Some(base) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(false);
    };

    if base == OPAQUE_WHITEOUT {
        let dir = path
            .parent()
            .ok_or_else(|| BerthError::Storage("Opaque marker without parent".into()))?;
        apply_opaque_whiteout(dir, unpacked);
        return Ok(true);
    }

    if let Some(target_name) = base.strip_prefix(WHITEOUT_PREFIX) {
        let parent = path
            .parent()
            .ok_or_else(|| BerthError::Storage("Whiteout without parent directory".into()))?;
        let target = parent.join(target_name);
        if fs::symlink_metadata(&target).is_ok() {
            if target.is_dir() && !target.is_symlink() {
                fs::remove_dir_all(&target).ok();
            } else {
                fs::remove_file(&target).ok();
            }
            debug!("Whiteout removed {}", target.display());
        }
        return Ok(true);
    }

    Ok(false)
}

/// Remove everything in `dir` that this layer did not itself create.
fn apply_opaque_whiteout(dir: &Path, unpacked: &HashSet<PathBuf>) {
    if !dir.exists() {
        return;
    }

    let stale: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| !unpacked.contains(p))
        .collect();

    for target in stale {
        if target.is_dir() && !target.is_symlink() {
            fs::remove_dir_all(&target).ok();
        } else {
            fs::remove_file(&target).ok();
        }
        debug!("Opaque whiteout removed {}", target.display());
    }
}

fn remove_existing_if_needed(path: &Path, entry_type: EntryType) -> BerthResult<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.is_dir() && entry_type == EntryType::Directory {
                return Ok(());
            }
            fs::remove_file(path)
                .or_else(|_| fs::remove_dir_all(path))
                .map_err(|e| {
                    BerthError::Storage(format!(
                        "Failed to remove existing path {}: {}",
                        path.display(),
                        e
                    ))
                })?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(BerthError::Storage(format!(
                "Failed to stat {}: {}",
                path.display(),
                e
            )));
        }
    }
    Ok(())
}

fn create_dir(path: &Path) -> BerthResult<()> {
    if !path.exists() {
        fs::create_dir(path).map_err(|e| {
            BerthError::Storage(format!("Failed to create dir {}: {}", path.display(), e))
        })?;
    }
    Ok(())
}

fn create_regular_file<R: Read>(entry: &mut Entry<R>, path: &Path, mode: u32) -> BerthResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(|e| {
            BerthError::Storage(format!("Failed to create file {}: {}", path.display(), e))
        })?;

    io::copy(entry, &mut file).map_err(|e| {
        BerthError::Storage(format!(
            "Failed to copy file data to {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(())
}

fn create_hardlink(path: &Path, target: &Path) -> BerthResult<()> {
    fs::hard_link(target, path).map_err(|e| {
        BerthError::Storage(format!(
            "Failed to create hardlink {} -> {}: {}",
            path.display(),
            target.display(),
            e
        ))
    })
}

fn create_symlink(path: &Path, target: &Path) -> BerthResult<()> {
    std::os::unix::fs::symlink(target, path).map_err(|e| {
        BerthError::Storage(format!(
            "Failed to create symlink {} -> {}: {}",
            path.display(),
            target.display(),
            e
        ))
    })
}

fn resolve_hardlink_target(root: &Path, linkname: &Path) -> BerthResult<PathBuf> {
    let cleaned = normalize_entry_path(linkname).ok_or_else(|| {
        BerthError::Storage(format!(
            "Hardlink target escapes root: {}",
            linkname.display()
        ))
    })?;
    Ok(root.join(cleaned))
}

fn apply_permissions_and_times(
    path: &Path,
    entry_type: EntryType,
    mode: u32,
    mtime: u64,
) -> BerthResult<()> {
    let mtime = FileTime::from_unix_time(mtime.min(i64::MAX as u64) as i64, 0);

    let result = match entry_type {
        EntryType::Symlink => set_symlink_file_times(path, mtime, mtime),
        // Hardlinks share the target's inode; leave its metadata alone.
        EntryType::Link => return Ok(()),
        _ => {
            fs::set_permissions(path, Permissions::from_mode(mode)).map_err(|e| {
                BerthError::Storage(format!(
                    "Failed to set permissions {:o} on {}: {}",
                    mode,
                    path.display(),
                    e
                ))
            })?;
            set_file_times(path, mtime, mtime)
        }
    };
    result.map_err(|e| BerthError::Storage(format!("Failed to set times on {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    enum TestEntry {
        Dir(&'static str),
        File(&'static str, &'static [u8]),
        Hardlink(&'static str, &'static str),
        Symlink(&'static str, &'static str),
    }

    fn create_test_tar(entries: Vec<TestEntry>) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        for entry in entries {
            let mut header = tar::Header::new_gnu();
            match entry {
                TestEntry::Dir(path) => {
                    header.set_path(path).unwrap();
                    header.set_mode(0o755);
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
                TestEntry::File(path, content) => {
                    header.set_path(path).unwrap();
                    header.set_mode(0o644);
                    header.set_size(content.len() as u64);
                    header.set_cksum();
                    builder.append(&header, content).unwrap();
                }
                TestEntry::Hardlink(path, target) => {
                    header.set_path(path).unwrap();
                    header.set_link_name(target).unwrap();
                    header.set_mode(0o644);
                    header.set_entry_type(EntryType::Link);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
                TestEntry::Symlink(path, target) => {
                    header.set_path(path).unwrap();
                    header.set_link_name(target).unwrap();
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
            }
        }

        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_apply_gzip_and_plain_tarballs() {
        let temp = tempfile::tempdir().unwrap();
        let tar = create_test_tar(vec![
            TestEntry::Dir("app"),
            TestEntry::File("app/server.txt", b"hello"),
        ]);

        let plain = temp.path().join("layer.tar");
        fs::write(&plain, &tar).unwrap();
        let gz = temp.path().join("layer.tar.gz");
        fs::write(&gz, gzip(&tar)).unwrap();

        for (layer, dest) in [(plain, "a"), (gz, "b")] {
            let dest = temp.path().join(dest);
            apply_layer_tarball(&layer, &dest).unwrap();
            assert_eq!(fs::read(dest.join("app/server.txt")).unwrap(), b"hello");
        }
    }

    #[test]
    fn test_deferred_hardlink_target_appears_later() {
        let temp = tempfile::tempdir().unwrap();
        let tar = create_test_tar(vec![
            TestEntry::Hardlink("link", "target.txt"),
            TestEntry::File("target.txt", b"target content"),
        ]);

        apply_layer(&tar[..], temp.path()).unwrap();
        assert_eq!(
            fs::read(temp.path().join("link")).unwrap(),
            b"target content"
        );
    }

    #[test]
    fn test_whiteout_removes_lower_file() {
        let temp = tempfile::tempdir().unwrap();
        let lower = create_test_tar(vec![
            TestEntry::Dir("bin"),
            TestEntry::File("bin/sh", b"sh"),
            TestEntry::File("bin/keep", b"keep"),
        ]);
        let upper = create_test_tar(vec![TestEntry::File("bin/.wh.sh", b"")]);

        apply_layer(&lower[..], temp.path()).unwrap();
        apply_layer(&upper[..], temp.path()).unwrap();

        assert!(!temp.path().join("bin/sh").exists());
        assert!(!temp.path().join("bin/.wh.sh").exists());
        assert!(temp.path().join("bin/keep").exists());
    }

    #[test]
    fn test_opaque_whiteout_keeps_entries_from_same_layer() {
        let temp = tempfile::tempdir().unwrap();
        let lower = create_test_tar(vec![
            TestEntry::Dir("etc"),
            TestEntry::File("etc/old.conf", b"old"),
        ]);
        let upper = create_test_tar(vec![
            TestEntry::File("etc/new.conf", b"new"),
            TestEntry::File("etc/.wh..wh..opq", b""),
        ]);

        apply_layer(&lower[..], temp.path()).unwrap();
        apply_layer(&upper[..], temp.path()).unwrap();

        assert!(!temp.path().join("etc/old.conf").exists());
        assert!(temp.path().join("etc/new.conf").exists());
    }

    #[test]
    fn test_file_replaced_by_directory() {
        let temp = tempfile::tempdir().unwrap();
        let lower = create_test_tar(vec![TestEntry::File("lib", b"not a dir")]);
        let upper = create_test_tar(vec![TestEntry::File("lib/module.txt", b"ok")]);

        apply_layer(&lower[..], temp.path()).unwrap();
        apply_layer(&upper[..], temp.path()).unwrap();

        assert!(temp.path().join("lib").is_dir());
        assert_eq!(fs::read(temp.path().join("lib/module.txt")).unwrap(), b"ok");
    }

    #[test]
    fn test_symlink_and_escaping_paths() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("root");
        let tar = create_test_tar(vec![
            TestEntry::File("real.txt", b"data"),
            TestEntry::Symlink("alias.txt", "real.txt"),
        ]);

        apply_layer(&tar[..], &dest).unwrap();
        assert_eq!(
            fs::read_link(dest.join("alias.txt")).unwrap(),
            PathBuf::from("real.txt")
        );
        assert!(normalize_entry_path(Path::new("../../etc/passwd")).is_none());
        assert_eq!(
            normalize_entry_path(Path::new("/./app/../srv/x")).unwrap(),
            PathBuf::from("srv/x")
        );
    }
}
