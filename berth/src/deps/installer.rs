//! Installs a resolved dependency set into a filesystem tree.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use berth_shared::errors::{BerthError, BerthResult, DependencyError};
use rayon::prelude::*;
use sha2::{Digest, Sha256};

use super::resolver::{ResolvedPackage, Selection};
use crate::images::archive;
use crate::runtime::constants::packages;

/// Install root for packages, relative to a filesystem root.
pub fn install_root(fs_root: &Path) -> PathBuf {
    fs_root.join(packages::INSTALL_ROOT.trim_start_matches('/'))
}

/// Verify and unpack every selection under `fs_root`, then record the
/// resolved set next to the packages.
///
/// All archives are verified before anything is unpacked, so an integrity
/// failure leaves `fs_root` untouched.
pub fn install(selections: &[Selection], fs_root: &Path) -> BerthResult<Vec<ResolvedPackage>> {
    selections
        .par_iter()
        .map(verify_archive)
        .collect::<BerthResult<Vec<()>>>()?;

    let root = install_root(fs_root);
    std::fs::create_dir_all(&root).map_err(|e| {
        BerthError::Storage(format!("failed to create {}: {}", root.display(), e))
    })?;

    for selection in selections {
        let dest = root.join(&selection.package.name);
        archive::apply_layer_tarball(&selection.archive, &dest)?;
        tracing::info!(
            package = %selection.package.name,
            version = %selection.package.version,
            "Installed package"
        );
    }

    let resolved: Vec<ResolvedPackage> = selections.iter().map(|s| s.package.clone()).collect();
    let json = serde_json::to_string_pretty(&resolved)?;
    std::fs::write(root.join(packages::RESOLVED_FILE), json).map_err(|e| {
        BerthError::Storage(format!("failed to write resolved set: {}", e))
    })?;

    Ok(resolved)
}

fn verify_archive(selection: &Selection) -> BerthResult<()> {
    let package = &selection.package;
    let file = File::open(&selection.archive).map_err(|e| DependencyError::UnreachableSource {
        source_path: selection.archive.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut hasher = Sha256::new();
    std::io::copy(&mut BufReader::new(file), &mut hasher).map_err(|e| {
        DependencyError::UnreachableSource {
            source_path: selection.archive.display().to_string(),
            reason: e.to_string(),
        }
    })?;
    let actual = hex::encode(hasher.finalize());

    if actual != package.sha256 {
        return Err(DependencyError::Integrity {
            package: package.name.clone(),
            version: package.version.clone(),
            expected: package.sha256.clone(),
            actual,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive_with(path: &Path, file: &str, content: &[u8]) -> String {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_path(file).unwrap();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, content).unwrap();
        let bytes = builder.into_inner().unwrap();
        std::fs::write(path, &bytes).unwrap();
        hex::encode(Sha256::digest(&bytes))
    }

    fn selection(name: &str, archive: PathBuf, sha256: String) -> Selection {
        Selection {
            package: ResolvedPackage {
                name: name.into(),
                version: "1.0".into(),
                sha256,
            },
            archive,
        }
    }

    #[test]
    fn test_install_unpacks_and_records() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("core.tar");
        let sha = archive_with(&archive, "core/__init__.txt", b"core");
        let fs_root = temp.path().join("rootfs");

        let resolved = install(&[selection("core", archive, sha)], &fs_root).unwrap();
        assert_eq!(resolved.len(), 1);

        let root = install_root(&fs_root);
        assert!(root.starts_with(&fs_root));
        assert_eq!(
            std::fs::read(root.join("core/core/__init__.txt")).unwrap(),
            b"core"
        );
        let recorded: Vec<ResolvedPackage> =
            serde_json::from_slice(&std::fs::read(root.join("resolved.json")).unwrap()).unwrap();
        assert_eq!(recorded, resolved);
    }

    #[test]
    fn test_integrity_failure_installs_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let good = temp.path().join("good.tar");
        let good_sha = archive_with(&good, "a.txt", b"a");
        let bad = temp.path().join("bad.tar");
        archive_with(&bad, "b.txt", b"b");
        let fs_root = temp.path().join("rootfs");

        let err = install(
            &[
                selection("good", good, good_sha),
                selection("bad", bad, "00".repeat(32)),
            ],
            &fs_root,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            BerthError::Dependency(DependencyError::Integrity { .. })
        ));
        assert!(!fs_root.exists());
    }

    #[test]
    fn test_missing_archive_is_unreachable() {
        let temp = tempfile::tempdir().unwrap();
        let err = install(
            &[selection("gone", temp.path().join("gone.tar"), "00".into())],
            &temp.path().join("rootfs"),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BerthError::Dependency(DependencyError::UnreachableSource { .. })
        ));
    }
}
