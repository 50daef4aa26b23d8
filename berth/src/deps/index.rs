//! Package indexes.
//!
//! A package index is a directory holding an `index.json` descriptor and the
//! archives it names:
//!
//! ```text
//! {
//!   "packages": {
//!     "starlette": [
//!       { "version": "0.37.2", "archive": "starlette-0.37.2.tar.gz",
//!         "sha256": "…", "requires": ["anyio>=3.4"] }
//!     ]
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use berth_shared::errors::{BerthError, BerthResult, DependencyError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::manifest::{Requirement, normalize_name};
use super::version::Version;
use crate::runtime::constants::packages;

/// On-disk index descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexFile {
    #[serde(default)]
    pub packages: BTreeMap<String, Vec<IndexEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub version: String,
    /// Archive path relative to the index directory.
    pub archive: String,
    /// Hex sha256 of the archive.
    pub sha256: String,
    #[serde(default)]
    pub requires: Vec<String>,
}

/// An installable package version.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub version: Version,
    pub archive: PathBuf,
    pub sha256: String,
    pub requires: Vec<Requirement>,
}

/// An opened, validated package index.
#[derive(Debug, Clone)]
pub struct PackageIndex {
    root: PathBuf,
    packages: BTreeMap<String, Vec<Candidate>>,
    fingerprint: String,
}

impl PackageIndex {
    /// Open the index rooted at `root`.
    ///
    /// A missing or unreadable descriptor is an unreachable source; a
    /// malformed one is reported the same way with the parse error.
    pub fn open(root: &Path) -> BerthResult<Self> {
        let descriptor = root.join(packages::INDEX_FILE);
        let unreachable = |reason: String| {
            BerthError::from(DependencyError::UnreachableSource {
                source_path: root.display().to_string(),
                reason,
            })
        };

        let bytes = std::fs::read(&descriptor)
            .map_err(|e| unreachable(format!("cannot read {}: {}", descriptor.display(), e)))?;
        let file: IndexFile = serde_json::from_slice(&bytes)
            .map_err(|e| unreachable(format!("invalid {}: {}", packages::INDEX_FILE, e)))?;

        let mut packages = BTreeMap::new();
        for (raw_name, entries) in file.packages {
            let name = normalize_name(&raw_name);
            let mut candidates = Vec::with_capacity(entries.len());
            for entry in entries {
                let version: Version = entry.version.parse().map_err(|e| {
                    unreachable(format!("{} {}: {}", raw_name, entry.version, e))
                })?;
                let requires = entry
                    .requires
                    .iter()
                    .map(|r| Requirement::parse(r))
                    .collect::<BerthResult<Vec<_>>>()
                    .map_err(|e| unreachable(format!("{} {}: {}", raw_name, entry.version, e)))?;
                candidates.push(Candidate {
                    name: name.clone(),
                    version,
                    archive: root.join(&entry.archive),
                    sha256: entry.sha256.to_ascii_lowercase(),
                    requires,
                });
            }
            packages
                .entry(name)
                .or_insert_with(Vec::new)
                .extend(candidates);
        }

        let fingerprint = hex::encode(Sha256::digest(&bytes));
        tracing::debug!(
            index = %root.display(),
            packages = packages.len(),
            fingerprint = %fingerprint,
            "Opened package index"
        );

        Ok(Self {
            root: root.to_path_buf(),
            packages,
            fingerprint,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Candidates for a normalized package name.
    pub fn candidates(&self, name: &str) -> &[Candidate] {
        self.packages.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// sha256 of the descriptor bytes; changes whenever the index changes.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Open the indexes an `INSTALL` step may use.
///
/// With `selected`, it must be one of `trusted`; otherwise every trusted
/// index is used in order.
pub fn open_trusted(trusted: &[PathBuf], selected: Option<&Path>) -> BerthResult<Vec<PackageIndex>> {
    match selected {
        Some(path) => {
            let wanted = canonical(path);
            if !trusted.iter().any(|t| canonical(t) == wanted) {
                return Err(DependencyError::UntrustedSource(path.display().to_string()).into());
            }
            Ok(vec![PackageIndex::open(path)?])
        }
        None => trusted.iter().map(|p| PackageIndex::open(p)).collect(),
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
