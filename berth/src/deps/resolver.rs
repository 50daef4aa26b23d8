//! Deterministic dependency resolution.
//!
//! Requirements are processed breadth-first in manifest order. The first
//! time a package is reached, the highest version satisfying the constraint
//! is selected (ties between indexes go to the earlier index) and its own
//! requirements are queued. A constraint met later that excludes the
//! selected version is a conflict: there is no backtracking, so the same
//! inputs always resolve the same way or fail the same way.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use berth_shared::errors::{BerthResult, DependencyError};
use serde::{Deserialize, Serialize};

use super::index::{Candidate, PackageIndex};
use super::manifest::{DependencyManifest, Requirement};

/// One entry of the resolved dependency set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: String,
    pub sha256: String,
}

/// A selected package together with where to install it from.
#[derive(Debug, Clone)]
pub struct Selection {
    pub package: ResolvedPackage,
    pub archive: PathBuf,
}

const FROM_MANIFEST: &str = "manifest";

/// Resolve `manifest` against `indexes` (in priority order).
///
/// The result is sorted by package name.
pub fn resolve(
    manifest: &DependencyManifest,
    indexes: &[PackageIndex],
) -> BerthResult<Vec<Selection>> {
    let mut queue: VecDeque<(Requirement, String)> = manifest
        .requirements
        .iter()
        .cloned()
        .map(|r| (r, FROM_MANIFEST.to_string()))
        .collect();
    let mut selected: HashMap<String, Candidate> = HashMap::new();

    while let Some((requirement, required_by)) = queue.pop_front() {
        if let Some(existing) = selected.get(&requirement.name) {
            if !requirement.constraint.matches(&existing.version) {
                return Err(DependencyError::Conflict {
                    package: requirement.name.clone(),
                    selected: existing.version.to_string(),
                    constraint: requirement.constraint.to_string(),
                    required_by,
                }
                .into());
            }
            continue;
        }

        let candidate = best_candidate(&requirement, indexes)?;
        tracing::debug!(
            package = %candidate.name,
            version = %candidate.version,
            required_by = %required_by,
            "Selected package"
        );

        let parent = format!("{} {}", candidate.name, candidate.version);
        for dependency in &candidate.requires {
            queue.push_back((dependency.clone(), parent.clone()));
        }
        selected.insert(requirement.name.clone(), candidate);
    }

    let mut selections: Vec<Selection> = selected
        .into_values()
        .map(|c| Selection {
            package: ResolvedPackage {
                name: c.name,
                version: c.version.to_string(),
                sha256: c.sha256,
            },
            archive: c.archive,
        })
        .collect();
    selections.sort_by(|a, b| a.package.cmp(&b.package));
    Ok(selections)
}

/// Pre-releases are picked only when the constraint names one or when no
/// final release satisfies it.
fn best_candidate(requirement: &Requirement, indexes: &[PackageIndex]) -> BerthResult<Candidate> {
    let allow_pre = requirement.constraint.allows_prereleases();
    let mut best: Option<&Candidate> = None;
    let mut best_pre: Option<&Candidate> = None;
    for index in indexes {
        for candidate in index.candidates(&requirement.name) {
            if !requirement.constraint.matches(&candidate.version) {
                continue;
            }
            let slot = if candidate.version.is_prerelease() && !allow_pre {
                &mut best_pre
            } else {
                &mut best
            };
            // Strictly greater: an equal version from a later index loses.
            if (*slot).is_none_or(|b| candidate.version > b.version) {
                *slot = Some(candidate);
            }
        }
    }

    best.or(best_pre).cloned().ok_or_else(|| {
        let mut available: Vec<String> = indexes
            .iter()
            .flat_map(|i| i.candidates(&requirement.name))
            .map(|c| c.version.to_string())
            .collect();
        available.dedup();
        DependencyError::Unresolvable {
            package: requirement.name.clone(),
            constraint: requirement.constraint.to_string(),
            available: if available.is_empty() {
                "none".to_string()
            } else {
                available.join(", ")
            },
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_shared::errors::BerthError;
    use std::path::Path;

    fn index_at(dir: &Path, json: &str) -> PackageIndex {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("index.json"), json).unwrap();
        PackageIndex::open(dir).unwrap()
    }

    fn names(selections: &[Selection]) -> Vec<String> {
        selections
            .iter()
            .map(|s| format!("{}=={}", s.package.name, s.package.version))
            .collect()
    }

    const WEB: &str = r#"{"packages":{
        "web": [
            {"version":"1.0","archive":"web-1.0.tgz","sha256":"01","requires":["core>=1"]},
            {"version":"1.2","archive":"web-1.2.tgz","sha256":"02","requires":["core>=2"]}
        ],
        "core": [
            {"version":"1.5","archive":"core-1.5.tgz","sha256":"03"},
            {"version":"2.1","archive":"core-2.1.tgz","sha256":"04"}
        ]
    }}"#;

    #[test]
    fn test_highest_satisfying_with_transitives() {
        let temp = tempfile::tempdir().unwrap();
        let index = index_at(temp.path(), WEB);
        let manifest = DependencyManifest::parse("web\n").unwrap();

        let resolved = resolve(&manifest, &[index]).unwrap();
        assert_eq!(names(&resolved), vec!["core==2.1", "web==1.2"]);
    }

    #[test]
    fn test_later_constraint_conflicts_without_backtracking() {
        let temp = tempfile::tempdir().unwrap();
        let index = index_at(temp.path(), WEB);
        // core<2 selects 1.5; web 1.2 later asks for core>=2.
        let manifest = DependencyManifest::parse("core<2\nweb==1.2\n").unwrap();
        let err = resolve(&manifest, &[index]).unwrap_err();
        match err {
            BerthError::Dependency(DependencyError::Conflict {
                package,
                selected,
                required_by,
                ..
            }) => {
                assert_eq!(package, "core");
                assert_eq!(selected, "1.5");
                assert_eq!(required_by, "web 1.2");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unresolvable_lists_available_versions() {
        let temp = tempfile::tempdir().unwrap();
        let index = index_at(temp.path(), WEB);
        let manifest = DependencyManifest::parse("core>=3\n").unwrap();

        let err = resolve(&manifest, &[index]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("core"), "{message}");
        assert!(message.contains("1.5, 2.1"), "{message}");
    }

    #[test]
    fn test_earlier_index_wins_ties() {
        let temp = tempfile::tempdir().unwrap();
        let first = index_at(
            &temp.path().join("first"),
            r#"{"packages":{"core":[{"version":"2.1","archive":"a.tgz","sha256":"aa"}]}}"#,
        );
        let second = index_at(
            &temp.path().join("second"),
            r#"{"packages":{"core":[{"version":"2.1.0","archive":"b.tgz","sha256":"bb"}]}}"#,
        );
        let manifest = DependencyManifest::parse("core\n").unwrap();

        let resolved = resolve(&manifest, &[first, second]).unwrap();
        assert_eq!(resolved[0].package.sha256, "aa");
    }

    #[test]
    fn test_prereleases_only_when_requested_or_alone() {
        let temp = tempfile::tempdir().unwrap();
        let index = index_at(
            temp.path(),
            r#"{"packages":{
                "core": [
                    {"version":"2.1","archive":"core-2.1.tgz","sha256":"01"},
                    {"version":"3.0rc1","archive":"core-3.0rc1.tgz","sha256":"02"}
                ],
                "edge": [{"version":"0.1.dev2","archive":"edge.tgz","sha256":"03"}]
            }}"#,
        );

        let manifest = DependencyManifest::parse("core
edge
").unwrap();
        let resolved = resolve(&manifest, std::slice::from_ref(&index)).unwrap();
        assert_eq!(names(&resolved), vec!["core==2.1", "edge==0.1.dev2"]);

        let manifest = DependencyManifest::parse("core==3.0rc1
").unwrap();
        let resolved = resolve(&manifest, &[index]).unwrap();
        assert_eq!(names(&resolved), vec!["core==3.0rc1"]);
    }

    #[test]
    fn test_empty_manifest_resolves_to_nothing() {
        let resolved = resolve(&DependencyManifest::default(), &[]).unwrap();
        assert!(resolved.is_empty());
    }
}
