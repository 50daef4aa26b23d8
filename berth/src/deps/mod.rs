//! Dependency manifests, package indexes, resolution and installation.

mod index;
mod installer;
mod manifest;
mod resolver;
mod version;

pub use index::{Candidate, IndexEntry, IndexFile, PackageIndex, open_trusted};
pub use installer::{install, install_root};
pub use manifest::{DependencyManifest, Requirement, normalize_name};
pub use resolver::{ResolvedPackage, Selection, resolve};
pub use version::{Operator, PreRelease, Specifier, Version, VersionReq};
