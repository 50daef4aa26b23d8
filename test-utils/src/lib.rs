//! Shared fixtures for berth integration tests.
//!
//! Nothing here touches the network: package indexes are built on disk and
//! base images are `scratch` or imported tarballs.

mod http;
mod index;
mod project;

pub use http::{free_port, http_get, wait_for_port};
pub use index::{PackageIndexFixture, WrittenIndex};
pub use project::ServiceProject;

use berth::{BerthRuntime, RuntimeOptions};
use std::path::PathBuf;
use tempfile::TempDir;

/// A runtime with a private home directory.
///
/// The home directory is removed when the value is dropped.
pub struct TestRuntime {
    pub runtime: BerthRuntime,
    pub home: TempDir,
}

impl TestRuntime {
    pub fn new(package_indexes: Vec<PathBuf>) -> Self {
        let home = TempDir::new().expect("create test home");
        let runtime = BerthRuntime::new(RuntimeOptions {
            home_dir: home.path().to_path_buf(),
            package_indexes,
            image_registries: Vec::new(),
        })
        .expect("create runtime");
        Self { runtime, home }
    }
}
