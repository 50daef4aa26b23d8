use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A package index directory built from in-memory packages.
///
/// ```ignore
/// let index = PackageIndexFixture::new()
///     .package("starlette", "0.37.2", &["anyio>=3.4"])
///     .package("anyio", "4.3.0", &[])
///     .write();
/// ```
#[derive(Default)]
pub struct PackageIndexFixture {
    packages: Vec<(String, String, Vec<String>)>,
    corrupt: Vec<(String, String)>,
}

/// A written index. Dropping it removes the directory.
pub struct WrittenIndex {
    dir: TempDir,
}

impl WrittenIndex {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn path_buf(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Archive path of `name` `version`, as written.
    pub fn archive(&self, name: &str, version: &str) -> PathBuf {
        self.dir.path().join(archive_name(name, version))
    }
}

impl PackageIndexFixture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a package whose archive holds a single `__init__.py`.
    pub fn package(mut self, name: &str, version: &str, requires: &[&str]) -> Self {
        self.packages.push((
            name.to_string(),
            version.to_string(),
            requires.iter().map(|r| r.to_string()).collect(),
        ));
        self
    }

    /// Record a wrong checksum for `name` `version`.
    pub fn corrupt(mut self, name: &str, version: &str) -> Self {
        self.corrupt.push((name.to_string(), version.to_string()));
        self
    }

    pub fn write(self) -> WrittenIndex {
        let dir = TempDir::new().expect("create index dir");
        let mut packages: BTreeMap<String, Vec<Value>> = BTreeMap::new();

        for (name, version, requires) in &self.packages {
            let archive = archive_name(name, version);
            let bytes = package_archive(name, version);
            std::fs::write(dir.path().join(&archive), &bytes).expect("write archive");

            let mut sha256 = hex::encode(Sha256::digest(&bytes));
            if self.corrupt.iter().any(|(n, v)| n == name && v == version) {
                sha256 = "0".repeat(64);
            }

            packages.entry(name.clone()).or_default().push(json!({
                "version": version,
                "archive": archive,
                "sha256": sha256,
                "requires": requires,
            }));
        }

        let descriptor = json!({ "packages": packages });
        std::fs::write(
            dir.path().join("index.json"),
            serde_json::to_vec_pretty(&descriptor).expect("serialize index"),
        )
        .expect("write index.json");

        WrittenIndex { dir }
    }
}

fn archive_name(name: &str, version: &str) -> String {
    format!("{name}-{version}.tar.gz")
}

/// A reproducible gzip tarball: fixed mtime and ownership.
fn package_archive(name: &str, version: &str) -> Vec<u8> {
    let body = format!("__version__ = \"{version}\"\n");
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));

    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    builder
        .append_data(&mut header, format!("{name}/__init__.py"), body.as_bytes())
        .expect("append package file");

    builder
        .into_inner()
        .and_then(|gz| gz.finish())
        .expect("finish archive")
}
