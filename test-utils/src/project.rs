use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A service source tree used as a build context.
pub struct ServiceProject {
    dir: TempDir,
}

impl ServiceProject {
    /// A project with `requirements.txt`, `server.py` and the canonical
    /// service recipe for `base`.
    pub fn new(requirements: &str) -> Self {
        Self::with_base("scratch", requirements)
    }

    pub fn with_base(base: &str, requirements: &str) -> Self {
        let project = Self::empty();
        project.write("requirements.txt", requirements);
        project.write("server.py", "app = object()\n");
        project.write(
            "Berthfile",
            &berth::Recipe::service(base, 8080)
                .expect("canonical recipe")
                .to_string(),
        );
        project
    }

    pub fn empty() -> Self {
        Self {
            dir: TempDir::new().expect("create project dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file, creating parent directories.
    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(&path, contents).expect("write project file");
        path
    }

    pub fn remove(&self, relative: &str) {
        std::fs::remove_file(self.dir.path().join(relative)).expect("remove project file");
    }
}
