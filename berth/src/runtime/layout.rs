use berth_shared::errors::{BerthError, BerthResult};
use std::path::{Path, PathBuf};

use super::constants::filenames;

/// Directory structure constants
pub mod dirs {
    /// Base directory name for berth data
    pub const BERTH_DIR: &str = ".berth";

    /// Subdirectory for image blobs and the image index
    pub const IMAGES_DIR: &str = "images";

    /// Subdirectory for layer tarballs
    pub const LAYERS_DIR: &str = "layers";

    /// Subdirectory for image configs
    pub const CONFIGS_DIR: &str = "configs";

    /// Subdirectory for registry manifests
    pub const MANIFESTS_DIR: &str = "manifests";

    /// Subdirectory for running containers
    pub const CONTAINERS_DIR: &str = "containers";

    /// Container rootfs directory name
    pub const ROOTFS_DIR: &str = "rootfs";

    /// Subdirectory for log files
    pub const LOGS_DIR: &str = "logs";

    /// Subdirectory for lock files
    pub const LOCKS_DIR: &str = "locks";

    /// Subdirectory for build staging areas
    pub const TMP_DIR: &str = "tmp";
}

// ============================================================================
// FILESYSTEM LAYOUT (home directory)
// ============================================================================

/// Layout of a berth home directory.
///
/// ```text
/// ~/.berth/
/// ├── images/            # ImageFilesystemLayout
/// ├── containers/{id}/   # ContainerLayout (removed on exit)
/// ├── cache.json         # build cache
/// ├── locks/build.lock
/// ├── logs/
/// └── tmp/               # build staging areas
/// ```
#[derive(Clone, Debug)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn images_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::IMAGES_DIR)
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::CONTAINERS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LOGS_DIR)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LOCKS_DIR)
    }

    /// Staging areas live on the same filesystem as the blob store so
    /// committed layers can be renamed into place.
    pub fn temp_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::TMP_DIR)
    }

    pub fn build_cache_file(&self) -> PathBuf {
        self.home_dir.join(filenames::BUILD_CACHE)
    }

    pub fn build_lock_file(&self) -> PathBuf {
        self.locks_dir().join(filenames::BUILD_LOCK)
    }

    /// Initialize the filesystem structure.
    pub fn prepare(&self) -> BerthResult<()> {
        for (dir, what) in [
            (self.home_dir.clone(), "home"),
            (self.containers_dir(), "containers dir"),
            (self.logs_dir(), "logs dir"),
            (self.locks_dir(), "locks dir"),
            (self.temp_dir(), "temp dir"),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| BerthError::Storage(format!("failed to create {what}: {e}")))?;
        }

        self.image_layout().prepare()
    }

    /// Layout of the images directory.
    pub fn image_layout(&self) -> ImageFilesystemLayout {
        ImageFilesystemLayout::new(self.images_dir())
    }

    /// Layout for a specific container.
    pub fn container_layout(&self, container_id: &str) -> ContainerLayout {
        ContainerLayout::new(self.containers_dir().join(container_id))
    }
}

// ============================================================================
// IMAGE FILESYSTEM LAYOUT
// ============================================================================

/// Content-addressed image storage.
///
/// ```text
/// ~/.berth/images/
/// ├── layers/sha256-{hex}.tar.gz
/// ├── configs/sha256-{hex}.json
/// ├── manifests/sha256-{hex}.json   # registry manifests of pulled bases
/// └── index.json                    # tag -> image
/// ```
#[derive(Clone, Debug)]
pub struct ImageFilesystemLayout {
    images_dir: PathBuf,
}

impl ImageFilesystemLayout {
    pub fn new(images_dir: PathBuf) -> Self {
        Self { images_dir }
    }

    /// Root directory: ~/.berth/images
    pub fn root(&self) -> &Path {
        &self.images_dir
    }

    pub fn layers_dir(&self) -> PathBuf {
        self.images_dir.join(dirs::LAYERS_DIR)
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.images_dir.join(dirs::CONFIGS_DIR)
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.images_dir.join(dirs::MANIFESTS_DIR)
    }

    pub fn index_file(&self) -> PathBuf {
        self.images_dir.join(filenames::IMAGE_INDEX)
    }

    pub fn prepare(&self) -> BerthResult<()> {
        for dir in [self.layers_dir(), self.configs_dir(), self.manifests_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                BerthError::Storage(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }
}

// ============================================================================
// CONTAINER LAYOUT (per-container directory)
// ============================================================================

/// Filesystem layout of one running container.
#[derive(Clone, Debug)]
pub struct ContainerLayout {
    root: PathBuf,
}

impl ContainerLayout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Materialized image filesystem: {root}/rootfs
    pub fn rootfs_dir(&self) -> PathBuf {
        self.root.join(dirs::ROOTFS_DIR)
    }

    /// Resolve an absolute in-image path to a host path under the rootfs.
    pub fn host_path(&self, image_path: &str) -> PathBuf {
        self.rootfs_dir().join(image_path.trim_start_matches('/'))
    }

    pub fn prepare(&self) -> BerthResult<()> {
        std::fs::create_dir_all(self.rootfs_dir()).map_err(|e| {
            BerthError::Storage(format!(
                "failed to create container rootfs {}: {e}",
                self.rootfs_dir().display()
            ))
        })
    }

    /// Remove the container directory. Containers are never persisted.
    pub fn remove(&self) -> BerthResult<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BerthError::Storage(format!(
                "failed to remove container dir {}: {e}",
                self.root.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_creates_directories() {
        let temp_dir = tempfile::tempdir().unwrap();
        let layout = FilesystemLayout::new(temp_dir.path().join("home"));
        layout.prepare().unwrap();

        let images = layout.image_layout();
        assert!(images.layers_dir().is_dir());
        assert!(images.configs_dir().is_dir());
        assert!(images.manifests_dir().is_dir());
        assert!(layout.temp_dir().is_dir());
        assert!(layout.locks_dir().is_dir());
    }

    #[test]
    fn test_container_host_path() {
        let layout = ContainerLayout::new(PathBuf::from("/h/containers/c1"));
        assert_eq!(
            layout.host_path("/app"),
            PathBuf::from("/h/containers/c1/rootfs/app")
        );
        assert_eq!(layout.host_path("/"), PathBuf::from("/h/containers/c1/rootfs/"));
    }

    #[test]
    fn test_container_remove_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let layout = ContainerLayout::new(temp_dir.path().join("c1"));
        layout.prepare().unwrap();
        layout.remove().unwrap();
        assert!(!layout.root().exists());
        layout.remove().unwrap();
    }
}
