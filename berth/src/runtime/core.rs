//! Runtime facade tying the image store, the builder and the launcher to
//! one home directory.

use std::path::Path;
use std::sync::Arc;

use berth_shared::errors::{BerthError, BerthResult};

use crate::app::EntryPointRegistry;
use crate::builder::{BuildReport, ImageBuilder};
use crate::images::ImageStore;
use crate::launcher::{LaunchOutcome, Launcher, RunningContainer, ShutdownHandle};
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::options::{BuildOptions, LaunchOptions, RuntimeOptions};

// ============================================================================
// PUBLIC API
// ============================================================================

/// Entry point for building images and running containers.
///
/// **Cloning**: cheap, all clones share the same store and entry points.
///
/// Several runtimes may share a home directory. Builds serialize on a build
/// lock; the image index is updated through atomic renames.
#[derive(Clone)]
pub struct BerthRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    options: RuntimeOptions,
    layout: FilesystemLayout,
    store: Arc<ImageStore>,
    entry_points: Arc<EntryPointRegistry>,
}

impl BerthRuntime {
    /// Create a runtime rooted at `options.home_dir`.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `home_dir` is not absolute
    /// - the home directory cannot be initialized
    pub fn new(options: RuntimeOptions) -> BerthResult<Self> {
        if !options.home_dir.is_absolute() {
            return Err(BerthError::Config(format!(
                "home_dir must be absolute path, got: {}",
                options.home_dir.display()
            )));
        }

        let layout = FilesystemLayout::new(options.home_dir.clone());
        layout.prepare().map_err(|e| {
            BerthError::Storage(format!(
                "Failed to initialize filesystem at {}: {}",
                layout.home_dir().display(),
                e
            ))
        })?;

        let store = ImageStore::new(layout.images_dir(), options.image_registries.clone())
            .map_err(|e| {
                BerthError::Storage(format!(
                    "Failed to initialize image store at {}: {}",
                    layout.images_dir().display(),
                    e
                ))
            })?;

        tracing::debug!(
            home_dir = %layout.home_dir().display(),
            indexes = options.package_indexes.len(),
            "initialized runtime"
        );

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                options,
                layout,
                store: Arc::new(store),
                entry_points: Arc::new(EntryPointRegistry::new()),
            }),
        })
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    pub fn layout(&self) -> &FilesystemLayout {
        &self.inner.layout
    }

    /// Local image store.
    pub fn images(&self) -> &ImageStore {
        &self.inner.store
    }

    /// Registry used to resolve container entry points.
    pub fn entry_points(&self) -> &EntryPointRegistry {
        &self.inner.entry_points
    }

    pub fn builder(&self) -> ImageBuilder {
        ImageBuilder::new(
            self.inner.layout.clone(),
            Arc::clone(&self.inner.store),
            self.inner.options.package_indexes.clone(),
        )
    }

    /// Build `context_dir` and tag the image.
    pub async fn build(
        &self,
        context_dir: &Path,
        tag: &str,
        options: &BuildOptions,
    ) -> BerthResult<BuildReport> {
        self.builder().build(context_dir, tag, options).await
    }

    pub fn launcher(&self) -> Launcher {
        Launcher::new(
            self.inner.layout.clone(),
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.entry_points),
        )
    }

    /// Start a container and return once it is accepting connections.
    pub async fn start(
        &self,
        image: &str,
        options: &LaunchOptions,
        shutdown: ShutdownHandle,
    ) -> BerthResult<RunningContainer> {
        self.launcher().start(image, options, shutdown).await
    }

    /// Run a container until `shutdown` stops it.
    pub async fn run(
        &self,
        image: &str,
        options: &LaunchOptions,
        shutdown: ShutdownHandle,
    ) -> BerthResult<LaunchOutcome> {
        self.launcher().run(image, options, shutdown).await
    }
}

impl std::fmt::Debug for BerthRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BerthRuntime")
            .field("home_dir", &self.inner.layout.home_dir())
            .finish()
    }
}

// Compile-time assertion that the runtime can be shared across tasks.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<BerthRuntime>;
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_relative_home_rejected() {
        let options = RuntimeOptions {
            home_dir: PathBuf::from("relative/home"),
            package_indexes: Vec::new(),
            image_registries: Vec::new(),
        };
        assert!(matches!(BerthRuntime::new(options), Err(BerthError::Config(_))));
    }

    #[tokio::test]
    async fn test_new_prepares_home() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = BerthRuntime::new(RuntimeOptions {
            home_dir: temp.path().to_path_buf(),
            package_indexes: Vec::new(),
            image_registries: Vec::new(),
        })
        .unwrap();

        assert!(runtime.layout().images_dir().is_dir());
        assert!(runtime.images().list().await.is_empty());
    }
}
