//! Container root filesystem materialization.

use std::path::PathBuf;

use berth_shared::errors::{BerthError, BerthResult};

use crate::images::archive::apply_layer_tarball;
use crate::images::{ImageConfig, ImageStore};
use crate::runtime::layout::ContainerLayout;
use crate::util::run_blocking;

/// Removes the container directory when dropped.
///
/// Containers are never persisted: the rootfs goes away on every exit path,
/// including startup failures.
pub struct ContainerDir {
    layout: ContainerLayout,
}

impl ContainerDir {
    pub fn create(layout: ContainerLayout) -> BerthResult<Self> {
        layout.prepare()?;
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &ContainerLayout {
        &self.layout
    }
}

impl Drop for ContainerDir {
    fn drop(&mut self) {
        if let Err(e) = self.layout.remove() {
            tracing::warn!("Failed to remove container directory: {}", e);
        } else {
            tracing::debug!(root = %self.layout.root().display(), "Removed container directory");
        }
    }
}

/// Apply the image layers in order and return the host path of the working
/// directory, which must exist in the result.
pub async fn materialize(
    store: &ImageStore,
    config: &ImageConfig,
    layout: &ContainerLayout,
) -> BerthResult<PathBuf> {
    let mut tarballs = Vec::with_capacity(config.layers.len());
    for digest in &config.layers {
        tarballs.push(store.layer_tarball(digest).await);
    }

    let rootfs = layout.rootfs_dir();
    let target = rootfs.clone();
    let layers = tarballs.len();
    run_blocking(move || {
        for tarball in &tarballs {
            apply_layer_tarball(tarball, &target)?;
        }
        Ok(())
    })
    .await?;

    let working_dir = layout.host_path(&config.working_dir);
    if !working_dir.is_dir() {
        return Err(BerthError::Image(format!(
            "working directory {} does not exist in the image",
            config.working_dir
        )));
    }

    tracing::debug!(rootfs = %rootfs.display(), layers, "Materialized container rootfs");
    Ok(working_dir)
}
