//! Local image storage: layers, configs, tags and base image pulls.

pub mod archive;
mod config;
mod index;
mod storage;
mod store;

pub use config::ImageConfig;
pub use index::{ImageIndex, ImageRecord};
pub use storage::{ImageStorage, sha256_file};
pub use store::{ImageStore, ResolvedImage};

use oci_client::Reference;

use crate::runtime::constants::recipe;

// ============================================================================
// Reference Pinning
// ============================================================================

/// Whether an image reference names a fixed version.
///
/// A reference is pinned when it carries a digest (`name@sha256:...`) or an
/// explicit tag other than `latest`. The empty `scratch` base is exempt.
pub fn is_pinned(image_ref: &str) -> bool {
    if image_ref == recipe::SCRATCH {
        return true;
    }

    if let Some((_, digest)) = image_ref.split_once('@') {
        return digest.starts_with("sha256:") && digest.len() > "sha256:".len();
    }

    // The tag separator is the last ':' after the last '/', so a registry
    // port ("localhost:5000/app") is not mistaken for a tag.
    let last_segment = image_ref.rsplit('/').next().unwrap_or(image_ref);
    match last_segment.split_once(':') {
        Some((_, tag)) => !tag.is_empty() && tag != "latest",
        None => false,
    }
}

// ============================================================================
// Registry Resolution (Reference Iterator)
// ============================================================================

/// Iterator that yields `Reference` candidates for an image.
///
/// For qualified images (e.g., `"ghcr.io/foo/bar:1.0"`), yields only the original.
/// For unqualified images (e.g., `"python:3.12-slim"`), yields one `Reference`
/// per configured registry, or the docker.io default when none are configured.
pub(crate) struct ReferenceIter<'a> {
    base_ref: Reference,
    registries: &'a [String],
    index: usize,
    is_qualified: bool,
    yielded_original: bool,
}

impl<'a> ReferenceIter<'a> {
    pub fn new(image_ref: &str, registries: &'a [String]) -> Result<Self, oci_client::ParseError> {
        let base_ref: Reference = image_ref.parse()?;
        let is_qualified = is_fully_qualified(image_ref);

        tracing::debug!(
            image_ref = %image_ref,
            is_qualified = %is_qualified,
            registry_count = registries.len(),
            "Created reference iterator for image resolution"
        );

        Ok(Self {
            base_ref,
            registries,
            index: 0,
            is_qualified,
            yielded_original: false,
        })
    }
}

impl Iterator for ReferenceIter<'_> {
    type Item = Reference;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_qualified || self.registries.is_empty() {
            if self.yielded_original {
                return None;
            }
            self.yielded_original = true;
            return Some(self.base_ref.clone());
        }

        let registry = self.registries.get(self.index)?;
        self.index += 1;

        let repository = self.base_ref.repository().to_string();
        Some(match self.base_ref.digest() {
            Some(digest) => Reference::with_digest(registry.clone(), repository, digest.to_string()),
            None => Reference::with_tag(
                registry.clone(),
                repository,
                self.base_ref.tag().unwrap_or("latest").to_string(),
            ),
        })
    }
}

/// Check if an image reference is fully qualified (contains a registry).
///
/// A reference is considered fully qualified if it contains a `/` and the
/// part before the first `/` looks like a registry hostname:
/// - Contains a `.` (e.g., `docker.io`, `ghcr.io`)
/// - Contains a `:` (e.g., `localhost:5000`)
/// - Is exactly `localhost`
fn is_fully_qualified(image_ref: &str) -> bool {
    if let Some((first_part, _)) = image_ref.split_once('/') {
        first_part.contains('.') || first_part.contains(':') || first_part == "localhost"
    } else {
        false
    }
}
