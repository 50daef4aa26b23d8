//! Error types shared by every berth crate.
//!
//! Failures fall into two independent domains:
//! - build time: recipe, manifest, dependency and storage errors. A build that
//!   fails with any of these never tags an image.
//! - run time: entry point, startup and bind errors. These are fatal to the
//!   container process, which exits non-zero.

use thiserror::Error;

/// Result alias used across the workspace.
pub type BerthResult<T> = Result<T, BerthError>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum BerthError {
    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("image error: {0}")]
    Image(String),

    /// Build recipe could not be parsed or validated.
    #[error("recipe error: {0}")]
    Recipe(String),

    /// Dependency manifest could not be read or parsed.
    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("entry point error: {0}")]
    EntryPoint(#[from] EntryPointError),

    /// Application lifespan startup failed.
    #[error("startup failed: {0}")]
    Startup(String),

    /// The requested listen address is held by another socket.
    #[error("address {addr} is already in use")]
    PortInUse { addr: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl BerthError {
    /// Whether this error belongs to the fatal startup class of the launcher.
    ///
    /// Startup failures exit with a dedicated code so supervisors can tell a
    /// broken image apart from a crash while serving.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            BerthError::EntryPoint(_) | BerthError::Startup(_) | BerthError::PortInUse { .. }
        )
    }
}

/// Dependency resolution and installation failures.
#[derive(Debug, Error)]
pub enum DependencyError {
    /// No candidate satisfies the constraints.
    #[error("no version of '{package}' satisfies '{constraint}' (available: {available})")]
    Unresolvable {
        package: String,
        constraint: String,
        available: String,
    },

    /// A later constraint excludes an already selected version.
    #[error("'{package}' {selected} was selected but '{constraint}' (from {required_by}) excludes it")]
    Conflict {
        package: String,
        selected: String,
        constraint: String,
        required_by: String,
    },

    /// Package source is not in the trusted set.
    #[error("package source {0} is not trusted")]
    UntrustedSource(String),

    /// Package source is missing or unreadable.
    #[error("package source {source_path} is unreachable: {reason}")]
    UnreachableSource { source_path: String, reason: String },

    /// Archive checksum does not match the index.
    #[error("integrity check failed for {package} {version}: expected sha256:{expected}, got sha256:{actual}")]
    Integrity {
        package: String,
        version: String,
        expected: String,
        actual: String,
    },
}

/// Entry point resolution failures.
///
/// "Not found" and "found but not an application" are distinct kinds so the
/// launcher can report which side of the import went wrong.
#[derive(Debug, Error)]
pub enum EntryPointError {
    #[error("malformed entry point reference '{0}': expected '<module>:<attribute>'")]
    MalformedReference(String),

    #[error("could not import module '{module}'")]
    ModuleNotFound { module: String },

    #[error("attribute '{attribute}' not found in module '{module}'")]
    AttributeNotFound { module: String, attribute: String },

    #[error("'{reference}' is a {found}, not an application")]
    InvalidShape { reference: String, found: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_failure_classification() {
        let import = BerthError::from(EntryPointError::ModuleNotFound {
            module: "server".into(),
        });
        assert!(import.is_startup_failure());

        let bind = BerthError::PortInUse {
            addr: "0.0.0.0:8080".into(),
        };
        assert!(bind.is_startup_failure());

        assert!(!BerthError::Storage("disk full".into()).is_startup_failure());
    }

    #[test]
    fn test_error_messages_name_the_subject() {
        let err = BerthError::from(EntryPointError::AttributeNotFound {
            module: "server".into(),
            attribute: "app".into(),
        });
        assert_eq!(
            err.to_string(),
            "entry point error: attribute 'app' not found in module 'server'"
        );

        let err = BerthError::from(DependencyError::UntrustedSource("/tmp/pkgs".into()));
        assert!(err.to_string().contains("/tmp/pkgs"));
    }
}
