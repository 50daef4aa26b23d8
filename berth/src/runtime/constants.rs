//! Constants for the berth runtime.
//!
//! Centralized location for hardcoded names and environment variables.

pub use berth_shared::constants::{exit_codes, packages, recipe, service};

pub mod envs {
    pub const BERTH_HOME: &str = "BERTH_HOME";

    /// `:`-separated list of trusted package index directories.
    pub const BERTH_INDEXES: &str = "BERTH_INDEXES";
}

/// Launcher defaults
pub mod launch_defaults {
    use std::time::Duration;

    /// Time in-flight requests get to finish after a stop request.
    pub const GRACE_PERIOD: Duration = Duration::from_secs(10);
}

/// File naming patterns
pub mod filenames {
    /// Image index file name (tags -> images)
    pub const IMAGE_INDEX: &str = "index.json";

    /// Build cache file name
    pub const BUILD_CACHE: &str = "cache.json";

    /// Build lock file name
    pub const BUILD_LOCK: &str = "build.lock";

    /// Rolling log file prefix
    pub const LOG_FILE: &str = "berth.log";
}
