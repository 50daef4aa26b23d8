//! Constants shared between the builder, the launcher and the CLI.

/// Service defaults baked into the canonical recipe.
pub mod service {
    /// Port the service declares and binds.
    pub const PORT: u16 = 8080;

    /// Bind address for container processes (all interfaces).
    pub const BIND_HOST: &str = "0.0.0.0";

    /// Entry point imported by the server process.
    pub const ENTRY_POINT: &str = "server:app";

    /// Working directory of the canonical recipe.
    pub const WORKDIR: &str = "/app";

    /// Dependency manifest file name, relative to the build context.
    pub const MANIFEST: &str = "requirements.txt";

    /// Command word that starts the server process.
    pub const SERVE_COMMAND: &str = "serve";
}

/// Build recipe conventions.
pub mod recipe {
    /// Default recipe file name inside the build context.
    pub const DEFAULT_FILE: &str = "Berthfile";

    /// Reference of the empty base image.
    pub const SCRATCH: &str = "scratch";
}

/// Where installed dependencies live inside an image.
pub mod packages {
    /// Install root for resolved packages.
    pub const INSTALL_ROOT: &str = "/usr/local/lib/berth/packages";

    /// Resolved set written next to the installed packages.
    pub const RESOLVED_FILE: &str = "resolved.json";

    /// Package index descriptor file name.
    pub const INDEX_FILE: &str = "index.json";
}

/// Process exit codes.
pub mod exit_codes {
    /// Graceful shutdown.
    pub const OK: i32 = 0;

    /// Any failure that is not a startup failure.
    pub const FAILURE: i32 = 1;

    /// Import, lifespan or bind failure during startup.
    pub const STARTUP_FAILURE: i32 = 3;
}
