//! Configuration for berth.

use crate::runtime::constants::{envs as const_envs, launch_defaults, service};
use crate::runtime::layout::dirs as const_dirs;
use berth_shared::errors::{BerthError, BerthResult};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Runtime Options
// ============================================================================

/// Configuration options for a berth runtime.
///
/// Users can create it with defaults and modify fields as needed.
#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    pub home_dir: PathBuf,

    /// Package index directories trusted by `INSTALL`.
    ///
    /// An `INSTALL` step may only resolve from these directories. With an
    /// `--index` flag it must name one of them; without it every trusted
    /// index is consulted in order.
    pub package_indexes: Vec<PathBuf>,

    /// Registries to search for unqualified base image references.
    ///
    /// - Empty list (default): uses docker.io as the implicit default
    /// - Non-empty list: tries each registry in order, first success wins
    /// - Fully qualified refs (e.g., `"quay.io/foo:1.0"`) bypass this list
    pub image_registries: Vec<String>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        let home_dir = std::env::var(const_envs::BERTH_HOME)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
                path.push(const_dirs::BERTH_DIR);
                path
            });

        let package_indexes = std::env::var(const_envs::BERTH_INDEXES)
            .map(|value| parse_index_list(&value))
            .unwrap_or_default();

        Self {
            home_dir,
            package_indexes,
            image_registries: Vec::new(),
        }
    }
}

/// Split a `:`-separated index list, skipping empty entries.
pub fn parse_index_list(value: &str) -> Vec<PathBuf> {
    value
        .split(':')
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
        .collect()
}

// ============================================================================
// Build Options
// ============================================================================

/// Options for a single image build.
#[derive(Clone, Debug, Default)]
pub struct BuildOptions {
    /// Recipe file. Relative paths are resolved against the build context.
    /// Defaults to `Berthfile` in the context.
    pub recipe_file: Option<PathBuf>,

    /// Skip cache lookups. Entries are still recorded.
    pub no_cache: bool,
}

// ============================================================================
// Launch Options
// ============================================================================

/// Options used when launching a container from an image.
#[derive(Clone, Debug)]
pub struct LaunchOptions {
    /// Published ports. Empty publishes the serve port on the same host port.
    pub ports: Vec<PortSpec>,

    /// Environment overrides, applied over the image environment.
    pub env: Vec<(String, String)>,

    /// Time in-flight requests get to finish after a stop request.
    pub grace_period: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            env: Vec::new(),
            grace_period: launch_defaults::GRACE_PERIOD,
        }
    }
}

/// Port mapping specification (host -> container).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub host_port: u16,
    pub container_port: u16,
}

impl PortSpec {
    /// Publish the service port on the same host port.
    pub fn service_default() -> Self {
        Self {
            host_port: service::PORT,
            container_port: service::PORT,
        }
    }
}

impl FromStr for PortSpec {
    type Err = BerthError;

    /// Parse `host:container` or a bare `port` (same on both sides).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_port = |p: &str| {
            p.trim().parse::<u16>().map_err(|_| {
                BerthError::InvalidArgument(format!("invalid port '{p}' in mapping '{s}'"))
            })
        };

        let (host_port, container_port) = match s.split_once(':') {
            Some((host, container)) => (parse_port(host)?, parse_port(container)?),
            None => {
                let port = parse_port(s)?;
                (port, port)
            }
        };

        // Port 0 would ask the kernel for a random port, which defeats the
        // fixed-port contract.
        if host_port == 0 || container_port == 0 {
            return Err(BerthError::InvalidArgument(format!(
                "port mapping '{s}' must use non-zero ports"
            )));
        }

        Ok(Self {
            host_port,
            container_port,
        })
    }
}

/// Parse a `KEY=VALUE` environment override.
pub fn parse_env_pair(s: &str) -> BerthResult<(String, String)> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(BerthError::InvalidArgument(format!(
            "invalid environment variable '{s}': expected KEY=VALUE"
        ))),
    }
}
