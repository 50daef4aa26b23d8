//! Image configuration.
//!
//! The canonical JSON serialization of [`ImageConfig`] is what the image id
//! is computed from, so field order and types here are part of the image
//! identity. Nothing time-dependent belongs in this struct.

use std::collections::BTreeMap;

use berth_shared::errors::{BerthError, BerthResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::deps::ResolvedPackage;

/// Default search path for images that do not declare one.
const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Runtime configuration of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Base reference the image was built from.
    pub base: String,

    /// Working directory (e.g., "/app").
    pub working_dir: String,

    /// Environment variables (e.g., ["PATH=/usr/bin", "HOME=/root"]).
    pub env: Vec<String>,

    /// Exposed ports (e.g., ["8080/tcp"]).
    pub exposed_ports: Vec<String>,

    /// Startup command (exec form).
    pub cmd: Vec<String>,

    /// Layer digests, bottom to top.
    pub layers: Vec<String>,

    /// Resolved dependency set installed into the image.
    #[serde(default)]
    pub packages: Vec<ResolvedPackage>,
}

impl ImageConfig {
    /// Configuration of the empty base image.
    pub fn scratch() -> Self {
        Self {
            base: crate::runtime::constants::recipe::SCRATCH.to_string(),
            working_dir: "/".to_string(),
            env: vec![DEFAULT_PATH.to_string()],
            exposed_ports: Vec::new(),
            cmd: Vec::new(),
            layers: Vec::new(),
            packages: Vec::new(),
        }
    }

    /// Canonical bytes hashed into the image id.
    pub fn canonical_bytes(&self) -> BerthResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| BerthError::Internal(format!("failed to serialize image config: {e}")))
    }

    /// Content-addressed image id (`sha256:<hex>` of the canonical bytes).
    pub fn image_id(&self) -> BerthResult<String> {
        let bytes = self.canonical_bytes()?;
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(&bytes))))
    }

    /// Parse port number and protocol from exposed port string
    ///
    /// # Examples
    /// - "8080/tcp" -> Some((8080, "tcp"))
    /// - "8080" -> Some((8080, "tcp")) // Default to TCP
    pub fn parse_exposed_port(port_spec: &str) -> Option<(u16, &str)> {
        let mut parts = port_spec.split('/');
        let port: u16 = parts.next()?.parse().ok()?;
        let protocol = parts.next().unwrap_or("tcp");
        Some((port, protocol))
    }

    /// Get TCP ports from exposed ports
    pub fn tcp_ports(&self) -> Vec<u16> {
        self.exposed_ports
            .iter()
            .filter_map(|spec| {
                Self::parse_exposed_port(spec).and_then(|(port, protocol)| {
                    if protocol == "tcp" { Some(port) } else { None }
                })
            })
            .collect()
    }

    /// Declare a TCP port. Declaring the same port twice is a no-op.
    pub fn expose(&mut self, port: u16) {
        let spec = format!("{port}/tcp");
        if !self.exposed_ports.contains(&spec) {
            self.exposed_ports.push(spec);
        }
    }

    /// Set one variable, replacing an earlier value in place.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let entry = format!("{key}={value}");
        match self
            .env
            .iter_mut()
            .find(|e| e.split_once('=').map(|(k, _)| k) == Some(key))
        {
            Some(existing) => *existing = entry,
            None => self.env.push(entry),
        }
    }

    /// Merge user-provided environment variables over the image environment.
    ///
    /// User values win on key collisions. Output is sorted for determinism.
    pub fn merged_env(&self, overrides: &[(String, String)]) -> Vec<String> {
        let mut env_map: BTreeMap<&str, &str> = BTreeMap::new();
        for entry in &self.env {
            if let Some((key, value)) = entry.split_once('=') {
                env_map.insert(key, value);
            }
        }
        for (key, value) in overrides {
            env_map.insert(key.as_str(), value.as_str());
        }

        env_map
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }

    /// Convert an OCI image configuration of a pulled base image.
    pub fn from_oci_config(
        base: &str,
        image_config: &oci_spec::image::ImageConfiguration,
        layers: Vec<String>,
    ) -> BerthResult<Self> {
        let mut config = Self::scratch();
        config.base = base.to_string();
        config.layers = layers;

        let Some(oci) = image_config.config().as_ref() else {
            return Ok(config);
        };

        let mut cmd = Vec::new();
        if let Some(ep) = oci.entrypoint().as_ref() {
            cmd.extend(ep.iter().cloned());
        }
        if let Some(c) = oci.cmd().as_ref() {
            cmd.extend(c.iter().cloned());
        }
        config.cmd = cmd;

        if let Some(env) = oci.env().as_ref() {
            config.env = env.clone();
        }
        if let Some(dir) = oci.working_dir().as_ref().filter(|d| !d.is_empty()) {
            config.working_dir = dir.clone();
        }
        if let Some(ports) = oci.exposed_ports().as_ref() {
            config.exposed_ports = ports.clone();
        }

        Ok(config)
    }
}
