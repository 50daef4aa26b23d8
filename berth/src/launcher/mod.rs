//! Process launcher.
//!
//! ## Architecture
//!
//! ```text
//! resolve image ──→ validate ports ──→ Pipeline ──→ bind ──→ serve ──→ drain
//!
//! Stage "prepare" (parallel):   [Rootfs, EntryPoint]
//! Stage "startup" (sequential): [Lifespan]
//! ```
//!
//! Everything that can fail for a broken image (import, invalid entry point,
//! lifespan startup) happens before the listener is bound, so a failed start
//! never exposes a socket.

mod command;
mod listener;
mod rootfs;
mod server;
mod shutdown;
mod state;
mod tasks;

pub use command::ServeCommand;
pub use listener::BoundListener;
pub use server::{ServeSummary, ShutdownKind};
pub use shutdown::{ShutdownHandle, install_signal_handlers};
pub use state::{ContainerStatus, StatusCell};

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use berth_shared::errors::{BerthError, BerthResult};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::app::{Application, EntryPointRegistry};
use crate::images::{ImageConfig, ImageStore};
use crate::pipeline::PipelineExecutor;
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::options::{LaunchOptions, PortSpec};
use rootfs::ContainerDir;
use tasks::LaunchState;

/// Result of a container run that reached the serving state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchOutcome {
    pub container_id: String,
    pub shutdown: ShutdownKind,
    /// Connections accepted over the container lifetime.
    pub connections: u64,
}

/// Starts containers from images in the local store.
pub struct Launcher {
    layout: FilesystemLayout,
    store: Arc<ImageStore>,
    registry: Arc<EntryPointRegistry>,
}

impl Launcher {
    pub fn new(
        layout: FilesystemLayout,
        store: Arc<ImageStore>,
        registry: Arc<EntryPointRegistry>,
    ) -> Self {
        Self {
            layout,
            store,
            registry,
        }
    }

    /// Start a container and return once it is accepting connections.
    pub async fn start(
        &self,
        image: &str,
        options: &LaunchOptions,
        shutdown: ShutdownHandle,
    ) -> BerthResult<RunningContainer> {
        let resolved = self.store.resolve(image).await?;
        let config = resolved.config;

        let command = ServeCommand::from_cmd(&config.cmd)?;
        let port = resolve_port_mapping(&options.ports, command.port, &config)?;
        let host: IpAddr = command
            .host
            .parse()
            .map_err(|e| BerthError::Config(format!("invalid bind host '{}': {}", command.host, e)))?;
        let bind_addr = SocketAddr::new(host, port.host_port);
        let env = config.merged_env(&options.env);

        let container_id = ulid::Ulid::new().to_string();
        let status = StatusCell::new(&container_id);
        tracing::info!(
            container_id = %container_id,
            image = %image,
            image_id = %resolved.record.image_id,
            app = %command.app,
            addr = %bind_addr,
            "Starting container"
        );

        status.transition(ContainerStatus::Starting)?;
        let fail = |e: BerthError| {
            tracing::error!(container_id = %container_id, "Container failed to start: {}", e);
            status.transition(ContainerStatus::Exited).and(Err(e))
        };

        let (dir, app) = match self
            .prepare(&container_id, config, command, env, bind_addr)
            .await
        {
            Ok(prepared) => prepared,
            Err(e) => return fail(e),
        };

        let listener = match BoundListener::bind(bind_addr) {
            Ok(listener) => listener,
            Err(e) => {
                app.shutdown().await;
                drop(dir);
                return fail(e);
            }
        };

        status.transition(ContainerStatus::Running)?;
        Ok(RunningContainer {
            container_id,
            status,
            dir,
            app,
            listener,
            shutdown,
            grace_period: options.grace_period,
        })
    }

    /// Start a container and serve until it is stopped through `shutdown`.
    pub async fn run(
        &self,
        image: &str,
        options: &LaunchOptions,
        shutdown: ShutdownHandle,
    ) -> BerthResult<LaunchOutcome> {
        self.start(image, options, shutdown).await?.wait().await
    }

    async fn prepare(
        &self,
        container_id: &str,
        config: ImageConfig,
        command: ServeCommand,
        env: Vec<String>,
        bind_addr: SocketAddr,
    ) -> BerthResult<(ContainerDir, Arc<dyn Application>)> {
        let dir = ContainerDir::create(self.layout.container_layout(container_id))?;

        let ctx = Arc::new(Mutex::new(LaunchState {
            container_id: container_id.to_string(),
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            config,
            command,
            env,
            bind_addr,
            layout: dir.layout().clone(),
            working_dir: None,
            app: None,
        }));

        PipelineExecutor::execute(tasks::launch_pipeline(), Arc::clone(&ctx)).await?;

        let app = ctx
            .lock()
            .await
            .app
            .take()
            .ok_or_else(|| BerthError::Internal("entry point task did not run".into()))?;
        Ok((dir, app))
    }
}

/// Check the requested publication against the image.
///
/// A container publishes exactly one port: its serve port, which the image
/// must declare with `EXPOSE`.
pub fn resolve_port_mapping(
    ports: &[PortSpec],
    serve_port: u16,
    config: &ImageConfig,
) -> BerthResult<PortSpec> {
    if ports.len() > 1 {
        return Err(BerthError::Config(format!(
            "a container publishes exactly one port, got {}",
            ports.len()
        )));
    }

    let spec = ports.first().copied().unwrap_or(PortSpec {
        host_port: serve_port,
        container_port: serve_port,
    });

    if spec.container_port != serve_port {
        return Err(BerthError::Config(format!(
            "cannot publish container port {}: the service listens on {}",
            spec.container_port, serve_port
        )));
    }
    if !config.tcp_ports().contains(&serve_port) {
        return Err(BerthError::Config(format!(
            "port {} is not declared by the image (EXPOSE)",
            serve_port
        )));
    }
    Ok(spec)
}

/// A container that is bound and accepting connections.
pub struct RunningContainer {
    container_id: String,
    status: StatusCell,
    dir: ContainerDir,
    app: Arc<dyn Application>,
    listener: BoundListener,
    shutdown: ShutdownHandle,
    grace_period: Duration,
}

impl RunningContainer {
    pub fn id(&self) -> &str {
        &self.container_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn status(&self) -> StatusCell {
        self.status.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serve until stopped, drain, run the lifespan shutdown hook and remove
    /// the container filesystem.
    pub async fn wait(self) -> BerthResult<LaunchOutcome> {
        let RunningContainer {
            container_id,
            status,
            dir,
            app,
            listener,
            shutdown,
            grace_period,
        } = self;

        let summary = server::serve(listener, Arc::clone(&app), shutdown, grace_period).await;
        status.transition(ContainerStatus::Stopping)?;

        app.shutdown().await;
        drop(dir);
        status.transition(ContainerStatus::Exited)?;

        tracing::info!(
            container_id = %container_id,
            connections = summary.connections,
            shutdown = ?summary.shutdown,
            "Container exited"
        );
        Ok(LaunchOutcome {
            container_id,
            shutdown: summary.shutdown,
            connections: summary.connections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_exposing(ports: &[u16]) -> ImageConfig {
        let mut config = ImageConfig::scratch();
        for port in ports {
            config.expose(*port);
        }
        config
    }

    #[test]
    fn test_default_mapping_uses_serve_port() {
        let spec = resolve_port_mapping(&[], 8080, &config_exposing(&[8080])).unwrap();
        assert_eq!(spec, PortSpec::service_default());
    }

    #[test]
    fn test_host_port_may_differ() {
        let wanted: PortSpec = "9090:8080".parse().unwrap();
        let spec = resolve_port_mapping(&[wanted], 8080, &config_exposing(&[8080])).unwrap();
        assert_eq!(spec.host_port, 9090);
    }

    #[test]
    fn test_undeclared_or_foreign_ports_rejected() {
        let config = config_exposing(&[8080]);
        let other: PortSpec = "9000:9000".parse().unwrap();
        assert!(matches!(
            resolve_port_mapping(&[other], 8080, &config),
            Err(BerthError::Config(_))
        ));

        assert!(resolve_port_mapping(&[], 8080, &config_exposing(&[])).is_err());

        let two = [PortSpec::service_default(), PortSpec::service_default()];
        assert!(resolve_port_mapping(&two, 8080, &config).is_err());
    }
}
