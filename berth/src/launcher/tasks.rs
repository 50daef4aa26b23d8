//! Container startup tasks.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use berth_shared::errors::{BerthError, BerthResult};
use tokio::sync::Mutex;

use super::command::ServeCommand;
use super::rootfs;
use crate::app::{AppContext, Application, EntryPointRegistry};
use crate::images::{ImageConfig, ImageStore};
use crate::pipeline::{BoxedTask, Pipeline, PipelineTask, Stage};
use crate::runtime::layout::ContainerLayout;

pub type LaunchCtx = Arc<Mutex<LaunchState>>;

/// Inputs and outputs of container startup.
///
/// Tasks copy their inputs out under the lock and write results back, so
/// the parallel stage does not serialize on the mutex.
pub struct LaunchState {
    pub container_id: String,
    pub store: Arc<ImageStore>,
    pub registry: Arc<EntryPointRegistry>,
    pub config: ImageConfig,
    pub command: ServeCommand,
    pub env: Vec<String>,
    pub bind_addr: SocketAddr,
    pub layout: ContainerLayout,

    pub working_dir: Option<PathBuf>,
    pub app: Option<Arc<dyn Application>>,
}

pub fn launch_pipeline() -> Pipeline<LaunchCtx> {
    let prepare: Vec<BoxedTask<LaunchCtx>> = vec![Box::new(RootfsTask), Box::new(EntryPointTask)];
    let startup: Vec<BoxedTask<LaunchCtx>> = vec![Box::new(LifespanStartupTask)];

    Pipeline::new("launch")
        .stage(Stage::parallel("prepare", prepare))
        .stage(Stage::sequential("startup", startup))
}

// ============================================================================
// Tasks
// ============================================================================

/// Materialize the image filesystem.
struct RootfsTask;

#[async_trait]
impl PipelineTask<LaunchCtx> for RootfsTask {
    async fn run(self: Box<Self>, ctx: LaunchCtx) -> BerthResult<()> {
        let (store, config, layout) = {
            let state = ctx.lock().await;
            (
                Arc::clone(&state.store),
                state.config.clone(),
                state.layout.clone(),
            )
        };

        let working_dir = rootfs::materialize(&store, &config, &layout).await?;
        ctx.lock().await.working_dir = Some(working_dir);
        Ok(())
    }

    fn name(&self) -> &str {
        "rootfs"
    }
}

/// Resolve the application reference of the serve command.
struct EntryPointTask;

#[async_trait]
impl PipelineTask<LaunchCtx> for EntryPointTask {
    async fn run(self: Box<Self>, ctx: LaunchCtx) -> BerthResult<()> {
        let mut state = ctx.lock().await;
        let app = state
            .registry
            .resolve(&state.command.app)
            .inspect_err(|e| tracing::error!(app = %state.command.app, "Cannot load application: {}", e))?;
        state.app = Some(app);
        Ok(())
    }

    fn name(&self) -> &str {
        "entry_point"
    }
}

/// Run the application's lifespan startup hook.
struct LifespanStartupTask;

#[async_trait]
impl PipelineTask<LaunchCtx> for LifespanStartupTask {
    async fn run(self: Box<Self>, ctx: LaunchCtx) -> BerthResult<()> {
        let (app, app_ctx) = {
            let state = ctx.lock().await;
            let app = state
                .app
                .clone()
                .ok_or_else(|| BerthError::Internal("entry point task must run first".into()))?;
            let working_dir = state
                .working_dir
                .clone()
                .ok_or_else(|| BerthError::Internal("rootfs task must run first".into()))?;
            let app_ctx = AppContext {
                container_id: state.container_id.clone(),
                rootfs: state.layout.rootfs_dir(),
                working_dir,
                env: state.env.clone(),
                bind_addr: state.bind_addr,
            };
            (app, app_ctx)
        };

        app.startup(&app_ctx).await.map_err(|e| match e {
            BerthError::Startup(_) => e,
            other => BerthError::Startup(other.to_string()),
        })
    }

    fn name(&self) -> &str {
        "lifespan_startup"
    }
}
