//! Task trait.

use async_trait::async_trait;
use berth_shared::errors::BerthResult;

/// Unit of work in a pipeline.
///
/// Tasks receive a clone of the shared context. Contexts are expected to be
/// cheap handles (`Arc<Mutex<_>>`) so writes are visible to later tasks.
#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx) -> BerthResult<()>;

    /// Name used for logging and metrics.
    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;
