//! Task: `WORKDIR`.

use async_trait::async_trait;
use berth_shared::errors::BerthResult;

use crate::builder::cache::cache_key;
use crate::builder::context::{BuildCtx, create_dir_with_mode, host_path};
use crate::pipeline::PipelineTask;

pub struct WorkdirTask {
    pub path: String,
    pub text: String,
}

#[async_trait]
impl PipelineTask<BuildCtx> for WorkdirTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> BerthResult<()> {
        let mut state = ctx.lock().await;
        let workdir = state.image_path(&self.path)?;
        state.config.working_dir = workdir.clone();

        let key = cache_key(&state.parent_key, &self.text, "");
        if let Some(entry) = state.lookup(&key).await {
            state.reuse(key, entry).await;
            return Ok(());
        }

        let (diff, layer_out) = state.staging.next_step()?;
        create_dir_with_mode(&host_path(&diff, &workdir))?;
        state
            .commit(key, self.text, diff, layer_out, Vec::new())
            .await
    }

    fn name(&self) -> &str {
        &self.text
    }
}
