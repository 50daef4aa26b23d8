//! Task: metadata instructions (`ENV`, `EXPOSE`, `CMD`).

use async_trait::async_trait;
use berth_shared::errors::{BerthError, BerthResult};

use crate::builder::context::BuildCtx;
use crate::pipeline::PipelineTask;
use crate::recipe::Instruction;

pub struct MetadataTask {
    pub instruction: Instruction,
    pub text: String,
}

#[async_trait]
impl PipelineTask<BuildCtx> for MetadataTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> BerthResult<()> {
        let mut state = ctx.lock().await;

        match &self.instruction {
            Instruction::Env { key, value } => state.config.set_env(key, value),
            Instruction::Expose { port } => state.config.expose(*port),
            Instruction::Cmd { args } => state.config.cmd = args.clone(),
            other => {
                return Err(BerthError::Internal(format!(
                    "{} is not a metadata instruction",
                    other.keyword()
                )));
            }
        }

        tracing::debug!(step = %self.text, "Updated image metadata");
        state.record_metadata(self.text);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.text
    }
}
