//! Task: resolve the base image.

use async_trait::async_trait;
use berth_shared::errors::BerthResult;

use crate::builder::StepReport;
use crate::builder::cache::cache_key;
use crate::builder::context::BuildCtx;
use crate::images::ImageConfig;
use crate::pipeline::PipelineTask;
use crate::runtime::constants::recipe;

pub struct BaseTask {
    pub image: String,
    pub text: String,
}

#[async_trait]
impl PipelineTask<BuildCtx> for BaseTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> BerthResult<()> {
        let mut state = ctx.lock().await;

        let (mut config, base_id) = if self.image == recipe::SCRATCH {
            let config = ImageConfig::scratch();
            let id = config.image_id()?;
            (config, id)
        } else {
            let base = state.store.pull(&self.image).await?;
            let id = base.image_id().to_string();
            (base.config, id)
        };

        for layer in &config.layers {
            let tarball = state.store.layer_tarball(layer).await;
            state.staging.push_layer(tarball);
        }

        config.base = self.image.clone();
        tracing::info!(base = %self.image, image_id = %base_id, layers = config.layers.len(), "Resolved base image");

        state.config = config;
        state.parent_key = cache_key("", &self.text, &base_id);
        state.steps.push(StepReport {
            instruction: self.text,
            layer: None,
            cached: false,
        });
        Ok(())
    }

    fn name(&self) -> &str {
        &self.text
    }
}
