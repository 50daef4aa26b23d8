//! Table-driven pipeline execution.
//!
//! ```text
//! Pipeline → Stages → Tasks
//! ```
//!
//! A stage runs its tasks either one after another or concurrently. Stages run
//! in order and the first failing task aborts the pipeline. Both the image
//! build and container startup are expressed as pipelines over a shared,
//! lock-protected context.

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;
mod task;

pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use pipeline::{Pipeline, PipelineExecutor};
pub use stage::{ExecutionMode, Stage};
pub use task::{BoxedTask, PipelineTask};
