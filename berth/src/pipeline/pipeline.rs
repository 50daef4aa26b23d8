//! Pipeline executor.

use std::time::Instant;

use berth_shared::errors::{BerthError, BerthResult};
use futures::future::join_all;

use super::metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
use super::stage::{ExecutionMode, Stage};
use super::task::BoxedTask;

/// Ordered list of stages over a context type.
pub struct Pipeline<Ctx> {
    name: &'static str,
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> Pipeline<Ctx> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            stages: Vec::new(),
        }
    }

    /// Append a stage. Empty stages are dropped.
    pub fn stage(mut self, stage: Stage<BoxedTask<Ctx>>) -> Self {
        if !stage.is_empty() {
            self.stages.push(stage);
        }
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn task_count(&self) -> usize {
        self.stages.iter().map(|s| s.tasks.len()).sum()
    }
}

pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Run every stage in order against `ctx`.
    pub async fn execute<Ctx>(pipeline: Pipeline<Ctx>, ctx: Ctx) -> BerthResult<PipelineMetrics>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let pipeline_name = pipeline.name;
        let mut stage_metrics = Vec::with_capacity(pipeline.stages.len());

        for stage in pipeline.stages {
            let execution = stage.execution;
            let stage_start = Instant::now();
            tracing::debug!(
                pipeline = pipeline_name,
                stage = stage.name,
                tasks = stage.tasks.len(),
                mode = ?execution,
                "Running stage"
            );

            let task_metrics = match execution {
                ExecutionMode::Parallel => {
                    let futures = stage.tasks.into_iter().map(|task| {
                        let ctx = ctx.clone();
                        async move {
                            let name = task.name().to_string();
                            let task_start = Instant::now();
                            task.run(ctx).await?;
                            Ok::<TaskMetrics, BerthError>(TaskMetrics {
                                name,
                                duration: task_start.elapsed(),
                            })
                        }
                    });
                    // Every task settles before the first error is reported, so
                    // no sibling keeps writing after the pipeline has failed.
                    join_all(futures)
                        .await
                        .into_iter()
                        .collect::<BerthResult<Vec<_>>>()?
                }
                ExecutionMode::Sequential => {
                    let mut task_metrics = Vec::with_capacity(stage.tasks.len());
                    for task in stage.tasks {
                        let name = task.name().to_string();
                        let task_start = Instant::now();
                        task.run(ctx.clone()).await?;
                        task_metrics.push(TaskMetrics {
                            name,
                            duration: task_start.elapsed(),
                        });
                    }
                    task_metrics
                }
            };

            stage_metrics.push(StageMetrics {
                name: stage.name,
                execution,
                duration: stage_start.elapsed(),
                tasks: task_metrics,
            });
        }

        let metrics = PipelineMetrics {
            total_duration: total_start.elapsed(),
            stages: stage_metrics,
        };
        tracing::debug!(
            pipeline = pipeline_name,
            duration_ms = metrics.total_duration.as_millis() as u64,
            "Pipeline finished"
        );
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::pipeline::PipelineTask;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Record(&'static str);

    #[async_trait]
    impl PipelineTask<Log> for Record {
        async fn run(self: Box<Self>, ctx: Log) -> BerthResult<()> {
            ctx.lock().await.push(self.0.to_string());
            Ok(())
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    struct Fail;

    #[async_trait]
    impl PipelineTask<Log> for Fail {
        async fn run(self: Box<Self>, _ctx: Log) -> BerthResult<()> {
            Err(BerthError::Internal("boom".into()))
        }

        fn name(&self) -> &str {
            "fail"
        }
    }

    #[tokio::test]
    async fn test_sequential_stages_run_in_order() {
        let log = Log::default();
        let pipeline = Pipeline::new("test")
            .stage(Stage::sequential(
                "first",
                vec![Box::new(Record("a")), Box::new(Record("b"))],
            ))
            .stage(Stage::sequential("empty", vec![]))
            .stage(Stage::parallel("second", vec![Box::new(Record("c"))]));
        assert_eq!(pipeline.task_count(), 3);

        let metrics = PipelineExecutor::execute(pipeline, log.clone())
            .await
            .unwrap();

        assert_eq!(*log.lock().await, vec!["a", "b", "c"]);
        assert_eq!(metrics.stages.len(), 2);
        assert!(metrics.task_duration("b").is_some());
        assert!(metrics.task_duration("missing").is_none());
    }

    struct SlowRecord(&'static str);

    #[async_trait]
    impl PipelineTask<Log> for SlowRecord {
        async fn run(self: Box<Self>, ctx: Log) -> BerthResult<()> {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            ctx.lock().await.push(self.0.to_string());
            Ok(())
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    #[tokio::test]
    async fn test_parallel_failure_waits_for_siblings() {
        let log = Log::default();
        let pipeline = Pipeline::new("test").stage(Stage::parallel(
            "prepare",
            vec![Box::new(SlowRecord("slow")), Box::new(Fail)],
        ));

        let err = PipelineExecutor::execute(pipeline, log.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, BerthError::Internal(_)));
        assert_eq!(*log.lock().await, vec!["slow"]);
    }

    #[tokio::test]
    async fn test_failure_stops_later_stages() {
        let log = Log::default();
        let pipeline = Pipeline::new("test")
            .stage(Stage::sequential(
                "first",
                vec![Box::new(Record("a")), Box::new(Fail)],
            ))
            .stage(Stage::sequential("second", vec![Box::new(Record("b"))]));

        let err = PipelineExecutor::execute(pipeline, log.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, BerthError::Internal(_)));
        assert_eq!(*log.lock().await, vec!["a"]);
    }
}
