use std::time::Duration;

use super::ExecutionMode;

#[derive(Debug, Clone)]
pub struct TaskMetrics {
    pub name: String,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct StageMetrics {
    pub name: &'static str,
    pub execution: ExecutionMode,
    pub duration: Duration,
    pub tasks: Vec<TaskMetrics>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    pub total_duration: Duration,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    pub fn task_duration(&self, name: &str) -> Option<Duration> {
        self.tasks()
            .find(|task| task.name == name)
            .map(|task| task.duration)
    }

    /// All task metrics in execution order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskMetrics> {
        self.stages.iter().flat_map(|stage| stage.tasks.iter())
    }
}
