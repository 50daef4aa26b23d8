//! Stage definition.

/// How the tasks of a stage are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// All tasks are polled concurrently and all of them settle; the first
    /// error in task order is returned.
    Parallel,
    /// Each task starts after the previous one finished.
    Sequential,
}

/// A named group of tasks sharing an execution mode.
#[derive(Debug, Clone)]
pub struct Stage<T> {
    pub name: &'static str,
    pub tasks: Vec<T>,
    pub execution: ExecutionMode,
}

impl<T> Stage<T> {
    pub fn parallel(name: &'static str, tasks: Vec<T>) -> Self {
        Self {
            name,
            tasks,
            execution: ExecutionMode::Parallel,
        }
    }

    pub fn sequential(name: &'static str, tasks: Vec<T>) -> Self {
        Self {
            name,
            tasks,
            execution: ExecutionMode::Sequential,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
