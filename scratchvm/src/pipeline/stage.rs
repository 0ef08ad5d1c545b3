//! Stage definition for table-driven pipeline execution.

/// Execution mode for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run all tasks concurrently; the first failure fails the stage.
    Parallel,
    /// Run tasks one after another.
    Sequential,
}

/// A group of tasks sharing an execution mode.
///
/// Stages run in order. A stage only starts once every task of the previous
/// stage has succeeded.
#[derive(Debug, Clone)]
pub struct Stage<T> {
    pub tasks: Vec<T>,
    pub execution: ExecutionMode,
}

impl<T> Stage<T> {
    pub fn parallel(tasks: Vec<T>) -> Self {
        Self {
            tasks,
            execution: ExecutionMode::Parallel,
        }
    }

    pub fn sequential(tasks: Vec<T>) -> Self {
        Self {
            tasks,
            execution: ExecutionMode::Sequential,
        }
    }
}
