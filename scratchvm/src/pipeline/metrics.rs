use crate::pipeline::ExecutionMode;

#[derive(Debug, Clone)]
pub struct TaskMetrics {
    pub name: String,
    pub duration_ms: u128,
}

#[derive(Debug, Clone)]
pub struct StageMetrics {
    pub index: usize,
    pub execution: ExecutionMode,
    pub duration_ms: u128,
    pub tasks: Vec<TaskMetrics>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    pub total_duration_ms: u128,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    pub fn task_duration_ms(&self, name: &str) -> Option<u128> {
        self.stages
            .iter()
            .flat_map(|stage| stage.tasks.iter())
            .find(|task| task.name == name)
            .map(|task| task.duration_ms)
    }

    /// Names of every task that completed, in execution order.
    pub fn completed_tasks(&self) -> Vec<&str> {
        self.stages
            .iter()
            .flat_map(|stage| stage.tasks.iter())
            .map(|task| task.name.as_str())
            .collect()
    }

    /// One debug line per task.
    pub fn log(&self) {
        for stage in &self.stages {
            for task in &stage.tasks {
                tracing::debug!(
                    stage = stage.index,
                    execution = ?stage.execution,
                    task = %task.name,
                    duration_ms = task.duration_ms as u64,
                    "Pipeline task finished"
                );
            }
        }
        tracing::debug!(
            total_ms = self.total_duration_ms as u64,
            "Pipeline finished"
        );
    }
}
