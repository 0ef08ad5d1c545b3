//! Pipeline executor.
//!
//! Runs stages in order. Within a stage tasks run in parallel or
//! sequentially. Execution stops at the first failing task and the failure
//! names that task together with the metrics of everything that finished.

use super::metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
use super::stage::{ExecutionMode, Stage};
use super::task::BoxedTask;
use futures::future::try_join_all;
use scratchvm_shared::errors::ScratchError;
use std::time::Instant;

pub struct ExecutionPlan<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }

    pub fn stages(self) -> Vec<Stage<BoxedTask<Ctx>>> {
        self.stages
    }
}

pub struct Pipeline<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> Pipeline<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }
}

pub struct PipelineBuilder;

impl PipelineBuilder {
    pub fn from_plan<Ctx>(plan: ExecutionPlan<Ctx>) -> Pipeline<Ctx> {
        Pipeline::new(plan.stages())
    }
}

/// A task failed. Carries the task name so callers can attribute the error.
#[derive(Debug)]
pub struct PipelineFailure {
    pub task: String,
    pub error: ScratchError,
    /// Metrics for the stages and tasks that completed before the failure.
    pub completed: PipelineMetrics,
}

impl std::fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task {} failed: {}", self.task, self.error)
    }
}

impl std::error::Error for PipelineFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

struct TaskFailure {
    task: String,
    error: ScratchError,
}

pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Execute a pipeline against a shared context.
    ///
    /// `Ctx` is cloned once per task; use `Arc<Mutex<..>>` for shared writes.
    pub async fn execute<Ctx>(
        pipeline: Pipeline<Ctx>,
        ctx: Ctx,
    ) -> Result<PipelineMetrics, PipelineFailure>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut metrics = PipelineMetrics::default();

        for (index, stage) in pipeline.stages.into_iter().enumerate() {
            let execution = stage.execution;
            let stage_start = Instant::now();

            let result = match execution {
                ExecutionMode::Parallel => {
                    let futures = stage.tasks.into_iter().map(|task| {
                        let ctx = ctx.clone();
                        async move {
                            let name = task.name().to_string();
                            let task_start = Instant::now();
                            match task.run(ctx).await {
                                Ok(()) => Ok(TaskMetrics {
                                    name,
                                    duration_ms: task_start.elapsed().as_millis(),
                                }),
                                Err(error) => Err(TaskFailure { task: name, error }),
                            }
                        }
                    });
                    try_join_all(futures).await
                }
                ExecutionMode::Sequential => {
                    let mut task_metrics = Vec::new();
                    let mut failure = None;
                    for task in stage.tasks {
                        let name = task.name().to_string();
                        let task_start = Instant::now();
                        if let Err(error) = task.run(ctx.clone()).await {
                            failure = Some(TaskFailure { task: name, error });
                            break;
                        }
                        task_metrics.push(TaskMetrics {
                            name,
                            duration_ms: task_start.elapsed().as_millis(),
                        });
                    }
                    match failure {
                        Some(failure) => Err(failure),
                        None => Ok(task_metrics),
                    }
                }
            };

            match result {
                Ok(tasks) => metrics.stages.push(StageMetrics {
                    index,
                    execution,
                    duration_ms: stage_start.elapsed().as_millis(),
                    tasks,
                }),
                Err(TaskFailure { task, error }) => {
                    metrics.total_duration_ms = total_start.elapsed().as_millis();
                    return Err(PipelineFailure {
                        task,
                        error,
                        completed: metrics,
                    });
                }
            }
        }

        metrics.total_duration_ms = total_start.elapsed().as_millis();
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineTask;
    use async_trait::async_trait;
    use scratchvm_shared::errors::ScratchResult;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Record(&'static str);

    #[async_trait]
    impl PipelineTask<Log> for Record {
        async fn run(self: Box<Self>, ctx: Log) -> ScratchResult<()> {
            ctx.lock().await.push(self.0.to_string());
            Ok(())
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    struct Fail(&'static str);

    #[async_trait]
    impl PipelineTask<Log> for Fail {
        async fn run(self: Box<Self>, _ctx: Log) -> ScratchResult<()> {
            Err(ScratchError::Disk("boom".into()))
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let log: Log = Arc::default();
        let plan = ExecutionPlan::new(vec![
            Stage::sequential(vec![Box::new(Record("a")) as BoxedTask<Log>]),
            Stage::parallel(vec![
                Box::new(Record("b")) as BoxedTask<Log>,
                Box::new(Record("c")),
            ]),
            Stage::sequential(vec![Box::new(Record("d")) as BoxedTask<Log>]),
        ]);

        let metrics = PipelineExecutor::execute(PipelineBuilder::from_plan(plan), log.clone())
            .await
            .unwrap();

        let seen = log.lock().await.clone();
        assert_eq!(seen.first().map(String::as_str), Some("a"));
        assert_eq!(seen.last().map(String::as_str), Some("d"));
        assert_eq!(metrics.stages.len(), 3);
        assert!(metrics.task_duration_ms("c").is_some());
    }

    #[tokio::test]
    async fn test_failure_names_task_and_stops() {
        let log: Log = Arc::default();
        let plan = ExecutionPlan::new(vec![
            Stage::sequential(vec![Box::new(Record("a")) as BoxedTask<Log>]),
            Stage::sequential(vec![
                Box::new(Fail("disk")) as BoxedTask<Log>,
                Box::new(Record("never")),
            ]),
            Stage::sequential(vec![Box::new(Record("after")) as BoxedTask<Log>]),
        ]);

        let failure = PipelineExecutor::execute(PipelineBuilder::from_plan(plan), log.clone())
            .await
            .unwrap_err();

        assert_eq!(failure.task, "disk");
        assert_eq!(failure.error.kind(), "DiskError");
        assert_eq!(failure.completed.completed_tasks(), vec!["a"]);
        assert_eq!(*log.lock().await, vec!["a".to_string()]);
    }
}
