//! Table-driven pipeline execution.
//!
//! ```text
//! Pipeline → Stages → Tasks
//!
//! - Pipeline: runs all stages in order
//! - Stage:    groups tasks with an execution mode (parallel/sequential)
//! - Task:     atomic unit of work against a shared context
//! ```
//!
//! The provisioning state machine is expressed as an execution plan over
//! this framework; see `provision`.

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;
mod task;

pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use pipeline::{ExecutionPlan, Pipeline, PipelineBuilder, PipelineExecutor, PipelineFailure};
pub use stage::{ExecutionMode, Stage};
pub use task::{BoxedTask, PipelineTask};
