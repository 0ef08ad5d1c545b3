//! Task trait for pipeline execution.

use async_trait::async_trait;
use scratchvm_shared::errors::ScratchResult;

/// A unit of work run by the pipeline executor.
///
/// Tasks receive a clone of the shared context. Writes go through the
/// context's interior mutability.
#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx) -> ScratchResult<()>;

    /// Stable task name, used in logs, metrics and failure reports.
    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;
