//! Task: derive the instance's copy-on-write disk.

use super::{DISK_DERIVE, ProvisionCtx, log_task_error, task_start};
use crate::pipeline::PipelineTask;
use async_trait::async_trait;
use scratchvm_shared::errors::{ScratchError, ScratchResult};

pub(crate) struct DiskDeriveTask;

#[async_trait]
impl PipelineTask<ProvisionCtx> for DiskDeriveTask {
    async fn run(self: Box<Self>, ctx: ProvisionCtx) -> ScratchResult<()> {
        let task_name = self.name();
        let instance = task_start(&ctx, task_name).await;

        let (env, layout, base, size) = {
            let ctx = ctx.lock().await;
            let base = ctx
                .base
                .clone()
                .ok_or_else(|| ScratchError::Internal("image task must run first".into()))?;
            (
                ctx.env.clone(),
                ctx.layout.clone(),
                base,
                ctx.options.disk_size_bytes()?,
            )
        };

        let disk = layout
            .prepare()
            .and_then(|()| env.images().derive_instance_disk(&base, &layout.disk_path(), size))
            .inspect_err(|e| log_task_error(&instance, task_name, e))?;

        tracing::info!(
            instance = %instance,
            disk = %disk.path.display(),
            reused = disk.reused,
            "Instance disk ready"
        );
        ctx.lock().await.disk = Some(disk);
        Ok(())
    }

    fn name(&self) -> &str {
        DISK_DERIVE
    }
}
