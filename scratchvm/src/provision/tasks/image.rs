//! Task: acquire the base image.
//!
//! First side-effecting task, so it also opens the instance's registry row.

use super::{IMAGE_ACQUIRE, ProvisionCtx, log_task_error, task_start};
use crate::db::{InstanceRecord, InstanceStatus};
use crate::pipeline::PipelineTask;
use async_trait::async_trait;
use scratchvm_shared::errors::ScratchResult;

pub(crate) struct ImageAcquireTask;

#[async_trait]
impl PipelineTask<ProvisionCtx> for ImageAcquireTask {
    async fn run(self: Box<Self>, ctx: ProvisionCtx) -> ScratchResult<()> {
        let task_name = self.name();
        let instance = task_start(&ctx, task_name).await;

        let (env, layout, url, sha256, forwards) = {
            let ctx = ctx.lock().await;
            (
                ctx.env.clone(),
                ctx.layout.clone(),
                ctx.options.image_url.clone(),
                ctx.options.image_sha256.clone(),
                ctx.options.forwards.clone(),
            )
        };

        let mut record = env
            .registry()
            .get(&instance)?
            .unwrap_or_else(|| {
                InstanceRecord::new(&instance, layout.disk_path(), layout.seed_path())
            });
        record.status = InstanceStatus::Provisioning;
        record.failed_stage = None;
        record.forwards = forwards;
        env.registry()
            .save(&record)
            .inspect_err(|e| log_task_error(&instance, task_name, e))?;

        let base = env
            .images()
            .acquire(&url, sha256.as_deref())
            .await
            .inspect_err(|e| log_task_error(&instance, task_name, e))?;

        record.base_image = Some(base.path.clone());
        env.registry().save(&record)?;

        ctx.lock().await.base = Some(base);
        Ok(())
    }

    fn name(&self) -> &str {
        IMAGE_ACQUIRE
    }
}
