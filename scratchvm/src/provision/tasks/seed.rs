//! Task: write the seed volume next to the instance disk.
//!
//! The rendered firewall rules are also dropped into the instance directory
//! so the operator can inspect or apply them on the host.

use super::{ProvisionCtx, SEED_WRITE, log_task_error, task_start};
use crate::firewall::restore_script;
use crate::pipeline::PipelineTask;
use async_trait::async_trait;
use scratchvm_shared::errors::{ScratchError, ScratchResult};

pub(crate) struct SeedWriteTask;

#[async_trait]
impl PipelineTask<ProvisionCtx> for SeedWriteTask {
    async fn run(self: Box<Self>, ctx: ProvisionCtx) -> ScratchResult<()> {
        let task_name = self.name();
        let instance = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        let (seed, policy) = match (&ctx.seed, &ctx.policy) {
            (Some(seed), Some(policy)) => (seed, policy),
            _ => {
                return Err(ScratchError::Internal(
                    "bundle assembly must run first".into(),
                ));
            }
        };

        let seed_path = ctx.layout.seed_path();
        let written = seed
            .write_to(&seed_path)
            .inspect_err(|e| log_task_error(&instance, task_name, e))?;

        let rules_path = ctx.layout.firewall_rules_path();
        std::fs::write(&rules_path, restore_script(policy)).map_err(|e| {
            let err = ScratchError::Storage(format!(
                "Failed to write {}: {}",
                rules_path.display(),
                e
            ));
            log_task_error(&instance, task_name, &err);
            err
        })?;

        tracing::info!(
            instance = %instance,
            seed = %seed_path.display(),
            written,
            "Seed volume ready"
        );
        ctx.seed_written = written;
        Ok(())
    }

    fn name(&self) -> &str {
        SEED_WRITE
    }
}
