//! Tasks: start (or re-attach to) the hypervisor, then check it stays up.

use super::{LIVENESS_CHECK, ProvisionCtx, VM_LAUNCH, log_task_error, task_start};
use crate::db::InstanceStatus;
use crate::pipeline::PipelineTask;
use crate::runtime::SharedEnvironment;
use crate::runtime::constants::hypervisor::LIVENESS_GRACE_MS;
use crate::util::is_same_process;
use crate::vmm::{Display, LaunchSpec, Resources, UserNetwork};
use async_trait::async_trait;
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use std::path::Path;
use std::time::Duration;

pub(crate) struct VmLaunchTask;

#[async_trait]
impl PipelineTask<ProvisionCtx> for VmLaunchTask {
    async fn run(self: Box<Self>, ctx: ProvisionCtx) -> ScratchResult<()> {
        let task_name = self.name();
        let instance = task_start(&ctx, task_name).await;

        let (env, options, layout) = {
            let ctx = ctx.lock().await;
            (ctx.env.clone(), ctx.options.clone(), ctx.layout.clone())
        };

        let spec = LaunchSpec {
            name: options.name.clone(),
            disk: layout.disk_path(),
            seed: layout.seed_path(),
            network: UserNetwork {
                forwards: options.forwards.clone(),
            },
            resources: Resources {
                cpus: options.cpus,
                memory_mib: options.memory_mib,
            },
            display: options.display.map(Display),
            console_log: layout.console_log_path(),
            hypervisor_log: layout.hypervisor_log_path(),
        };

        let launcher = env.launcher_for(&options);
        let vm = match running_pid(&env, &instance, &spec.disk)? {
            Some(pid) => launcher.attach(spec, pid),
            None => launcher.launch(spec).await,
        }
        .inspect_err(|e| log_task_error(&instance, task_name, e))?;

        if let Some(mut record) = env.registry().get(&instance)? {
            record.pid = Some(vm.pid());
            record.display = vm.display_endpoint();
            env.registry().save(&record)?;
        }

        ctx.lock().await.instance = Some(vm);
        Ok(())
    }

    fn name(&self) -> &str {
        VM_LAUNCH
    }
}

/// PID of a hypervisor an earlier run left serving this instance's disk.
///
/// The registry status is not consulted: earlier tasks of this run have
/// already reset it. A live process whose command line names the disk is
/// the only evidence that counts.
fn running_pid(env: &SharedEnvironment, name: &str, disk: &Path) -> ScratchResult<Option<u32>> {
    let Some(record) = env.registry().get(name)? else {
        return Ok(None);
    };
    let marker = disk.to_string_lossy();
    Ok(record.pid.filter(|pid| is_same_process(*pid, &marker)))
}

pub(crate) struct LivenessTask;

#[async_trait]
impl PipelineTask<ProvisionCtx> for LivenessTask {
    async fn run(self: Box<Self>, ctx: ProvisionCtx) -> ScratchResult<()> {
        let task_name = self.name();
        let instance = task_start(&ctx, task_name).await;

        let (env, vm) = {
            let mut ctx = ctx.lock().await;
            let vm = ctx
                .instance
                .take()
                .ok_or_else(|| ScratchError::Internal("launch task must run first".into()))?;
            (ctx.env.clone(), vm)
        };

        vm.confirm_started(Duration::from_millis(LIVENESS_GRACE_MS))
            .await
            .inspect_err(|e| log_task_error(&instance, task_name, e))?;

        if let Some(mut record) = env.registry().get(&instance)? {
            record.status = InstanceStatus::Running;
            record.pid = Some(vm.pid());
            env.registry().save(&record)?;
        }

        tracing::info!(instance = %instance, pid = vm.pid(), state = %vm.state(), "VM running");
        ctx.lock().await.instance = Some(vm);
        Ok(())
    }

    fn name(&self) -> &str {
        LIVENESS_CHECK
    }
}
