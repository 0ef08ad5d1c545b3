//! Pipeline tasks, one file per concern.

mod disk;
mod image;
mod launch;
mod seed;
mod validate;

pub(crate) use disk::DiskDeriveTask;
pub(crate) use image::ImageAcquireTask;
pub(crate) use launch::{LivenessTask, VmLaunchTask};
pub(crate) use seed::SeedWriteTask;
pub(crate) use validate::{BundleAssembleTask, BundleBuildTask, FirewallBuildTask, UnitBuildTask};
pub use validate::workload_unit;

use super::types::ProvisionContext;
use scratchvm_shared::errors::ScratchError;
use std::sync::Arc;
use tokio::sync::Mutex;

pub(crate) type ProvisionCtx = Arc<Mutex<ProvisionContext>>;

pub(crate) const BUNDLE_BUILD: &str = "bundle_build";
pub(crate) const FIREWALL_BUILD: &str = "firewall_build";
pub(crate) const UNIT_BUILD: &str = "unit_build";
pub(crate) const BUNDLE_ASSEMBLE: &str = "bundle_assemble";
pub(crate) const IMAGE_ACQUIRE: &str = "image_acquire";
pub(crate) const DISK_DERIVE: &str = "disk_derive";
pub(crate) const SEED_WRITE: &str = "seed_write";
pub(crate) const VM_LAUNCH: &str = "vm_launch";
pub(crate) const LIVENESS_CHECK: &str = "liveness_check";

/// Log the task start and return the instance name for later logging.
pub(crate) async fn task_start(ctx: &ProvisionCtx, task_name: &str) -> String {
    let name = ctx.lock().await.options.name.clone();
    tracing::debug!(instance = %name, task = task_name, "Starting task");
    name
}

pub(crate) fn log_task_error(instance: &str, task_name: &str, error: &ScratchError) {
    tracing::error!(
        instance = %instance,
        task = task_name,
        kind = error.kind(),
        error = %error,
        "Task failed"
    );
}
