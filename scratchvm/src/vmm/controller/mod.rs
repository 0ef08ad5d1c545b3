//! Hypervisor process management.
//!
//! - **VmmController**: spawning (creates a VmmHandler)
//! - **VmmHandler**: operations on a running VM (stop, liveness)
//!
//! A handler can also be created for a VM started by an earlier invocation
//! from its recorded PID, see [`VmmController::attach`].

mod handler;
mod qemu;
mod spawn;

use crate::vmm::LaunchSpec;
use scratchvm_shared::ScratchResult;
pub use handler::VmmHandler;
pub use qemu::{QemuController, QemuHandler, qemu_args};

/// Trait for spawning VMs.
#[async_trait::async_trait]
pub trait VmmController: Send + Sync {
    /// Start the hypervisor for `spec`.
    ///
    /// Returns once the process exists; guest boot is not awaited.
    async fn start(&self, spec: &LaunchSpec) -> ScratchResult<Box<dyn VmmHandler>>;

    /// Handler for a VM an earlier invocation started.
    fn attach(&self, pid: u32) -> Box<dyn VmmHandler>;
}
