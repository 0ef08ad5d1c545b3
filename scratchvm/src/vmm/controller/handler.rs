//! VmmHandler - Runtime operations on a running VM.

use scratchvm_shared::ScratchResult;

/// Lifecycle operations on a started VM.
pub trait VmmHandler: Send {
    /// Stop the VM. Stopping an already exited VM succeeds.
    fn stop(&mut self) -> ScratchResult<()>;

    /// Check if the VM process is still running. Reaps it if it exited.
    fn is_running(&mut self) -> bool;

    /// Get the process ID of the running VM.
    fn pid(&self) -> u32;
}
