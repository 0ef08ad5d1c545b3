//! scratchvm: provision a disposable development VM.
//!
//! A base cloud image is cached once and every instance boots from a qcow2
//! overlay of it. First-boot configuration travels on a NoCloud `cidata`
//! volume carrying the login identity, packages, the container bridge
//! isolation rules and a supervised workload unit. The VM runs under QEMU
//! with user-mode networking and loopback port forwards.
//!
//! Entry point: [`ProvisioningOrchestrator`] over a [`HostEnvironment`].

pub mod db;
pub mod disk;
pub mod firewall;
pub mod images;
pub mod logging;
pub mod pipeline;
pub mod provision;
pub mod runtime;
pub mod seed;
pub mod service;
pub mod util;
pub mod vmm;

pub use logging::{LogGuard, init_logging_for};
pub use provision::{ProvisionError, ProvisionReport, ProvisionStage, ProvisioningOrchestrator};
pub use runtime::{HostEnvironment, PortForward, ProvisionOptions, ScratchOptions};
pub use scratchvm_shared::errors::{ScratchError, ScratchResult};
