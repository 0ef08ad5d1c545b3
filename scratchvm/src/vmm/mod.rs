//! Virtual machine launch.
//!
//! [`VmLauncher`] checks that everything a VM needs is in place, then hands
//! a [`LaunchSpec`] to a [`controller::VmmController`] which starts the
//! hypervisor process.

pub mod controller;
mod launcher;

pub use launcher::{VmInstance, VmLauncher};

use crate::runtime::constants::network::VNC_BASE_PORT;
use crate::runtime::options::PortForward;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: u8,
    pub memory_mib: u32,
}

/// User-mode NAT with explicit host → guest TCP forwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserNetwork {
    pub forwards: Vec<PortForward>,
}

/// VNC display number. Listens on `5900 + n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Display(pub u16);

impl Display {
    pub fn port(&self) -> Option<u16> {
        VNC_BASE_PORT.checked_add(self.0)
    }
}

/// Everything a controller needs to start one VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub name: String,
    /// Attached read-write.
    pub disk: PathBuf,
    /// Attached read-only.
    pub seed: PathBuf,
    pub network: UserNetwork,
    pub resources: Resources,
    pub display: Option<Display>,
    /// Guest serial console.
    pub console_log: PathBuf,
    /// Hypervisor stdout/stderr.
    pub hypervisor_log: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    Starting,
    Running,
    Stopped,
    Failed,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Stopped => "stopped",
            VmState::Failed => "failed",
        };
        f.write_str(s)
    }
}
