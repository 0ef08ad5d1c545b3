use super::controller::{VmmController, VmmHandler};
use super::{LaunchSpec, VmState};
use parking_lot::Mutex;
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use std::collections::{BTreeMap, HashSet};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

/// Pre-flight checks plus controller dispatch.
pub struct VmLauncher {
    controller: Arc<dyn VmmController>,
}

impl VmLauncher {
    pub fn new(controller: Arc<dyn VmmController>) -> Self {
        Self { controller }
    }

    /// Start a VM for `spec`.
    ///
    /// Fails with a launch error when the disk or seed is missing or a
    /// forwarded host port is taken. A busy display port only drops the
    /// display.
    pub async fn launch(&self, mut spec: LaunchSpec) -> ScratchResult<VmInstance> {
        if !spec.disk.is_file() {
            return Err(ScratchError::Launch(format!(
                "instance disk {} does not exist",
                spec.disk.display()
            )));
        }
        if !spec.seed.is_file() {
            return Err(ScratchError::Launch(format!(
                "seed volume {} does not exist",
                spec.seed.display()
            )));
        }

        let mut seen = HashSet::new();
        for fwd in &spec.network.forwards {
            if !seen.insert(fwd.host_port) {
                return Err(ScratchError::Launch(format!(
                    "host port {} forwarded twice",
                    fwd.host_port
                )));
            }
            if !port_is_free(fwd.host_port) {
                return Err(ScratchError::Launch(format!(
                    "host port {} is already in use",
                    fwd.host_port
                )));
            }
        }

        if let Some(vnc) = spec.display {
            let free = vnc.port().is_some_and(port_is_free);
            if !free {
                tracing::warn!(
                    instance = %spec.name,
                    vnc_display = vnc.0,
                    "VNC port unavailable, launching without a display"
                );
                spec.display = None;
            }
        }

        let handler = self.controller.start(&spec).await?;
        Ok(VmInstance::new(spec, handler, VmState::Starting))
    }

    /// Take over a VM that is already running `spec`.
    ///
    /// No pre-flight: the forwarded ports are expected to be held by `pid`.
    pub fn attach(&self, spec: LaunchSpec, pid: u32) -> ScratchResult<VmInstance> {
        let mut handler = self.controller.attach(pid);
        if !handler.is_running() {
            return Err(ScratchError::Launch(format!(
                "hypervisor pid {} for {} is gone",
                pid, spec.name
            )));
        }
        tracing::info!(instance = %spec.name, pid, "Attached to running hypervisor");
        Ok(VmInstance::new(spec, handler, VmState::Running))
    }
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// A launched VM.
pub struct VmInstance {
    spec: LaunchSpec,
    inner: Mutex<InstanceInner>,
}

struct InstanceInner {
    handler: Box<dyn VmmHandler>,
    state: VmState,
}

impl VmInstance {
    fn new(spec: LaunchSpec, handler: Box<dyn VmmHandler>, state: VmState) -> Self {
        Self {
            spec,
            inner: Mutex::new(InstanceInner { handler, state }),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    /// Current state. An unexpected process exit shows up as `Failed`.
    pub fn state(&self) -> VmState {
        let mut inner = self.inner.lock();
        if matches!(inner.state, VmState::Starting | VmState::Running)
            && !inner.handler.is_running()
        {
            inner.state = VmState::Failed;
        }
        inner.state
    }

    /// Guest port → `localhost:<host port>`.
    pub fn forwarded_ports(&self) -> BTreeMap<u16, String> {
        self.spec
            .network
            .forwards
            .iter()
            .map(|f| (f.guest_port, format!("localhost:{}", f.host_port)))
            .collect()
    }

    /// VNC endpoint, when the display survived pre-flight.
    pub fn display_endpoint(&self) -> Option<String> {
        self.spec
            .display
            .and_then(|d| d.port())
            .map(|port| format!("localhost:{}", port))
    }

    pub fn pid(&self) -> u32 {
        self.inner.lock().handler.pid()
    }

    /// Give the process `grace` to fall over, then mark it running.
    ///
    /// Only the hypervisor process is checked; the guest may still be
    /// booting.
    pub async fn confirm_started(&self, grace: Duration) -> ScratchResult<()> {
        tokio::time::sleep(grace).await;
        let mut inner = self.inner.lock();
        if inner.handler.is_running() {
            inner.state = VmState::Running;
            Ok(())
        } else {
            inner.state = VmState::Failed;
            Err(ScratchError::Launch(format!(
                "hypervisor exited during startup, see {}",
                self.spec.hypervisor_log.display()
            )))
        }
    }

    pub fn stop(&self) -> ScratchResult<()> {
        let mut inner = self.inner.lock();
        inner.handler.stop()?;
        inner.state = VmState::Stopped;
        Ok(())
    }
}

impl std::fmt::Debug for VmInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmInstance")
            .field("name", &self.spec.name)
            .field("pid", &self.pid())
            .finish()
    }
}
