//! QEMU-backed controller.

use super::spawn::spawn_subprocess;
use super::{VmmController, VmmHandler};
use crate::util::process::{is_process_alive, kill_process, terminate_process};
use crate::vmm::LaunchSpec;
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use std::path::PathBuf;
use std::process::Child;
use std::time::{Duration, Instant};

/// Time a VM gets to shut down after SIGTERM before it is killed.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Command line for one VM.
///
/// KVM is used when available, TCG otherwise. Forwards bind on loopback
/// only, matching the `localhost:<port>` addresses reported to the operator.
pub fn qemu_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args = vec![
        "-name".to_string(),
        spec.name.clone(),
        "-machine".to_string(),
        "accel=kvm:tcg".to_string(),
        "-smp".to_string(),
        spec.resources.cpus.to_string(),
        "-m".to_string(),
        spec.resources.memory_mib.to_string(),
        "-drive".to_string(),
        format!("file={},format=qcow2,if=virtio", spec.disk.display()),
        "-drive".to_string(),
        format!(
            "file={},format=raw,if=virtio,readonly=on",
            spec.seed.display()
        ),
    ];

    let mut netdev = "user,id=net0".to_string();
    for fwd in &spec.network.forwards {
        netdev.push_str(&format!(
            ",hostfwd=tcp:127.0.0.1:{}-:{}",
            fwd.host_port, fwd.guest_port
        ));
    }
    args.extend([
        "-netdev".to_string(),
        netdev,
        "-device".to_string(),
        "virtio-net-pci,netdev=net0".to_string(),
    ]);

    match spec.display {
        Some(display) => args.extend(["-vnc".to_string(), format!("127.0.0.1:{}", display.0)]),
        None => args.extend(["-display".to_string(), "none".to_string()]),
    }

    args.extend([
        "-serial".to_string(),
        format!("file:{}", spec.console_log.display()),
    ]);
    args
}

pub struct QemuController {
    binary: PathBuf,
}

impl QemuController {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait::async_trait]
impl VmmController for QemuController {
    async fn start(&self, spec: &LaunchSpec) -> ScratchResult<Box<dyn VmmHandler>> {
        let args = qemu_args(spec);
        tracing::debug!(
            instance = %spec.name,
            binary = %self.binary.display(),
            args = ?args,
            "Spawning hypervisor"
        );

        let child = spawn_subprocess(&self.binary, &args, &spec.hypervisor_log)?;
        tracing::info!(instance = %spec.name, pid = child.id(), "Hypervisor started");
        Ok(Box::new(QemuHandler::spawned(child)))
    }

    fn attach(&self, pid: u32) -> Box<dyn VmmHandler> {
        Box::new(QemuHandler::attach(pid))
    }
}

/// Handle on a hypervisor process.
pub struct QemuHandler {
    pid: u32,
    /// Present when this process spawned the VM.
    child: Option<Child>,
    exited: bool,
}

impl QemuHandler {
    fn spawned(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Some(child),
            exited: false,
        }
    }

    /// Handle for a VM started by an earlier invocation.
    pub fn attach(pid: u32) -> Self {
        Self {
            pid,
            child: None,
            exited: false,
        }
    }
}

impl VmmHandler for QemuHandler {
    fn stop(&mut self) -> ScratchResult<()> {
        if !self.is_running() {
            return Ok(());
        }

        terminate_process(self.pid);
        let deadline = Instant::now() + STOP_TIMEOUT;
        while Instant::now() < deadline {
            if !self.is_running() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        tracing::warn!(pid = self.pid, "Hypervisor ignored SIGTERM, killing");
        if !kill_process(self.pid) {
            return Err(ScratchError::Launch(format!(
                "failed to kill hypervisor pid {}",
                self.pid
            )));
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.wait();
        }
        self.exited = true;
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        if self.exited {
            return false;
        }
        let running = match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => is_process_alive(self.pid),
        };
        if !running {
            self.exited = true;
        }
        running
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::options::PortForward;
    use crate::vmm::{Display, Resources, UserNetwork};

    fn spec(display: Option<Display>) -> LaunchSpec {
        LaunchSpec {
            name: "dev".into(),
            disk: "/var/lib/x/disk.qcow2".into(),
            seed: "/var/lib/x/seed.img".into(),
            network: UserNetwork {
                forwards: vec![
                    PortForward {
                        host_port: 2222,
                        guest_port: 22,
                    },
                    PortForward {
                        host_port: 8080,
                        guest_port: 80,
                    },
                ],
            },
            resources: Resources {
                cpus: 2,
                memory_mib: 2048,
            },
            display,
            console_log: "/var/lib/x/console.log".into(),
            hypervisor_log: "/var/lib/x/qemu.log".into(),
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn test_qemu_args() {
        let args = qemu_args(&spec(Some(Display(1))));
        assert_eq!(value_after(&args, "-smp"), vec!["2"]);
        assert_eq!(value_after(&args, "-m"), vec!["2048"]);
        assert_eq!(
            value_after(&args, "-drive"),
            vec![
                "file=/var/lib/x/disk.qcow2,format=qcow2,if=virtio",
                "file=/var/lib/x/seed.img,format=raw,if=virtio,readonly=on",
            ]
        );
        assert_eq!(
            value_after(&args, "-netdev"),
            vec!["user,id=net0,hostfwd=tcp:127.0.0.1:2222-:22,hostfwd=tcp:127.0.0.1:8080-:80"]
        );
        assert_eq!(value_after(&args, "-vnc"), vec!["127.0.0.1:1"]);
        assert_eq!(value_after(&args, "-serial"), vec!["file:/var/lib/x/console.log"]);
    }

    #[test]
    fn test_qemu_args_without_display() {
        let args = qemu_args(&spec(None));
        assert!(value_after(&args, "-vnc").is_empty());
        assert_eq!(value_after(&args, "-display"), vec!["none"]);
    }

    #[test]
    fn test_attach_to_dead_pid() {
        let mut handler = QemuHandler::attach(999_999_999);
        assert!(!handler.is_running());
        handler.stop().unwrap();
    }
}
