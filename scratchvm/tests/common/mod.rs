use scratchvm::firewall::MemoryPacketFilter;
use scratchvm::runtime::HostEnvironment;
use scratchvm::service::NoopSupervisor;
use scratchvm::{PortForward, ProvisionOptions, ProvisioningOrchestrator, ScratchOptions};
use std::net::{Ipv4Addr, TcpListener};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Stands in for qemu: stays alive until signalled. Arguments end up in its
/// command line, so the instance disk path is visible in /proc.
pub const LONG_RUNNING_HYPERVISOR: &str = "#!/bin/sh\nwhile :; do sleep 1; done\n";

/// Stands in for a qemu that rejects its arguments.
pub const CRASHING_HYPERVISOR: &str = "#!/bin/sh\necho 'qemu: could not open disk' >&2\nexit 1\n";

pub struct Host {
    pub dir: TempDir,
    pub orchestrator: ProvisioningOrchestrator,
}

impl Host {
    /// Scratch home with in-memory firewall and no init system.
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let env = HostEnvironment::builder(ScratchOptions {
            home_dir: dir.path().join("home"),
        })
        .packet_filter(Arc::new(MemoryPacketFilter::new()))
        .supervisor(Arc::new(NoopSupervisor::new()))
        .build()
        .unwrap();
        Self {
            dir,
            orchestrator: ProvisioningOrchestrator::new(env),
        }
    }

    pub fn home(&self) -> PathBuf {
        self.dir.path().join("home")
    }

    pub fn hypervisor(&self, script: &str) -> PathBuf {
        let path = self.dir.path().join("fake-qemu");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Small raw base image served over file://.
    pub fn base_image(&self) -> String {
        let path = self.dir.path().join("jammy.img");
        if !path.exists() {
            std::fs::write(&path, vec![0u8; 4 << 20]).unwrap();
        }
        format!("file://{}", path.display())
    }

    pub fn key_file(&self) -> PathBuf {
        let path = self.dir.path().join("id_ed25519.pub");
        std::fs::write(&path, "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIG dev@laptop\n").unwrap();
        path
    }

    pub fn options(&self, name: &str, hypervisor: &Path, host_port: u16) -> ProvisionOptions {
        ProvisionOptions {
            name: name.to_string(),
            cpus: 2,
            memory_mib: 2048,
            disk_size: "20G".to_string(),
            image_url: self.base_image(),
            ssh_authorized_keys: vec![
                std::fs::read_to_string(self.key_file())
                    .unwrap()
                    .trim()
                    .to_string(),
            ],
            forwards: vec![PortForward {
                host_port,
                guest_port: 22,
            }],
            display: None,
            qemu_binary: hypervisor.to_path_buf(),
            ..Default::default()
        }
    }
}

pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

pub fn free_port() -> u16 {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
