//! Host-wide shared state.
//!
//! One `HostEnvironment` per process. It owns everything concurrent
//! provisioning runs must agree on: the image cache with its fetch locks and
//! base image leases, the per-bridge firewall locks, and the instance
//! registry.

use super::constants::guest;
use super::layout::FilesystemLayout;
use super::options::{ProvisionOptions, ScratchOptions};
use crate::db::{Database, InstanceStore};
use crate::firewall::{BridgeLocks, FirewallPolicy, IptablesRestore, PacketFilter};
use crate::images::ImageStore;
use crate::service::{ServiceUnit, Supervisor, detect_supervisor};
use crate::vmm::VmLauncher;
use crate::vmm::controller::{QemuController, VmmController};
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use std::sync::Arc;

pub type SharedEnvironment = Arc<HostEnvironment>;

pub struct HostEnvironment {
    pub(crate) layout: FilesystemLayout,
    pub(crate) images: ImageStore,
    pub(crate) registry: InstanceStore,
    bridge_locks: BridgeLocks,
    packet_filter: Arc<dyn PacketFilter>,
    supervisor: Arc<dyn Supervisor>,
    /// Fixed controller; `None` means a QEMU controller per provision.
    controller: Option<Arc<dyn VmmController>>,
}

impl HostEnvironment {
    /// Real host: iptables, systemd when running, QEMU.
    pub fn new(options: ScratchOptions) -> ScratchResult<SharedEnvironment> {
        HostEnvironmentBuilder::new(options).build()
    }

    pub fn builder(options: ScratchOptions) -> HostEnvironmentBuilder {
        HostEnvironmentBuilder::new(options)
    }

    pub fn layout(&self) -> &FilesystemLayout {
        &self.layout
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub fn registry(&self) -> &InstanceStore {
        &self.registry
    }

    pub fn packet_filter(&self) -> &Arc<dyn PacketFilter> {
        &self.packet_filter
    }

    pub fn supervisor(&self) -> &Arc<dyn Supervisor> {
        &self.supervisor
    }

    /// Launcher for one provision.
    pub(crate) fn launcher_for(&self, options: &ProvisionOptions) -> VmLauncher {
        let controller = self
            .controller
            .clone()
            .unwrap_or_else(|| Arc::new(QemuController::new(options.qemu_binary.clone())));
        VmLauncher::new(controller)
    }

    /// Install `policy` on the host, serialized per bridge.
    pub async fn apply_firewall(&self, bridge: &str, policy: &FirewallPolicy) -> ScratchResult<()> {
        self.bridge_locks
            .apply(self.packet_filter.as_ref(), bridge, policy)
            .await
    }

    /// Hand `unit` to the host supervisor and optionally start it.
    pub async fn install_unit(&self, unit: &ServiceUnit, start: bool) -> ScratchResult<()> {
        self.supervisor.install(unit).await?;
        if start {
            self.supervisor.start(&unit.name).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HostEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEnvironment")
            .field("home", &self.layout.home_dir())
            .field("packet_filter", &self.packet_filter.name())
            .field("supervisor", &self.supervisor.name())
            .finish()
    }
}

/// Swaps in alternative backends, mainly for tests and dry runs.
pub struct HostEnvironmentBuilder {
    options: ScratchOptions,
    packet_filter: Option<Arc<dyn PacketFilter>>,
    supervisor: Option<Arc<dyn Supervisor>>,
    controller: Option<Arc<dyn VmmController>>,
}

impl HostEnvironmentBuilder {
    fn new(options: ScratchOptions) -> Self {
        Self {
            options,
            packet_filter: None,
            supervisor: None,
            controller: None,
        }
    }

    pub fn packet_filter(mut self, filter: Arc<dyn PacketFilter>) -> Self {
        self.packet_filter = Some(filter);
        self
    }

    pub fn supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn controller(mut self, controller: Arc<dyn VmmController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn build(self) -> ScratchResult<SharedEnvironment> {
        let home = &self.options.home_dir;
        if !home.is_absolute() {
            return Err(ScratchError::Config(format!(
                "home directory must be an absolute path, got: {}",
                home.display()
            )));
        }

        let layout = FilesystemLayout::new(home.clone());
        layout.prepare().map_err(|e| {
            ScratchError::Storage(format!(
                "Failed to initialize filesystem at {}: {}",
                layout.home_dir().display(),
                e
            ))
        })?;

        let images = ImageStore::new(layout.images_dir(), layout.temp_dir())?;
        let db = Database::open(&layout.db_path()).map_err(|e| {
            ScratchError::Storage(format!(
                "Failed to initialize database at {}: {}",
                layout.db_path().display(),
                e
            ))
        })?;

        let env = HostEnvironment {
            images,
            registry: InstanceStore::new(db),
            bridge_locks: BridgeLocks::new(),
            packet_filter: self
                .packet_filter
                .unwrap_or_else(|| Arc::new(IptablesRestore::default())),
            supervisor: self
                .supervisor
                .unwrap_or_else(|| detect_supervisor(std::path::Path::new(guest::UNIT_DIR))),
            controller: self.controller,
            layout,
        };

        tracing::debug!(env = ?env, "Initialized host environment");
        Ok(Arc::new(env))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{MemoryPacketFilter, bridge_isolation_policy};
    use crate::service::{NoopSupervisor, ResourceLimits, RestartPolicy, UnitStatus};
    use tempfile::TempDir;

    fn env(dir: &TempDir, filter: Arc<MemoryPacketFilter>) -> SharedEnvironment {
        HostEnvironment::builder(ScratchOptions {
            home_dir: dir.path().to_path_buf(),
        })
        .packet_filter(filter)
        .supervisor(Arc::new(NoopSupervisor::new()))
        .build()
        .unwrap()
    }

    #[test]
    fn test_relative_home_rejected() {
        let err = HostEnvironment::new(ScratchOptions {
            home_dir: "relative/home".into(),
        })
        .unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[tokio::test]
    async fn test_apply_firewall_goes_through_filter() {
        let dir = TempDir::new().unwrap();
        let filter = Arc::new(MemoryPacketFilter::new());
        let env = env(&dir, filter.clone());
        let policy = bridge_isolation_policy("docker0", "172.17.0.0/16".parse().unwrap()).unwrap();

        env.apply_firewall("docker0", &policy).await.unwrap();
        env.apply_firewall("docker0", &policy).await.unwrap();
        assert_eq!(filter.apply_count(), 2);
        assert!(env.layout().db_path().exists());
    }

    #[tokio::test]
    async fn test_install_unit_with_noop_supervisor() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir, Arc::new(MemoryPacketFilter::new()));
        let unit = ServiceUnit::build(
            "workload",
            "/bin/true",
            vec![],
            RestartPolicy::default(),
            ResourceLimits::default(),
        )
        .unwrap();

        env.install_unit(&unit, true).await.unwrap();
        assert_eq!(
            env.supervisor().status("workload").await.unwrap(),
            UnitStatus::Installed
        );
    }
}
