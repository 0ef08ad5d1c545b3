//! Provisioning orchestration.
//!
//! ## Execution plan
//!
//! ```text
//!   0. BundleBuild ─┬─      (identity, packages, network)
//!      FirewallBuild ─┤     (bridge isolation policy)
//!      UnitBuild ─────┘     (supervised workload)
//!   1. BundleAssemble       (embed rules + unit, serialize seed)
//!   2. ImageAcquire         → ImageReady
//!   3. DiskDerive           → DiskReady
//!   4. SeedWrite            → BundleReady
//!   5. VmLaunch             → Launched
//!   6. LivenessCheck        → Running
//! ```
//!
//! Steps 0 and 1 are pure, so invalid input fails before anything is
//! written. Failures after that leave artifacts in place; every step is
//! idempotent, so running the plan again converges.

mod tasks;
mod types;

pub use tasks::workload_unit;
pub use types::{ProvisionError, ProvisionReport, ProvisionStage};

use crate::db::{InstanceRecord, InstanceStatus};
use crate::pipeline::{BoxedTask, ExecutionPlan, PipelineBuilder, PipelineExecutor, Stage};
use crate::runtime::{ProvisionOptions, SharedEnvironment};
use crate::util::is_same_process;
use crate::vmm::controller::{QemuHandler, VmmHandler};
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use std::sync::Arc;
use tasks::{
    BundleAssembleTask, BundleBuildTask, DiskDeriveTask, FirewallBuildTask, ImageAcquireTask,
    LivenessTask, ProvisionCtx, SeedWriteTask, UnitBuildTask, VmLaunchTask,
};
use tokio::sync::Mutex;
use types::ProvisionContext;

fn execution_plan() -> ExecutionPlan<ProvisionCtx> {
    let stages: Vec<Stage<BoxedTask<ProvisionCtx>>> = vec![
        Stage::parallel(vec![
            Box::new(BundleBuildTask),
            Box::new(FirewallBuildTask),
            Box::new(UnitBuildTask),
        ]),
        Stage::sequential(vec![Box::new(BundleAssembleTask)]),
        Stage::sequential(vec![Box::new(ImageAcquireTask)]),
        Stage::sequential(vec![Box::new(DiskDeriveTask)]),
        Stage::sequential(vec![Box::new(SeedWriteTask)]),
        Stage::sequential(vec![Box::new(VmLaunchTask)]),
        Stage::sequential(vec![Box::new(LivenessTask)]),
    ];
    ExecutionPlan::new(stages)
}

/// Drives instances through the provisioning state machine.
pub struct ProvisioningOrchestrator {
    env: SharedEnvironment,
}

impl ProvisioningOrchestrator {
    pub fn new(env: SharedEnvironment) -> Self {
        Self { env }
    }

    /// Run the full plan for one instance.
    pub async fn provision(
        &self,
        options: ProvisionOptions,
    ) -> Result<ProvisionReport, ProvisionError> {
        options
            .sanitize()
            .map_err(|e| ProvisionError::new(ProvisionStage::Init, e))?;

        let name = options.name.clone();
        tracing::info!(
            instance = %name,
            cpus = options.cpus,
            memory_mib = options.memory_mib,
            disk_size = %options.disk_size,
            "Provisioning instance"
        );

        let ctx = Arc::new(Mutex::new(ProvisionContext::new(
            Arc::clone(&self.env),
            options,
        )));
        let pipeline = PipelineBuilder::from_plan(execution_plan());

        let metrics = match PipelineExecutor::execute(pipeline, Arc::clone(&ctx)).await {
            Ok(metrics) => metrics,
            Err(failure) => {
                let stage = ProvisionStage::for_task(&failure.task);
                tracing::error!(
                    instance = %name,
                    stage = %stage,
                    task = %failure.task,
                    error = %failure.error,
                    "Provisioning failed"
                );
                self.mark_failed(&name, stage);
                return Err(ProvisionError::new(stage, failure.error));
            }
        };
        metrics.log();

        let mut ctx = ctx.lock().await;
        let missing = |what: &str| {
            ProvisionError::new(
                ProvisionStage::Running,
                ScratchError::Internal(format!("{} missing after provisioning", what)),
            )
        };
        let instance = ctx.instance.take().ok_or_else(|| missing("instance"))?;
        let disk = ctx.disk.take().ok_or_else(|| missing("disk"))?;

        Ok(ProvisionReport {
            name,
            base_image: disk.base.path.clone(),
            disk: disk.path,
            seed: ctx.layout.seed_path(),
            disk_reused: disk.reused,
            seed_written: ctx.seed_written,
            instance,
            metrics,
        })
    }

    /// Record the failed stage. Registry trouble must not mask the provisioning error.
    fn mark_failed(&self, name: &str, stage: ProvisionStage) {
        let result = self.env.registry().get(name).and_then(|record| match record {
            Some(mut record) => {
                record.status = InstanceStatus::Failed;
                record.failed_stage = Some(stage.to_string());
                self.env.registry().save(&record)
            }
            None => Ok(()),
        });
        if let Err(e) = result {
            tracing::warn!(instance = %name, error = %e, "Failed to record provisioning failure");
        }
    }

    /// Stop the VM and delete its disk, seed and registry row.
    ///
    /// The base image stays cached. Returns `NotFound` for an unknown name.
    pub fn destroy(&self, name: &str) -> ScratchResult<()> {
        let record = self
            .env
            .registry()
            .get(name)?
            .ok_or_else(|| ScratchError::NotFound(format!("instance {}", name)))?;

        if let Some(pid) = record.pid
            && is_same_process(pid, &record.disk_path.to_string_lossy())
        {
            tracing::info!(instance = %name, pid, "Stopping hypervisor");
            QemuHandler::attach(pid).stop()?;
        }

        self.env.layout().instance(name).cleanup()?;
        self.env.registry().remove(name)?;
        tracing::info!(instance = %name, "Instance destroyed");
        Ok(())
    }

    pub fn list(&self) -> ScratchResult<Vec<InstanceRecord>> {
        self.env.registry().list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::MemoryPacketFilter;
    use crate::runtime::{HostEnvironment, PortForward, ScratchOptions};
    use crate::service::NoopSupervisor;
    use crate::vmm::LaunchSpec;
    use crate::vmm::controller::VmmController;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FakeHandler {
        alive: Arc<AtomicBool>,
    }

    impl VmmHandler for FakeHandler {
        fn stop(&mut self) -> ScratchResult<()> {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn pid(&self) -> u32 {
            999_999_998
        }
    }

    /// Starts VMs that exit immediately when `crash` is set.
    #[derive(Default)]
    struct FakeController {
        crash: AtomicBool,
        starts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl VmmController for FakeController {
        async fn start(&self, _spec: &LaunchSpec) -> ScratchResult<Box<dyn VmmHandler>> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let alive = !self.crash.load(Ordering::SeqCst);
            Ok(Box::new(FakeHandler {
                alive: Arc::new(AtomicBool::new(alive)),
            }))
        }

        fn attach(&self, _pid: u32) -> Box<dyn VmmHandler> {
            Box::new(FakeHandler {
                alive: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    struct Fixture {
        dir: TempDir,
        controller: Arc<FakeController>,
        orchestrator: ProvisioningOrchestrator,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let controller = Arc::new(FakeController::default());
        let env = HostEnvironment::builder(ScratchOptions {
            home_dir: dir.path().join("home"),
        })
        .packet_filter(Arc::new(MemoryPacketFilter::new()))
        .supervisor(Arc::new(NoopSupervisor::new()))
        .controller(controller.clone())
        .build()
        .unwrap();
        Fixture {
            dir,
            controller,
            orchestrator: ProvisioningOrchestrator::new(env),
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn options(fixture: &Fixture) -> ProvisionOptions {
        let image = fixture.dir.path().join("base.img");
        std::fs::write(&image, vec![0u8; 1 << 20]).unwrap();
        ProvisionOptions {
            name: "dev".into(),
            image_url: format!("file://{}", image.display()),
            ssh_authorized_keys: vec!["ssh-ed25519 AAAAC3Nza dev@host".into()],
            forwards: vec![PortForward {
                host_port: free_port(),
                guest_port: 22,
            }],
            display: None,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_provision_reaches_running_and_records_instance() {
        let fixture = fixture();
        let report = fixture
            .orchestrator
            .provision(options(&fixture))
            .await
            .unwrap();

        assert!(report.disk.is_file());
        assert!(report.seed.is_file());
        assert!(report.seed_written);
        assert!(!report.disk_reused);

        let records = fixture.orchestrator.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, InstanceStatus::Running);
        assert_eq!(records[0].pid, Some(999_999_998));
    }

    #[tokio::test]
    async fn test_reprovision_reuses_artifacts() {
        let fixture = fixture();
        let opts = options(&fixture);
        let first = fixture.orchestrator.provision(opts.clone()).await.unwrap();
        first.instance.stop().unwrap();

        let second = fixture.orchestrator.provision(opts).await.unwrap();
        assert!(second.disk_reused);
        assert!(!second.seed_written);
        assert_eq!(second.disk, first.disk);
        assert_eq!(fixture.controller.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_crash_fails_at_running_and_keeps_artifacts() {
        let fixture = fixture();
        fixture.controller.crash.store(true, Ordering::SeqCst);

        let err = fixture
            .orchestrator
            .provision(options(&fixture))
            .await
            .unwrap_err();
        assert_eq!(err.stage, ProvisionStage::Running);
        assert_eq!(err.source.kind(), "LaunchError");

        let record = fixture.orchestrator.list().unwrap().remove(0);
        assert_eq!(record.status, InstanceStatus::Failed);
        assert_eq!(record.failed_stage.as_deref(), Some("Running"));
        assert!(record.disk_path.is_file());
        assert!(record.seed_path.is_file());
    }

    #[tokio::test]
    async fn test_bad_image_fails_at_image_ready() {
        let fixture = fixture();
        let opts = ProvisionOptions {
            image_url: format!("file://{}", fixture.dir.path().join("missing.img").display()),
            ..options(&fixture)
        };
        let err = fixture.orchestrator.provision(opts).await.unwrap_err();
        assert_eq!(err.stage, ProvisionStage::ImageReady);
        assert_eq!(err.source.kind(), "FetchError");
    }

    #[tokio::test]
    async fn test_invalid_name_fails_at_init() {
        let fixture = fixture();
        let opts = ProvisionOptions {
            name: "../escape".into(),
            ..options(&fixture)
        };
        let err = fixture.orchestrator.provision(opts).await.unwrap_err();
        assert_eq!(err.stage, ProvisionStage::Init);
        assert!(fixture.orchestrator.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_removes_instance() {
        let fixture = fixture();
        let report = fixture
            .orchestrator
            .provision(options(&fixture))
            .await
            .unwrap();
        report.instance.stop().unwrap();

        fixture.orchestrator.destroy("dev").unwrap();
        assert!(!report.disk.exists());
        assert!(!report.seed.exists());
        assert!(fixture.orchestrator.list().unwrap().is_empty());
        assert_eq!(
            fixture.orchestrator.destroy("dev").unwrap_err().kind(),
            "NotFound"
        );
    }
}
