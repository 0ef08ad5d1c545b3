//! Pluggable process supervisor.

use super::unit::ServiceUnit;
use async_trait::async_trait;
use parking_lot::Mutex;
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

/// Where systemd records that it is PID 1.
const SYSTEMD_RUNTIME_DIR: &str = "/run/systemd/system";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Active,
    Activating,
    Inactive,
    Failed,
    /// Known to the supervisor but never started.
    Installed,
    NotFound,
}

#[async_trait]
pub trait Supervisor: Send + Sync {
    fn name(&self) -> &str;

    /// Make `unit` known to the supervisor.
    async fn install(&self, unit: &ServiceUnit) -> ScratchResult<()>;

    async fn start(&self, unit: &str) -> ScratchResult<()>;

    async fn stop(&self, unit: &str) -> ScratchResult<()>;

    async fn status(&self, unit: &str) -> ScratchResult<UnitStatus>;
}

pub struct SystemdSupervisor {
    unit_dir: PathBuf,
    systemctl: String,
}

impl SystemdSupervisor {
    pub fn new(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            systemctl: "systemctl".to_string(),
        }
    }

    async fn systemctl(&self, args: &[&str]) -> ScratchResult<std::process::Output> {
        Command::new(&self.systemctl)
            .args(args)
            .output()
            .await
            .map_err(|e| ScratchError::Internal(format!("failed to run systemctl: {}", e)))
    }

    async fn systemctl_ok(&self, args: &[&str]) -> ScratchResult<()> {
        let output = self.systemctl(args).await?;
        if !output.status.success() {
            return Err(ScratchError::Internal(format!(
                "systemctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Supervisor for SystemdSupervisor {
    fn name(&self) -> &str {
        "systemd"
    }

    async fn install(&self, unit: &ServiceUnit) -> ScratchResult<()> {
        let path = self.unit_dir.join(unit.file_name());
        tokio::fs::write(&path, unit.render()).await.map_err(|e| {
            ScratchError::Storage(format!("Failed to write unit {}: {}", path.display(), e))
        })?;
        self.systemctl_ok(&["daemon-reload"]).await?;
        tracing::info!(unit = %unit.name, path = %path.display(), "Installed systemd unit");
        Ok(())
    }

    async fn start(&self, unit: &str) -> ScratchResult<()> {
        self.systemctl_ok(&["start", unit]).await
    }

    async fn stop(&self, unit: &str) -> ScratchResult<()> {
        self.systemctl_ok(&["stop", unit]).await
    }

    async fn status(&self, unit: &str) -> ScratchResult<UnitStatus> {
        // is-active exits non-zero for anything but "active"; the word on
        // stdout is what matters.
        let output = self.systemctl(&["is-active", unit]).await?;
        Ok(match String::from_utf8_lossy(&output.stdout).trim() {
            "active" | "reloading" => UnitStatus::Active,
            "activating" => UnitStatus::Activating,
            "failed" => UnitStatus::Failed,
            "inactive" | "deactivating" => UnitStatus::Inactive,
            _ => UnitStatus::NotFound,
        })
    }
}

/// Used where no init system is available. Remembers installed units and
/// reports them as never started; it never pretends to run anything.
#[derive(Default)]
pub struct NoopSupervisor {
    units: Mutex<HashMap<String, UnitStatus>>,
}

impl NoopSupervisor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Supervisor for NoopSupervisor {
    fn name(&self) -> &str {
        "none"
    }

    async fn install(&self, unit: &ServiceUnit) -> ScratchResult<()> {
        self.units
            .lock()
            .insert(unit.file_name(), UnitStatus::Installed);
        tracing::warn!(unit = %unit.name, "No supervisor available; unit recorded but not managed");
        Ok(())
    }

    async fn start(&self, unit: &str) -> ScratchResult<()> {
        if !self.units.lock().contains_key(&service_name(unit)) {
            return Err(ScratchError::NotFound(format!("unit {}", unit)));
        }
        tracing::warn!(unit, "No supervisor available; not starting");
        Ok(())
    }

    async fn stop(&self, unit: &str) -> ScratchResult<()> {
        tracing::debug!(unit, "No supervisor available; nothing to stop");
        Ok(())
    }

    async fn status(&self, unit: &str) -> ScratchResult<UnitStatus> {
        Ok(self
            .units
            .lock()
            .get(&service_name(unit))
            .copied()
            .unwrap_or(UnitStatus::NotFound))
    }
}

fn service_name(unit: &str) -> String {
    if unit.ends_with(".service") {
        unit.to_string()
    } else {
        format!("{}.service", unit)
    }
}

/// Pick systemd when it is running, otherwise the no-op supervisor.
pub fn detect_supervisor(unit_dir: &Path) -> Arc<dyn Supervisor> {
    detect_supervisor_at(Path::new(SYSTEMD_RUNTIME_DIR), unit_dir)
}

fn detect_supervisor_at(runtime_dir: &Path, unit_dir: &Path) -> Arc<dyn Supervisor> {
    if runtime_dir.is_dir() {
        Arc::new(SystemdSupervisor::new(unit_dir))
    } else {
        tracing::debug!("systemd not running; using no-op supervisor");
        Arc::new(NoopSupervisor::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ResourceLimits, RestartPolicy};

    fn unit() -> ServiceUnit {
        ServiceUnit::build(
            "workload",
            "/bin/false",
            vec![],
            RestartPolicy::default(),
            ResourceLimits::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_detect_falls_back_to_noop() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-systemd");
        assert_eq!(detect_supervisor_at(&missing, dir.path()).name(), "none");
        assert_eq!(detect_supervisor_at(dir.path(), dir.path()).name(), "systemd");
    }

    #[tokio::test]
    async fn test_noop_supervisor_tracks_units() {
        let supervisor = NoopSupervisor::new();
        assert_eq!(supervisor.status("workload").await.unwrap(), UnitStatus::NotFound);
        assert_eq!(
            supervisor.start("workload").await.unwrap_err().kind(),
            "NotFound"
        );

        supervisor.install(&unit()).await.unwrap();
        supervisor.start("workload.service").await.unwrap();
        supervisor.stop("workload").await.unwrap();
        assert_eq!(
            supervisor.status("workload").await.unwrap(),
            UnitStatus::Installed
        );
    }
}
