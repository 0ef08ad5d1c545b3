//! On-disk layout of the scratchvm home directory.
//!
//! ```text
//! ~/.scratchvm/
//!   images/                 cached base images (never written after fetch)
//!   instances/<name>/       one directory per VM instance
//!     disk.qcow2            copy-on-write overlay
//!     seed.img              cidata volume
//!     console.log           guest serial console
//!     qemu.log              hypervisor stdout/stderr
//!   db/scratchvm.db         instance registry
//!   logs/                   scratchvm logs
//!   tmp/                    partial downloads
//! ```

use super::constants::{dirs, filenames};
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn images_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::IMAGES)
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::INSTANCES)
    }

    pub fn db_path(&self) -> PathBuf {
        self.home_dir.join(dirs::DB).join(filenames::DB)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LOGS)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::TMP)
    }

    /// Create the top-level directories.
    pub fn prepare(&self) -> ScratchResult<()> {
        for dir in [
            self.images_dir(),
            self.instances_dir(),
            self.home_dir.join(dirs::DB),
            self.logs_dir(),
            self.temp_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                ScratchError::Storage(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    pub fn instance(&self, name: &str) -> InstanceLayout {
        InstanceLayout {
            root: self.instances_dir().join(name),
        }
    }
}

/// Paths owned by a single VM instance.
#[derive(Debug, Clone)]
pub struct InstanceLayout {
    root: PathBuf,
}

impl InstanceLayout {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn disk_path(&self) -> PathBuf {
        self.root.join(filenames::DISK)
    }

    pub fn seed_path(&self) -> PathBuf {
        self.root.join(filenames::SEED)
    }

    pub fn console_log_path(&self) -> PathBuf {
        self.root.join(filenames::CONSOLE_LOG)
    }

    pub fn hypervisor_log_path(&self) -> PathBuf {
        self.root.join(filenames::HYPERVISOR_LOG)
    }

    pub fn firewall_rules_path(&self) -> PathBuf {
        self.root.join(filenames::FIREWALL_RULES)
    }

    pub fn prepare(&self) -> ScratchResult<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            ScratchError::Storage(format!(
                "Failed to create instance directory {}: {}",
                self.root.display(),
                e
            ))
        })
    }

    /// Remove the instance directory and everything in it.
    pub fn cleanup(&self) -> ScratchResult<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}
