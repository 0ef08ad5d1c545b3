//! Disk image formats.
//!
//! Base images are info to decide how the overlay references them.
//! Instance disks are always qcow2 overlays; see [`qcow2`].

pub mod constants;
pub mod qcow2;

use qcow2::Qcow2Info;
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskFormat {
    Qcow2,
    Raw,
}

impl DiskFormat {
    /// Name understood by qemu's `format=` and the backing-format extension.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        }
    }
}

impl std::fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format and size of an image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: DiskFormat,
    /// Size the guest sees, in bytes.
    pub virtual_size: u64,
}

/// Detect the format of `path` and validate it can back an overlay.
pub fn inspect(path: &Path) -> ScratchResult<ImageInfo> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)
        .map_err(|e| ScratchError::Disk(format!("Failed to open {}: {}", path.display(), e)))?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Err(ScratchError::Disk(format!("{} is empty", path.display())));
    }

    let is_qcow2 = len >= 4 && {
        file.read_exact(&mut magic)?;
        qcow2::has_magic(&magic)
    };

    if is_qcow2 {
        let header = Qcow2Info::read(path)?;
        header.check_backing_compatible()?;
        Ok(ImageInfo {
            format: DiskFormat::Qcow2,
            virtual_size: header.size,
        })
    } else {
        Ok(ImageInfo {
            format: DiskFormat::Raw,
            virtual_size: len,
        })
    }
}
