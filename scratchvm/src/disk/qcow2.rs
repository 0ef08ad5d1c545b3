//! qcow2 header parsing and copy-on-write overlay creation.
//!
//! Headers are parsed with `qcow2_rs`. The crate formats standalone images
//! only, so overlays are serialized here: an empty qcow2 v3 image (no
//! allocated data clusters) whose header references a backing file. Reads of
//! unallocated clusters fall through to the backing file, writes allocate in
//! the overlay.
//!
//! ```text
//! cluster 0   header, extensions, backing file name
//! cluster 1   refcount table (one entry → cluster 2)
//! cluster 2   refcount block (refcount 1 for every metadata cluster)
//! cluster 3.. L1 table (all zero: nothing allocated yet)
//! ```

use super::DiskFormat;
use super::constants::{
    CLUSTER_BITS, CLUSTER_SIZE, EXT_BACKING_FORMAT, EXT_END, HEADER_LENGTH, INCOMPAT_DATA_FILE,
    MAGIC, MAX_BACKING_NAME, MAX_VIRTUAL_SIZE, REFCOUNT_ORDER, VERSION,
};
use qcow2_rs::meta::Qcow2Header;
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Fields of a qcow2 header that decide how an image is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qcow2Info {
    pub version: u32,
    pub cluster_bits: u32,
    pub size: u64,
    pub crypt_method: u32,
    pub incompatible_features: u64,
    pub backing_file: Option<String>,
}

fn be_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

fn be_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

/// True when `buf` starts with the qcow2 magic.
pub fn has_magic(buf: &[u8]) -> bool {
    buf.len() >= 4 && be_u32(buf, 0) == MAGIC
}

/// Length of a version 2 header, the shortest one qemu writes.
const V2_HEADER_LENGTH: usize = 72;

impl Qcow2Info {
    /// Read and parse the header of a qcow2 file.
    pub fn read(path: &Path) -> ScratchResult<Self> {
        let mut file = File::open(path).map_err(|e| {
            ScratchError::Disk(format!("Failed to open {}: {}", path.display(), e))
        })?;
        let mut buf = Vec::new();
        // The header, its extensions and the backing name all fit in cluster 0.
        std::io::Read::by_ref(&mut file).take(1 << 21).read_to_end(&mut buf)?;
        Self::parse(&buf).map_err(|e| ScratchError::Disk(format!("{}: {}", path.display(), e)))
    }

    fn parse(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < V2_HEADER_LENGTH {
            return Err("file too short for a qcow2 header".into());
        }
        if !has_magic(buf) {
            return Err("missing qcow2 magic".into());
        }
        let cluster_bits = be_u32(buf, 20);
        if !(9..=21).contains(&cluster_bits) {
            return Err(format!("invalid qcow2 cluster size 2^{}", cluster_bits));
        }
        let cluster = 1usize << cluster_bits;

        let backing_len = be_u32(buf, 16) as usize;
        if backing_len > MAX_BACKING_NAME {
            return Err(format!("backing file name too long ({} bytes)", backing_len));
        }
        let backing_end = be_u64(buf, 8).saturating_add(backing_len as u64);
        if backing_len != 0 && backing_end > cluster.min(buf.len()) as u64 {
            return Err("backing file name lies outside the first cluster".into());
        }

        let mut first = buf[..cluster.min(buf.len())].to_vec();
        first.resize(cluster, 0);
        let header = Qcow2Header::from_buf(&first).map_err(|e| format!("{:?}", e))?;

        let version = be_u32(buf, 4);
        let incompatible_features = if version >= 3 {
            if buf.len() < HEADER_LENGTH as usize {
                return Err("truncated v3 header".into());
            }
            be_u64(buf, 72)
        } else {
            0
        };
        Ok(Self {
            version,
            cluster_bits,
            size: header.size(),
            crypt_method: be_u32(buf, 32),
            incompatible_features,
            backing_file: header
                .backing_filename()
                .as_ref()
                .map(|name| name.to_string()),
        })
    }

    /// Reject variants that cannot serve as a read-only backing file.
    pub fn check_backing_compatible(&self) -> ScratchResult<()> {
        if self.version != 2 && self.version != 3 {
            return Err(ScratchError::Disk(format!(
                "unsupported qcow2 version {}",
                self.version
            )));
        }
        if self.crypt_method != 0 {
            return Err(ScratchError::Disk(
                "encrypted qcow2 images cannot be used as backing files".into(),
            ));
        }
        if self.incompatible_features & INCOMPAT_DATA_FILE != 0 {
            return Err(ScratchError::Disk(
                "qcow2 images with an external data file are not supported".into(),
            ));
        }
        if !(9..=21).contains(&self.cluster_bits) {
            return Err(ScratchError::Disk(format!(
                "invalid qcow2 cluster size 2^{}",
                self.cluster_bits
            )));
        }
        Ok(())
    }
}

/// Number of L1 entries needed to address `size` bytes.
pub fn l1_entries(size: u64) -> u64 {
    // Each L2 table is one cluster of 8-byte entries, each entry maps one cluster.
    let bytes_per_l2 = CLUSTER_SIZE * (CLUSTER_SIZE / 8);
    size.div_ceil(bytes_per_l2)
}

/// Serialize an empty overlay image referencing `backing_file`.
pub fn overlay_bytes(
    backing_file: &str,
    backing_format: DiskFormat,
    size: u64,
) -> ScratchResult<Vec<u8>> {
    if size > MAX_VIRTUAL_SIZE {
        return Err(ScratchError::Disk(format!(
            "disk size {} exceeds the qcow2 limit of {} bytes",
            size, MAX_VIRTUAL_SIZE
        )));
    }
    let l1_size = l1_entries(size);
    let l1_size_u32 = u32::try_from(l1_size)
        .map_err(|_| ScratchError::Disk(format!("disk size {} too large", size)))?;
    let l1_clusters = (l1_size * 8).div_ceil(CLUSTER_SIZE).max(1);
    let total_clusters = 3 + l1_clusters;

    let refcount_table_offset = CLUSTER_SIZE;
    let refcount_block_offset = 2 * CLUSTER_SIZE;
    let l1_table_offset = 3 * CLUSTER_SIZE;

    // Extension area: backing format, then end marker.
    let format_name = backing_format.as_str().as_bytes();
    let mut extensions = Vec::new();
    extensions.extend_from_slice(&EXT_BACKING_FORMAT.to_be_bytes());
    extensions.extend_from_slice(&(format_name.len() as u32).to_be_bytes());
    extensions.extend_from_slice(format_name);
    while extensions.len() % 8 != 0 {
        extensions.push(0);
    }
    extensions.extend_from_slice(&EXT_END.to_be_bytes());
    extensions.extend_from_slice(&0u32.to_be_bytes());

    let backing_file_offset = HEADER_LENGTH as u64 + extensions.len() as u64;
    let backing_name = backing_file.as_bytes();
    if backing_name.len() > MAX_BACKING_NAME {
        return Err(ScratchError::Disk(format!(
            "backing file path too long: {}",
            backing_file
        )));
    }

    let mut image = vec![0u8; (total_clusters * CLUSTER_SIZE) as usize];

    let mut header = Vec::with_capacity(HEADER_LENGTH as usize);
    header.extend_from_slice(&MAGIC.to_be_bytes());
    header.extend_from_slice(&VERSION.to_be_bytes());
    header.extend_from_slice(&backing_file_offset.to_be_bytes());
    header.extend_from_slice(&(backing_name.len() as u32).to_be_bytes());
    header.extend_from_slice(&CLUSTER_BITS.to_be_bytes());
    header.extend_from_slice(&size.to_be_bytes());
    header.extend_from_slice(&0u32.to_be_bytes()); // crypt_method
    header.extend_from_slice(&l1_size_u32.to_be_bytes());
    header.extend_from_slice(&l1_table_offset.to_be_bytes());
    header.extend_from_slice(&refcount_table_offset.to_be_bytes());
    header.extend_from_slice(&1u32.to_be_bytes()); // refcount_table_clusters
    header.extend_from_slice(&0u32.to_be_bytes()); // nb_snapshots
    header.extend_from_slice(&0u64.to_be_bytes()); // snapshots_offset
    header.extend_from_slice(&0u64.to_be_bytes()); // incompatible_features
    header.extend_from_slice(&0u64.to_be_bytes()); // compatible_features
    header.extend_from_slice(&0u64.to_be_bytes()); // autoclear_features
    header.extend_from_slice(&REFCOUNT_ORDER.to_be_bytes());
    header.extend_from_slice(&HEADER_LENGTH.to_be_bytes());
    debug_assert_eq!(header.len(), HEADER_LENGTH as usize);

    let mut cursor = 0usize;
    for chunk in [header.as_slice(), extensions.as_slice(), backing_name] {
        image[cursor..cursor + chunk.len()].copy_from_slice(chunk);
        cursor += chunk.len();
    }

    let rt = refcount_table_offset as usize;
    image[rt..rt + 8].copy_from_slice(&refcount_block_offset.to_be_bytes());

    let rb = refcount_block_offset as usize;
    for cluster in 0..total_clusters as usize {
        let at = rb + cluster * 2;
        image[at..at + 2].copy_from_slice(&1u16.to_be_bytes());
    }

    Qcow2Header::from_buf(&image[..CLUSTER_SIZE as usize])
        .map_err(|e| ScratchError::Disk(format!("overlay header rejected: {:?}", e)))?;
    Ok(image)
}

/// Write an overlay to `path` atomically (temp file in the same directory, then rename).
pub fn write_overlay(
    path: &Path,
    backing_file: &Path,
    backing_format: DiskFormat,
    size: u64,
) -> ScratchResult<()> {
    let backing = backing_file.to_str().ok_or_else(|| {
        ScratchError::Disk(format!(
            "backing file path is not UTF-8: {}",
            backing_file.display()
        ))
    })?;
    let bytes = overlay_bytes(backing, backing_format, size)?;

    let parent = path
        .parent()
        .ok_or_else(|| ScratchError::Disk(format!("{} has no parent", path.display())))?;
    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
        ScratchError::Disk(format!("Failed to create temp disk in {}: {}", parent.display(), e))
    })?;
    temp.write_all(&bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| {
        ScratchError::Disk(format!("Failed to install {}: {}", path.display(), e.error))
    })?;
    Ok(())
}
