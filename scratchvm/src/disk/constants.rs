//! qcow2 layout constants used when writing overlays.

/// Header magic, `QFI\xfb`.
pub const MAGIC: u32 = 0x5146_49fb;

/// Version written for new overlays. Versions 2 and 3 are accepted as backing files.
pub const VERSION: u32 = 3;

/// Cluster size in bits (64KB = 2^16).
pub const CLUSTER_BITS: u32 = 16;

pub const CLUSTER_SIZE: u64 = 1 << CLUSTER_BITS;

/// Refcount order (16-bit refcounts = 2^4).
pub const REFCOUNT_ORDER: u32 = 4;

/// Length of the fixed v3 header without the compression-type field.
pub const HEADER_LENGTH: u32 = 104;

/// Header extension: backing file format name.
pub const EXT_BACKING_FORMAT: u32 = 0xe279_2aca;

/// Header extension: end of extension area.
pub const EXT_END: u32 = 0;

/// Incompatible feature bit 2: external data file.
pub const INCOMPAT_DATA_FILE: u64 = 1 << 2;

/// Largest L1 table qemu will open, in bytes.
pub const MAX_L1_BYTES: u64 = 32 << 20;

/// Largest virtual size addressable by an overlay with [`CLUSTER_SIZE`] clusters.
pub const MAX_VIRTUAL_SIZE: u64 = (MAX_L1_BYTES / 8) * CLUSTER_SIZE * (CLUSTER_SIZE / 8);

/// Backing file names longer than this are refused by qemu.
pub const MAX_BACKING_NAME: usize = 1023;
