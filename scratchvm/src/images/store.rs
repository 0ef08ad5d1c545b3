//! Image store: cached base images and copy-on-write instance disks.

use super::fetch::{self, ImageSource};
use crate::disk::{self, DiskFormat, qcow2};
use parking_lot::Mutex;
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A cached, read-only base image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImage {
    pub source: String,
    pub path: PathBuf,
    /// On-disk size in bytes (never zero).
    pub file_size: u64,
}

/// A writable overlay owned by one instance.
///
/// Holds a lease on the base image entry; the image store counts leases to
/// know which base images still back live overlays.
#[derive(Debug, Clone)]
pub struct InstanceDisk {
    pub path: PathBuf,
    pub base: Arc<BaseImage>,
    pub backing_format: DiskFormat,
    pub virtual_size: u64,
    /// The overlay already existed with the same backing file and size.
    pub reused: bool,
}

/// Cache of base images under `images/`.
///
/// Fetches of the same source are serialized by a per-path lock; different
/// sources download concurrently. Overlays only ever read base images.
pub struct ImageStore {
    images_dir: PathBuf,
    temp_dir: PathBuf,
    client: reqwest::Client,
    fetch_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    entries: Mutex<HashMap<PathBuf, Arc<BaseImage>>>,
}

impl std::fmt::Debug for ImageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageStore")
            .field("images_dir", &self.images_dir)
            .finish()
    }
}

impl ImageStore {
    pub fn new(images_dir: PathBuf, temp_dir: PathBuf) -> ScratchResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("scratchvm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ScratchError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            images_dir,
            temp_dir,
            client,
            fetch_locks: Mutex::new(HashMap::new()),
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Local path a source is cached at.
    pub fn cache_path(&self, source: &str) -> ScratchResult<PathBuf> {
        let parsed = ImageSource::parse(source)?;
        let digest = hex::encode(Sha256::digest(source.as_bytes()));
        Ok(self
            .images_dir
            .join(format!("{}-{}", &digest[..16], parsed.file_name())))
    }

    /// Fetch `source` into the cache unless it is already there.
    ///
    /// A cached, non-empty file is returned as-is without being rewritten.
    /// A zero-length leftover is treated as a failed earlier fetch and replaced.
    pub async fn acquire(
        &self,
        source: &str,
        expected_sha256: Option<&str>,
    ) -> ScratchResult<Arc<BaseImage>> {
        let parsed = ImageSource::parse(source)?;
        let path = self.cache_path(source)?;

        let lock = self.fetch_lock(&path);
        let _guard = lock.lock().await;

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() > 0 => {
                tracing::debug!(
                    source = %source,
                    path = %path.display(),
                    "Base image already cached"
                );
                return Ok(self.entry(BaseImage {
                    source: source.to_string(),
                    path,
                    file_size: meta.len(),
                }));
            }
            Ok(_) => {
                tracing::warn!(path = %path.display(), "Removing empty cached image");
                tokio::fs::remove_file(&path).await?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!(source = %source, "Fetching base image");
        let download = fetch::download(&self.client, &parsed, &self.temp_dir).await?;
        download.verify(source, expected_sha256)?;

        let bytes = download.bytes;
        download.temp.persist(&path).map_err(|e| {
            ScratchError::Storage(format!(
                "Failed to install image at {}: {}",
                path.display(),
                e.error
            ))
        })?;

        tracing::info!(
            source = %source,
            path = %path.display(),
            size_mb = bytes / (1024 * 1024),
            sha256 = %download.sha256,
            "Base image cached"
        );

        Ok(self.entry(BaseImage {
            source: source.to_string(),
            path,
            file_size: bytes,
        }))
    }

    /// Create a qcow2 overlay at `target` backed by `base`, with logical size `size_cap`.
    ///
    /// An existing overlay that already references the same base with the
    /// same size is reused. Any other non-empty file at `target` is an error.
    pub fn derive_instance_disk(
        &self,
        base: &Arc<BaseImage>,
        target: &Path,
        size_cap: u64,
    ) -> ScratchResult<InstanceDisk> {
        let backing_path = base.path.canonicalize().map_err(|e| {
            ScratchError::Disk(format!(
                "Base image {} is missing: {}",
                base.path.display(),
                e
            ))
        })?;
        let info = disk::inspect(&backing_path)?;

        if size_cap < info.virtual_size {
            return Err(ScratchError::Disk(format!(
                "requested disk size {} is smaller than base image size {}",
                size_cap, info.virtual_size
            )));
        }

        if let Ok(meta) = std::fs::metadata(target)
            && meta.len() > 0
        {
            if self.is_same_overlay(target, &backing_path, size_cap) {
                tracing::info!(
                    disk = %target.display(),
                    base = %backing_path.display(),
                    "Reusing existing instance disk"
                );
                return Ok(InstanceDisk {
                    path: target.to_path_buf(),
                    base: Arc::clone(base),
                    backing_format: info.format,
                    virtual_size: size_cap,
                    reused: true,
                });
            }
            return Err(ScratchError::Disk(format!(
                "{} already exists and is not an overlay of {}",
                target.display(),
                backing_path.display()
            )));
        }

        qcow2::write_overlay(target, &backing_path, info.format, size_cap)?;

        tracing::info!(
            disk = %target.display(),
            base = %backing_path.display(),
            backing_format = %info.format,
            size_gb = size_cap >> 30,
            "Created instance COW overlay"
        );

        Ok(InstanceDisk {
            path: target.to_path_buf(),
            base: Arc::clone(base),
            backing_format: info.format,
            virtual_size: size_cap,
            reused: false,
        })
    }

    /// Number of live leases (instance disks and callers) on a cached image.
    pub fn live_references(&self, path: &Path) -> usize {
        self.entries
            .lock()
            .get(path)
            .map(|entry| Arc::strong_count(entry) - 1)
            .unwrap_or(0)
    }

    fn is_same_overlay(&self, target: &Path, backing: &Path, size: u64) -> bool {
        match qcow2::Qcow2Info::read(target) {
            Ok(header) => {
                header.size == size
                    && header.backing_file.as_deref().map(Path::new) == Some(backing)
            }
            Err(_) => false,
        }
    }

    fn fetch_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.fetch_locks.lock();
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    fn entry(&self, image: BaseImage) -> Arc<BaseImage> {
        let mut entries = self.entries.lock();
        match entries.get(&image.path) {
            Some(existing) if **existing == image => Arc::clone(existing),
            _ => {
                let entry = Arc::new(image);
                entries.insert(entry.path.clone(), Arc::clone(&entry));
                entry
            }
        }
    }
}
