//! Error taxonomy for provisioning.
//!
//! The first five variants map one-to-one onto the stages that can fail:
//! fetching the base image, creating the overlay disk, validating
//! configuration input, applying firewall policy and launching the VM.
//! The rest are ambient failures (storage, registry, internal invariants).

use thiserror::Error;

pub type ScratchResult<T> = Result<T, ScratchError>;

#[derive(Debug, Error)]
pub enum ScratchError {
    /// Network failure or integrity mismatch while acquiring a base image.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Backing-file inspection or overlay creation failed.
    #[error("disk error: {0}")]
    Disk(String),

    /// Malformed or incomplete configuration input. Raised before any side effect.
    #[error("validation error: {0}")]
    Validation(String),

    /// The packet-filter subsystem rejected or could not receive a rule set.
    #[error("policy apply error: {0}")]
    PolicyApply(String),

    /// VM process could not be started or a requested resource is taken.
    #[error("launch error: {0}")]
    Launch(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ScratchError {
    /// Short, stable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            ScratchError::Fetch(_) => "FetchError",
            ScratchError::Disk(_) => "DiskError",
            ScratchError::Validation(_) => "ValidationError",
            ScratchError::PolicyApply(_) => "PolicyApplyError",
            ScratchError::Launch(_) => "LaunchError",
            ScratchError::Storage(_) => "StorageError",
            ScratchError::Database(_) => "DatabaseError",
            ScratchError::Config(_) => "ConfigError",
            ScratchError::NotFound(_) => "NotFound",
            ScratchError::InvalidState(_) => "InvalidState",
            ScratchError::Internal(_) => "InternalError",
            ScratchError::Io(_) => "IoError",
        }
    }
}
