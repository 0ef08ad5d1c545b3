//! Types shared between the scratchvm library and its binaries.

pub mod errors;

pub use errors::{ScratchError, ScratchResult};
