//! First-boot configuration bundle.
//!
//! A bundle is rendered into the three NoCloud documents and packed into a
//! small FAT volume labelled `cidata`, attached to the VM as a second drive.

mod bundle;
mod cloud_config;
mod types;
mod vfat;

pub use bundle::{ConfigBundle, SeedArtifact};
pub use types::{AddressPolicy, Identity, InstanceId, NetworkSpec, PackageSet, SeedFile};
