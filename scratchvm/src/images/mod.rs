//! Base image cache and instance disk derivation.
//!
//! Base images are fetched once into `images/` and never written again.
//! Every instance disk is a qcow2 overlay that names a cached base image as
//! its read-only backing file.

mod fetch;
mod store;

pub use store::{BaseImage, ImageStore, InstanceDisk};
