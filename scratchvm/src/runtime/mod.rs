pub mod constants;
mod env;
pub mod layout;
pub mod options;

pub use env::{HostEnvironment, HostEnvironmentBuilder, SharedEnvironment};
pub use layout::{FilesystemLayout, InstanceLayout};
pub use options::{PortForward, ProvisionOptions, ScratchOptions, WorkloadOptions};
