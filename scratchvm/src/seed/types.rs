//! First-boot configuration inputs.

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Namespace for deriving stable instance ids from instance names.
const INSTANCE_ID_NAMESPACE: uuid::Uuid = uuid::Uuid::from_u128(0x6f1c_2a7e_93d4_4b8e_a0f5_1d2c_3b4a_5e6f);

/// Correlates a seed bundle with exactly one VM instance.
///
/// Derived from the instance name so that re-provisioning the same name
/// produces the same id, and therefore the same seed bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn for_instance(name: &str) -> Self {
        let id = uuid::Uuid::new_v5(&INSTANCE_ID_NAMESPACE, name.as_bytes());
        Self(format!("iid-{}", id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who can log in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub hostname: String,
    pub user: String,
    pub shell: String,
    pub ssh_authorized_keys: Vec<String>,
    /// Crypted password (`mkpasswd` output). Enables console/SSH password login.
    pub password_hash: Option<String>,
    /// Passwordless sudo for `user`.
    pub sudo: bool,
}

impl Identity {
    pub fn has_auth_method(&self) -> bool {
        self.ssh_authorized_keys.iter().any(|k| !k.trim().is_empty())
            || self
                .password_hash
                .as_deref()
                .is_some_and(|h| !h.trim().is_empty())
    }
}

/// Packages installed on first boot, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSet {
    pub packages: Vec<String>,
    /// Refresh the package index before installing.
    pub update: bool,
    pub upgrade: bool,
}

impl PackageSet {
    pub fn new(packages: Vec<String>) -> Self {
        Self {
            packages,
            update: true,
            upgrade: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressPolicy {
    Dhcp,
    Static {
        address: Ipv4Network,
        gateway: Ipv4Addr,
        nameservers: Vec<Ipv4Addr>,
    },
}

/// Guest interface configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub interface: String,
    pub policy: AddressPolicy,
}

impl NetworkSpec {
    pub fn dhcp(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            policy: AddressPolicy::Dhcp,
        }
    }
}

/// A file written by the guest's first-boot agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFile {
    pub path: String,
    pub content: String,
    pub permissions: String,
}

impl SeedFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            permissions: "0644".to_string(),
        }
    }
}
