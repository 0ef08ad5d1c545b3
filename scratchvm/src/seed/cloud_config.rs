//! NoCloud documents: `meta-data`, `user-data`, `network-config`.
//!
//! All three are YAML. Field order follows struct declaration order and maps
//! are `BTreeMap`, so rendering is deterministic.

use super::bundle::ConfigBundle;
use super::types::AddressPolicy;
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct MetaData<'a> {
    instance_id: &'a str,
    local_hostname: &'a str,
}

#[derive(Serialize)]
struct UserData<'a> {
    hostname: &'a str,
    preserve_hostname: bool,
    users: Vec<User<'a>>,
    ssh_pwauth: bool,
    package_update: bool,
    package_upgrade: bool,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    packages: &'a [String],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    write_files: Vec<WriteFile<'a>>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    runcmd: &'a [String],
}

#[derive(Serialize)]
struct User<'a> {
    name: &'a str,
    shell: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sudo: Option<&'static str>,
    lock_passwd: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    passwd: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_authorized_keys: Vec<&'a str>,
}

#[derive(Serialize)]
struct WriteFile<'a> {
    path: &'a str,
    permissions: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct NetworkConfig<'a> {
    version: u8,
    ethernets: BTreeMap<&'a str, Ethernet>,
}

#[derive(Serialize)]
struct Ethernet {
    dhcp4: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    addresses: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    routes: Vec<Route>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nameservers: Option<Nameservers>,
}

#[derive(Serialize)]
struct Route {
    to: &'static str,
    via: String,
}

#[derive(Serialize)]
struct Nameservers {
    addresses: Vec<String>,
}

fn to_yaml<T: Serialize>(doc: &T, what: &str) -> ScratchResult<String> {
    serde_yaml::to_string(doc)
        .map_err(|e| ScratchError::Internal(format!("failed to serialize {}: {}", what, e)))
}

pub(crate) fn meta_data(bundle: &ConfigBundle) -> ScratchResult<String> {
    to_yaml(
        &MetaData {
            instance_id: bundle.instance_id.as_str(),
            local_hostname: &bundle.identity.hostname,
        },
        "meta-data",
    )
}

pub(crate) fn user_data(bundle: &ConfigBundle) -> ScratchResult<String> {
    let identity = &bundle.identity;
    let keys: Vec<&str> = identity
        .ssh_authorized_keys
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .collect();
    let passwd = identity
        .password_hash
        .as_deref()
        .filter(|h| !h.trim().is_empty());

    let doc = UserData {
        hostname: &identity.hostname,
        preserve_hostname: false,
        users: vec![User {
            name: &identity.user,
            shell: &identity.shell,
            sudo: identity.sudo.then_some("ALL=(ALL) NOPASSWD:ALL"),
            lock_passwd: passwd.is_none(),
            passwd,
            ssh_authorized_keys: keys,
        }],
        ssh_pwauth: passwd.is_some(),
        package_update: bundle.packages.update,
        package_upgrade: bundle.packages.upgrade,
        packages: &bundle.packages.packages,
        write_files: bundle
            .files
            .iter()
            .map(|f| WriteFile {
                path: &f.path,
                permissions: &f.permissions,
                content: &f.content,
            })
            .collect(),
        runcmd: &bundle.run_commands,
    };

    Ok(format!("#cloud-config\n{}", to_yaml(&doc, "user-data")?))
}

pub(crate) fn network_config(bundle: &ConfigBundle) -> ScratchResult<String> {
    let network = &bundle.network;
    let ethernet = match &network.policy {
        AddressPolicy::Dhcp => Ethernet {
            dhcp4: true,
            addresses: Vec::new(),
            routes: Vec::new(),
            nameservers: None,
        },
        AddressPolicy::Static {
            address,
            gateway,
            nameservers,
        } => Ethernet {
            dhcp4: false,
            addresses: vec![address.to_string()],
            routes: vec![Route {
                to: "default",
                via: gateway.to_string(),
            }],
            nameservers: (!nameservers.is_empty()).then(|| Nameservers {
                addresses: nameservers.iter().map(|n| n.to_string()).collect(),
            }),
        },
    };

    let mut ethernets = BTreeMap::new();
    ethernets.insert(network.interface.as_str(), ethernet);
    to_yaml(
        &NetworkConfig {
            version: 2,
            ethernets,
        },
        "network-config",
    )
}
