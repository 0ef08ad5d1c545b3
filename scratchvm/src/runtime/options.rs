//! User-facing configuration.

use super::constants::{self, guest, network, resources};
use crate::disk::constants::MAX_VIRTUAL_SIZE;
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Process-wide options: where scratchvm keeps its state.
#[derive(Debug, Clone)]
pub struct ScratchOptions {
    pub home_dir: PathBuf,
}

impl Default for ScratchOptions {
    /// `$SCRATCHVM_HOME`, else `~/.scratchvm`.
    fn default() -> Self {
        let home_dir = std::env::var_os(constants::HOME_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(constants::DEFAULT_HOME_DIRNAME)
            });
        Self { home_dir }
    }
}

/// Host port → guest port forward over user-mode NAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub host_port: u16,
    pub guest_port: u16,
}

impl std::str::FromStr for PortForward {
    type Err = ScratchError;

    /// Parses `HOST:GUEST`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, guest) = s.split_once(':').ok_or_else(|| {
            ScratchError::Validation(format!("port forward must be HOST:GUEST, got '{}'", s))
        })?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ScratchError::Validation(format!("invalid port '{}' in '{}'", v, s)))
        };
        Ok(Self {
            host_port: parse(host)?,
            guest_port: parse(guest)?,
        })
    }
}

/// Workload restart settings handed to the guest supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadOptions {
    pub command: Vec<String>,
    pub working_directory: String,
    pub restart_delay: Duration,
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub max_open_files: u64,
}

impl Default for WorkloadOptions {
    fn default() -> Self {
        Self {
            command: vec![
                "/usr/bin/docker".to_string(),
                "run".to_string(),
                "--rm".to_string(),
                "--name".to_string(),
                "workload".to_string(),
                "hello-world".to_string(),
            ],
            working_directory: guest::WORKLOAD_DIR.to_string(),
            restart_delay: Duration::from_secs(5),
            max_restarts: 3,
            restart_window: Duration::from_secs(60),
            max_open_files: 65536,
        }
    }
}

/// Everything needed to provision one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionOptions {
    pub name: String,
    pub cpus: u8,
    pub memory_mib: u32,
    /// Logical size of the instance disk, qemu-img syntax (`20G`, `512M`).
    pub disk_size: String,
    pub image_url: String,
    /// Expected SHA-256 of the base image, hex.
    pub image_sha256: Option<String>,
    pub user: String,
    /// Public keys, one per entry, in authorized_keys format.
    pub ssh_authorized_keys: Vec<String>,
    /// Crypted password hash, accepted as an alternative to SSH keys.
    pub password_hash: Option<String>,
    pub forwards: Vec<PortForward>,
    /// VNC display number; `None` disables the display.
    pub display: Option<u16>,
    pub bridge: String,
    pub subnet: String,
    pub packages: Vec<String>,
    pub run_commands: Vec<String>,
    pub workload: WorkloadOptions,
    pub qemu_binary: PathBuf,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self {
            name: "scratch".to_string(),
            cpus: resources::DEFAULT_CPUS,
            memory_mib: resources::DEFAULT_MEMORY_MIB,
            disk_size: resources::DEFAULT_DISK_SIZE.to_string(),
            image_url: constants::DEFAULT_IMAGE_URL.to_string(),
            image_sha256: None,
            user: guest::DEFAULT_USER.to_string(),
            ssh_authorized_keys: Vec::new(),
            password_hash: None,
            forwards: vec![PortForward {
                host_port: network::DEFAULT_SSH_HOST_PORT,
                guest_port: network::SSH_GUEST_PORT,
            }],
            display: Some(network::DEFAULT_VNC_DISPLAY),
            bridge: network::DEFAULT_BRIDGE.to_string(),
            subnet: network::DEFAULT_SUBNET.to_string(),
            packages: vec![guest::CONTAINER_RUNTIME_PACKAGE.to_string()],
            run_commands: Vec::new(),
            workload: WorkloadOptions::default(),
            qemu_binary: PathBuf::from(constants::hypervisor::QEMU_BINARY),
        }
    }
}

impl ProvisionOptions {
    /// Check the cheap structural constraints. Bundle, firewall and unit
    /// builders validate their own inputs.
    pub fn sanitize(&self) -> ScratchResult<()> {
        validate_instance_name(&self.name)?;
        if self.cpus == 0 {
            return Err(ScratchError::Validation("cpus must be at least 1".into()));
        }
        if self.memory_mib < 128 {
            return Err(ScratchError::Validation(format!(
                "memory must be at least 128 MiB, got {}",
                self.memory_mib
            )));
        }
        let disk_size = self.disk_size_bytes()?;
        if disk_size > MAX_VIRTUAL_SIZE {
            return Err(ScratchError::Validation(format!(
                "disk size {} exceeds the qcow2 limit of {} bytes",
                self.disk_size, MAX_VIRTUAL_SIZE
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for forward in &self.forwards {
            if !seen.insert(forward.host_port) {
                return Err(ScratchError::Validation(format!(
                    "host port {} forwarded twice",
                    forward.host_port
                )));
            }
        }
        Ok(())
    }

    pub fn disk_size_bytes(&self) -> ScratchResult<u64> {
        parse_size(&self.disk_size)
    }
}

/// Instance names become directory names and hostnames.
pub fn validate_instance_name(name: &str) -> ScratchResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(ScratchError::Validation(format!(
            "instance name '{}' must be 1-63 alphanumerics or '-', not starting or ending with '-'",
            name
        )))
    }
}

/// Parse a size with an optional binary suffix (K, M, G, T). No suffix means bytes.
pub fn parse_size(input: &str) -> ScratchResult<u64> {
    let trimmed = input.trim();
    let invalid = || ScratchError::Validation(format!("invalid size '{}'", input));

    let (digits, shift) = match trimmed.chars().last() {
        Some(c) if c.is_ascii_digit() => (trimmed, 0),
        Some(c) => {
            let shift = match c.to_ascii_uppercase() {
                'K' => 10,
                'M' => 20,
                'G' => 30,
                'T' => 40,
                _ => return Err(invalid()),
            };
            (&trimmed[..trimmed.len() - 1], shift)
        }
        None => return Err(invalid()),
    };

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    if value == 0 {
        return Err(invalid());
    }
    value.checked_shl(shift).filter(|v| v >> shift == value).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("20G").unwrap(), 20 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert!(parse_size("").is_err());
        assert!(parse_size("0G").is_err());
        assert!(parse_size("12X").is_err());
        assert!(parse_size("G").is_err());
    }

    #[test]
    fn test_port_forward_parse() {
        let fwd: PortForward = "2222:22".parse().unwrap();
        assert_eq!(fwd.host_port, 2222);
        assert_eq!(fwd.guest_port, 22);
        assert!("2222".parse::<PortForward>().is_err());
        assert!("0:22".parse::<PortForward>().is_err());
        assert!("a:22".parse::<PortForward>().is_err());
    }

    #[test]
    fn test_sanitize_rejects_duplicate_host_port() {
        let options = ProvisionOptions {
            forwards: vec![
                PortForward {
                    host_port: 2222,
                    guest_port: 22,
                },
                PortForward {
                    host_port: 2222,
                    guest_port: 80,
                },
            ],
            ..Default::default()
        };
        let err = options.sanitize().unwrap_err();
        assert!(err.to_string().contains("forwarded twice"));
    }

    #[test]
    fn test_sanitize_bounds_disk_size() {
        let options = ProvisionOptions {
            disk_size: "2048T".into(),
            ..Default::default()
        };
        options.sanitize().unwrap();

        let options = ProvisionOptions {
            disk_size: "8192T".into(),
            ..Default::default()
        };
        let err = options.sanitize().unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
        assert!(err.to_string().contains("exceeds the qcow2 limit"));
    }

    #[test]
    fn test_instance_names() {
        assert!(validate_instance_name("dev-1").is_ok());
        assert!(validate_instance_name("").is_err());
        assert!(validate_instance_name("-dev").is_err());
        assert!(validate_instance_name("dev/../x").is_err());
    }
}
