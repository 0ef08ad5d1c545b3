//! Defaults and fixed names.

/// Base image used when `--image` is not given.
pub const DEFAULT_IMAGE_URL: &str =
    "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img";

/// Environment variable overriding the scratchvm home directory.
pub const HOME_ENV: &str = "SCRATCHVM_HOME";

/// Directory under the user's home used when `SCRATCHVM_HOME` is unset.
pub const DEFAULT_HOME_DIRNAME: &str = ".scratchvm";

pub mod filenames {
    pub const DISK: &str = "disk.qcow2";
    pub const SEED: &str = "seed.img";
    pub const CONSOLE_LOG: &str = "console.log";
    pub const HYPERVISOR_LOG: &str = "qemu.log";
    pub const DB: &str = "scratchvm.db";
    pub const FIREWALL_RULES: &str = "bridge.rules";
}

pub mod dirs {
    pub const IMAGES: &str = "images";
    pub const INSTANCES: &str = "instances";
    pub const DB: &str = "db";
    pub const LOGS: &str = "logs";
    pub const TMP: &str = "tmp";
}

pub mod resources {
    pub const DEFAULT_CPUS: u8 = 2;
    pub const DEFAULT_MEMORY_MIB: u32 = 2048;
    pub const DEFAULT_DISK_SIZE: &str = "20G";
}

pub mod network {
    /// Container bridge reproduced by the firewall policy.
    pub const DEFAULT_BRIDGE: &str = "docker0";
    pub const DEFAULT_SUBNET: &str = "172.17.0.0/16";

    /// Guest NIC name inside the VM.
    pub const GUEST_INTERFACE: &str = "ens3";

    pub const DEFAULT_SSH_HOST_PORT: u16 = 2222;
    pub const SSH_GUEST_PORT: u16 = 22;

    /// VNC listens on 5900 + display number.
    pub const VNC_BASE_PORT: u16 = 5900;
    pub const DEFAULT_VNC_DISPLAY: u16 = 1;
}

pub mod guest {
    pub const DEFAULT_USER: &str = "dev";
    pub const DEFAULT_SHELL: &str = "/bin/bash";
    pub const CONTAINER_RUNTIME_PACKAGE: &str = "docker.io";
    pub const CONTAINER_RUNTIME_UNIT: &str = "docker.service";
    pub const WORKLOAD_UNIT: &str = "scratch-workload";
    pub const WORKLOAD_DIR: &str = "/opt/workload";
    pub const UNIT_DIR: &str = "/etc/systemd/system";
    pub const FIREWALL_RULES_PATH: &str = "/etc/scratchvm/bridge.rules";
}

pub mod hypervisor {
    pub const QEMU_BINARY: &str = "qemu-system-x86_64";

    /// How long the launcher waits before declaring a spawned VM running.
    pub const LIVENESS_GRACE_MS: u64 = 500;
}
