use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scratchvm::firewall::{bridge_isolation_policy, operator_chain_commands, restore_script};
use scratchvm::provision::workload_unit;
use scratchvm::runtime::constants::{network, resources};
use scratchvm::runtime::{FilesystemLayout, WorkloadOptions};
use scratchvm::{
    HostEnvironment, PortForward, ProvisionError, ProvisionOptions, ProvisionStage,
    ProvisioningOrchestrator, ScratchError, ScratchOptions, ScratchResult, init_logging_for,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Exit code for a provision that ended in `Failed`.
const EXIT_PROVISION_FAILED: u8 = 2;

/// scratchvm — disposable development VMs
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// State directory (default: $SCRATCHVM_HOME or ~/.scratchvm).
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create (or converge) an instance and boot it.
    Provision(ProvisionArgs),

    /// Stop an instance and delete its disk and seed.
    Destroy {
        #[arg(long)]
        name: String,
    },

    /// List known instances.
    List,

    /// Print the bridge isolation rules, or install them on this host.
    Firewall {
        #[arg(long, default_value = network::DEFAULT_BRIDGE)]
        bridge: String,
        #[arg(long, default_value = network::DEFAULT_SUBNET)]
        subnet: String,
        /// Apply with iptables-restore instead of printing.
        #[arg(long)]
        apply: bool,
    },

    /// Print the workload service unit.
    Unit {
        /// Workload command line (default runs a container).
        #[arg(long, num_args = 1.., allow_hyphen_values = true)]
        command: Option<Vec<String>>,
        /// Install and start the unit with this host's supervisor.
        #[arg(long)]
        install: bool,
    },
}

#[derive(clap::Args, Debug)]
struct ProvisionArgs {
    #[arg(long, default_value = "scratch")]
    name: String,
    #[arg(long, default_value_t = resources::DEFAULT_CPUS)]
    cpus: u8,
    /// Memory in MiB.
    #[arg(long, default_value_t = resources::DEFAULT_MEMORY_MIB)]
    memory: u32,
    /// Logical disk size, e.g. 20G.
    #[arg(long, default_value = resources::DEFAULT_DISK_SIZE)]
    disk_size: String,
    /// Public key file; repeatable. Defaults to ~/.ssh/id_ed25519.pub or id_rsa.pub.
    #[arg(long = "ssh-key")]
    ssh_keys: Vec<PathBuf>,
    /// Login user inside the guest.
    #[arg(long)]
    user: Option<String>,
    /// Base image URL, file:// URL or absolute path.
    #[arg(long)]
    image: Option<String>,
    /// Expected SHA-256 of the base image.
    #[arg(long)]
    image_sha256: Option<String>,
    /// HOST:GUEST TCP forward; repeatable. Defaults to 2222:22.
    #[arg(long = "forward")]
    forwards: Vec<PortForward>,
    /// VNC display number (port 5900 + N).
    #[arg(long, default_value_t = network::DEFAULT_VNC_DISPLAY, conflicts_with = "no_display")]
    display: u16,
    #[arg(long)]
    no_display: bool,
    #[arg(long, default_value = network::DEFAULT_BRIDGE)]
    bridge: String,
    #[arg(long, default_value = network::DEFAULT_SUBNET)]
    subnet: String,
    /// Package installed on first boot; repeatable. Replaces the default list.
    #[arg(long = "package")]
    packages: Vec<String>,
    /// Command run once on first boot; repeatable, kept in order.
    #[arg(long = "run")]
    run_commands: Vec<String>,
    /// Hypervisor binary.
    #[arg(long)]
    qemu: Option<PathBuf>,
}

impl ProvisionArgs {
    /// Key files that cannot be read fail the run at `Init`.
    fn into_options(self) -> Result<ProvisionOptions, ProvisionError> {
        let defaults = ProvisionOptions::default();

        let key_files = if self.ssh_keys.is_empty() {
            default_key_files()
        } else {
            self.ssh_keys
        };
        let mut ssh_authorized_keys = Vec::new();
        for path in &key_files {
            let keys = read_public_keys(path)
                .map_err(|e| ProvisionError::new(ProvisionStage::Init, e))?;
            ssh_authorized_keys.extend(keys);
        }

        Ok(ProvisionOptions {
            name: self.name,
            cpus: self.cpus,
            memory_mib: self.memory,
            disk_size: self.disk_size,
            image_url: self.image.unwrap_or(defaults.image_url),
            image_sha256: self.image_sha256,
            user: self.user.unwrap_or(defaults.user),
            ssh_authorized_keys,
            forwards: if self.forwards.is_empty() {
                defaults.forwards
            } else {
                self.forwards
            },
            display: (!self.no_display).then_some(self.display),
            bridge: self.bridge,
            subnet: self.subnet,
            packages: if self.packages.is_empty() {
                defaults.packages
            } else {
                self.packages
            },
            run_commands: self.run_commands,
            qemu_binary: self.qemu.unwrap_or(defaults.qemu_binary),
            ..defaults
        })
    }
}

fn default_key_files() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    ["id_ed25519.pub", "id_ecdsa.pub", "id_rsa.pub"]
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .filter(|path| path.is_file())
        .take(1)
        .collect()
}

/// One key per non-empty, non-comment line.
fn read_public_keys(path: &Path) -> ScratchResult<Vec<String>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ScratchError::Config(format!("cannot read SSH public key {}: {}", path.display(), e))
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut options = ScratchOptions::default();
    if let Some(home) = cli.home {
        options.home_dir = std::path::absolute(&home)
            .with_context(|| format!("resolving {}", home.display()))?;
    }
    let _log_guard = init_logging_for(&FilesystemLayout::new(options.home_dir.clone()))?;

    match cli.command {
        Cmd::Provision(args) => {
            let outcome = match args.into_options() {
                Ok(provision_options) => match HostEnvironment::new(options) {
                    Ok(env) => {
                        ProvisioningOrchestrator::new(env)
                            .provision(provision_options)
                            .await
                    }
                    Err(err) => Err(ProvisionError::new(ProvisionStage::Init, err)),
                },
                Err(err) => Err(err),
            };

            match outcome {
                Ok(report) => {
                    println!(
                        "instance {} is running (pid {})",
                        report.name,
                        report.instance.pid()
                    );
                    println!("  disk:    {}", report.disk.display());
                    println!("  seed:    {}", report.seed.display());
                    for (guest, host) in report.forwarded_ports() {
                        println!("  port {:<5} -> {}", guest, host);
                    }
                    match report.display_endpoint() {
                        Some(endpoint) => println!("  display: vnc://{}", endpoint),
                        None => println!("  display: none"),
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    eprintln!("{}", err);
                    Ok(ExitCode::from(EXIT_PROVISION_FAILED))
                }
            }
        }

        Cmd::Destroy { name } => {
            let orchestrator = ProvisioningOrchestrator::new(HostEnvironment::new(options)?);
            orchestrator.destroy(&name)?;
            println!("destroyed {}", name);
            Ok(ExitCode::SUCCESS)
        }

        Cmd::List => {
            let orchestrator = ProvisioningOrchestrator::new(HostEnvironment::new(options)?);
            println!("{:<20} {:<13} {:<8} {}", "NAME", "STATUS", "PID", "FORWARDS");
            for record in orchestrator.list()? {
                let status = match &record.failed_stage {
                    Some(stage) => format!("{} ({})", record.status, stage),
                    None => record.status.to_string(),
                };
                let forwards: Vec<String> = record
                    .forwards
                    .iter()
                    .map(|f| format!("{}->{}", f.host_port, f.guest_port))
                    .collect();
                println!(
                    "{:<20} {:<13} {:<8} {}",
                    record.name,
                    status,
                    record.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    forwards.join(",")
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Cmd::Firewall {
            bridge,
            subnet,
            apply,
        } => {
            let subnet = subnet
                .parse()
                .with_context(|| format!("invalid subnet {}", subnet))?;
            let policy = bridge_isolation_policy(&bridge, subnet)?;
            if apply {
                let env = HostEnvironment::new(options)?;
                env.apply_firewall(&bridge, &policy).await?;
                println!("applied isolation rules for {}", bridge);
            } else {
                for command in operator_chain_commands(&policy) {
                    println!("# run first: {}", command);
                }
                print!("{}", restore_script(&policy));
            }
            Ok(ExitCode::SUCCESS)
        }

        Cmd::Unit { command, install } => {
            let mut workload = WorkloadOptions::default();
            if let Some(command) = command {
                workload.command = command;
            }
            let unit = workload_unit(&workload)?;
            if install {
                let env = HostEnvironment::new(options)?;
                env.install_unit(&unit, true).await?;
                println!("installed {} with {}", unit.file_name(), env.supervisor().name());
            } else {
                print!("{}", unit.render());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
