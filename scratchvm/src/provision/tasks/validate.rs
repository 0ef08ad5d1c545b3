//! Tasks: pure builders. Nothing here touches the filesystem, so a
//! rejected input leaves no artifact behind.
//!
//! The bundle, firewall and unit builders run in parallel. Assembly then
//! embeds the rules file and unit file in the bundle and serializes it, so
//! an oversized seed is also caught before any side effect.

use super::{
    BUNDLE_ASSEMBLE, BUNDLE_BUILD, FIREWALL_BUILD, ProvisionCtx, UNIT_BUILD, log_task_error,
    task_start,
};
use crate::firewall::{
    FirewallPolicy, bridge_isolation_policy, operator_chain_commands, restore_script,
};
use crate::pipeline::PipelineTask;
use crate::runtime::constants::{guest, network};
use crate::runtime::{ProvisionOptions, WorkloadOptions};
use crate::seed::{ConfigBundle, Identity, InstanceId, NetworkSpec, PackageSet, SeedFile};
use crate::service::{ResourceLimits, RestartPolicy, ServiceUnit};
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use scratchvm_shared::errors::{ScratchError, ScratchResult};

pub(crate) struct BundleBuildTask;

#[async_trait]
impl PipelineTask<ProvisionCtx> for BundleBuildTask {
    async fn run(self: Box<Self>, ctx: ProvisionCtx) -> ScratchResult<()> {
        let task_name = self.name();
        let instance = task_start(&ctx, task_name).await;

        let (options, instance_id) = {
            let ctx = ctx.lock().await;
            (ctx.options.clone(), ctx.instance_id.clone())
        };
        let bundle = build_bundle(&options, instance_id)
            .inspect_err(|e| log_task_error(&instance, task_name, e))?;

        ctx.lock().await.bundle = Some(bundle);
        Ok(())
    }

    fn name(&self) -> &str {
        BUNDLE_BUILD
    }
}

fn build_bundle(options: &ProvisionOptions, instance_id: InstanceId) -> ScratchResult<ConfigBundle> {
    let identity = Identity {
        hostname: options.name.clone(),
        user: options.user.clone(),
        shell: guest::DEFAULT_SHELL.to_string(),
        ssh_authorized_keys: options.ssh_authorized_keys.clone(),
        password_hash: options.password_hash.clone(),
        sudo: true,
    };
    ConfigBundle::build(
        instance_id,
        identity,
        PackageSet::new(options.packages.clone()),
        NetworkSpec::dhcp(network::GUEST_INTERFACE),
        options.run_commands.clone(),
    )
}

pub(crate) struct FirewallBuildTask;

#[async_trait]
impl PipelineTask<ProvisionCtx> for FirewallBuildTask {
    async fn run(self: Box<Self>, ctx: ProvisionCtx) -> ScratchResult<()> {
        let task_name = self.name();
        let instance = task_start(&ctx, task_name).await;

        let (bridge, subnet) = {
            let ctx = ctx.lock().await;
            (ctx.options.bridge.clone(), ctx.options.subnet.clone())
        };
        let policy = build_policy(&bridge, &subnet)
            .inspect_err(|e| log_task_error(&instance, task_name, e))?;

        ctx.lock().await.policy = Some(policy);
        Ok(())
    }

    fn name(&self) -> &str {
        FIREWALL_BUILD
    }
}

fn build_policy(bridge: &str, subnet: &str) -> ScratchResult<FirewallPolicy> {
    let subnet: Ipv4Network = subnet
        .parse()
        .map_err(|e| ScratchError::Validation(format!("invalid subnet '{}': {}", subnet, e)))?;
    let policy = bridge_isolation_policy(bridge, subnet)?;
    policy.validate()?;
    Ok(policy)
}

pub(crate) struct UnitBuildTask;

#[async_trait]
impl PipelineTask<ProvisionCtx> for UnitBuildTask {
    async fn run(self: Box<Self>, ctx: ProvisionCtx) -> ScratchResult<()> {
        let task_name = self.name();
        let instance = task_start(&ctx, task_name).await;

        let workload = ctx.lock().await.options.workload.clone();
        let unit =
            workload_unit(&workload).inspect_err(|e| log_task_error(&instance, task_name, e))?;

        ctx.lock().await.unit = Some(unit);
        Ok(())
    }

    fn name(&self) -> &str {
        UNIT_BUILD
    }
}

/// The supervised workload, bound to the container runtime's unit.
pub fn workload_unit(workload: &WorkloadOptions) -> ScratchResult<ServiceUnit> {
    let unit = ServiceUnit::build(
        guest::WORKLOAD_UNIT,
        &exec_line(&workload.command),
        vec![guest::CONTAINER_RUNTIME_UNIT.to_string()],
        RestartPolicy {
            delay: workload.restart_delay,
            max_restarts: workload.max_restarts,
            window: workload.restart_window,
        },
        ResourceLimits {
            max_open_files: Some(workload.max_open_files),
            max_tasks: None,
        },
    )?;
    Ok(unit
        .with_description("scratchvm workload")
        .with_working_directory(workload.working_directory.clone()))
}

/// Join argv into an `ExecStart=` line, double-quoting words that need it.
fn exec_line(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if !arg.is_empty() && !arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
                arg.clone()
            } else {
                format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote one word for `/bin/sh`; plain words pass through.
fn shell_word(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:=@%,".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

pub(crate) struct BundleAssembleTask;

#[async_trait]
impl PipelineTask<ProvisionCtx> for BundleAssembleTask {
    async fn run(self: Box<Self>, ctx: ProvisionCtx) -> ScratchResult<()> {
        let task_name = self.name();
        let instance = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        let (bundle, policy, unit) = match (ctx.bundle.take(), &ctx.policy, &ctx.unit) {
            (Some(bundle), Some(policy), Some(unit)) => (bundle, policy, unit),
            _ => {
                return Err(ScratchError::Internal(
                    "bundle, firewall and unit builders must run first".into(),
                ));
            }
        };

        let assembled = assemble(bundle, policy, unit)
            .inspect_err(|e| log_task_error(&instance, task_name, e))?;
        let seed = assembled
            .serialize()
            .inspect_err(|e| log_task_error(&instance, task_name, e))?;

        tracing::debug!(
            instance = %instance,
            instance_id = %seed.instance_id,
            bytes = seed.bytes.len(),
            "Seed volume rendered"
        );
        ctx.bundle = Some(assembled);
        ctx.seed = Some(seed);
        Ok(())
    }

    fn name(&self) -> &str {
        BUNDLE_ASSEMBLE
    }
}

/// Embed the rules and unit files, then order first-boot commands: install
/// the rules, run the operator's commands, enable the workload.
///
/// The rules file never touches operator chains, so they are created first
/// when missing.
pub(crate) fn assemble(
    bundle: ConfigBundle,
    policy: &FirewallPolicy,
    unit: &ServiceUnit,
) -> ScratchResult<ConfigBundle> {
    let unit_path = format!("{}/{}", guest::UNIT_DIR, unit.file_name());
    let mut bundle = bundle
        .with_file(SeedFile::new(guest::FIREWALL_RULES_PATH, restore_script(policy)))?
        .with_file(SeedFile::new(unit_path, unit.render()))?;

    let mut commands = Vec::new();
    if let Some(dir) = &unit.working_directory {
        commands.push(format!("mkdir -p {}", shell_word(dir)));
    }
    commands.extend(operator_chain_commands(policy));
    commands.push(format!(
        "iptables-restore --noflush {}",
        guest::FIREWALL_RULES_PATH
    ));
    commands.append(&mut bundle.run_commands);
    commands.push("systemctl daemon-reload".to_string());
    commands.push(format!("systemctl enable --now {}", unit.file_name()));
    bundle.run_commands = commands;
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ProvisionOptions {
        ProvisionOptions {
            name: "dev".into(),
            ssh_authorized_keys: vec!["ssh-ed25519 AAAAC3Nza dev@host".into()],
            run_commands: vec!["echo hello".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_build_bundle_requires_key() {
        let mut opts = options();
        opts.ssh_authorized_keys.clear();
        let err = build_bundle(&opts, InstanceId::for_instance("dev")).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn test_build_policy_rejects_bad_subnet() {
        assert_eq!(
            build_policy("docker0", "172.17.0.0/99").unwrap_err().kind(),
            "ValidationError"
        );
        assert!(build_policy("docker0", "172.17.0.0/16").is_ok());
    }

    #[test]
    fn test_workload_unit_depends_on_runtime() {
        let unit = workload_unit(&WorkloadOptions::default()).unwrap();
        assert_eq!(unit.requires, vec!["docker.service".to_string()]);
        assert_eq!(unit.part_of, vec!["docker.service".to_string()]);
        assert!(unit.render().contains("StartLimitBurst=4"));
        assert!(unit.render().contains("LimitNOFILE=65536"));
    }

    #[test]
    fn test_workload_unit_rejects_empty_command() {
        let workload = WorkloadOptions {
            command: vec![],
            ..Default::default()
        };
        assert_eq!(workload_unit(&workload).unwrap_err().kind(), "ValidationError");
    }

    #[test]
    fn test_exec_line_quotes() {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo \"hi\" there".to_string(),
        ];
        assert_eq!(exec_line(&argv), r#"/bin/sh -c "echo \"hi\" there""#);
    }

    #[test]
    fn test_assemble_orders_first_boot_commands() {
        let bundle = build_bundle(&options(), InstanceId::for_instance("dev")).unwrap();
        let policy = build_policy("docker0", "172.17.0.0/16").unwrap();
        let unit = workload_unit(&WorkloadOptions::default()).unwrap();

        let bundle = assemble(bundle, &policy, &unit).unwrap();
        assert_eq!(
            bundle.run_commands,
            vec![
                "mkdir -p /opt/workload".to_string(),
                "iptables -t filter -N DOCKER-USER 2>/dev/null || true".to_string(),
                "iptables-restore --noflush /etc/scratchvm/bridge.rules".to_string(),
                "echo hello".to_string(),
                "systemctl daemon-reload".to_string(),
                "systemctl enable --now scratch-workload.service".to_string(),
            ]
        );
        let paths: Vec<&str> = bundle.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/etc/scratchvm/bridge.rules",
                "/etc/systemd/system/scratch-workload.service"
            ]
        );
        assert!(bundle.files[0].content.contains("-A DOCKER-ISOLATION-STAGE-2 -o docker0 -j DROP"));
        assert!(!bundle.files[0].content.contains(":DOCKER-USER"));
        bundle.serialize().unwrap();
    }

    #[test]
    fn test_assemble_quotes_working_directory() {
        let bundle = build_bundle(&options(), InstanceId::for_instance("dev")).unwrap();
        let policy = build_policy("docker0", "172.17.0.0/16").unwrap();
        let workload = WorkloadOptions {
            working_directory: "/srv/my app; rm -rf /".into(),
            ..Default::default()
        };
        let unit = workload_unit(&workload).unwrap();

        let bundle = assemble(bundle, &policy, &unit).unwrap();
        assert_eq!(bundle.run_commands[0], "mkdir -p '/srv/my app; rm -rf /'");
    }

    #[test]
    fn test_shell_word() {
        assert_eq!(shell_word("/opt/workload"), "/opt/workload");
        assert_eq!(shell_word(""), "''");
        assert_eq!(shell_word("it's"), r"'it'\''s'");
        assert_eq!(shell_word("$HOME"), "'$HOME'");
    }
}
