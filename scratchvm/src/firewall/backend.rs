//! Packet-filter backends and per-bridge apply serialization.

use super::policy::{FirewallPolicy, Rule, Table, TableKind, is_operator_chain};
use super::restore::{parse, restore_script_against};
use async_trait::async_trait;
use parking_lot::Mutex;
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Something that can install a [`FirewallPolicy`] into a packet filter.
#[async_trait]
pub trait PacketFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Replace the contents of every chain named in `policy`.
    ///
    /// Chains not named in `policy` are left alone. Operator chains are
    /// created when missing and otherwise keep their rules.
    async fn apply(&self, policy: &FirewallPolicy) -> ScratchResult<()>;

    /// Current state of the filter and nat tables, foreign rules included.
    ///
    /// Narrow with [`FirewallPolicy::scoped_to`] before comparing against a
    /// policy.
    async fn dump(&self) -> ScratchResult<FirewallPolicy>;
}

/// Drives the kernel through `iptables-restore --noflush`.
#[derive(Debug, Clone)]
pub struct IptablesRestore {
    restore_binary: String,
    save_binary: String,
}

impl Default for IptablesRestore {
    fn default() -> Self {
        Self {
            restore_binary: "iptables-restore".to_string(),
            save_binary: "iptables-save".to_string(),
        }
    }
}

impl IptablesRestore {
    pub fn with_binaries(restore: impl Into<String>, save: impl Into<String>) -> Self {
        Self {
            restore_binary: restore.into(),
            save_binary: save.into(),
        }
    }

    fn spawn_error(&self, binary: &str, e: std::io::Error) -> ScratchError {
        match e.kind() {
            std::io::ErrorKind::NotFound => {
                ScratchError::PolicyApply(format!("{} not found in PATH", binary))
            }
            std::io::ErrorKind::PermissionDenied => {
                ScratchError::PolicyApply(format!("permission denied running {}", binary))
            }
            _ => ScratchError::PolicyApply(format!("failed to run {}: {}", binary, e)),
        }
    }
}

#[async_trait]
impl PacketFilter for IptablesRestore {
    fn name(&self) -> &str {
        "iptables"
    }

    async fn apply(&self, policy: &FirewallPolicy) -> ScratchResult<()> {
        let current = self.dump().await?;
        let script = restore_script_against(policy, &current);

        let mut child = Command::new(&self.restore_binary)
            .arg("--noflush")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(&self.restore_binary, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await.map_err(|e| {
                ScratchError::PolicyApply(format!("writing rules to {}: {}", self.restore_binary, e))
            })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.spawn_error(&self.restore_binary, e))?;
        if !output.status.success() {
            return Err(ScratchError::PolicyApply(format!(
                "{} exited with {}: {}",
                self.restore_binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn dump(&self) -> ScratchResult<FirewallPolicy> {
        let mut tables = Vec::new();
        for kind in [TableKind::Filter, TableKind::Nat] {
            let output = Command::new(&self.save_binary)
                .args(["-t", kind.as_str()])
                .output()
                .await
                .map_err(|e| self.spawn_error(&self.save_binary, e))?;
            if !output.status.success() {
                return Err(ScratchError::PolicyApply(format!(
                    "{} -t {} exited with {}: {}",
                    self.save_binary,
                    kind,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            let parsed = parse(&String::from_utf8_lossy(&output.stdout))?;
            tables.extend(parsed.tables);
        }
        Ok(FirewallPolicy { tables })
    }
}

/// In-process packet filter with the same replace-on-apply semantics as
/// [`IptablesRestore`]. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryPacketFilter {
    state: Mutex<FirewallPolicy>,
    applied: Mutex<usize>,
}

impl MemoryPacketFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `apply` has succeeded.
    pub fn apply_count(&self) -> usize {
        *self.applied.lock()
    }

    /// `iptables -t <table> -I <chain> <position>`: a manual edit outside any policy.
    pub fn insert_rule(
        &self,
        table: TableKind,
        chain: &str,
        position: usize,
        rule: Rule,
    ) -> ScratchResult<()> {
        let mut state = self.state.lock();
        let target = state
            .tables
            .iter_mut()
            .find(|t| t.kind == table)
            .and_then(|t| t.chains.iter_mut().find(|c| c.name == chain))
            .ok_or_else(|| {
                ScratchError::PolicyApply(format!("no chain {} in table {}", chain, table))
            })?;
        let position = position.min(target.rules.len());
        target.rules.insert(position, rule);
        Ok(())
    }
}

#[async_trait]
impl PacketFilter for MemoryPacketFilter {
    fn name(&self) -> &str {
        "memory"
    }

    async fn apply(&self, policy: &FirewallPolicy) -> ScratchResult<()> {
        policy.validate()?;

        let mut state = self.state.lock();
        for table in &policy.tables {
            let pos = match state.tables.iter().position(|t| t.kind == table.kind) {
                Some(pos) => pos,
                None => {
                    state.tables.push(Table {
                        kind: table.kind,
                        chains: Vec::new(),
                    });
                    state.tables.len() - 1
                }
            };
            let current = &mut state.tables[pos];
            for chain in &table.chains {
                match current.chains.iter_mut().find(|c| c.name == chain.name) {
                    Some(_) if is_operator_chain(table.kind, &chain.name) => {}
                    Some(existing) => *existing = chain.clone(),
                    None => current.chains.push(chain.clone()),
                }
            }
        }
        *self.applied.lock() += 1;
        Ok(())
    }

    async fn dump(&self) -> ScratchResult<FirewallPolicy> {
        Ok(self.state.lock().clone())
    }
}

/// Serializes `apply` per bridge name.
///
/// Replacing several chains is not atomic across chains, so two appliers
/// for the same bridge must not interleave.
#[derive(Default)]
pub struct BridgeLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BridgeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, bridge: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(bridge.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Validate `policy` and install it while holding `bridge`'s lock.
    pub async fn apply(
        &self,
        filter: &dyn PacketFilter,
        bridge: &str,
        policy: &FirewallPolicy,
    ) -> ScratchResult<()> {
        policy.validate()?;

        let lock = self.lock_for(bridge);
        let _guard = lock.lock().await;
        tracing::info!(bridge, backend = filter.name(), "Applying firewall policy");
        filter.apply(policy).await.inspect_err(|e| {
            tracing::error!(bridge, backend = filter.name(), error = %e, "Firewall apply failed");
        })
    }
}
