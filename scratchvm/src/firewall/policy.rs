//! Chain/rule model and the bridge isolation topology.

use ipnetwork::Ipv4Network;
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Chain names used by the bridge isolation topology.
pub mod chains {
    pub const FORWARD: &str = "FORWARD";
    pub const PREROUTING: &str = "PREROUTING";
    pub const OUTPUT: &str = "OUTPUT";
    pub const POSTROUTING: &str = "POSTROUTING";
    /// Operator rules; always consulted first.
    pub const USER: &str = "DOCKER-USER";
    pub const ISOLATION_STAGE_1: &str = "DOCKER-ISOLATION-STAGE-1";
    pub const ISOLATION_STAGE_2: &str = "DOCKER-ISOLATION-STAGE-2";
    /// Per-bridge service chain (published ports).
    pub const SERVICE: &str = "DOCKER";
}

/// Chains whose contents belong to the operator.
///
/// A policy may declare them so its jumps resolve, but applying it only
/// creates them when missing and never replaces their rules.
pub fn is_operator_chain(table: TableKind, chain: &str) -> bool {
    table == TableKind::Filter && chain == chains::USER
}

/// iptables limits chain names to 28 characters.
const MAX_CHAIN_NAME: usize = 28;
/// Linux IFNAMSIZ minus the terminating NUL.
const MAX_INTERFACE_NAME: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableKind {
    Filter,
    Nat,
}

impl TableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableKind::Filter => "filter",
            TableKind::Nat => "nat",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "filter" => Some(TableKind::Filter),
            "nat" => Some(TableKind::Nat),
            _ => None,
        }
    }

    /// Chains the kernel provides for this table.
    pub fn builtin_chains(&self) -> &'static [&'static str] {
        match self {
            TableKind::Filter => &["INPUT", "FORWARD", "OUTPUT"],
            TableKind::Nat => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
        }
    }

    pub fn is_builtin(&self, chain: &str) -> bool {
        self.builtin_chains().contains(&chain)
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens when a packet falls off the end of a chain.
///
/// Built-in chains carry `Accept` or `Drop`; user chains always `Return`
/// to their caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainPolicy {
    Accept,
    Drop,
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnState {
    New,
    Established,
    Related,
    Invalid,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::New => "NEW",
            ConnState::Established => "ESTABLISHED",
            ConnState::Related => "RELATED",
            ConnState::Invalid => "INVALID",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "NEW" => Some(ConnState::New),
            "ESTABLISHED" => Some(ConnState::Established),
            "RELATED" => Some(ConnState::Related),
            "INVALID" => Some(ConnState::Invalid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrType {
    Local,
    Unicast,
    Broadcast,
    Multicast,
}

impl AddrType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddrType::Local => "LOCAL",
            AddrType::Unicast => "UNICAST",
            AddrType::Broadcast => "BROADCAST",
            AddrType::Multicast => "MULTICAST",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "LOCAL" => Some(AddrType::Local),
            "UNICAST" => Some(AddrType::Unicast),
            "BROADCAST" => Some(AddrType::Broadcast),
            "MULTICAST" => Some(AddrType::Multicast),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchKind {
    InInterface(String),
    OutInterface(String),
    Source(Ipv4Network),
    Destination(Ipv4Network),
    ConnState(Vec<ConnState>),
    DstAddrType(AddrType),
    /// Options this crate does not model, kept verbatim (`-p tcp --dport 80`).
    Other(String),
}

/// A single rule criterion, optionally inverted (`!`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub negated: bool,
    pub kind: MatchKind,
}

impl Match {
    pub fn is(kind: MatchKind) -> Self {
        Self {
            negated: false,
            kind,
        }
    }

    pub fn not(kind: MatchKind) -> Self {
        Self {
            negated: true,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    Accept,
    Drop,
    Return,
    Masquerade,
    Jump(String),
    /// No `-j`: the rule only counts packets.
    None,
    /// Extension target or goto, verbatim (`-j REJECT --reject-with ...`, `-g CHAIN`).
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub matches: Vec<Match>,
    pub target: Target,
}

impl Rule {
    pub fn new(target: Target) -> Self {
        Self {
            matches: Vec::new(),
            target,
        }
    }

    pub fn when(mut self, m: MatchKind) -> Self {
        self.matches.push(Match::is(m));
        self
    }

    pub fn unless(mut self, m: MatchKind) -> Self {
        self.matches.push(Match::not(m));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub name: String,
    pub policy: ChainPolicy,
    pub rules: Vec<Rule>,
}

impl Chain {
    pub fn builtin(name: &str, policy: ChainPolicy) -> Self {
        Self {
            name: name.to_string(),
            policy,
            rules: Vec::new(),
        }
    }

    pub fn user(name: &str) -> Self {
        Self::builtin(name, ChainPolicy::Return)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub kind: TableKind,
    pub chains: Vec<Chain>,
}

impl Table {
    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.iter().find(|c| c.name == name)
    }

    fn chain_mut(&mut self, name: &str) -> Option<&mut Chain> {
        self.chains.iter_mut().find(|c| c.name == name)
    }
}

/// Ordered set of tables, each an ordered set of chains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallPolicy {
    pub tables: Vec<Table>,
}

impl FirewallPolicy {
    pub fn table(&self, kind: TableKind) -> Option<&Table> {
        self.tables.iter().find(|t| t.kind == kind)
    }

    pub fn chain(&self, kind: TableKind, name: &str) -> Option<&Chain> {
        self.table(kind).and_then(|t| t.chain(name))
    }

    /// Only the tables and chains `scope` declares, in `scope`'s order.
    ///
    /// Used to compare a dump of a busy host against the policy applied to it.
    pub fn scoped_to(&self, scope: &FirewallPolicy) -> FirewallPolicy {
        let tables = scope
            .tables
            .iter()
            .filter_map(|wanted| {
                let have = self.table(wanted.kind)?;
                Some(Table {
                    kind: wanted.kind,
                    chains: wanted
                        .chains
                        .iter()
                        .filter_map(|c| have.chain(&c.name).cloned())
                        .collect(),
                })
            })
            .collect();
        FirewallPolicy { tables }
    }

    /// Check structural soundness before anything touches the kernel.
    pub fn validate(&self) -> ScratchResult<()> {
        let mut kinds = HashSet::new();
        for table in &self.tables {
            if !kinds.insert(table.kind) {
                return Err(ScratchError::Validation(format!(
                    "table {} declared twice",
                    table.kind
                )));
            }

            let mut names = HashSet::new();
            for chain in &table.chains {
                validate_chain_name(&chain.name)?;
                if !names.insert(chain.name.as_str()) {
                    return Err(ScratchError::Validation(format!(
                        "chain {} declared twice in table {}",
                        chain.name, table.kind
                    )));
                }
                let builtin = table.kind.is_builtin(&chain.name);
                if builtin == (chain.policy == ChainPolicy::Return) {
                    return Err(ScratchError::Validation(format!(
                        "chain {} in table {} cannot have policy {:?}",
                        chain.name, table.kind, chain.policy
                    )));
                }
            }

            for chain in &table.chains {
                for rule in &chain.rules {
                    match &rule.target {
                        Target::Jump(to) => {
                            if table.kind.is_builtin(to) || !names.contains(to.as_str()) {
                                return Err(ScratchError::Validation(format!(
                                    "chain {} jumps to undeclared chain {} in table {}",
                                    chain.name, to, table.kind
                                )));
                            }
                        }
                        Target::Masquerade if table.kind != TableKind::Nat => {
                            return Err(ScratchError::Validation(format!(
                                "MASQUERADE is only valid in the nat table (chain {})",
                                chain.name
                            )));
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_chain_name(name: &str) -> ScratchResult<()> {
    if name.is_empty()
        || name.len() > MAX_CHAIN_NAME
        || name.starts_with('-')
        || name.chars().any(|c| c.is_whitespace())
    {
        return Err(ScratchError::Validation(format!(
            "invalid chain name '{}'",
            name
        )));
    }
    Ok(())
}

fn validate_interface(name: &str) -> ScratchResult<()> {
    if name.is_empty()
        || name.len() > MAX_INTERFACE_NAME
        || name.chars().any(|c| c.is_whitespace() || c == '/' || c == '!')
    {
        return Err(ScratchError::Validation(format!(
            "invalid bridge name '{}'",
            name
        )));
    }
    Ok(())
}

/// A container bridge and the subnet behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeNetwork {
    pub name: String,
    pub subnet: Ipv4Network,
}

impl BridgeNetwork {
    pub fn new(name: impl Into<String>, subnet: Ipv4Network) -> Self {
        Self {
            name: name.into(),
            subnet,
        }
    }
}

/// Isolation policy for a single bridge.
pub fn bridge_isolation_policy(bridge: &str, subnet: Ipv4Network) -> ScratchResult<FirewallPolicy> {
    multi_bridge_isolation_policy(&[BridgeNetwork::new(bridge, subnet)])
}

/// Isolation policy covering several bridges that share the host chains.
///
/// Rule order is significant: `DOCKER-USER` is consulted before isolation,
/// and stage 2 drops traffic entering another bridge before the `FORWARD`
/// accepts below it can match.
pub fn multi_bridge_isolation_policy(bridges: &[BridgeNetwork]) -> ScratchResult<FirewallPolicy> {
    if bridges.is_empty() {
        return Err(ScratchError::Validation("no bridges given".into()));
    }
    let mut seen = HashSet::new();
    for bridge in bridges {
        validate_interface(&bridge.name)?;
        if !seen.insert(bridge.name.as_str()) {
            return Err(ScratchError::Validation(format!(
                "bridge {} given twice",
                bridge.name
            )));
        }
    }

    use MatchKind as M;
    let jump = |c: &str| Target::Jump(c.to_string());

    let mut filter = Table {
        kind: TableKind::Filter,
        chains: vec![
            Chain::builtin(chains::FORWARD, ChainPolicy::Drop),
            Chain::user(chains::SERVICE),
            Chain::user(chains::ISOLATION_STAGE_1),
            Chain::user(chains::ISOLATION_STAGE_2),
            Chain::user(chains::USER),
        ],
    };
    let mut nat = Table {
        kind: TableKind::Nat,
        chains: vec![
            Chain::builtin(chains::PREROUTING, ChainPolicy::Accept),
            Chain::builtin(chains::OUTPUT, ChainPolicy::Accept),
            Chain::builtin(chains::POSTROUTING, ChainPolicy::Accept),
            Chain::user(chains::SERVICE),
        ],
    };

    let mut forward = vec![
        Rule::new(jump(chains::USER)),
        Rule::new(jump(chains::ISOLATION_STAGE_1)),
    ];
    let mut stage1 = Vec::new();
    let mut stage2 = Vec::new();
    let mut postrouting = Vec::new();
    let mut nat_service = Vec::new();

    for bridge in bridges {
        let name = || bridge.name.clone();
        forward.extend([
            Rule::new(Target::Accept)
                .when(M::OutInterface(name()))
                .when(M::ConnState(vec![ConnState::Related, ConnState::Established])),
            Rule::new(jump(chains::SERVICE)).when(M::OutInterface(name())),
            Rule::new(Target::Accept)
                .when(M::InInterface(name()))
                .unless(M::OutInterface(name())),
            Rule::new(Target::Accept)
                .when(M::InInterface(name()))
                .when(M::OutInterface(name())),
        ]);
        stage1.push(
            Rule::new(jump(chains::ISOLATION_STAGE_2))
                .when(M::InInterface(name()))
                .unless(M::OutInterface(name())),
        );
        stage2.push(Rule::new(Target::Drop).when(M::OutInterface(name())));
        postrouting.push(
            Rule::new(Target::Masquerade)
                .when(M::Source(bridge.subnet))
                .unless(M::OutInterface(name())),
        );
        nat_service.push(Rule::new(Target::Return).when(M::InInterface(name())));
    }
    stage1.push(Rule::new(Target::Return));
    stage2.push(Rule::new(Target::Return));

    set_rules(&mut filter, chains::FORWARD, forward);
    set_rules(&mut filter, chains::ISOLATION_STAGE_1, stage1);
    set_rules(&mut filter, chains::ISOLATION_STAGE_2, stage2);
    set_rules(&mut filter, chains::USER, vec![Rule::new(Target::Return)]);

    let loopback: Ipv4Network = Ipv4Network::new(std::net::Ipv4Addr::new(127, 0, 0, 0), 8)
        .map_err(|e| ScratchError::Internal(format!("loopback network: {}", e)))?;
    set_rules(
        &mut nat,
        chains::PREROUTING,
        vec![Rule::new(jump(chains::SERVICE)).when(M::DstAddrType(AddrType::Local))],
    );
    set_rules(
        &mut nat,
        chains::OUTPUT,
        vec![
            Rule::new(jump(chains::SERVICE))
                .unless(M::Destination(loopback))
                .when(M::DstAddrType(AddrType::Local)),
        ],
    );
    set_rules(&mut nat, chains::POSTROUTING, postrouting);
    set_rules(&mut nat, chains::SERVICE, nat_service);

    let policy = FirewallPolicy {
        tables: vec![filter, nat],
    };
    policy.validate()?;
    Ok(policy)
}

fn set_rules(table: &mut Table, chain: &str, rules: Vec<Rule>) {
    if let Some(chain) = table.chain_mut(chain) {
        chain.rules = rules;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> FirewallPolicy {
        bridge_isolation_policy("docker0", "172.17.0.0/16".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_forward_ordering() {
        let policy = policy();
        let forward = policy.chain(TableKind::Filter, chains::FORWARD).unwrap();
        assert_eq!(forward.policy, ChainPolicy::Drop);
        assert_eq!(forward.rules[0].target, Target::Jump(chains::USER.into()));
        assert_eq!(
            forward.rules[1].target,
            Target::Jump(chains::ISOLATION_STAGE_1.into())
        );
        assert_eq!(forward.rules.len(), 6);
        assert_eq!(forward.rules[3].target, Target::Jump(chains::SERVICE.into()));
    }

    #[test]
    fn test_stage2_drops_before_return() {
        let policy = policy();
        let stage2 = policy
            .chain(TableKind::Filter, chains::ISOLATION_STAGE_2)
            .unwrap();
        assert_eq!(stage2.rules.first().unwrap().target, Target::Drop);
        assert_eq!(stage2.rules.last().unwrap().target, Target::Return);
    }

    #[test]
    fn test_masquerade_excludes_bridge() {
        let policy = policy();
        let post = policy.chain(TableKind::Nat, chains::POSTROUTING).unwrap();
        assert_eq!(post.rules.len(), 1);
        assert_eq!(post.rules[0].target, Target::Masquerade);
        assert!(post.rules[0].matches.contains(&Match::not(MatchKind::OutInterface(
            "docker0".into()
        ))));
    }

    #[test]
    fn test_validate_rejects_dangling_jump() {
        let mut policy = policy();
        policy.tables[0].chains[0]
            .rules
            .push(Rule::new(Target::Jump("NOWHERE".into())));
        assert_eq!(policy.validate().unwrap_err().kind(), "ValidationError");
    }

    #[test]
    fn test_validate_rejects_duplicate_chain() {
        let mut policy = policy();
        policy.tables[0].chains.push(Chain::user(chains::USER));
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_policy() {
        let mut policy = policy();
        policy.tables[0].chains[0].policy = ChainPolicy::Return;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_bridge_names() {
        let subnet: Ipv4Network = "10.0.0.0/24".parse().unwrap();
        assert!(bridge_isolation_policy("", subnet).is_err());
        assert!(bridge_isolation_policy("has space", subnet).is_err());
        assert!(bridge_isolation_policy("averyveryverylongbridge", subnet).is_err());
        assert!(
            multi_bridge_isolation_policy(&[
                BridgeNetwork::new("br0", subnet),
                BridgeNetwork::new("br0", subnet)
            ])
            .is_err()
        );
    }
}
