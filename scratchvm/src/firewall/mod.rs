//! Bridge network isolation rules.
//!
//! [`bridge_isolation_policy`] builds the chain topology a container bridge
//! needs on a Linux host: operator rules first, two-stage isolation between
//! bridges, service chain for published ports, and masquerading for traffic
//! leaving the host. Policies render to the `iptables-restore` text format
//! and can be walked packet by packet with [`evaluate`].

mod backend;
mod eval;
mod policy;
mod restore;

pub use backend::{BridgeLocks, IptablesRestore, MemoryPacketFilter, PacketFilter};
pub use eval::{Decision, Hit, Packet, Verdict, evaluate};
pub use policy::{
    AddrType, BridgeNetwork, Chain, ChainPolicy, ConnState, FirewallPolicy, Match, MatchKind,
    Rule, Table, TableKind, Target, bridge_isolation_policy, chains, is_operator_chain,
    multi_bridge_isolation_policy,
};
pub use restore::{operator_chain_commands, parse, render, restore_script, restore_script_against};
