//! Walk a packet through a policy the way netfilter would.

use super::policy::{AddrType, ChainPolicy, ConnState, FirewallPolicy, Match, MatchKind, TableKind, Target};
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use std::net::Ipv4Addr;

/// netfilter refuses rule sets nested deeper than this.
const MAX_JUMP_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub state: ConnState,
    pub destination_type: AddrType,
}

impl Packet {
    /// A new forwarded connection from one interface to another.
    pub fn forwarded(from: &str, to: &str, source: Ipv4Addr, destination: Ipv4Addr) -> Self {
        Self {
            in_interface: Some(from.to_string()),
            out_interface: Some(to.to_string()),
            source,
            destination,
            state: ConnState::New,
            destination_type: AddrType::Unicast,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    Masquerade,
}

/// A rule that matched on the way to the verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    pub chain: String,
    pub rule: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    /// Matching rules in evaluation order. Empty when the verdict came from
    /// a built-in chain's policy without any rule matching.
    pub trace: Vec<Hit>,
}

/// Evaluate `packet` starting at built-in `chain` of `table`.
///
/// First match wins; `-j CHAIN` descends, `RETURN` or falling off a user
/// chain resumes the caller, falling off a built-in chain applies its policy.
///
/// Rules carrying options this crate does not model never match. Of the
/// extension targets only `REJECT` ends evaluation (as a drop); the rest,
/// gotos included, are passed over like `LOG`.
pub fn evaluate(
    policy: &FirewallPolicy,
    table: TableKind,
    chain: &str,
    packet: &Packet,
) -> ScratchResult<Decision> {
    let table_ref = policy
        .table(table)
        .ok_or_else(|| ScratchError::Validation(format!("policy has no {} table", table)))?;
    let entry = table_ref.chain(chain).ok_or_else(|| {
        ScratchError::Validation(format!("table {} has no chain {}", table, chain))
    })?;
    if !table.is_builtin(chain) {
        return Err(ScratchError::Validation(format!(
            "evaluation must start at a built-in chain, got {}",
            chain
        )));
    }

    let mut trace = Vec::new();
    // (chain, next rule index) frames
    let mut stack: Vec<(&str, usize)> = vec![(entry.name.as_str(), 0)];

    while let Some((name, start)) = stack.pop() {
        let current = table_ref.chain(name).ok_or_else(|| {
            ScratchError::Validation(format!("table {} has no chain {}", table, name))
        })?;

        let mut jumped = false;
        for (idx, rule) in current.rules.iter().enumerate().skip(start) {
            if !rule.matches.iter().all(|m| matches(m, packet)) {
                continue;
            }
            trace.push(Hit {
                chain: name.to_string(),
                rule: idx,
            });
            match &rule.target {
                Target::Accept => return Ok(decided(Verdict::Accept, trace)),
                Target::Drop => return Ok(decided(Verdict::Drop, trace)),
                Target::Masquerade => return Ok(decided(Verdict::Masquerade, trace)),
                Target::Return => break,
                Target::Other(text) if is_reject(text) => {
                    return Ok(decided(Verdict::Drop, trace));
                }
                Target::None | Target::Other(_) => continue,
                Target::Jump(to) => {
                    if stack.len() + 2 > MAX_JUMP_DEPTH {
                        return Err(ScratchError::Validation(format!(
                            "jump depth exceeded at {}",
                            to
                        )));
                    }
                    stack.push((name, idx + 1));
                    stack.push((to.as_str(), 0));
                    jumped = true;
                    break;
                }
            }
        }

        if !jumped && stack.is_empty() {
            // Fell off (or returned from) the built-in entry chain.
            let verdict = match current.policy {
                ChainPolicy::Drop => Verdict::Drop,
                ChainPolicy::Accept | ChainPolicy::Return => Verdict::Accept,
            };
            return Ok(decided(verdict, trace));
        }
    }

    Err(ScratchError::Internal("evaluation ended without a verdict".into()))
}

fn decided(verdict: Verdict, trace: Vec<Hit>) -> Decision {
    Decision { verdict, trace }
}

fn is_reject(target: &str) -> bool {
    target.split_whitespace().take(2).eq(["-j", "REJECT"])
}

fn matches(m: &Match, packet: &Packet) -> bool {
    let hit = match &m.kind {
        MatchKind::Other(_) => return false,
        MatchKind::InInterface(name) => interface_matches(name, packet.in_interface.as_deref()),
        MatchKind::OutInterface(name) => interface_matches(name, packet.out_interface.as_deref()),
        MatchKind::Source(net) => net.contains(packet.source),
        MatchKind::Destination(net) => net.contains(packet.destination),
        MatchKind::ConnState(states) => states.contains(&packet.state),
        MatchKind::DstAddrType(kind) => *kind == packet.destination_type,
    };
    hit != m.negated
}

/// `eth+` matches any interface starting with `eth`.
fn interface_matches(pattern: &str, actual: Option<&str>) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    match pattern.strip_suffix('+') {
        Some(prefix) => actual.starts_with(prefix),
        None => actual == pattern,
    }
}
