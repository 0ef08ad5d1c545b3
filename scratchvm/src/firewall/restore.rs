//! iptables-save / iptables-restore text format.

use super::policy::{
    AddrType, Chain, ChainPolicy, ConnState, FirewallPolicy, Match, MatchKind, Rule, Table,
    TableKind, Target, is_operator_chain,
};
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use std::fmt::Write as _;

/// Render in `iptables-save` layout.
pub fn render(policy: &FirewallPolicy) -> String {
    render_tables(policy, false, |_, _| true)
}

/// Script for `iptables-restore --noflush`.
///
/// With `--noflush`, declaring a user chain flushes it but declaring a
/// built-in chain only resets its policy, so built-in chains get an explicit
/// `-F`. Applying the script twice leaves the same rules as applying it once.
///
/// Operator chains are left out entirely and must already exist; run
/// [`operator_chain_commands`] first, or use [`restore_script_against`].
pub fn restore_script(policy: &FirewallPolicy) -> String {
    render_tables(policy, true, |table, chain| !is_operator_chain(table, chain))
}

/// [`restore_script`] for a host currently holding `current`.
///
/// Operator chains missing from `current` are created with the policy's
/// rules; ones already present keep their contents.
pub fn restore_script_against(policy: &FirewallPolicy, current: &FirewallPolicy) -> String {
    render_tables(policy, true, |table, chain| {
        !is_operator_chain(table, chain) || current.chain(table, chain).is_none()
    })
}

/// Shell commands creating the policy's operator chains when missing.
pub fn operator_chain_commands(policy: &FirewallPolicy) -> Vec<String> {
    policy
        .tables
        .iter()
        .flat_map(|table| {
            table
                .chains
                .iter()
                .filter(|c| is_operator_chain(table.kind, &c.name))
                .map(|c| format!("iptables -t {} -N {} 2>/dev/null || true", table.kind, c.name))
        })
        .collect()
}

fn render_tables(
    policy: &FirewallPolicy,
    flush_builtins: bool,
    managed: impl Fn(TableKind, &str) -> bool,
) -> String {
    let mut out = String::new();
    for table in &policy.tables {
        let chains: Vec<&Chain> = table
            .chains
            .iter()
            .filter(|c| managed(table.kind, &c.name))
            .collect();
        let _ = writeln!(out, "*{}", table.kind);
        for chain in &chains {
            let _ = writeln!(out, ":{} {} [0:0]", chain.name, policy_token(chain.policy));
        }
        if flush_builtins {
            for chain in &chains {
                if table.kind.is_builtin(&chain.name) {
                    let _ = writeln!(out, "-F {}", chain.name);
                }
            }
        }
        for chain in &chains {
            for rule in &chain.rules {
                let _ = writeln!(out, "{}", render_rule(&chain.name, rule));
            }
        }
        out.push_str("COMMIT\n");
    }
    out
}

fn policy_token(policy: ChainPolicy) -> &'static str {
    match policy {
        ChainPolicy::Accept => "ACCEPT",
        ChainPolicy::Drop => "DROP",
        ChainPolicy::Return => "-",
    }
}

pub(crate) fn render_rule(chain: &str, rule: &Rule) -> String {
    let mut line = format!("-A {}", chain);
    for m in &rule.matches {
        // iptables-save puts `!` after the module name for module options.
        let neg = if m.negated { " !" } else { "" };
        let _ = match &m.kind {
            MatchKind::InInterface(name) => write!(line, "{} -i {}", neg, name),
            MatchKind::OutInterface(name) => write!(line, "{} -o {}", neg, name),
            MatchKind::Source(net) => write!(line, "{} -s {}", neg, net),
            MatchKind::Destination(net) => write!(line, "{} -d {}", neg, net),
            MatchKind::ConnState(states) => {
                let names: Vec<&str> = states.iter().map(ConnState::as_str).collect();
                write!(line, " -m conntrack{} --ctstate {}", neg, names.join(","))
            }
            MatchKind::DstAddrType(kind) => {
                write!(line, " -m addrtype{} --dst-type {}", neg, kind.as_str())
            }
            MatchKind::Other(text) => write!(line, "{} {}", neg, text),
        };
    }
    let target = match &rule.target {
        Target::Accept => "ACCEPT",
        Target::Drop => "DROP",
        Target::Return => "RETURN",
        Target::Masquerade => "MASQUERADE",
        Target::Jump(to) => to.as_str(),
        Target::None => return line,
        Target::Other(text) => {
            let _ = write!(line, " {}", text);
            return line;
        }
    };
    let _ = write!(line, " -j {}", target);
    line
}

fn parse_err(line_no: usize, msg: impl std::fmt::Display) -> ScratchError {
    ScratchError::Validation(format!("rules line {}: {}", line_no, msg))
}

/// Parse `iptables-save` output (or [`render`] output) back into a policy.
///
/// Matches and targets this crate does not model are kept verbatim as
/// [`MatchKind::Other`] and [`Target::Other`], so a dump of a host with
/// unrelated rules still parses. Structural problems are errors.
pub fn parse(text: &str) -> ScratchResult<FirewallPolicy> {
    let mut policy = FirewallPolicy::default();
    let mut current: Option<Table> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix('*') {
            if current.is_some() {
                return Err(parse_err(line_no, "table started before COMMIT"));
            }
            let kind = TableKind::from_name(name)
                .ok_or_else(|| parse_err(line_no, format!("unsupported table '{}'", name)))?;
            current = Some(Table {
                kind,
                chains: Vec::new(),
            });
            continue;
        }

        if line == "COMMIT" {
            let done = current
                .take()
                .ok_or_else(|| parse_err(line_no, "COMMIT outside of a table"))?;
            policy.tables.push(done);
            continue;
        }

        let table = current
            .as_mut()
            .ok_or_else(|| parse_err(line_no, "content outside of a table"))?;

        if let Some(decl) = line.strip_prefix(':') {
            let mut parts = decl.split_whitespace();
            let name = parts
                .next()
                .ok_or_else(|| parse_err(line_no, "missing chain name"))?;
            let chain_policy = match parts.next() {
                Some("ACCEPT") => ChainPolicy::Accept,
                Some("DROP") => ChainPolicy::Drop,
                Some("-") => ChainPolicy::Return,
                other => {
                    return Err(parse_err(
                        line_no,
                        format!("bad policy {:?} for chain {}", other, name),
                    ));
                }
            };
            table.chains.push(Chain::builtin(name, chain_policy));
            continue;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.first() {
            Some(&"-A") => {
                let declared = |name: &str| table.chains.iter().any(|c| c.name == name);
                let (chain, rule) = parse_rule(&tokens, line_no, declared)?;
                let target = table
                    .chains
                    .iter_mut()
                    .find(|c| c.name == chain)
                    .ok_or_else(|| parse_err(line_no, format!("undeclared chain {}", chain)))?;
                target.rules.push(rule);
            }
            // Flush lines from a restore script; declarations already reset state.
            Some(&"-F") => {}
            _ => return Err(parse_err(line_no, format!("unrecognised line '{}'", line))),
        }
    }

    if current.is_some() {
        return Err(ScratchError::Validation(
            "rules text ends without COMMIT".into(),
        ));
    }
    Ok(policy)
}

/// Single-dash flags start a new option; `--x` belongs to the module before it.
fn is_option(token: &str) -> bool {
    token.starts_with('-') && !token.starts_with("--") && token.len() > 1
}

/// Index past the option starting at `from`: its flag plus every value and
/// module option up to the next single-dash flag (or `!` negating one).
fn option_end(tokens: &[&str], from: usize) -> usize {
    let mut end = from + 1;
    while end < tokens.len() {
        let token = tokens[end];
        if is_option(token) {
            break;
        }
        if token == "!" && tokens.get(end + 1).is_some_and(|next| is_option(next)) {
            break;
        }
        end += 1;
    }
    end
}

fn parse_rule(
    tokens: &[&str],
    line_no: usize,
    declared: impl Fn(&str) -> bool,
) -> ScratchResult<(String, Rule)> {
    let chain = tokens
        .get(1)
        .ok_or_else(|| parse_err(line_no, "-A without chain"))?
        .to_string();

    let mut matches = Vec::new();
    let mut target = None;
    let mut negate = false;
    let mut i = 2;

    let value = |i: usize| -> ScratchResult<&str> {
        tokens
            .get(i)
            .copied()
            .ok_or_else(|| parse_err(line_no, format!("missing value after {}", tokens[i - 1])))
    };
    let network = |s: &str| {
        s.parse::<ipnetwork::Ipv4Network>()
            .map_err(|e| parse_err(line_no, format!("bad address '{}': {}", s, e)))
    };

    while i < tokens.len() {
        if tokens[i] == "!" {
            negate = true;
            i += 1;
            continue;
        }
        let end = option_end(tokens, i);
        let verbatim = tokens[i..end].join(" ");

        if matches!(tokens[i], "-j" | "-g") {
            if target.is_some() {
                return Err(parse_err(line_no, "rule with two targets"));
            }
            let name = value(i + 1)?;
            target = Some(match (tokens[i], name, end - i) {
                ("-j", "ACCEPT", 2) => Target::Accept,
                ("-j", "DROP", 2) => Target::Drop,
                ("-j", "RETURN", 2) => Target::Return,
                ("-j", "MASQUERADE", 2) => Target::Masquerade,
                ("-j", to, 2) if declared(to) => Target::Jump(to.to_string()),
                _ => Target::Other(verbatim),
            });
            i = end;
            continue;
        }

        let kind = match (tokens[i], end - i) {
            ("-i", 2) => MatchKind::InInterface(value(i + 1)?.to_string()),
            ("-o", 2) => MatchKind::OutInterface(value(i + 1)?.to_string()),
            ("-s", 2) => MatchKind::Source(network(value(i + 1)?)?),
            ("-d", 2) => MatchKind::Destination(network(value(i + 1)?)?),
            ("-m", _) => parse_module(&tokens[i..end], &mut negate, line_no)?
                .unwrap_or(MatchKind::Other(verbatim)),
            _ => MatchKind::Other(verbatim),
        };
        matches.push(Match {
            negated: negate,
            kind,
        });
        negate = false;
        i = end;
    }

    Ok((
        chain,
        Rule {
            matches,
            target: target.unwrap_or(Target::None),
        },
    ))
}

/// `-m conntrack --ctstate ...` and `-m addrtype --dst-type ...`; `None` for
/// any other module or option combination.
fn parse_module(
    option: &[&str],
    negate: &mut bool,
    line_no: usize,
) -> ScratchResult<Option<MatchKind>> {
    let (module, rest) = match option {
        [_, module, rest @ ..] => (*module, rest),
        _ => return Err(parse_err(line_no, "-m without module")),
    };
    let (negated, rest) = match rest {
        ["!", rest @ ..] => (true, rest),
        rest => (false, rest),
    };
    let kind = match (module, rest) {
        ("conntrack", ["--ctstate", states]) | ("state", ["--state", states]) => {
            let states = states
                .split(',')
                .map(ConnState::from_name)
                .collect::<Option<Vec<_>>>();
            states.map(MatchKind::ConnState)
        }
        ("addrtype", ["--dst-type", name]) => AddrType::from_name(name).map(MatchKind::DstAddrType),
        _ => None,
    };
    if kind.is_some() && negated {
        *negate = true;
    }
    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::bridge_isolation_policy;

    const DOCKER_SAVE: &str = "\
# Generated by iptables-save v1.8.7
*filter
:INPUT ACCEPT [0:0]
:FORWARD DROP [0:0]
:OUTPUT ACCEPT [0:0]
:DOCKER - [0:0]
:DOCKER-ISOLATION-STAGE-1 - [0:0]
:DOCKER-ISOLATION-STAGE-2 - [0:0]
:DOCKER-USER - [0:0]
-A FORWARD -j DOCKER-USER
-A FORWARD -j DOCKER-ISOLATION-STAGE-1
-A FORWARD -o docker0 -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT
-A FORWARD -o docker0 -j DOCKER
-A FORWARD -i docker0 ! -o docker0 -j ACCEPT
-A FORWARD -i docker0 -o docker0 -j ACCEPT
-A DOCKER-ISOLATION-STAGE-1 -i docker0 ! -o docker0 -j DOCKER-ISOLATION-STAGE-2
-A DOCKER-ISOLATION-STAGE-1 -j RETURN
-A DOCKER-ISOLATION-STAGE-2 -o docker0 -j DROP
-A DOCKER-ISOLATION-STAGE-2 -j RETURN
-A DOCKER-USER -j RETURN
COMMIT
*nat
:PREROUTING ACCEPT [0:0]
:INPUT ACCEPT [0:0]
:OUTPUT ACCEPT [0:0]
:POSTROUTING ACCEPT [0:0]
:DOCKER - [0:0]
-A PREROUTING -m addrtype --dst-type LOCAL -j DOCKER
-A OUTPUT ! -d 127.0.0.0/8 -m addrtype --dst-type LOCAL -j DOCKER
-A POSTROUTING -s 172.17.0.0/16 ! -o docker0 -j MASQUERADE
-A DOCKER -i docker0 -j RETURN
COMMIT
";

    fn policy() -> FirewallPolicy {
        bridge_isolation_policy("docker0", "172.17.0.0/16".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let policy = policy();
        assert_eq!(parse(&render(&policy)).unwrap(), policy);
    }

    #[test]
    fn test_rendered_rules_match_docker_layout() {
        let rendered = render(&policy());
        let expected: Vec<&str> = DOCKER_SAVE.lines().filter(|l| l.starts_with("-A")).collect();
        let actual: Vec<&str> = rendered.lines().filter(|l| l.starts_with("-A")).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_parse_docker_save_output() {
        let parsed = parse(DOCKER_SAVE).unwrap();
        parsed.validate().unwrap();
        let ours = policy();
        for table in &ours.tables {
            for chain in &table.chains {
                assert_eq!(parsed.chain(table.kind, &chain.name), Some(chain));
            }
        }
    }

    #[test]
    fn test_restore_script_flushes_builtins() {
        let script = restore_script_against(&policy(), &FirewallPolicy::default());
        assert!(script.contains("-F FORWARD\n"));
        assert!(script.contains("-F POSTROUTING\n"));
        assert!(!script.contains("-F DOCKER\n"));
        assert_eq!(parse(&script).unwrap(), policy());
    }

    #[test]
    fn test_restore_script_leaves_operator_chain_alone() {
        let script = restore_script(&policy());
        assert!(!script.contains(":DOCKER-USER"));
        assert!(!script.contains("-A DOCKER-USER"));
        assert!(script.contains("-A FORWARD -j DOCKER-USER\n"));

        let host = parse(DOCKER_SAVE).unwrap();
        assert_eq!(restore_script_against(&policy(), &host), script);
        assert_eq!(
            operator_chain_commands(&policy()),
            vec!["iptables -t filter -N DOCKER-USER 2>/dev/null || true".to_string()]
        );
    }

    #[test]
    fn test_parse_keeps_foreign_rules_verbatim() {
        let save = "\
*filter
:INPUT ACCEPT [0:0]
:FORWARD DROP [0:0]
:DOCKER-USER - [0:0]
:LIBVIRT_FWI - [0:0]
-A INPUT -i virbr0 -p udp -m udp --dport 53 -j ACCEPT
-A INPUT -p tcp -m comment --comment \"ssh in\" -m tcp --dport 22 -j ACCEPT
-A FORWARD -j LIBVIRT_FWI
-A FORWARD -m conntrack ! --ctstate INVALID -j ACCEPT
-A DOCKER-USER -s 172.17.0.9/32 -j REJECT --reject-with icmp-port-unreachable
-A DOCKER-USER -o eth1 -g LIBVIRT_FWI
-A DOCKER-USER -i docker0
-A LIBVIRT_FWI -o virbr0 -j REJECT
COMMIT
";
        let parsed = parse(save).unwrap();

        let input = parsed.chain(TableKind::Filter, "INPUT").unwrap();
        assert_eq!(
            input.rules[0].matches[1].kind,
            MatchKind::Other("-p udp".into())
        );
        assert_eq!(
            input.rules[0].matches[2].kind,
            MatchKind::Other("-m udp --dport 53".into())
        );
        assert_eq!(input.rules[0].target, Target::Accept);

        let forward = parsed.chain(TableKind::Filter, "FORWARD").unwrap();
        assert_eq!(forward.rules[0].target, Target::Jump("LIBVIRT_FWI".into()));
        assert_eq!(
            forward.rules[1].matches[0],
            Match::not(MatchKind::ConnState(vec![ConnState::Invalid]))
        );

        let user = parsed.chain(TableKind::Filter, "DOCKER-USER").unwrap();
        assert_eq!(
            user.rules[0].target,
            Target::Other("-j REJECT --reject-with icmp-port-unreachable".into())
        );
        assert_eq!(user.rules[1].target, Target::Other("-g LIBVIRT_FWI".into()));
        assert_eq!(user.rules[2].target, Target::None);

        // Rendering gives back the same rule lines.
        let rendered = render(&parsed);
        let expected: Vec<&str> = save.lines().filter(|l| l.starts_with("-A")).collect();
        let actual: Vec<&str> = rendered.lines().filter(|l| l.starts_with("-A")).collect();
        assert_eq!(actual, expected);
        assert_eq!(parse(&rendered).unwrap(), parsed);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("*mangle\nCOMMIT\n").is_err());
        assert!(parse("*filter\n:FORWARD DROP [0:0]\n").is_err());
        assert!(parse("*filter\n-A FORWARD -j ACCEPT\nCOMMIT\n").is_err());
        assert!(parse("*filter\n:FORWARD DROP [0:0]\n-A FORWARD -j\nCOMMIT\n").is_err());
        assert!(parse("*filter\n:FORWARD DROP [0:0]\n-A FORWARD -j DROP -j ACCEPT\nCOMMIT\n").is_err());
    }
}
