//! iptables backend.
//!
//! Rules are rendered as an `iptables-restore` document covering the filter
//! and nat tables. Live state is read from `iptables -t TABLE -L -n`; the
//! parser also accepts `iptables-save` format so rendered documents can be
//! read back.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ipnetwork::IpNetwork;

use sbc_netcfg_common::model::{chain_table, FirewallRuleIntent, PortSpec, Protocol, RuleAction};
use sbc_netcfg_common::shell::{argv, exec_or_fail, HostExecutor, IPTABLES_CMD, IPTABLES_RESTORE_CMD};
use sbc_netcfg_common::{Artifact, Backend, FirewallBackendKind, NetCfgResult, ParseOutcome};

use crate::backend::{assign_positions, render_order, tokenize};
use crate::tables::*;

/// Renders and parses iptables rule sets.
#[derive(Debug, Clone)]
pub struct IptablesBackend {
    rules_file: PathBuf,
}

impl IptablesBackend {
    pub fn new(rules_file: impl Into<PathBuf>) -> Self {
        Self {
            rules_file: rules_file.into(),
        }
    }

    pub fn rules_file(&self) -> &Path {
        &self.rules_file
    }
}

/// Match and target arguments following `-A CHAIN`.
pub fn rule_spec(rule: &FirewallRuleIntent) -> Vec<String> {
    let mut spec = Vec::new();
    if let Some(proto) = rule.protocol.filter(|p| *p != Protocol::All) {
        spec.extend(argv(["-p", proto.as_str()]));
    }
    if let Some(src) = &rule.source {
        spec.extend(argv(["-s".to_string(), src.to_string()]));
    }
    if let Some(dst) = &rule.destination {
        spec.extend(argv(["-d".to_string(), dst.to_string()]));
    }
    if let Some(port) = &rule.port {
        spec.extend(argv(["--dport".to_string(), port.render(':')]));
    }
    if let Some(comment) = &rule.comment {
        spec.extend(argv(["-m", "comment", "--comment", comment.as_str()]));
    }
    spec.extend(argv(["-j", rule.action.target()]));
    match &rule.action {
        RuleAction::Snat { to } => spec.extend(argv(["--to-source", to.as_str()])),
        RuleAction::Dnat { to } => spec.extend(argv(["--to-destination", to.as_str()])),
        _ => {}
    }
    spec
}

/// The `iptables` invocation that appends `rule` to its chain.
pub fn append_argv(rule: &FirewallRuleIntent) -> Vec<String> {
    let table = rule.table().unwrap_or(FILTER_TABLE);
    let mut cmd = argv([IPTABLES_CMD, "-t", table, "-A", rule.chain.as_str()]);
    cmd.extend(rule_spec(rule));
    cmd
}

/// Renders the `iptables-restore` document for a rule set.
pub fn render_restore(rules: &[FirewallRuleIntent]) -> String {
    let ordered = render_order(rules);
    let mut out = String::new();
    let _ = writeln!(out, "{}", IPTABLES_HEADER);

    for &table in MANAGED_TABLES {
        let _ = writeln!(out, "*{}", table);
        for chain in table_chains(table) {
            let _ = writeln!(out, ":{} {} [0:0]", chain, DEFAULT_POLICY);
        }
        for rule in ordered.iter().filter(|r| r.table() == Some(table)) {
            // Skip "iptables -t TABLE".
            let words: Vec<String> = append_argv(rule)
                .into_iter()
                .skip(3)
                .map(|w| {
                    if w.is_empty() || w.contains(char::is_whitespace) {
                        format!("\"{}\"", w)
                    } else {
                        w
                    }
                })
                .collect();
            let _ = writeln!(out, "{}", words.join(" "));
        }
        let _ = writeln!(out, "{}", IPTABLES_COMMIT);
    }
    out
}

fn action_from(target: &str, to: Option<String>) -> Result<RuleAction, String> {
    let needs_to = |to: Option<String>| to.ok_or_else(|| format!("{} without a target address", target));
    match target {
        "ACCEPT" => Ok(RuleAction::Accept),
        "DROP" => Ok(RuleAction::Drop),
        "REJECT" => Ok(RuleAction::Reject),
        "MASQUERADE" => Ok(RuleAction::Masquerade),
        "SNAT" => Ok(RuleAction::Snat { to: needs_to(to)? }),
        "DNAT" => Ok(RuleAction::Dnat { to: needs_to(to)? }),
        other => Err(format!("unmanaged target {}", other)),
    }
}

fn parse_network(value: &str) -> Result<Option<IpNetwork>, String> {
    if value == "0.0.0.0/0" || value == "anywhere" {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| format!("unsupported address {}", value))
}

/// Parses the arguments after `-A CHAIN` in iptables-save format.
fn parse_save_rule(chain: &str, tokens: &[String]) -> Result<FirewallRuleIntent, String> {
    let mut protocol = None;
    let mut source = None;
    let mut destination = None;
    let mut port = None;
    let mut comment = None;
    let mut target = None;
    let mut to = None;

    let mut it = tokens.iter();
    while let Some(flag) = it.next() {
        let mut value = || {
            it.next()
                .cloned()
                .ok_or_else(|| format!("{} without value", flag))
        };
        match flag.as_str() {
            "-p" | "--protocol" => {
                let p = value()?.parse::<Protocol>().map_err(|e| format!("{}", e))?;
                protocol = (p != Protocol::All).then_some(p);
            }
            "-s" | "--source" => source = parse_network(&value()?)?,
            "-d" | "--destination" => destination = parse_network(&value()?)?,
            "--dport" | "--destination-port" => {
                port = Some(value()?.parse::<PortSpec>().map_err(|e| format!("{}", e))?)
            }
            "-m" | "--match" => {
                value()?;
            }
            "--comment" => comment = Some(value()?),
            "-j" | "--jump" => target = Some(value()?),
            "--to-source" | "--to-destination" | "--to" => to = Some(value()?),
            "--reject-with" => {
                value()?;
            }
            "!" => return Err("negated matches are not managed".to_string()),
            other => return Err(format!("unsupported option {}", other)),
        }
    }

    let target = target.ok_or("rule without a target")?;
    let mut rule = FirewallRuleIntent::new(chain, action_from(&target, to)?);
    rule.protocol = protocol;
    rule.source = source;
    rule.destination = destination;
    rule.port = port;
    rule.comment = comment;
    Ok(rule)
}

/// Parses one `iptables -L -n` rule line.
fn parse_listing_rule(chain: &str, line: &str) -> Result<FirewallRuleIntent, String> {
    if line.starts_with(char::is_whitespace) {
        return Err("rule without a target".to_string());
    }

    let (body, comment) = match line.split_once("/*") {
        Some((before, rest)) => {
            let (text, after) = rest.split_once("*/").unwrap_or((rest, ""));
            (format!("{} {}", before, after), Some(text.trim().to_string()))
        }
        None => (line.to_string(), None),
    };

    let cols: Vec<&str> = body.split_whitespace().collect();
    let [target, prot, _opt, src, dst, extras @ ..] = cols.as_slice() else {
        return Err(format!("too few columns in '{}'", line.trim()));
    };
    if src.starts_with('!') || dst.starts_with('!') {
        return Err("negated matches are not managed".to_string());
    }

    let mut port = None;
    let mut to = None;
    for extra in extras {
        if let Some(p) = extra.strip_prefix("dpt:").or_else(|| extra.strip_prefix("dpts:")) {
            port = Some(p.parse::<PortSpec>().map_err(|e| format!("{}", e))?);
        } else if let Some(t) = extra.strip_prefix("to:") {
            to = Some(t.to_string());
        } else if extra.starts_with("spt:") || extra.starts_with("spts:") {
            return Err("source port matches are not managed".to_string());
        } else if *extra == "multiport" {
            return Err("multiport matches are not managed".to_string());
        }
    }

    let protocol = prot.parse::<Protocol>().map_err(|e| format!("{}", e))?;
    let mut rule = FirewallRuleIntent::new(chain, action_from(target, to)?);
    rule.protocol = (protocol != Protocol::All).then_some(protocol);
    rule.source = parse_network(src)?;
    rule.destination = parse_network(dst)?;
    rule.port = port;
    rule.comment = comment.filter(|c| !c.is_empty());
    Ok(rule)
}

/// Parses `iptables -L -n` listings and `iptables-save` documents.
pub fn parse_iptables(text: &str) -> ParseOutcome<Vec<FirewallRuleIntent>> {
    let mut out = ParseOutcome::new(Vec::new());
    let mut chain: Option<String> = None;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim_end();
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        // iptables-save framing
        if trimmed.starts_with('*') || trimmed.starts_with(':') || trimmed == IPTABLES_COMMIT {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("-A ") {
            let tokens = tokenize(rest);
            let Some((chain_name, spec)) = tokens.split_first() else {
                continue;
            };
            if chain_table(chain_name).is_none() {
                out.warn(format!("line {}: chain {} is not managed", lineno, chain_name));
                continue;
            }
            match parse_save_rule(chain_name, spec) {
                Ok(rule) => out.records.push(rule),
                Err(e) => out.warn(format!("line {}: {}", lineno, e)),
            }
            continue;
        }
        if trimmed.starts_with("-N ") || trimmed.starts_with("-P ") {
            continue;
        }

        // iptables -L framing
        if let Some(rest) = trimmed.strip_prefix("Chain ") {
            let name = rest.split_whitespace().next().unwrap_or_default();
            if chain_table(name).is_some() {
                chain = Some(name.to_string());
            } else {
                out.warn(format!("line {}: chain {} is not managed", lineno, name));
                chain = None;
            }
            continue;
        }
        if trimmed.starts_with("target ") {
            continue;
        }

        match &chain {
            Some(name) => match parse_listing_rule(name, line) {
                Ok(rule) => out.records.push(rule),
                Err(e) => out.warn(format!("line {}: {}", lineno, e)),
            },
            None => {}
        }
    }

    assign_positions(&mut out.records);
    out
}

#[async_trait]
impl Backend for IptablesBackend {
    type Intent = Vec<FirewallRuleIntent>;
    type State = Vec<FirewallRuleIntent>;
    type Kind = FirewallBackendKind;

    fn kind(&self) -> FirewallBackendKind {
        FirewallBackendKind::IPTables
    }

    fn parse(&self, text: &str) -> NetCfgResult<ParseOutcome<Vec<FirewallRuleIntent>>> {
        Ok(parse_iptables(text))
    }

    async fn read_live(
        &self,
        exec: &dyn HostExecutor,
    ) -> NetCfgResult<ParseOutcome<Vec<FirewallRuleIntent>>> {
        let mut listing = String::new();
        for &table in MANAGED_TABLES {
            let text = exec_or_fail(exec, &argv([IPTABLES_CMD, "-t", table, "-L", "-n"])).await?;
            listing.push_str(&text);
            listing.push('\n');
        }
        Ok(parse_iptables(&listing))
    }

    fn synthesize(&self, rules: &Vec<FirewallRuleIntent>) -> NetCfgResult<Artifact> {
        let path = self.rules_file.to_string_lossy().into_owned();
        Ok(Artifact::new("iptables")
            .with_file(&self.rules_file, render_restore(rules))
            .validate_with(argv([IPTABLES_RESTORE_CMD, "--test", path.as_str()]))
            .reload_with(argv([IPTABLES_RESTORE_CMD, path.as_str()])))
    }
}
