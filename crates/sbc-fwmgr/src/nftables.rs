//! nftables backend.
//!
//! Rules are rendered as an `nft -f` script that (re)creates the managed
//! base chains in `ip filter` and `ip nat`, flushes them and adds one rule
//! per enabled intent. Other tables are left alone.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ipnetwork::IpNetwork;

use sbc_netcfg_common::model::{chain_table, FirewallRuleIntent, PortSpec, Protocol, RuleAction};
use sbc_netcfg_common::shell::{argv, exec_or_fail, HostExecutor, NFT_CMD};
use sbc_netcfg_common::{Artifact, Backend, FirewallBackendKind, NetCfgResult, ParseOutcome};

use crate::backend::{assign_positions, render_order, tokenize};
use crate::tables::*;

/// Renders and parses nftables rule sets.
#[derive(Debug, Clone)]
pub struct NftablesBackend {
    script: PathBuf,
}

impl NftablesBackend {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
        }
    }

    pub fn script(&self) -> &Path {
        &self.script
    }
}

/// The statement part of `add rule ip TABLE CHAIN ...`.
pub fn rule_statement(rule: &FirewallRuleIntent) -> String {
    let mut parts: Vec<String> = Vec::new();

    let proto = rule.protocol.filter(|p| *p != Protocol::All);
    if let Some(p) = proto {
        parts.push(format!("ip protocol {}", p));
    }
    if let Some(src) = &rule.source {
        parts.push(format!("ip saddr {}", src));
    }
    if let Some(dst) = &rule.destination {
        parts.push(format!("ip daddr {}", dst));
    }
    if let (Some(port), Some(p)) = (&rule.port, proto) {
        parts.push(format!("{} dport {}", p, port.render('-')));
    }
    parts.push(match &rule.action {
        RuleAction::Accept => "accept".to_string(),
        RuleAction::Drop => "drop".to_string(),
        RuleAction::Reject => "reject".to_string(),
        RuleAction::Masquerade => "masquerade".to_string(),
        RuleAction::Snat { to } => format!("snat to {}", to),
        RuleAction::Dnat { to } => format!("dnat to {}", to),
    });
    if let Some(comment) = &rule.comment {
        parts.push(format!("comment \"{}\"", comment));
    }
    parts.join(" ")
}

/// Renders the full `nft -f` script for a rule set.
pub fn render_script(rules: &[FirewallRuleIntent]) -> String {
    let ordered = render_order(rules);
    let mut out = String::new();
    let _ = writeln!(out, "{}", NFT_SHEBANG);
    let _ = writeln!(out, "{}", NFT_HEADER);

    for &table in MANAGED_TABLES {
        out.push('\n');
        let _ = writeln!(out, "add table {} {}", NFT_FAMILY, table);
        for &chain in table_chains(table) {
            if let Some((hook, kind, priority)) = nft_hook(chain) {
                let _ = writeln!(
                    out,
                    "add chain {} {} {} {{ type {} hook {} priority {}; policy accept; }}",
                    NFT_FAMILY, table, chain, kind, hook, priority
                );
            }
        }
        for chain in table_chains(table) {
            let _ = writeln!(out, "flush chain {} {} {}", NFT_FAMILY, table, chain);
        }
        for rule in ordered.iter().filter(|r| r.table() == Some(table)) {
            let _ = writeln!(
                out,
                "add rule {} {} {} {}",
                NFT_FAMILY,
                table,
                rule.chain,
                rule_statement(rule)
            );
        }
    }
    out
}

fn parse_addr(value: &str) -> Result<IpNetwork, String> {
    value
        .parse()
        .map_err(|_| format!("unsupported address {}", value))
}

/// Parses the tokens of one rule statement.
fn parse_statement(chain: &str, tokens: &[String]) -> Result<FirewallRuleIntent, String> {
    let mut protocol = None;
    let mut source = None;
    let mut destination = None;
    let mut port = None;
    let mut comment = None;
    let mut action = None;

    let mut i = 0;
    let word = |i: usize| tokens.get(i).map(String::as_str);
    let need = |i: usize| {
        tokens
            .get(i)
            .map(String::as_str)
            .ok_or_else(|| "truncated rule".to_string())
    };

    while let Some(tok) = word(i) {
        match (tok, word(i + 1)) {
            ("ip", Some("protocol")) | ("meta", Some("l4proto")) => {
                let p = need(i + 2)?
                    .parse::<Protocol>()
                    .map_err(|e| format!("{}", e))?;
                protocol = (p != Protocol::All).then_some(p);
                i += 3;
            }
            ("ip", Some("saddr")) => {
                source = Some(parse_addr(need(i + 2)?)?);
                i += 3;
            }
            ("ip", Some("daddr")) => {
                destination = Some(parse_addr(need(i + 2)?)?);
                i += 3;
            }
            ("tcp" | "udp", Some("dport")) => {
                let value = need(i + 2)?;
                if value == "{" {
                    return Err("port sets are not managed".to_string());
                }
                protocol = Some(tok.parse::<Protocol>().map_err(|e| format!("{}", e))?);
                port = Some(value.parse::<PortSpec>().map_err(|e| format!("{}", e))?);
                i += 3;
            }
            ("counter", _) => {
                i += 1;
                // "counter packets N bytes M"
                if word(i) == Some("packets") {
                    i += 4;
                }
            }
            ("accept", _) => {
                action = Some(RuleAction::Accept);
                i += 1;
            }
            ("drop", _) => {
                action = Some(RuleAction::Drop);
                i += 1;
            }
            ("reject", _) => {
                action = Some(RuleAction::Reject);
                i += 1;
                // "reject with icmp type port-unreachable"
                if word(i) == Some("with") {
                    while let Some(w) = word(i) {
                        if w == "comment" {
                            break;
                        }
                        i += 1;
                    }
                }
            }
            ("masquerade", _) => {
                action = Some(RuleAction::Masquerade);
                i += 1;
            }
            ("snat" | "dnat", _) => {
                // nft may print "snat ip to X"
                let mut j = i + 1;
                if word(j) == Some("ip") {
                    j += 1;
                }
                if word(j) != Some("to") {
                    return Err(format!("unsupported {} form", tok));
                }
                let to = need(j + 1)?.to_string();
                action = Some(if tok == "snat" {
                    RuleAction::Snat { to }
                } else {
                    RuleAction::Dnat { to }
                });
                i = j + 2;
            }
            ("comment", _) => {
                comment = Some(need(i + 1)?.to_string());
                i += 2;
            }
            (other, _) => return Err(format!("unsupported expression {}", other)),
        }
    }

    let action = action.ok_or("rule without a verdict")?;
    let mut rule = FirewallRuleIntent::new(chain, action);
    rule.protocol = protocol;
    rule.source = source;
    rule.destination = destination;
    rule.port = port;
    rule.comment = comment;
    Ok(rule)
}

/// Strips the `# handle N` suffix `nft -a` appends.
fn strip_handle(line: &str) -> &str {
    match line.find(" # handle ") {
        Some(idx) => &line[..idx],
        None => line,
    }
}

#[derive(Debug, PartialEq)]
enum Block {
    Table { managed: bool, name: String },
    Chain(Option<String>),
    Other,
}

/// Parses `nft list ruleset` output and rendered `nft -f` scripts.
pub fn parse_nft(text: &str) -> ParseOutcome<Vec<FirewallRuleIntent>> {
    let mut out = ParseOutcome::new(Vec::new());
    let mut stack: Vec<Block> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = strip_handle(raw.trim());
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Script form
        if let Some(rest) = line.strip_prefix("add rule ") {
            let tokens = tokenize(rest);
            match tokens.as_slice() {
                [family, table, chain, stmt @ ..]
                    if family == NFT_FAMILY && chain_table(chain) == Some(table.as_str()) =>
                {
                    match parse_statement(chain, stmt) {
                        Ok(rule) => out.records.push(rule),
                        Err(e) => out.warn(format!("line {}: {}", lineno, e)),
                    }
                }
                _ => out.warn(format!("line {}: rule outside managed chains", lineno)),
            }
            continue;
        }
        if line.starts_with("add ") || line.starts_with("flush ") || line.starts_with("delete ") {
            continue;
        }

        // Listing form
        if line == "}" {
            stack.pop();
            continue;
        }
        if let Some(head) = line.strip_suffix('{') {
            let words: Vec<&str> = head.split_whitespace().collect();
            let block = match (words.as_slice(), stack.last()) {
                (["table", family, name], _) => {
                    let managed = *family == NFT_FAMILY
                        && MANAGED_TABLES.contains(name);
                    if !managed {
                        out.warn(format!("line {}: table {} {} is not managed", lineno, family, name));
                    }
                    Block::Table {
                        managed,
                        name: name.to_string(),
                    }
                }
                (["chain", name], Some(Block::Table { managed: true, name: table })) => {
                    if chain_table(name) == Some(table.as_str()) {
                        Block::Chain(Some(name.to_string()))
                    } else {
                        out.warn(format!("line {}: chain {} is not managed", lineno, name));
                        Block::Chain(None)
                    }
                }
                (["chain", _], _) => Block::Chain(None),
                _ => Block::Other,
            };
            stack.push(block);
            continue;
        }

        match stack.last() {
            Some(Block::Chain(Some(chain))) => {
                if line.starts_with("type ") || line.starts_with("policy ") {
                    continue;
                }
                match parse_statement(chain, &tokenize(line)) {
                    Ok(rule) => out.records.push(rule),
                    Err(e) => out.warn(format!("line {}: {}", lineno, e)),
                }
            }
            Some(_) => {}
            None => out.warn(format!("line {}: unrecognized '{}'", lineno, line)),
        }
    }

    assign_positions(&mut out.records);
    out
}

#[async_trait]
impl Backend for NftablesBackend {
    type Intent = Vec<FirewallRuleIntent>;
    type State = Vec<FirewallRuleIntent>;
    type Kind = FirewallBackendKind;

    fn kind(&self) -> FirewallBackendKind {
        FirewallBackendKind::NFTables
    }

    fn parse(&self, text: &str) -> NetCfgResult<ParseOutcome<Vec<FirewallRuleIntent>>> {
        Ok(parse_nft(text))
    }

    async fn read_live(
        &self,
        exec: &dyn HostExecutor,
    ) -> NetCfgResult<ParseOutcome<Vec<FirewallRuleIntent>>> {
        let text = exec_or_fail(exec, &argv([NFT_CMD, "list", "ruleset"])).await?;
        Ok(parse_nft(&text))
    }

    fn synthesize(&self, rules: &Vec<FirewallRuleIntent>) -> NetCfgResult<Artifact> {
        let path = self.script.to_string_lossy().into_owned();
        Ok(Artifact::new("nftables")
            .with_file(&self.script, render_script(rules))
            .validate_with(argv([NFT_CMD, "-c", "-f", path.as_str()]))
            .reload_with(argv([NFT_CMD, "-f", path.as_str()])))
    }
}
