//! Firewall backend selection and helpers shared by both renderers.

use async_trait::async_trait;

use sbc_netcfg_common::model::FirewallRuleIntent;
use sbc_netcfg_common::settings::Settings;
use sbc_netcfg_common::shell::HostExecutor;
use sbc_netcfg_common::{Artifact, Backend, FirewallBackendKind, NetCfgResult, ParseOutcome};

use crate::iptables::IptablesBackend;
use crate::nftables::NftablesBackend;
use crate::tables::chain_order;

/// Enabled rules in render order: chain order, then position.
pub fn render_order(rules: &[FirewallRuleIntent]) -> Vec<&FirewallRuleIntent> {
    let mut enabled: Vec<&FirewallRuleIntent> = rules.iter().filter(|r| r.enabled).collect();
    enabled.sort_by_key(|r| (chain_order(&r.chain), r.position));
    enabled
}

/// Splits a line on whitespace, keeping double-quoted text as one token
/// (without the quotes).
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;

    for ch in line.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() || quoted {
                    tokens.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() || quoted {
        tokens.push(current);
    }
    tokens
}

/// Renumbers parsed rules 0.. within each chain, in encounter order.
pub fn assign_positions(rules: &mut [FirewallRuleIntent]) {
    let mut next: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
    for rule in rules.iter_mut() {
        let slot = next.entry(rule.chain.clone()).or_insert(0);
        rule.position = *slot;
        *slot += 1;
    }
}

/// The concrete firewall backend in use on this host.
#[derive(Debug, Clone)]
pub enum FirewallBackend {
    Nftables(NftablesBackend),
    Iptables(IptablesBackend),
}

impl FirewallBackend {
    pub fn for_kind(kind: FirewallBackendKind, settings: &Settings) -> Self {
        match kind {
            FirewallBackendKind::NFTables => {
                Self::Nftables(NftablesBackend::new(&settings.paths.nftables_conf))
            }
            FirewallBackendKind::IPTables => {
                Self::Iptables(IptablesBackend::new(&settings.paths.iptables_rules))
            }
        }
    }
}

#[async_trait]
impl Backend for FirewallBackend {
    type Intent = Vec<FirewallRuleIntent>;
    type State = Vec<FirewallRuleIntent>;
    type Kind = FirewallBackendKind;

    fn kind(&self) -> FirewallBackendKind {
        match self {
            Self::Nftables(b) => b.kind(),
            Self::Iptables(b) => b.kind(),
        }
    }

    fn parse(&self, text: &str) -> NetCfgResult<ParseOutcome<Vec<FirewallRuleIntent>>> {
        match self {
            Self::Nftables(b) => b.parse(text),
            Self::Iptables(b) => b.parse(text),
        }
    }

    async fn read_live(
        &self,
        exec: &dyn HostExecutor,
    ) -> NetCfgResult<ParseOutcome<Vec<FirewallRuleIntent>>> {
        match self {
            Self::Nftables(b) => b.read_live(exec).await,
            Self::Iptables(b) => b.read_live(exec).await,
        }
    }

    fn synthesize(&self, rules: &Vec<FirewallRuleIntent>) -> NetCfgResult<Artifact> {
        match self {
            Self::Nftables(b) => b.synthesize(rules),
            Self::Iptables(b) => b.synthesize(rules),
        }
    }
}
