//! Firewall table, chain and file constants

use sbc_netcfg_common::model::{FILTER_CHAINS, NAT_CHAINS};

pub const FILTER_TABLE: &str = "filter";
pub const NAT_TABLE: &str = "nat";

/// Managed tables in render order.
pub const MANAGED_TABLES: &[&str] = &[FILTER_TABLE, NAT_TABLE];

/// Chains of a managed table in render order.
pub fn table_chains(table: &str) -> &'static [&'static str] {
    match table {
        FILTER_TABLE => FILTER_CHAINS,
        NAT_TABLE => NAT_CHAINS,
        _ => &[],
    }
}

/// Sort key placing chains in render order.
pub fn chain_order(chain: &str) -> usize {
    FILTER_CHAINS
        .iter()
        .chain(NAT_CHAINS)
        .position(|c| *c == chain)
        .unwrap_or(usize::MAX)
}

pub const DEFAULT_POLICY: &str = "ACCEPT";

// nftables
pub const NFT_FAMILY: &str = "ip";
pub const NFT_SHEBANG: &str = "#!/usr/sbin/nft -f";
pub const NFT_HEADER: &str = "# Generated by netcfgd. Manual changes will be overwritten.";

/// Base chain declaration: (hook, type, priority).
pub fn nft_hook(chain: &str) -> Option<(&'static str, &'static str, i32)> {
    match chain {
        "INPUT" => Some(("input", "filter", 0)),
        "FORWARD" => Some(("forward", "filter", 0)),
        "OUTPUT" => Some(("output", "filter", 0)),
        "PREROUTING" => Some(("prerouting", "nat", -100)),
        "POSTROUTING" => Some(("postrouting", "nat", 100)),
        _ => None,
    }
}

// iptables
pub const IPTABLES_HEADER: &str = "# Generated by netcfgd. Manual changes will be overwritten.";
pub const IPTABLES_COMMIT: &str = "COMMIT";
