//! Multi-WAN load balancing plan.
//!
//! Gateways are resolved by the caller; everything here is pure so the
//! command shapes can be checked without a host.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use sbc_netcfg_common::model::WanMember;
use sbc_netcfg_common::shell::{argv, IP_CMD};
use sbc_netcfg_common::{NetCfgError, NetCfgResult};

use crate::tables::{RT_TABLES_RESERVED, WAN_TABLE_BASE, WAN_TABLE_PREFIX};

/// Routing table number and name for the member at `position` in the member list.
pub fn wan_table(position: usize) -> (u32, String) {
    let position = u32::try_from(position).unwrap_or(u32::MAX - WAN_TABLE_BASE);
    (
        WAN_TABLE_BASE + position,
        format!("{}{}", WAN_TABLE_PREFIX, position + 1),
    )
}

/// An enabled member whose gateway is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMember {
    pub name: String,
    pub gateway: Ipv4Addr,
    pub weight: u32,
    pub table: u32,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipathPlan {
    pub members: Vec<ResolvedMember>,
    pub warnings: Vec<String>,
}

impl MultipathPlan {
    /// Keeps enabled members with a resolved gateway, in input order.
    ///
    /// Members without a gateway are dropped with a warning; a plan with no
    /// usable member is rejected.
    pub fn build(members: &[WanMember], gateways: &HashMap<String, Ipv4Addr>) -> NetCfgResult<Self> {
        let mut plan = Self {
            members: Vec::new(),
            warnings: Vec::new(),
        };

        for (position, member) in members.iter().enumerate() {
            if !member.enabled {
                continue;
            }
            let Some(&gateway) = gateways.get(&member.name) else {
                plan.warnings
                    .push(format!("no gateway found for {}, excluded from load balancing", member.name));
                continue;
            };
            let (table, table_name) = wan_table(position);
            plan.members.push(ResolvedMember {
                name: member.name.clone(),
                gateway,
                weight: member.weight,
                table,
                table_name,
            });
        }

        if plan.members.is_empty() {
            return Err(NetCfgError::validation(
                "members",
                "no enabled WAN member has a resolvable gateway",
            ));
        }
        Ok(plan)
    }

    /// `ip route replace default nexthop via G dev N weight W ...`, one clause per member.
    pub fn route_argv(&self) -> Vec<String> {
        let mut args = argv([IP_CMD, "route", "replace", "default"]);
        for member in &self.members {
            args.extend(argv([
                "nexthop".to_string(),
                "via".to_string(),
                member.gateway.to_string(),
                "dev".to_string(),
                member.name.clone(),
                "weight".to_string(),
                member.weight.to_string(),
            ]));
        }
        args
    }

    /// Per-member default routes in each member's own table.
    pub fn table_routes(&self) -> Vec<Vec<String>> {
        self.members
            .iter()
            .map(|m| {
                let gateway = m.gateway.to_string();
                let table = m.table.to_string();
                argv([
                    IP_CMD,
                    "route",
                    "replace",
                    "default",
                    "via",
                    gateway.as_str(),
                    "dev",
                    m.name.as_str(),
                    "table",
                    table.as_str(),
                ])
            })
            .collect()
    }

    pub fn table_entries(&self) -> Vec<(u32, String)> {
        self.members
            .iter()
            .map(|m| (m.table, m.table_name.clone()))
            .collect()
    }
}

/// Adds missing `<id>\t<name>` lines to an `rt_tables` file.
///
/// Existing numbers are left alone; a number already bound to another name
/// produces a warning instead of a second entry.
pub fn merge_rt_tables(existing: &str, entries: &[(u32, String)]) -> (String, Vec<String>) {
    let mut text = if existing.trim().is_empty() {
        RT_TABLES_RESERVED.to_string()
    } else {
        existing.to_string()
    };
    if !text.ends_with('\n') {
        text.push('\n');
    }

    let bound: HashMap<u32, String> = existing
        .lines()
        .filter(|l| !l.trim_start().starts_with('#'))
        .filter_map(|l| {
            let mut fields = l.split_whitespace();
            let id = fields.next()?.parse().ok()?;
            Some((id, fields.next()?.to_string()))
        })
        .collect();

    let mut warnings = Vec::new();
    for (id, name) in entries {
        match bound.get(id) {
            Some(current) if current == name => {}
            Some(current) => warnings.push(format!(
                "routing table {} is already named {}, not renaming to {}",
                id, current, name
            )),
            None => text.push_str(&format!("{}\t{}\n", id, name)),
        }
    }
    (text, warnings)
}
