//! `ip route show` output parsing.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::Serialize;

use sbc_netcfg_common::model::validate_ifname;
use sbc_netcfg_common::{NetCfgError, NetCfgResult, ParseOutcome};

use crate::tables::{DYNAMIC_PROTOCOLS, IGNORED_ATTRIBUTES, ROUTE_TYPES};

/// One hop of a multipath route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Nexthop {
    pub gateway: Option<Ipv4Addr>,
    pub interface: Option<String>,
    pub weight: u32,
}

/// A route as the kernel reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemRoute {
    pub destination: Ipv4Network,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    pub metric: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nexthops: Vec<Nexthop>,
}

impl SystemRoute {
    fn new(destination: Ipv4Network) -> Self {
        Self {
            destination,
            route_type: None,
            gateway: None,
            interface: None,
            metric: 0,
            protocol: None,
            scope: None,
            source: None,
            nexthops: Vec::new(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.destination.prefix() == 0
    }

    /// True unless the route came from the kernel or an address daemon.
    pub fn is_static(&self) -> bool {
        !self
            .protocol
            .as_deref()
            .is_some_and(|p| DYNAMIC_PROTOCOLS.contains(&p))
    }
}

fn parse_destination(word: &str) -> Option<Ipv4Network> {
    if word == "default" {
        return Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).ok();
    }
    word.parse().ok()
}

/// Attribute tokens shared by route lines and `nexthop` lines.
enum Attr<'a> {
    Via(&'a str),
    Dev(&'a str),
    Metric(&'a str),
    Weight(&'a str),
    Proto(&'a str),
    Scope(&'a str),
    Src(&'a str),
}

/// Splits `words` into known attributes, skipping flags and unmodeled keys.
fn attributes<'a>(words: &[&'a str]) -> Vec<Attr<'a>> {
    let mut attrs = Vec::new();
    let mut i = 0;
    while i < words.len() {
        let value = words.get(i + 1).copied();
        let attr = match (words[i], value) {
            ("via", Some(v)) => Some(Attr::Via(v)),
            ("dev", Some(v)) => Some(Attr::Dev(v)),
            ("metric", Some(v)) => Some(Attr::Metric(v)),
            ("weight", Some(v)) => Some(Attr::Weight(v)),
            ("proto", Some(v)) => Some(Attr::Proto(v)),
            ("scope", Some(v)) => Some(Attr::Scope(v)),
            ("src", Some(v)) => Some(Attr::Src(v)),
            (key, Some(_)) if IGNORED_ATTRIBUTES.contains(&key) => None,
            // onlink, linkdown, dead, offload and friends
            _ => {
                i += 1;
                continue;
            }
        };
        attrs.extend(attr);
        i += 2;
    }
    attrs
}

fn parse_nexthop(words: &[&str], line_no: usize, warnings: &mut Vec<String>) -> Nexthop {
    let mut hop = Nexthop {
        gateway: None,
        interface: None,
        weight: 1,
    };
    for attr in attributes(words) {
        match attr {
            Attr::Via(v) => match v.parse() {
                Ok(gw) => hop.gateway = Some(gw),
                Err(_) => warnings.push(format!("line {}: bad nexthop via {}", line_no, v)),
            },
            Attr::Dev(v) => hop.interface = Some(v.to_string()),
            Attr::Weight(v) => match v.parse() {
                Ok(w) => hop.weight = w,
                Err(_) => warnings.push(format!("line {}: bad weight {}", line_no, v)),
            },
            _ => {}
        }
    }
    hop
}

/// Parses `ip route show` output.
///
/// `default` becomes 0.0.0.0/0 and a bare address becomes a /32. Indented
/// `nexthop` lines attach to the preceding multipath route. Lines whose
/// destination is not IPv4 are skipped with a warning.
pub fn parse_ip_route(text: &str) -> ParseOutcome<Vec<SystemRoute>> {
    let mut outcome = ParseOutcome::new(Vec::<SystemRoute>::new());
    let mut warnings = Vec::new();
    // Set while the last route line was accepted, so nexthops have a parent.
    let mut open_route = false;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some(&first) = words.first() else {
            continue;
        };

        if first == "nexthop" {
            match outcome.records.last_mut().filter(|_| open_route) {
                Some(route) => {
                    let hop = parse_nexthop(&words[1..], line_no, &mut warnings);
                    route.nexthops.push(hop);
                }
                None => warnings.push(format!("line {}: nexthop without a route", line_no)),
            }
            continue;
        }
        open_route = false;

        let (route_type, rest) = if ROUTE_TYPES.contains(&first) {
            (Some(first.to_string()), &words[1..])
        } else {
            (None, &words[..])
        };
        let Some(destination) = rest.first().and_then(|w| parse_destination(w)) else {
            warnings.push(format!("line {}: unsupported destination in '{}'", line_no, line.trim()));
            continue;
        };

        let mut route = SystemRoute::new(destination);
        route.route_type = route_type;
        for attr in attributes(&rest[1..]) {
            match attr {
                Attr::Via(v) => match v.parse() {
                    Ok(gw) => route.gateway = Some(gw),
                    Err(_) => warnings.push(format!("line {}: gateway {} is not IPv4", line_no, v)),
                },
                Attr::Dev(v) => route.interface = Some(v.to_string()),
                Attr::Metric(v) => match v.parse() {
                    Ok(m) => route.metric = m,
                    Err(_) => warnings.push(format!("line {}: bad metric {}", line_no, v)),
                },
                Attr::Proto(v) => route.protocol = Some(v.to_string()),
                Attr::Scope(v) => route.scope = Some(v.to_string()),
                Attr::Src(v) => route.source = v.parse().ok(),
                Attr::Weight(_) => {}
            }
        }
        outcome.records.push(route);
        open_route = true;
    }

    for warning in warnings {
        outcome.warn(warning);
    }
    outcome
}

/// The first gateway `ip route show dev NAME` reports for an interface.
pub fn first_gateway(text: &str) -> Option<Ipv4Addr> {
    let routes = parse_ip_route(text).records;
    routes
        .iter()
        .find_map(|r| r.gateway)
        .or_else(|| routes.iter().flat_map(|r| &r.nexthops).find_map(|h| h.gateway))
}

/// A source/destination/ingress selector bound to a routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Ipv4Network>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Ipv4Network>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iif: Option<String>,
    pub table: u32,
}

impl PolicyRule {
    pub fn lookup(table: u32) -> Self {
        Self {
            from: None,
            to: None,
            iif: None,
            table,
        }
    }

    pub fn from_source(mut self, from: Ipv4Network) -> Self {
        self.from = Some(from);
        self
    }

    pub fn to_destination(mut self, to: Ipv4Network) -> Self {
        self.to = Some(to);
        self
    }

    pub fn incoming(mut self, iif: impl Into<String>) -> Self {
        self.iif = Some(iif.into());
        self
    }

    pub fn validate(&self) -> NetCfgResult<()> {
        if self.table == 0 {
            return Err(NetCfgError::validation("table", "table 0 is reserved"));
        }
        if let Some(iif) = &self.iif {
            validate_ifname(iif)?;
        }
        Ok(())
    }

    /// Arguments following `ip rule add|del`.
    pub fn ip_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(from) = self.from {
            args.extend(["from".to_string(), from.to_string()]);
        }
        if let Some(to) = self.to {
            args.extend(["to".to_string(), to.to_string()]);
        }
        if let Some(iif) = &self.iif {
            args.extend(["iif".to_string(), iif.clone()]);
        }
        args.extend(["table".to_string(), self.table.to_string()]);
        args
    }
}
