//! Canonical intent records shared by every backend.
//!
//! These are the declared-configuration types persisted by the intent store,
//! produced by state parsers and consumed by config synthesizers. Validation
//! lives next to each type so orchestrators can reject malformed intent
//! before anything is persisted.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};

use crate::error::{NetCfgError, NetCfgResult};

/// Maximum Linux interface name length (IFNAMSIZ - 1).
pub const MAX_IFNAME_LEN: usize = 15;

/// Chains of the filter table.
pub const FILTER_CHAINS: &[&str] = &["INPUT", "FORWARD", "OUTPUT"];

/// Chains of the nat table.
pub const NAT_CHAINS: &[&str] = &["PREROUTING", "POSTROUTING"];

/// Returns the table a known chain belongs to.
pub fn chain_table(chain: &str) -> Option<&'static str> {
    if FILTER_CHAINS.contains(&chain) {
        Some("filter")
    } else if NAT_CHAINS.contains(&chain) {
        Some("nat")
    } else {
        None
    }
}

/// Converts a dotted netmask to a prefix length.
pub fn netmask_to_prefix(netmask: Ipv4Addr) -> NetCfgResult<u8> {
    ipnetwork::ipv4_mask_to_prefix(netmask)
        .map_err(|_| NetCfgError::validation("netmask", format!("{} is not contiguous", netmask)))
}

/// Converts a prefix length to a dotted netmask.
pub fn prefix_to_netmask(prefix: u8) -> NetCfgResult<Ipv4Addr> {
    Ipv4Network::new(Ipv4Addr::UNSPECIFIED, prefix)
        .map(|net| net.mask())
        .map_err(|_| NetCfgError::validation("prefix", format!("{} is out of range", prefix)))
}

/// Validates a Linux interface name.
pub fn validate_ifname(name: &str) -> NetCfgResult<()> {
    if name.is_empty() {
        return Err(NetCfgError::validation("name", "interface name is empty"));
    }
    if name.len() > MAX_IFNAME_LEN {
        return Err(NetCfgError::validation(
            "name",
            format!("{} is longer than {} characters", name, MAX_IFNAME_LEN),
        ));
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || c == '/' || c == ':' || c == '#')
    {
        return Err(NetCfgError::validation(
            "name",
            format!("{} contains an invalid character", name),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Interfaces
// ---------------------------------------------------------------------------

/// Kind of network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ethernet,
    Wifi,
    Bridge,
    Vlan,
    Vpn,
}

impl InterfaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceType::Ethernet => "ethernet",
            InterfaceType::Wifi => "wifi",
            InterfaceType::Bridge => "bridge",
            InterfaceType::Vlan => "vlan",
            InterfaceType::Vpn => "vpn",
        }
    }

    /// Guesses the type from a kernel interface name.
    pub fn infer_from_name(name: &str) -> Self {
        if name.starts_with("br") {
            InterfaceType::Bridge
        } else if name.starts_with("wl") {
            InterfaceType::Wifi
        } else if name.starts_with("vlan") || name.contains('.') {
            InterfaceType::Vlan
        } else if name.starts_with("wg") || name.starts_with("tun") || name.starts_with("tap") {
            InterfaceType::Vpn
        } else {
            InterfaceType::Ethernet
        }
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterfaceType {
    type Err = NetCfgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ethernet" => Ok(InterfaceType::Ethernet),
            "wifi" => Ok(InterfaceType::Wifi),
            "bridge" => Ok(InterfaceType::Bridge),
            "vlan" => Ok(InterfaceType::Vlan),
            "vpn" => Ok(InterfaceType::Vpn),
            other => Err(NetCfgError::validation(
                "type",
                format!("unknown interface type {}", other),
            )),
        }
    }
}

/// How an interface obtains its IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressingMode {
    Dhcp,
    Static,
}

impl AddressingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressingMode::Dhcp => "dhcp",
            AddressingMode::Static => "static",
        }
    }
}

impl FromStr for AddressingMode {
    type Err = NetCfgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dhcp" => Ok(AddressingMode::Dhcp),
            "static" => Ok(AddressingMode::Static),
            other => Err(NetCfgError::validation(
                "mode",
                format!("unknown addressing mode {}", other),
            )),
        }
    }
}

/// 802.1Q sub-interface details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanConfig {
    pub id: u16,
    pub link: String,
}

/// Wireless association details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiConfig {
    pub ssid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,
}

/// Declared configuration of one network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceIntent {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: InterfaceType,
    pub enabled: bool,
    pub mode: AddressingMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bridge_ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<VlanConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi: Option<WifiConfig>,
}

impl NetworkInterfaceIntent {
    /// An enabled DHCP-addressed interface.
    pub fn dhcp(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: InterfaceType::infer_from_name(&name),
            name,
            enabled: true,
            mode: AddressingMode::Dhcp,
            address: None,
            netmask: None,
            gateway: None,
            dns: Vec::new(),
            bridge_ports: Vec::new(),
            vlan: None,
            wifi: None,
        }
    }

    /// An enabled statically addressed interface.
    pub fn static_v4(name: impl Into<String>, address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            mode: AddressingMode::Static,
            address: Some(address),
            netmask: Some(netmask),
            ..Self::dhcp(name)
        }
    }

    pub fn with_kind(mut self, kind: InterfaceType) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_dns<I: IntoIterator<Item = IpAddr>>(mut self, dns: I) -> Self {
        self.dns = dns.into_iter().collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Prefix length of the static netmask, if any.
    pub fn prefix_len(&self) -> Option<u8> {
        self.netmask.and_then(|m| ipnetwork::ipv4_mask_to_prefix(m).ok())
    }

    /// The static address in CIDR notation (e.g. `192.168.1.1/24`).
    pub fn cidr(&self) -> Option<Ipv4Network> {
        let address = self.address?;
        Ipv4Network::new(address, self.prefix_len()?).ok()
    }

    /// The subnet the static address lives in.
    pub fn subnet(&self) -> Option<Ipv4Network> {
        let cidr = self.cidr()?;
        Ipv4Network::new(cidr.network(), cidr.prefix()).ok()
    }

    /// Checks structural invariants of a single intent.
    pub fn validate(&self) -> NetCfgResult<()> {
        validate_ifname(&self.name)?;

        if self.mode == AddressingMode::Static {
            if self.address.is_none() {
                return Err(NetCfgError::validation(
                    "address",
                    format!("static interface {} requires an address", self.name),
                ));
            }
            match self.netmask {
                None => {
                    return Err(NetCfgError::validation(
                        "netmask",
                        format!("static interface {} requires a netmask", self.name),
                    ))
                }
                Some(mask) => {
                    netmask_to_prefix(mask)?;
                }
            }
        }

        match self.kind {
            InterfaceType::Vlan => {
                let vlan = self.vlan.as_ref().ok_or_else(|| {
                    NetCfgError::validation("vlan", format!("{} has no VLAN id or link", self.name))
                })?;
                if !(1..=4094).contains(&vlan.id) {
                    return Err(NetCfgError::validation(
                        "vlan",
                        format!("VLAN id {} is out of range 1-4094", vlan.id),
                    ));
                }
                validate_ifname(&vlan.link)?;
            }
            InterfaceType::Bridge => {
                for port in &self.bridge_ports {
                    validate_ifname(port)?;
                }
            }
            InterfaceType::Wifi => {
                if let Some(wifi) = &self.wifi {
                    if wifi.ssid.is_empty() {
                        return Err(NetCfgError::validation("ssid", "SSID is empty"));
                    }
                }
            }
            InterfaceType::Ethernet | InterfaceType::Vpn => {}
        }

        Ok(())
    }
}

/// Validates a whole intent set, including name uniqueness.
pub fn validate_interface_set(interfaces: &[NetworkInterfaceIntent]) -> NetCfgResult<()> {
    let mut seen = std::collections::HashSet::new();
    for intf in interfaces {
        intf.validate()?;
        if !seen.insert(intf.name.as_str()) {
            return Err(NetCfgError::validation(
                "name",
                format!("interface {} is declared twice", intf.name),
            ));
        }
    }
    Ok(())
}

/// Everything an interface backend renders: interfaces plus the static
/// routes declared alongside them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDeclarations {
    pub interfaces: Vec<NetworkInterfaceIntent>,
    #[serde(default)]
    pub routes: Vec<StaticRouteIntent>,
}

impl InterfaceDeclarations {
    pub fn interface(&self, name: &str) -> Option<&NetworkInterfaceIntent> {
        self.interfaces.iter().find(|i| i.name == name)
    }
}

// ---------------------------------------------------------------------------
// Firewall
// ---------------------------------------------------------------------------

/// Transport protocol matched by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::All => "all",
        }
    }

    /// Whether a destination port can be matched for this protocol.
    pub fn has_ports(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = NetCfgError;

    /// Accepts names and the IANA numbers `iptables -L -n` prints.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "6" => Ok(Protocol::Tcp),
            "udp" | "17" => Ok(Protocol::Udp),
            "icmp" | "1" => Ok(Protocol::Icmp),
            "all" | "0" => Ok(Protocol::All),
            other => Err(NetCfgError::validation(
                "protocol",
                format!("unsupported protocol {}", other),
            )),
        }
    }
}

/// What a matching packet is subjected to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Accept,
    Drop,
    Reject,
    Masquerade,
    Snat { to: String },
    Dnat { to: String },
}

impl RuleAction {
    /// The iptables target name.
    pub fn target(&self) -> &'static str {
        match self {
            RuleAction::Accept => "ACCEPT",
            RuleAction::Drop => "DROP",
            RuleAction::Reject => "REJECT",
            RuleAction::Masquerade => "MASQUERADE",
            RuleAction::Snat { .. } => "SNAT",
            RuleAction::Dnat { .. } => "DNAT",
        }
    }

    /// True for actions that rewrite addresses and live in the nat table.
    pub fn is_nat(&self) -> bool {
        matches!(
            self,
            RuleAction::Masquerade | RuleAction::Snat { .. } | RuleAction::Dnat { .. }
        )
    }
}

/// A destination port or inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortSpec {
    pub start: u16,
    pub end: u16,
}

impl PortSpec {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn range(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn is_range(&self) -> bool {
        self.start != self.end
    }

    /// Rendering with a custom range separator (`:` for iptables, `-` for nft).
    pub fn render(&self, sep: char) -> String {
        if self.is_range() {
            format!("{}{}{}", self.start, sep, self.end)
        } else {
            self.start.to_string()
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(':'))
    }
}

impl FromStr for PortSpec {
    type Err = NetCfgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| NetCfgError::validation("port", format!("invalid port {}", s)))
        };
        let spec = match s.split_once([':', '-']) {
            Some((a, b)) => PortSpec::range(parse(a)?, parse(b)?),
            None => PortSpec::single(parse(s)?),
        };
        if spec.start == 0 || spec.start > spec.end {
            return Err(NetCfgError::validation(
                "port",
                format!("invalid port range {}", s),
            ));
        }
        Ok(spec)
    }
}

impl TryFrom<String> for PortSpec {
    type Error = NetCfgError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortSpec> for String {
    fn from(value: PortSpec) -> Self {
        value.to_string()
    }
}

/// One declared firewall rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRuleIntent {
    /// Store row id; `None` until persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub chain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<IpNetwork>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<IpNetwork>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSpec>,
    pub action: RuleAction,
    pub position: u32,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl FirewallRuleIntent {
    /// A bare enabled rule at position 0 in `chain`.
    pub fn new(chain: impl Into<String>, action: RuleAction) -> Self {
        Self {
            id: None,
            chain: chain.into(),
            protocol: None,
            source: None,
            destination: None,
            port: None,
            action,
            position: 0,
            enabled: true,
            comment: None,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_source(mut self, source: IpNetwork) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_destination(mut self, destination: IpNetwork) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_port(mut self, port: PortSpec) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_position(mut self, position: u32) -> Self {
        self.position = position;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// The table this rule's chain belongs to.
    pub fn table(&self) -> Option<&'static str> {
        chain_table(&self.chain)
    }

    /// True if two rules match the same packets with the same action.
    pub fn same_match(&self, other: &Self) -> bool {
        self.chain == other.chain
            && self.protocol.filter(|p| *p != Protocol::All)
                == other.protocol.filter(|p| *p != Protocol::All)
            && self.source == other.source
            && self.destination == other.destination
            && self.port == other.port
            && self.action == other.action
    }

    pub fn validate(&self) -> NetCfgResult<()> {
        let table = self.table().ok_or_else(|| {
            NetCfgError::validation("chain", format!("unknown chain {}", self.chain))
        })?;

        if self.action.is_nat() && table != "nat" {
            return Err(NetCfgError::validation(
                "action",
                format!("{} is only valid in nat chains", self.action.target()),
            ));
        }
        match &self.action {
            RuleAction::Masquerade | RuleAction::Snat { .. } if self.chain != "POSTROUTING" => {
                return Err(NetCfgError::validation(
                    "action",
                    format!("{} is only valid in POSTROUTING", self.action.target()),
                ));
            }
            RuleAction::Dnat { .. } if self.chain != "PREROUTING" => {
                return Err(NetCfgError::validation(
                    "action",
                    "DNAT is only valid in PREROUTING",
                ));
            }
            RuleAction::Snat { to } | RuleAction::Dnat { to } if to.trim().is_empty() => {
                return Err(NetCfgError::validation("action", "NAT target is empty"));
            }
            _ => {}
        }

        if self.port.is_some() && !self.protocol.is_some_and(|p| p.has_ports()) {
            return Err(NetCfgError::validation(
                "port",
                "a port match requires protocol tcp or udp",
            ));
        }

        if let Some(comment) = &self.comment {
            if comment.contains('"') || comment.contains('\n') {
                return Err(NetCfgError::validation(
                    "comment",
                    "comment must not contain quotes or newlines",
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DHCP
// ---------------------------------------------------------------------------

/// DHCP lease duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LeaseTime {
    Seconds(u64),
    Infinite,
}

impl LeaseTime {
    /// Saturates at `u64::MAX` seconds.
    pub fn hours(h: u64) -> Self {
        LeaseTime::Seconds(h.saturating_mul(3600))
    }

    /// Seconds, with infinite mapped to the all-ones lease value ISC uses.
    pub fn as_secs(&self) -> u64 {
        match self {
            LeaseTime::Seconds(s) => *s,
            LeaseTime::Infinite => u64::from(u32::MAX),
        }
    }
}

impl Default for LeaseTime {
    fn default() -> Self {
        LeaseTime::hours(24)
    }
}

impl fmt::Display for LeaseTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            LeaseTime::Infinite => f.write_str("infinite"),
            LeaseTime::Seconds(s) if s > 0 && s % 3600 == 0 => write!(f, "{}h", s / 3600),
            LeaseTime::Seconds(s) if s > 0 && s % 60 == 0 => write!(f, "{}m", s / 60),
            LeaseTime::Seconds(s) => write!(f, "{}", s),
        }
    }
}

impl FromStr for LeaseTime {
    type Err = NetCfgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "infinite" {
            return Ok(LeaseTime::Infinite);
        }
        let (digits, multiplier) = match s.chars().last() {
            Some('s') => (&s[..s.len() - 1], 1),
            Some('m') => (&s[..s.len() - 1], 60),
            Some('h') => (&s[..s.len() - 1], 3600),
            Some('d') => (&s[..s.len() - 1], 86_400),
            Some('w') => (&s[..s.len() - 1], 604_800),
            _ => (s.as_str(), 1),
        };
        let n: u64 = digits
            .parse()
            .map_err(|_| NetCfgError::validation("lease_time", format!("invalid lease time {}", s)))?;
        if n == 0 {
            return Err(NetCfgError::validation("lease_time", "lease time must be positive"));
        }
        n.checked_mul(multiplier)
            .map(LeaseTime::Seconds)
            .ok_or_else(|| NetCfgError::validation("lease_time", format!("lease time {} is too large", s)))
    }
}

impl TryFrom<String> for LeaseTime {
    type Error = NetCfgError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LeaseTime> for String {
    fn from(value: LeaseTime) -> Self {
        value.to_string()
    }
}

/// Address pool served on one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpPoolIntent {
    pub interface: String,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    #[serde(default)]
    pub lease_time: LeaseTime,
    #[serde(default)]
    pub authoritative: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Additional options keyed by name or code, rendered in key order.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl DhcpPoolIntent {
    pub fn new(interface: impl Into<String>, range_start: Ipv4Addr, range_end: Ipv4Addr) -> Self {
        Self {
            interface: interface.into(),
            range_start,
            range_end,
            lease_time: LeaseTime::default(),
            authoritative: true,
            netmask: None,
            router: None,
            dns_servers: Vec::new(),
            domain: None,
            options: BTreeMap::new(),
        }
    }

    /// Netmask used for the subnet declaration, defaulting to /24.
    pub fn effective_netmask(&self) -> Ipv4Addr {
        self.netmask.unwrap_or(Ipv4Addr::new(255, 255, 255, 0))
    }

    /// The subnet containing the range.
    pub fn subnet(&self) -> NetCfgResult<Ipv4Network> {
        let prefix = netmask_to_prefix(self.effective_netmask())?;
        let net = Ipv4Network::new(self.range_start, prefix)
            .map_err(|e| NetCfgError::validation("netmask", e.to_string()))?;
        Ipv4Network::new(net.network(), prefix)
            .map_err(|e| NetCfgError::validation("netmask", e.to_string()))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.range_start <= ip && ip <= self.range_end
    }

    pub fn validate(&self) -> NetCfgResult<()> {
        validate_ifname(&self.interface)?;
        if self.range_start > self.range_end {
            return Err(NetCfgError::validation(
                "range",
                format!("start {} is after end {}", self.range_start, self.range_end),
            ));
        }
        let subnet = self.subnet()?;
        if !subnet.contains(self.range_end) {
            return Err(NetCfgError::validation(
                "range",
                format!("{} and {} are not in the same subnet", self.range_start, self.range_end),
            ));
        }
        if let Some(domain) = &self.domain {
            if domain.is_empty() || domain.contains(char::is_whitespace) || domain.contains('"') {
                return Err(NetCfgError::validation("domain", format!("invalid domain {:?}", domain)));
            }
        }
        Ok(())
    }
}

/// Normalizes a MAC address to lowercase colon-separated form.
///
/// Accepts `:` or `-` separators, or twelve bare hex digits.
pub fn normalize_mac(mac: &str) -> NetCfgResult<String> {
    let hex: String = mac
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-' && *c != '.')
        .collect();
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(NetCfgError::validation("mac", format!("invalid MAC address {}", mac)));
    }
    let hex = hex.to_ascii_lowercase();
    let octets: Vec<&str> = (0..6).map(|i| &hex[i * 2..i * 2 + 2]).collect();
    Ok(octets.join(":"))
}

/// Fixed address assignment keyed by MAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpReservationIntent {
    pub mac: String,
    pub ip: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl DhcpReservationIntent {
    /// Builds a reservation with a normalized MAC.
    pub fn new(mac: &str, ip: Ipv4Addr, hostname: Option<&str>) -> NetCfgResult<Self> {
        let reservation = Self {
            mac: normalize_mac(mac)?,
            ip,
            hostname: hostname.filter(|h| !h.is_empty()).map(str::to_string),
        };
        reservation.validate()?;
        Ok(reservation)
    }

    pub fn validate(&self) -> NetCfgResult<()> {
        if normalize_mac(&self.mac)? != self.mac {
            return Err(NetCfgError::validation(
                "mac",
                format!("{} is not normalized", self.mac),
            ));
        }
        if let Some(host) = &self.hostname {
            let ok = host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
            if !ok {
                return Err(NetCfgError::validation("hostname", format!("invalid hostname {}", host)));
            }
        }
        Ok(())
    }
}

/// DHCP service role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DhcpMode {
    #[default]
    Server,
    Relay,
    Disabled,
}

impl FromStr for DhcpMode {
    type Err = NetCfgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "server" => Ok(DhcpMode::Server),
            "relay" => Ok(DhcpMode::Relay),
            "disabled" => Ok(DhcpMode::Disabled),
            other => Err(NetCfgError::validation("mode", format!("unknown DHCP mode {}", other))),
        }
    }
}

/// Service-level DHCP settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpSettings {
    #[serde(default)]
    pub mode: DhcpMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<DhcpPoolIntent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relay_servers: Vec<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relay_interfaces: Vec<String>,
}

impl DhcpSettings {
    pub fn validate(&self) -> NetCfgResult<()> {
        match self.mode {
            DhcpMode::Server => {
                let pool = self.pool.as_ref().ok_or_else(|| {
                    NetCfgError::validation("pool", "server mode requires an address pool")
                })?;
                pool.validate()
            }
            DhcpMode::Relay => {
                if self.relay_servers.is_empty() {
                    return Err(NetCfgError::validation(
                        "relay_servers",
                        "relay mode requires at least one server",
                    ));
                }
                for intf in &self.relay_interfaces {
                    validate_ifname(intf)?;
                }
                Ok(())
            }
            DhcpMode::Disabled => Ok(()),
        }
    }
}

/// Complete DHCP declaration rendered by a DHCP backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpConfig {
    pub settings: DhcpSettings,
    #[serde(default)]
    pub reservations: Vec<DhcpReservationIntent>,
}

/// A lease handed out by the running DHCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub mac: String,
    pub ip: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// `None` means the lease never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// A declared static IPv4 route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRouteIntent {
    pub destination: Ipv4Network,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default)]
    pub metric: u32,
}

impl StaticRouteIntent {
    pub fn via(destination: Ipv4Network, gateway: Ipv4Addr) -> Self {
        Self {
            destination,
            gateway: Some(gateway),
            interface: None,
            metric: 0,
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_metric(mut self, metric: u32) -> Self {
        self.metric = metric;
        self
    }

    /// Destination with host bits cleared.
    pub fn normalized(mut self) -> Self {
        if let Ok(net) = Ipv4Network::new(self.destination.network(), self.destination.prefix()) {
            self.destination = net;
        }
        self
    }

    pub fn is_default(&self) -> bool {
        self.destination.prefix() == 0
    }

    /// Destination as `ip route` prints it (`default` for 0.0.0.0/0).
    pub fn destination_str(&self) -> String {
        if self.is_default() {
            "default".to_string()
        } else {
            self.destination.to_string()
        }
    }

    /// Arguments following `ip route add|del`: destination, then via, dev and metric when set.
    pub fn ip_args(&self) -> Vec<String> {
        let mut args = vec![self.destination_str()];
        if let Some(gw) = self.gateway {
            args.push("via".to_string());
            args.push(gw.to_string());
        }
        if let Some(dev) = &self.interface {
            args.push("dev".to_string());
            args.push(dev.clone());
        }
        if self.metric > 0 {
            args.push("metric".to_string());
            args.push(self.metric.to_string());
        }
        args
    }

    pub fn validate(&self) -> NetCfgResult<()> {
        if self.gateway.is_none() && self.interface.is_none() {
            return Err(NetCfgError::validation(
                "gateway",
                "a route needs a gateway or an interface",
            ));
        }
        if let Some(intf) = &self.interface {
            validate_ifname(intf)?;
        }
        if self.destination.ip() != self.destination.network() {
            return Err(NetCfgError::validation(
                "destination",
                format!("{} has host bits set", self.destination),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WAN
// ---------------------------------------------------------------------------

/// How the WAN uplink is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WanConnection {
    #[default]
    Dhcp,
    Static,
    Pppoe,
}

/// Primary uplink settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WanSettings {
    pub interface: String,
    #[serde(default)]
    pub connection: WanConnection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pppoe_username: Option<String>,
    pub enabled: bool,
}

impl Default for WanSettings {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            connection: WanConnection::Dhcp,
            address: None,
            netmask: None,
            gateway: None,
            dns: Vec::new(),
            mtu: None,
            pppoe_username: None,
            enabled: true,
        }
    }
}

/// Multi-WAN operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MultiWanMode {
    #[default]
    LoadBalance,
    Failover,
}

/// One uplink participating in multi-WAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WanMember {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl WanMember {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
            priority: 0,
            enabled: true,
        }
    }
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Link health probing used by failover mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverProbe {
    pub target: Ipv4Addr,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub failure_threshold: u32,
    pub recovery_delay_secs: u32,
}

impl Default for FailoverProbe {
    fn default() -> Self {
        Self {
            target: Ipv4Addr::new(8, 8, 8, 8),
            interval_secs: 30,
            timeout_secs: 5,
            failure_threshold: 3,
            recovery_delay_secs: 60,
        }
    }
}

/// Multi-uplink settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiWanSettings {
    pub enabled: bool,
    #[serde(default)]
    pub mode: MultiWanMode,
    #[serde(default)]
    pub members: Vec<WanMember>,
    #[serde(default)]
    pub failover: FailoverProbe,
}

impl MultiWanSettings {
    pub fn validate(&self) -> NetCfgResult<()> {
        let mut seen = std::collections::HashSet::new();
        for member in &self.members {
            validate_ifname(&member.name)?;
            if member.weight == 0 || member.weight > 256 {
                return Err(NetCfgError::validation(
                    "weight",
                    format!("weight {} for {} is out of range 1-256", member.weight, member.name),
                ));
            }
            if !seen.insert(member.name.as_str()) {
                return Err(NetCfgError::validation(
                    "members",
                    format!("{} is listed twice", member.name),
                ));
            }
        }
        Ok(())
    }
}

/// UPnP port-mapping service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpnpSettings {
    pub enabled: bool,
    pub external_interface: String,
    pub internal_interface: String,
    #[serde(default = "default_true")]
    pub secure_mode: bool,
}

impl Default for UpnpSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            external_interface: "eth0".to_string(),
            internal_interface: "br0".to_string(),
            secure_mode: true,
        }
    }
}

/// Egress/ingress rate limiting settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficShapingSettings {
    pub enabled: bool,
    pub interface: String,
    #[serde(default)]
    pub download_kbps: u32,
    #[serde(default)]
    pub upload_kbps: u32,
}

impl Default for TrafficShapingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interface: "eth0".to_string(),
            download_kbps: 0,
            upload_kbps: 0,
        }
    }
}
