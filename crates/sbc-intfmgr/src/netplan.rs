//! netplan (declarative manager) backend.
//!
//! Renders the whole interface set into a single YAML document under
//! `/etc/netplan` and recovers declarations from every `*.yaml` file there.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sbc_netcfg_common::model::{
    prefix_to_netmask, AddressingMode, InterfaceDeclarations, InterfaceType,
    NetworkInterfaceIntent, StaticRouteIntent, VlanConfig, WifiConfig,
};
use sbc_netcfg_common::shell::{argv, HostExecutor, NETPLAN_CMD};
use sbc_netcfg_common::{
    Artifact, Backend, InterfaceBackendKind, NetCfgError, NetCfgResult, ParseOutcome,
};

use crate::backend::route_owner;
use crate::tables::*;

/// Top-level netplan document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetplanDocument {
    pub network: NetplanNetwork,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetplanNetwork {
    #[serde(default = "default_version")]
    pub version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renderer: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ethernets: BTreeMap<String, NetplanDevice>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wifis: BTreeMap<String, NetplanDevice>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bridges: BTreeMap<String, NetplanDevice>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vlans: BTreeMap<String, NetplanDevice>,
    /// Sections this engine does not manage (bonds, tunnels, ...).
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_yaml::Value>,
}

fn default_version() -> u8 {
    NETPLAN_VERSION
}

/// netplan reads YAML 1.1 booleans (`yes`, `no`, `on`, `off`).
fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::Bool(b)) => Ok(Some(b)),
        Some(serde_yaml::Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "y" => Ok(Some(true)),
            "false" | "no" | "off" | "n" => Ok(Some(false)),
            _ => Err(serde::de::Error::custom(format!("invalid boolean {}", s))),
        },
        Some(other) => Err(serde::de::Error::custom(format!(
            "invalid boolean {:?}",
            other
        ))),
    }
}

/// One device entry; fields apply depending on its section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetplanDevice {
    #[serde(
        default,
        deserialize_with = "lenient_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub dhcp4: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<NetplanNameservers>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<NetplanRoute>,
    #[serde(
        rename = "activation-mode",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub activation_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BridgeParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(
        rename = "access-points",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub access_points: BTreeMap<String, AccessPoint>,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetplanNameservers {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetplanRoute {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stp: Option<bool>,
    #[serde(
        rename = "forward-delay",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub forward_delay: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessPoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Renders and parses netplan YAML.
#[derive(Debug, Clone)]
pub struct NetplanBackend {
    dir: PathBuf,
    file: PathBuf,
}

impl NetplanBackend {
    pub fn new(dir: impl Into<PathBuf>, file: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            file: file.into(),
        }
    }

    /// The file this backend owns.
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Builds the netplan document for a declaration set.
    pub fn render_document(
        &self,
        decl: &InterfaceDeclarations,
        warnings: &mut Vec<String>,
    ) -> NetplanDocument {
        let mut network = NetplanNetwork {
            version: NETPLAN_VERSION,
            renderer: Some(NETPLAN_RENDERER.to_string()),
            ..Default::default()
        };

        for intf in &decl.interfaces {
            let mut device = NetplanDevice::default();

            match intf.mode {
                AddressingMode::Dhcp => device.dhcp4 = Some(true),
                AddressingMode::Static => {
                    if let Some(cidr) = intf.cidr() {
                        device.addresses.push(cidr.to_string());
                    }
                    device.gateway4 = intf.gateway.map(|g| g.to_string());
                }
            }
            if !intf.dns.is_empty() {
                device.nameservers = Some(NetplanNameservers {
                    addresses: intf.dns.iter().map(|d| d.to_string()).collect(),
                    search: Vec::new(),
                });
            }
            if !intf.enabled {
                device.activation_mode = Some(NETPLAN_ACTIVATION_OFF.to_string());
            }

            device.routes = decl
                .routes
                .iter()
                .filter(|r| route_owner(decl, r) == Some(intf.name.as_str()))
                .map(render_route)
                .collect();

            let section = match intf.kind {
                InterfaceType::Ethernet => &mut network.ethernets,
                InterfaceType::Wifi => {
                    match &intf.wifi {
                        Some(wifi) => {
                            device.access_points.insert(
                                wifi.ssid.clone(),
                                AccessPoint {
                                    password: wifi.psk.clone(),
                                },
                            );
                        }
                        None => warnings.push(format!(
                            "wifi interface {} has no SSID; netplan will reject it",
                            intf.name
                        )),
                    }
                    &mut network.wifis
                }
                InterfaceType::Bridge => {
                    device.interfaces = intf.bridge_ports.clone();
                    device.parameters = Some(BridgeParameters {
                        stp: Some(false),
                        forward_delay: Some(0),
                    });
                    &mut network.bridges
                }
                InterfaceType::Vlan => {
                    if let Some(vlan) = &intf.vlan {
                        device.id = Some(vlan.id);
                        device.link = Some(vlan.link.clone());
                    }
                    &mut network.vlans
                }
                InterfaceType::Vpn => {
                    warnings.push(format!(
                        "vpn interface {} cannot be expressed in netplan, skipped",
                        intf.name
                    ));
                    continue;
                }
            };
            section.insert(intf.name.clone(), device);
        }

        // Bridge members and VLAN parents must exist as devices.
        let referenced: Vec<String> = decl
            .interfaces
            .iter()
            .flat_map(|i| {
                i.bridge_ports
                    .iter()
                    .cloned()
                    .chain(i.vlan.as_ref().map(|v| v.link.clone()))
            })
            .collect();
        for name in referenced {
            if decl.interface(&name).is_none() && !network.ethernets.contains_key(&name) {
                network.ethernets.insert(name, NetplanDevice::default());
            }
        }

        for route in &decl.routes {
            if route_owner(decl, route).is_none() {
                warnings.push(format!(
                    "route to {} has no declared owning interface, not persisted",
                    route.destination
                ));
            }
        }

        NetplanDocument { network }
    }

    /// Serializes a declaration set to YAML text.
    pub fn render(
        &self,
        decl: &InterfaceDeclarations,
        warnings: &mut Vec<String>,
    ) -> NetCfgResult<String> {
        let doc = self.render_document(decl, warnings);
        let yaml = serde_yaml::to_string(&doc)?;
        Ok(format!("{}{}", NETPLAN_HEADER, yaml))
    }
}

fn render_route(route: &StaticRouteIntent) -> NetplanRoute {
    NetplanRoute {
        to: route.destination_str(),
        via: route.gateway.map(|g| g.to_string()),
        metric: (route.metric > 0).then_some(route.metric),
        scope: route.gateway.is_none().then(|| "link".to_string()),
    }
}

fn parse_route(device: &str, route: &NetplanRoute) -> Result<StaticRouteIntent, String> {
    let destination: Ipv4Network = if route.to == "default" {
        Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).map_err(|e| e.to_string())?
    } else {
        route
            .to
            .parse()
            .map_err(|_| format!("route on {}: unsupported destination {}", device, route.to))?
    };
    let gateway = match &route.via {
        Some(via) => Some(
            via.parse::<Ipv4Addr>()
                .map_err(|_| format!("route on {}: unsupported gateway {}", device, via))?,
        ),
        None => None,
    };
    Ok(StaticRouteIntent {
        destination,
        gateway,
        interface: Some(device.to_string()),
        metric: route.metric.unwrap_or(0),
    }
    .normalized())
}

fn device_to_intent(
    name: &str,
    kind: InterfaceType,
    device: &NetplanDevice,
    out: &mut ParseOutcome<InterfaceDeclarations>,
) -> Option<NetworkInterfaceIntent> {
    for key in device.other.keys() {
        out.warn(format!("{}: unhandled key {}", name, key));
    }

    let mut intent = NetworkInterfaceIntent::dhcp(name).with_kind(kind);
    intent.enabled = device.activation_mode.as_deref() != Some(NETPLAN_ACTIVATION_OFF);

    let mut v4 = device
        .addresses
        .iter()
        .filter_map(|a| match a.parse::<Ipv4Network>() {
            Ok(net) => Some(net),
            Err(_) => {
                if !a.contains(':') {
                    out.warn(format!("{}: unparseable address {}", name, a));
                }
                None
            }
        });

    if device.dhcp4 == Some(true) {
        intent.mode = AddressingMode::Dhcp;
    } else if let Some(cidr) = v4.next() {
        intent.mode = AddressingMode::Static;
        intent.address = Some(cidr.ip());
        intent.netmask = prefix_to_netmask(cidr.prefix()).ok();
        if v4.next().is_some() {
            out.warn(format!("{}: only the first IPv4 address is managed", name));
        }
    } else if kind == InterfaceType::Ethernet {
        // Addressless ethernet entries are bridge members or VLAN parents.
        return None;
    } else {
        intent.mode = AddressingMode::Static;
    }

    if let Some(gw) = &device.gateway4 {
        match gw.parse() {
            Ok(ip) => intent.gateway = Some(ip),
            Err(_) => out.warn(format!("{}: unparseable gateway4 {}", name, gw)),
        }
    }

    if let Some(ns) = &device.nameservers {
        for addr in &ns.addresses {
            match addr.parse::<IpAddr>() {
                Ok(ip) => intent.dns.push(ip),
                Err(_) => out.warn(format!("{}: unparseable nameserver {}", name, addr)),
            }
        }
    }

    for route in &device.routes {
        match parse_route(name, route) {
            Ok(r) if r.is_default() && intent.gateway.is_none() => intent.gateway = r.gateway,
            Ok(r) => out.records.routes.push(r),
            Err(msg) => out.warn(msg),
        }
    }

    match kind {
        InterfaceType::Bridge => intent.bridge_ports = device.interfaces.clone(),
        InterfaceType::Vlan => match (device.id, &device.link) {
            (Some(id), Some(link)) => {
                intent.vlan = Some(VlanConfig {
                    id,
                    link: link.clone(),
                })
            }
            _ => out.warn(format!("{}: vlan without id or link", name)),
        },
        InterfaceType::Wifi => {
            if let Some((ssid, ap)) = device.access_points.iter().next() {
                intent.wifi = Some(WifiConfig {
                    ssid: ssid.clone(),
                    psk: ap.password.clone(),
                });
            }
        }
        InterfaceType::Ethernet | InterfaceType::Vpn => {}
    }

    if let Err(e) = intent.validate() {
        out.warn(format!("{}: {}", name, e));
        return None;
    }
    Some(intent)
}

/// Parses one netplan YAML document.
pub fn parse_netplan(text: &str) -> NetCfgResult<ParseOutcome<InterfaceDeclarations>> {
    let mut out = ParseOutcome::new(InterfaceDeclarations::default());
    if text.trim().is_empty() {
        return Ok(out);
    }

    let doc: NetplanDocument = serde_yaml::from_str(text)
        .map_err(|e| NetCfgError::parse_failure("netplan", e.to_string()))?;
    let network = doc.network;
    if network.version != NETPLAN_VERSION {
        out.warn(format!("unexpected netplan version {}", network.version));
    }
    for key in network.other.keys() {
        out.warn(format!("unmanaged netplan section {}", key));
    }

    let sections = [
        (InterfaceType::Ethernet, &network.ethernets),
        (InterfaceType::Wifi, &network.wifis),
        (InterfaceType::Bridge, &network.bridges),
        (InterfaceType::Vlan, &network.vlans),
    ];
    for (kind, devices) in sections {
        for (name, device) in devices {
            if let Some(intent) = device_to_intent(name, kind, device, &mut out) {
                out.records.interfaces.push(intent);
            }
        }
    }
    Ok(out)
}

/// Later documents override earlier ones per interface, as netplan merges them.
fn merge(into: &mut ParseOutcome<InterfaceDeclarations>, from: ParseOutcome<InterfaceDeclarations>) {
    for intf in from.records.interfaces {
        into.records.interfaces.retain(|i| i.name != intf.name);
        into.records
            .routes
            .retain(|r| r.interface.as_deref() != Some(intf.name.as_str()));
        into.records.interfaces.push(intf);
    }
    into.records.routes.extend(from.records.routes);
    into.warnings.extend(from.warnings);
}

#[async_trait]
impl Backend for NetplanBackend {
    type Intent = InterfaceDeclarations;
    type State = InterfaceDeclarations;
    type Kind = InterfaceBackendKind;

    fn kind(&self) -> InterfaceBackendKind {
        InterfaceBackendKind::DeclarativeManager
    }

    fn parse(&self, text: &str) -> NetCfgResult<ParseOutcome<InterfaceDeclarations>> {
        parse_netplan(text)
    }

    async fn read_live(
        &self,
        _exec: &dyn HostExecutor,
    ) -> NetCfgResult<ParseOutcome<InterfaceDeclarations>> {
        let mut files = Vec::new();
        match tokio::fs::read_dir(&self.dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| NetCfgError::io(&self.dir, e))?
                {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "yaml") {
                        files.push(path);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(NetCfgError::io(&self.dir, e)),
        }
        files.sort();

        let mut merged = ParseOutcome::new(InterfaceDeclarations::default());
        for path in files {
            debug!("Reading netplan file {}", path.display());
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| NetCfgError::io(&path, e))?;
            match parse_netplan(&text) {
                Ok(outcome) => merge(&mut merged, outcome),
                Err(e) => merged.warn(format!("{}: {}", path.display(), e)),
            }
        }
        merged.records.interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(merged)
    }

    fn synthesize(&self, decl: &InterfaceDeclarations) -> NetCfgResult<Artifact> {
        let mut warnings = Vec::new();
        let text = self.render(decl, &mut warnings)?;
        let mut artifact = Artifact::new("netplan")
            .with_private_file(&self.file, text)
            .validate_with(argv([NETPLAN_CMD, "generate"]))
            .reload_with(argv([NETPLAN_CMD, "apply"]));
        artifact.warnings = warnings;
        Ok(artifact)
    }
}
