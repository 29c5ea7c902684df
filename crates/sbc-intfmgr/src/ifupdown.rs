//! ifupdown (`/etc/network/interfaces`) backend.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ipnetwork::Ipv4Network;

use sbc_netcfg_common::backend::read_native_file;
use sbc_netcfg_common::model::{
    prefix_to_netmask, AddressingMode, InterfaceDeclarations, InterfaceType,
    NetworkInterfaceIntent, StaticRouteIntent, VlanConfig, WifiConfig,
};
use sbc_netcfg_common::shell::{argv, HostExecutor, SERVICE_CMD, SYSTEMCTL_CMD};
use sbc_netcfg_common::{Artifact, Backend, InterfaceBackendKind, NetCfgResult, ParseOutcome};

use crate::backend::route_owner;
use crate::tables::stanza_keys::*;
use crate::tables::*;

/// Renders and parses Debian interface stanzas.
#[derive(Debug, Clone)]
pub struct IfupdownBackend {
    file: PathBuf,
}

impl IfupdownBackend {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self { file: file.into() }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Renders the full interfaces file.
    pub fn render(&self, decl: &InterfaceDeclarations, warnings: &mut Vec<String>) -> String {
        let mut out = String::new();
        for line in IFUPDOWN_HEADER {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(IFUPDOWN_SOURCE_LINE);
        out.push_str("\n\n");
        let _ = writeln!(out, "auto {}", LOOPBACK);
        let _ = writeln!(out, "iface {} inet loopback", LOOPBACK);

        for intf in &decl.interfaces {
            out.push('\n');
            render_stanza(&mut out, decl, intf);
        }

        for route in &decl.routes {
            if route_owner(decl, route).is_none() {
                warnings.push(format!(
                    "route to {} has no declared owning interface, not persisted",
                    route.destination
                ));
            }
        }
        out
    }
}

fn option(out: &mut String, key: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "{}{} {}", INDENT, key, value);
}

fn render_stanza(out: &mut String, decl: &InterfaceDeclarations, intf: &NetworkInterfaceIntent) {
    if intf.enabled {
        let _ = writeln!(out, "auto {}", intf.name);
    }
    let _ = writeln!(out, "iface {} inet {}", intf.name, intf.mode.as_str());

    if intf.mode == AddressingMode::Static {
        if let Some(address) = intf.address {
            option(out, ADDRESS, address);
        }
        if let Some(netmask) = intf.netmask {
            option(out, NETMASK, netmask);
        }
        if let Some(gateway) = intf.gateway {
            option(out, GATEWAY, gateway);
        }
    }
    if !intf.dns.is_empty() {
        let servers: Vec<String> = intf.dns.iter().map(|d| d.to_string()).collect();
        option(out, DNS_NAMESERVERS, servers.join(" "));
    }

    match intf.kind {
        InterfaceType::Bridge => {
            if intf.bridge_ports.is_empty() {
                option(out, BRIDGE_PORTS, "none");
            } else {
                option(out, BRIDGE_PORTS, intf.bridge_ports.join(" "));
            }
            option(out, BRIDGE_STP, "off");
            option(out, BRIDGE_FD, 0);
        }
        InterfaceType::Vlan => {
            if let Some(vlan) = &intf.vlan {
                option(out, VLAN_RAW_DEVICE, &vlan.link);
            }
        }
        InterfaceType::Wifi => {
            if let Some(wifi) = &intf.wifi {
                option(out, WPA_SSID, &wifi.ssid);
                if let Some(psk) = &wifi.psk {
                    option(out, WPA_PSK, psk);
                }
            }
        }
        InterfaceType::Ethernet | InterfaceType::Vpn => {}
    }

    for route in decl
        .routes
        .iter()
        .filter(|r| route_owner(decl, r) == Some(intf.name.as_str()))
    {
        let args = route.ip_args().join(" ");
        option(out, POST_UP, format!("ip route add {}", args));
        option(out, PRE_DOWN, format!("ip route del {}", args));
    }
}

/// A stanza being accumulated while parsing.
#[derive(Debug, Default)]
struct Stanza {
    name: String,
    mode: Option<AddressingMode>,
    address: Option<Ipv4Addr>,
    netmask: Option<Ipv4Addr>,
    gateway: Option<Ipv4Addr>,
    dns: Vec<IpAddr>,
    bridge_ports: Option<Vec<String>>,
    vlan_raw_device: Option<String>,
    ssid: Option<String>,
    psk: Option<String>,
}

/// Parses the trailing VLAN id out of `eth0.20` or `vlan20`.
fn vlan_id_from_name(name: &str) -> Option<u16> {
    if let Some((_, id)) = name.rsplit_once('.') {
        return id.parse().ok();
    }
    name.strip_prefix("vlan").and_then(|id| id.parse().ok())
}

/// Parses the arguments of `ip route add`.
fn parse_route_args(args: &[&str]) -> Result<StaticRouteIntent, String> {
    let (dest, rest) = args.split_first().ok_or("missing destination")?;
    let destination: Ipv4Network = if *dest == "default" {
        "0.0.0.0/0".parse().map_err(|_| "bad default".to_string())?
    } else {
        dest.parse()
            .map_err(|_| format!("unsupported destination {}", dest))?
    };
    let mut route = StaticRouteIntent {
        destination,
        gateway: None,
        interface: None,
        metric: 0,
    };
    let mut it = rest.iter();
    while let Some(key) = it.next() {
        let value = it.next().ok_or_else(|| format!("{} without value", key))?;
        match *key {
            "via" => {
                route.gateway = Some(
                    value
                        .parse()
                        .map_err(|_| format!("unsupported gateway {}", value))?,
                )
            }
            "dev" => route.interface = Some(value.to_string()),
            "metric" => {
                route.metric = value
                    .parse()
                    .map_err(|_| format!("unsupported metric {}", value))?
            }
            other => return Err(format!("unsupported route keyword {}", other)),
        }
    }
    Ok(route.normalized())
}

fn parse_option(
    stanza: &mut Stanza,
    key: &str,
    values: &[&str],
    routes: &mut Vec<StaticRouteIntent>,
    lineno: usize,
    out_warnings: &mut Vec<String>,
) {
    let mut warn = |msg: String| out_warnings.push(format!("line {}: {}", lineno, msg));
    let first = values.first().copied().unwrap_or_default();

    match key {
        ADDRESS => {
            if let Ok(cidr) = first.parse::<Ipv4Network>() {
                stanza.address = Some(cidr.ip());
                if first.contains('/') {
                    stanza.netmask = prefix_to_netmask(cidr.prefix()).ok();
                }
            } else {
                warn(format!("{}: unsupported address {}", stanza.name, first));
            }
        }
        NETMASK => match first.parse::<Ipv4Addr>() {
            Ok(mask) => stanza.netmask = Some(mask),
            Err(_) => match first.parse::<u8>().map(prefix_to_netmask) {
                Ok(Ok(mask)) => stanza.netmask = Some(mask),
                _ => warn(format!("{}: unsupported netmask {}", stanza.name, first)),
            },
        },
        GATEWAY => match first.parse() {
            Ok(gw) => stanza.gateway = Some(gw),
            Err(_) => warn(format!("{}: unsupported gateway {}", stanza.name, first)),
        },
        DNS_NAMESERVERS | DNS_SERVERS => {
            for value in values {
                match value.parse() {
                    Ok(ip) => stanza.dns.push(ip),
                    Err(_) => warn(format!("{}: unsupported nameserver {}", stanza.name, value)),
                }
            }
        }
        BRIDGE_PORTS => {
            stanza.bridge_ports = Some(if first == "none" {
                Vec::new()
            } else {
                values.iter().map(|v| v.to_string()).collect()
            });
        }
        BRIDGE_STP | BRIDGE_FD => {}
        VLAN_RAW_DEVICE => stanza.vlan_raw_device = Some(first.to_string()),
        WPA_SSID => stanza.ssid = Some(values.join(" ")),
        WPA_PSK => stanza.psk = Some(values.join(" ")),
        UP | POST_UP => match values {
            ["ip", "route", "add", args @ ..] => match parse_route_args(args) {
                Ok(route) => routes.push(route),
                Err(e) => warn(format!("{}: {}", stanza.name, e)),
            },
            _ => warn(format!("{}: unmanaged hook {} {}", stanza.name, key, values.join(" "))),
        },
        PRE_DOWN | DOWN => match values {
            ["ip", "route", "del", ..] => {}
            _ => warn(format!("{}: unmanaged hook {} {}", stanza.name, key, values.join(" "))),
        },
        PRE_UP | POST_DOWN => {
            warn(format!("{}: unmanaged hook {} {}", stanza.name, key, values.join(" ")))
        }
        other => warn(format!("{}: unhandled option {}", stanza.name, other)),
    }
}

fn finish(stanza: Stanza, auto: &HashSet<String>, out: &mut ParseOutcome<InterfaceDeclarations>) {
    let Some(mode) = stanza.mode else {
        return;
    };

    let kind = if stanza.bridge_ports.is_some() {
        InterfaceType::Bridge
    } else if stanza.vlan_raw_device.is_some() {
        InterfaceType::Vlan
    } else if stanza.ssid.is_some() {
        InterfaceType::Wifi
    } else {
        InterfaceType::infer_from_name(&stanza.name)
    };

    let mut intent = NetworkInterfaceIntent::dhcp(stanza.name.as_str()).with_kind(kind);
    intent.mode = mode;
    intent.enabled = auto.contains(&stanza.name);
    if mode == AddressingMode::Static {
        intent.address = stanza.address;
        intent.netmask = stanza.netmask;
        intent.gateway = stanza.gateway;
    }
    intent.dns = stanza.dns;
    intent.bridge_ports = stanza.bridge_ports.unwrap_or_default();

    if kind == InterfaceType::Vlan {
        let link = stanza
            .vlan_raw_device
            .or_else(|| stanza.name.rsplit_once('.').map(|(link, _)| link.to_string()));
        match (vlan_id_from_name(&stanza.name), link) {
            (Some(id), Some(link)) => intent.vlan = Some(VlanConfig { id, link }),
            _ => out.warn(format!("{}: cannot determine VLAN id or link", stanza.name)),
        }
    }
    if let Some(ssid) = stanza.ssid {
        intent.wifi = Some(WifiConfig {
            ssid,
            psk: stanza.psk,
        });
    }

    match intent.validate() {
        Ok(()) => out.records.interfaces.push(intent),
        Err(e) => out.warn(format!("{}: {}", stanza.name, e)),
    }
}

/// Parses an interfaces file.
pub fn parse_interfaces(text: &str) -> ParseOutcome<InterfaceDeclarations> {
    let mut out = ParseOutcome::new(InterfaceDeclarations::default());
    let mut auto: HashSet<String> = HashSet::new();
    let mut stanzas: Vec<Stanza> = Vec::new();
    // None while inside a stanza that is being skipped.
    let mut current: Option<Stanza> = None;
    let mut in_skipped = false;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (keyword, args) = match tokens.split_first() {
            Some((k, a)) => (*k, a),
            None => continue,
        };

        match keyword {
            "auto" | "allow-hotplug" | "allow-auto" => {
                auto.extend(args.iter().map(|a| a.to_string()));
            }
            "source" | "source-directory" => {}
            "iface" => {
                if let Some(done) = current.take() {
                    stanzas.push(done);
                }
                in_skipped = true;
                let [name, family, method] = match args {
                    [n, f, m, ..] => [*n, *f, *m],
                    _ => {
                        out.warn(format!("line {}: malformed iface line", lineno));
                        continue;
                    }
                };
                if name == LOOPBACK {
                    continue;
                }
                if family != "inet" {
                    out.warn(format!("line {}: {} family {} is not managed", lineno, name, family));
                    continue;
                }
                let mode = match method {
                    "static" => AddressingMode::Static,
                    "dhcp" => AddressingMode::Dhcp,
                    other => {
                        out.warn(format!("line {}: {} method {} is not managed", lineno, name, other));
                        continue;
                    }
                };
                in_skipped = false;
                current = Some(Stanza {
                    name: name.to_string(),
                    mode: Some(mode),
                    ..Default::default()
                });
            }
            "mapping" | "rename" => {
                out.warn(format!("line {}: {} is not supported", lineno, keyword));
            }
            key => match current.as_mut() {
                Some(stanza) => parse_option(
                    stanza,
                    key,
                    args,
                    &mut out.records.routes,
                    lineno,
                    &mut out.warnings,
                ),
                None if in_skipped => {}
                None => out.warn(format!("line {}: option {} outside any stanza", lineno, key)),
            },
        }
    }
    if let Some(done) = current.take() {
        stanzas.push(done);
    }

    for stanza in stanzas {
        finish(stanza, &auto, &mut out);
    }
    out
}

#[async_trait]
impl Backend for IfupdownBackend {
    type Intent = InterfaceDeclarations;
    type State = InterfaceDeclarations;
    type Kind = InterfaceBackendKind;

    fn kind(&self) -> InterfaceBackendKind {
        InterfaceBackendKind::LegacyStanzaFile
    }

    fn parse(&self, text: &str) -> NetCfgResult<ParseOutcome<InterfaceDeclarations>> {
        Ok(parse_interfaces(text))
    }

    async fn read_live(
        &self,
        _exec: &dyn HostExecutor,
    ) -> NetCfgResult<ParseOutcome<InterfaceDeclarations>> {
        let text = read_native_file(&self.file).await?;
        Ok(parse_interfaces(&text))
    }

    fn synthesize(&self, decl: &InterfaceDeclarations) -> NetCfgResult<Artifact> {
        let mut warnings = Vec::new();
        let text = self.render(decl, &mut warnings);
        let has_secret = decl
            .interfaces
            .iter()
            .any(|i| i.wifi.as_ref().is_some_and(|w| w.psk.is_some()));

        let artifact = if has_secret {
            Artifact::new("ifupdown").with_private_file(&self.file, text)
        } else {
            Artifact::new("ifupdown").with_file(&self.file, text)
        };
        let mut artifact = artifact
            .reload_with(argv([SYSTEMCTL_CMD, "restart", NETWORKING_SERVICE]))
            .reload_with(argv([SERVICE_CMD, NETWORKING_SERVICE, "restart"]));
        artifact.warnings = warnings;
        Ok(artifact)
    }
}
