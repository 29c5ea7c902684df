//! ISC dhcpd backend: `dhcpd.conf` plus the `INTERFACESv4` defaults file.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;

use sbc_netcfg_common::backend::read_native_file;
use sbc_netcfg_common::model::{
    normalize_mac, DhcpConfig, DhcpMode, DhcpPoolIntent, DhcpReservationIntent, LeaseTime,
};
use sbc_netcfg_common::shell::{argv, HostExecutor, DHCPD_CMD, SERVICE_CMD, SYSTEMCTL_CMD};
use sbc_netcfg_common::{
    Artifact, Backend, DhcpBackendKind, NetCfgError, NetCfgResult, ParseOutcome,
};

use crate::isc_syntax::{parse_statements, Statement};
use crate::tables::{
    DHCPD_SERVICE, ISC_HEADER, ISC_HOST_PREFIX, ISC_IGNORED_GLOBALS, RELAY_SERVICE,
};

const INDENT: &str = "    ";

/// Host block name used when a reservation has no hostname.
pub fn derived_host_name(mac: &str) -> String {
    format!("{}{}", ISC_HOST_PREFIX, mac.replace(':', ""))
}

fn is_isc_option_name(key: &str) -> bool {
    !key.is_empty()
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !key.chars().all(|c| c.is_ascii_digit())
}

fn lease_secs(lease: LeaseTime) -> u64 {
    lease.as_secs().min(u64::from(u32::MAX))
}

/// Renders `dhcpd.conf` for a server-mode config.
///
/// Returns the text and warnings for options ISC cannot express.
pub fn render_dhcpd_conf(
    pool: &DhcpPoolIntent,
    reservations: &[DhcpReservationIntent],
) -> NetCfgResult<(String, Vec<String>)> {
    let subnet = pool.subnet()?;
    let mut warnings = Vec::new();
    let mut out = String::new();

    let default_lease = lease_secs(pool.lease_time);
    let max_lease = default_lease.saturating_mul(2).min(u64::from(u32::MAX));

    out.push_str(ISC_HEADER);
    out.push('\n');
    out.push_str(&format!("default-lease-time {};\n", default_lease));
    out.push_str(&format!("max-lease-time {};\n", max_lease));
    if pool.authoritative {
        out.push_str("authoritative;\n");
    }
    out.push('\n');

    out.push_str(&format!(
        "subnet {} netmask {} {{\n",
        subnet.network(),
        subnet.mask()
    ));
    out.push_str(&format!("{}range {} {};\n", INDENT, pool.range_start, pool.range_end));
    if let Some(router) = pool.router {
        out.push_str(&format!("{}option routers {};\n", INDENT, router));
    }
    if !pool.dns_servers.is_empty() {
        let servers: Vec<String> = pool.dns_servers.iter().map(|s| s.to_string()).collect();
        out.push_str(&format!(
            "{}option domain-name-servers {};\n",
            INDENT,
            servers.join(", ")
        ));
    }
    if let Some(domain) = &pool.domain {
        out.push_str(&format!("{}option domain-name \"{}\";\n", INDENT, domain));
    }
    for (key, value) in &pool.options {
        if is_isc_option_name(key) {
            out.push_str(&format!("{}option {} {};\n", INDENT, key, value));
        } else {
            warnings.push(format!("DHCP option {} has no ISC dhcpd name, not rendered", key));
        }
    }
    out.push_str("}\n");

    for r in reservations {
        let name = r
            .hostname
            .clone()
            .unwrap_or_else(|| derived_host_name(&r.mac));
        out.push('\n');
        out.push_str(&format!("host {} {{\n", name));
        out.push_str(&format!("{}hardware ethernet {};\n", INDENT, r.mac));
        out.push_str(&format!("{}fixed-address {};\n", INDENT, r.ip));
        out.push_str("}\n");
    }

    Ok((out, warnings))
}

/// Renders `/etc/default/isc-dhcp-server`.
pub fn render_defaults(interfaces: &[&str]) -> String {
    format!(
        "{}\nINTERFACESv4=\"{}\"\nINTERFACESv6=\"\"\n",
        ISC_HEADER,
        interfaces.join(" ")
    )
}

/// Reads a `KEY="a b c"` value from a shell-style defaults file.
pub fn defaults_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines().find_map(|line| {
        let (k, v) = line.trim().split_once('=')?;
        (k.trim() == key).then(|| v.trim().trim_matches('"'))
    })
}

#[derive(Default)]
struct Globals {
    lease: Option<LeaseTime>,
    authoritative: bool,
    domain: Option<String>,
    dns_servers: Vec<Ipv4Addr>,
}

fn parse_lease_secs(arg: Option<&String>) -> Option<LeaseTime> {
    let secs: u64 = arg?.parse().ok()?;
    if secs == 0 {
        None
    } else if secs >= u64::from(u32::MAX) {
        Some(LeaseTime::Infinite)
    } else {
        Some(LeaseTime::Seconds(secs))
    }
}

fn parse_addrs(words: &[String]) -> Vec<Ipv4Addr> {
    words.iter().filter_map(|w| w.parse().ok()).collect()
}

fn parse_host(stmt: &Statement, outcome: &mut ParseOutcome<DhcpConfig>) {
    let name = stmt.args().first().cloned().unwrap_or_default();
    let mut mac = None;
    let mut ip = None;
    let mut hostname = None;

    for inner in stmt.block.iter().flatten() {
        if inner.starts_with(&["hardware", "ethernet"]) {
            mac = inner.words.get(2).and_then(|m| normalize_mac(m).ok());
        } else if inner.keyword() == "fixed-address" {
            ip = inner.args().first().and_then(|a| a.parse::<Ipv4Addr>().ok());
        } else if inner.starts_with(&["option", "host-name"]) {
            hostname = inner.words.get(2).cloned();
        }
    }

    let (mac, ip) = match (mac, ip) {
        (Some(m), Some(i)) => (m, i),
        _ => {
            outcome.warn(format!(
                "line {}: host {} lacks an ethernet address or IPv4 fixed-address",
                stmt.line, name
            ));
            return;
        }
    };
    let hostname = hostname.or_else(|| (name != derived_host_name(&mac)).then_some(name));

    match DhcpReservationIntent::new(&mac, ip, hostname.as_deref()) {
        Ok(r) => {
            let reservations = &mut outcome.records.reservations;
            if let Some(slot) = reservations.iter_mut().find(|e| e.mac == r.mac) {
                *slot = r;
            } else {
                reservations.push(r);
            }
        }
        Err(e) => outcome.warn(format!("line {}: {}", stmt.line, e)),
    }
}

fn parse_subnet(stmt: &Statement, globals: &Globals, outcome: &mut ParseOutcome<DhcpConfig>) {
    let netmask = match stmt.words.as_slice() {
        [_, _, kw, mask] if kw == "netmask" => mask.parse::<Ipv4Addr>().ok(),
        _ => None,
    };
    let Some(netmask) = netmask else {
        outcome.warn(format!("line {}: malformed subnet declaration", stmt.line));
        return;
    };

    let mut range: Option<(Ipv4Addr, Ipv4Addr)> = None;
    let mut router: Option<Ipv4Addr> = None;
    let mut dns_servers = globals.dns_servers.clone();
    let mut domain = globals.domain.clone();
    let mut options = std::collections::BTreeMap::new();
    let mut hosts = Vec::new();

    for inner in stmt.block.iter().flatten() {
        match inner.keyword() {
            "range" => {
                let addrs = parse_addrs(inner.args());
                match (range, addrs.as_slice()) {
                    (None, [start, end]) => range = Some((*start, *end)),
                    (None, [single]) => range = Some((*single, *single)),
                    (Some(_), _) => outcome.warn(format!(
                        "line {}: ignoring additional range",
                        inner.line
                    )),
                    _ => outcome.warn(format!("line {}: malformed range", inner.line)),
                }
            }
            "option" => {
                let args = inner.args();
                let values = args.get(1..).unwrap_or_default();
                match args.first().map(String::as_str) {
                    Some("routers") => router = values.first().and_then(|v| v.parse().ok()),
                    Some("domain-name-servers") => dns_servers = parse_addrs(values),
                    Some("domain-name") => domain = values.first().cloned(),
                    Some("subnet-mask") => {}
                    Some(key) => {
                        options.insert(key.to_string(), values.join(", "));
                    }
                    None => {}
                }
            }
            "host" => hosts.push(inner),
            "default-lease-time" | "max-lease-time" => {}
            other => outcome.warn(format!(
                "line {}: unsupported subnet statement {}",
                inner.line, other
            )),
        }
    }

    for host in hosts {
        parse_host(host, outcome);
    }

    let Some((start, end)) = range else {
        return;
    };
    if outcome.records.settings.pool.is_some() {
        outcome.warn(format!(
            "line {}: only the first subnet with a range is managed",
            stmt.line
        ));
        return;
    }

    let mut pool = DhcpPoolIntent::new("", start, end);
    pool.netmask = Some(netmask);
    pool.lease_time = globals.lease.unwrap_or_default();
    pool.authoritative = globals.authoritative;
    pool.router = router;
    pool.dns_servers = dns_servers;
    pool.domain = domain;
    pool.options = options;
    outcome.records.settings.mode = DhcpMode::Server;
    outcome.records.settings.pool = Some(pool);
}

/// Parses `dhcpd.conf`.
///
/// The pool's interface is left empty; it lives in the defaults file.
pub fn parse_dhcpd_conf(text: &str) -> NetCfgResult<ParseOutcome<DhcpConfig>> {
    let statements =
        parse_statements(text).map_err(|e| NetCfgError::parse_failure("dhcpd.conf", e))?;
    let mut outcome = ParseOutcome::new(DhcpConfig::default());
    outcome.records.settings.mode = DhcpMode::Disabled;

    let mut globals = Globals::default();
    let mut subnets = Vec::new();
    let mut hosts = Vec::new();

    let mut pending: VecDeque<&Statement> = statements.iter().collect();
    while let Some(stmt) = pending.pop_front() {
        match stmt.keyword() {
            "default-lease-time" => globals.lease = parse_lease_secs(stmt.args().first()),
            "authoritative" => globals.authoritative = true,
            "not" if stmt.starts_with(&["not", "authoritative"]) => globals.authoritative = false,
            "option" => {
                let args = stmt.args();
                let values = args.get(1..).unwrap_or_default();
                match args.first().map(String::as_str) {
                    Some("domain-name") => globals.domain = values.first().cloned(),
                    Some("domain-name-servers") => globals.dns_servers = parse_addrs(values),
                    _ => outcome.warn(format!(
                        "line {}: global option {} not managed",
                        stmt.line,
                        args.first().map(String::as_str).unwrap_or_default()
                    )),
                }
            }
            "subnet" if stmt.block.is_some() => subnets.push(stmt),
            "host" if stmt.block.is_some() => hosts.push(stmt),
            "group" => {
                for inner in stmt.block.iter().flatten().rev() {
                    pending.push_front(inner);
                }
            }
            kw if ISC_IGNORED_GLOBALS.contains(&kw) => {}
            other => outcome.warn(format!(
                "line {}: unsupported statement {}",
                stmt.line, other
            )),
        }
    }

    for subnet in subnets {
        parse_subnet(subnet, &globals, &mut outcome);
    }
    for host in hosts {
        parse_host(host, &mut outcome);
    }
    Ok(outcome)
}

/// ISC dhcpd backend.
#[derive(Debug, Clone)]
pub struct IscDhcpBackend {
    conf: PathBuf,
    defaults: PathBuf,
}

impl IscDhcpBackend {
    pub fn new(conf: impl Into<PathBuf>, defaults: impl Into<PathBuf>) -> Self {
        Self {
            conf: conf.into(),
            defaults: defaults.into(),
        }
    }
}

#[async_trait]
impl Backend for IscDhcpBackend {
    type Intent = DhcpConfig;
    type State = DhcpConfig;
    type Kind = DhcpBackendKind;

    fn kind(&self) -> DhcpBackendKind {
        DhcpBackendKind::StandaloneServer
    }

    fn parse(&self, text: &str) -> NetCfgResult<ParseOutcome<DhcpConfig>> {
        parse_dhcpd_conf(text)
    }

    async fn read_live(&self, _exec: &dyn HostExecutor) -> NetCfgResult<ParseOutcome<DhcpConfig>> {
        let conf = read_native_file(&self.conf).await?;
        let defaults = read_native_file(&self.defaults).await?;
        let mut outcome = self.parse(&conf)?;

        let interface = defaults_value(&defaults, "INTERFACESv4")
            .and_then(|v| v.split_whitespace().next())
            .map(str::to_string);
        if let Some(pool) = outcome.records.settings.pool.as_mut() {
            match interface {
                Some(intf) => pool.interface = intf,
                None => outcome.warnings.push(format!(
                    "{} does not name an interface",
                    self.defaults.display()
                )),
            }
        }
        Ok(outcome)
    }

    fn synthesize(&self, config: &DhcpConfig) -> NetCfgResult<Artifact> {
        let pool = match (&config.settings.mode, &config.settings.pool) {
            (DhcpMode::Server, Some(pool)) => pool,
            _ => {
                return Err(NetCfgError::validation(
                    "pool",
                    "ISC dhcpd renders server mode with a pool only",
                ))
            }
        };

        let (text, warnings) = render_dhcpd_conf(pool, &config.reservations)?;
        let conf = self.conf.display().to_string();
        let mut artifact = Artifact::new(self.kind().to_string())
            .with_file(&self.conf, text)
            .with_file(&self.defaults, render_defaults(&[pool.interface.as_str()]))
            .validate_with(argv([DHCPD_CMD, "-t", "-cf", conf.as_str()]))
            .reload_with(argv([SYSTEMCTL_CMD, "restart", DHCPD_SERVICE]))
            .reload_with(argv([SERVICE_CMD, DHCPD_SERVICE, "restart"]))
            .then_run(argv([SYSTEMCTL_CMD, "enable", DHCPD_SERVICE]))
            .then_run(argv([SYSTEMCTL_CMD, "stop", RELAY_SERVICE]));
        for warning in warnings {
            artifact = artifact.with_warning(warning);
        }
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sbc_netcfg_common::model::DhcpSettings;

    fn lan_config() -> DhcpConfig {
        let mut pool = DhcpPoolIntent::new(
            "br0",
            Ipv4Addr::new(192, 168, 1, 100),
            Ipv4Addr::new(192, 168, 1, 200),
        );
        pool.netmask = Some(Ipv4Addr::new(255, 255, 255, 0));
        pool.router = Some(Ipv4Addr::new(192, 168, 1, 1));
        pool.dns_servers = vec![Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(9, 9, 9, 9)];
        pool.domain = Some("local".to_string());
        DhcpConfig {
            settings: DhcpSettings {
                mode: DhcpMode::Server,
                pool: Some(pool),
                ..Default::default()
            },
            reservations: vec![
                DhcpReservationIntent::new(
                    "aa:bb:cc:dd:ee:01",
                    Ipv4Addr::new(192, 168, 1, 50),
                    Some("nas"),
                )
                .unwrap(),
                DhcpReservationIntent::new("aa:bb:cc:dd:ee:02", Ipv4Addr::new(192, 168, 1, 51), None)
                    .unwrap(),
            ],
        }
    }

    #[test]
    fn test_render_dhcpd_conf() {
        let config = lan_config();
        let (text, warnings) =
            render_dhcpd_conf(config.settings.pool.as_ref().unwrap(), &config.reservations).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(
            text,
            format!(
                "{}\n{}",
                ISC_HEADER,
                r#"default-lease-time 86400;
max-lease-time 172800;
authoritative;

subnet 192.168.1.0 netmask 255.255.255.0 {
    range 192.168.1.100 192.168.1.200;
    option routers 192.168.1.1;
    option domain-name-servers 192.168.1.1, 9.9.9.9;
    option domain-name "local";
}

host nas {
    hardware ethernet aa:bb:cc:dd:ee:01;
    fixed-address 192.168.1.50;
}

host res-aabbccddee02 {
    hardware ethernet aa:bb:cc:dd:ee:02;
    fixed-address 192.168.1.51;
}
"#
            )
        );
    }

    #[test]
    fn test_round_trip_without_interface() {
        let config = lan_config();
        let (text, _) =
            render_dhcpd_conf(config.settings.pool.as_ref().unwrap(), &config.reservations).unwrap();
        let parsed = parse_dhcpd_conf(&text).unwrap();
        assert!(parsed.warnings.is_empty());

        let mut expected = config;
        if let Some(pool) = expected.settings.pool.as_mut() {
            pool.interface = String::new();
        }
        assert_eq!(parsed.records, expected);
    }

    #[test]
    fn test_parse_hand_written() {
        let text = r#"
ddns-update-style none;
option domain-name "corp.example";
option domain-name-servers 10.0.0.53;
default-lease-time 600;
log-facility local7;
option ntp-servers 10.0.0.1;

subnet 10.0.9.0 netmask 255.255.255.0 {
}

subnet 10.0.0.0 netmask 255.255.255.0 {
    range dynamic-bootp 10.0.0.100 10.0.0.150;
    option routers 10.0.0.1;
    option tftp-server-name "boot";
    filename "pxelinux.0";
    host printer {
        hardware ethernet 00:11:22:33:44:55;
        fixed-address 10.0.0.20;
    }
}

group {
    host laptop {
        hardware ethernet 00:11:22:33:44:66;
    }
}
"#;
        let outcome = parse_dhcpd_conf(text).unwrap();
        let pool = outcome.records.settings.pool.clone().unwrap();
        assert_eq!(pool.range_start, Ipv4Addr::new(10, 0, 0, 100));
        assert_eq!(pool.lease_time, LeaseTime::Seconds(600));
        assert!(!pool.authoritative);
        assert_eq!(pool.domain.as_deref(), Some("corp.example"));
        assert_eq!(pool.dns_servers, vec![Ipv4Addr::new(10, 0, 0, 53)]);
        assert_eq!(pool.options.get("tftp-server-name").map(String::as_str), Some("boot"));
        assert_eq!(outcome.records.reservations.len(), 1);
        assert_eq!(outcome.records.reservations[0].hostname.as_deref(), Some("printer"));

        // global ntp-servers, filename, laptop without fixed-address
        assert_eq!(outcome.warnings.len(), 3);
    }

    #[test]
    fn test_unbalanced_file_is_parse_failure() {
        let err = parse_dhcpd_conf("subnet 10.0.0.0 netmask 255.0.0.0 {\n range 10.0.0.1 10.0.0.9;\n")
            .unwrap_err();
        assert!(matches!(err, NetCfgError::ParseFailure { .. }));
    }

    #[test]
    fn test_synthesize_defaults_file() {
        let backend = IscDhcpBackend::new("/etc/dhcp/dhcpd.conf", "/etc/default/isc-dhcp-server");
        let mut config = lan_config();
        if let Some(pool) = config.settings.pool.as_mut() {
            pool.options.insert("option:ntp-server".to_string(), "10.0.0.1".to_string());
        }
        let artifact = backend.synthesize(&config).unwrap();
        assert_eq!(
            artifact.file(std::path::Path::new("/etc/default/isc-dhcp-server")),
            Some(format!("{}\nINTERFACESv4=\"br0\"\nINTERFACESv6=\"\"\n", ISC_HEADER).as_str())
        );
        assert_eq!(artifact.validate, vec![argv(["dhcpd", "-t", "-cf", "/etc/dhcp/dhcpd.conf"])]);
        assert_eq!(artifact.warnings.len(), 1);

        config.settings.mode = DhcpMode::Relay;
        assert!(backend.synthesize(&config).unwrap_err().is_validation());
    }

    #[test]
    fn test_defaults_value() {
        let text = "# comment\nINTERFACESv4=\"br0 eth2\"\nINTERFACESv6=\"\"\n";
        assert_eq!(defaults_value(text, "INTERFACESv4"), Some("br0 eth2"));
        assert_eq!(defaults_value(text, "INTERFACESv6"), Some(""));
        assert_eq!(defaults_value(text, "OPTIONS"), None);
    }
}
