//! dnsmasq DHCP backend.
//!
//! dnsmasq usually also serves DNS from the same file, so the DHCP
//! directives live in a marked block that is replaced on every apply.
//! Everything outside the block is preserved except stray `dhcp-*`
//! directives, which would conflict with the managed ones.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use sbc_netcfg_common::backend::read_native_file;
use sbc_netcfg_common::model::{
    normalize_mac, DhcpConfig, DhcpMode, DhcpPoolIntent, DhcpReservationIntent, LeaseTime,
};
use sbc_netcfg_common::shell::{argv, HostExecutor, DNSMASQ_CMD, SERVICE_CMD, SYSTEMCTL_CMD};
use sbc_netcfg_common::{Artifact, Backend, DhcpBackendKind, NetCfgResult, ParseOutcome};

use crate::tables::{
    dnsmasq_options, DHCPD_SERVICE, DNSMASQ_BEGIN, DNSMASQ_DHCP_DIRECTIVES, DNSMASQ_END,
    DNSMASQ_SERVICE, RELAY_SERVICE,
};

/// Renders the managed block for `config`.
///
/// Empty unless the config is in server mode with a pool.
pub fn render_block(config: &DhcpConfig) -> Vec<String> {
    let pool = match (&config.settings.mode, &config.settings.pool) {
        (DhcpMode::Server, Some(pool)) => pool,
        _ => return Vec::new(),
    };

    let mut lines = vec![DNSMASQ_BEGIN.to_string()];

    let mut range = format!("dhcp-range={},{}", pool.range_start, pool.range_end);
    if let Some(mask) = pool.netmask {
        range.push_str(&format!(",{}", mask));
    }
    range.push_str(&format!(",{}", pool.lease_time));
    lines.push(range);

    if let Some(domain) = &pool.domain {
        lines.push(format!("dhcp-option={},{}", dnsmasq_options::DOMAIN_NAME, domain));
    }
    if let Some(router) = pool.router {
        lines.push(format!("dhcp-option={},{}", dnsmasq_options::ROUTER, router));
    }
    if !pool.dns_servers.is_empty() {
        let servers: Vec<String> = pool.dns_servers.iter().map(|s| s.to_string()).collect();
        lines.push(format!(
            "dhcp-option={},{}",
            dnsmasq_options::DNS_SERVER,
            servers.join(",")
        ));
    }
    for (key, value) in &pool.options {
        lines.push(format!("dhcp-option={},{}", key, value));
    }

    for r in &config.reservations {
        match &r.hostname {
            Some(host) => lines.push(format!("dhcp-host={},{},{}", r.mac, r.ip, host)),
            None => lines.push(format!("dhcp-host={},{}", r.mac, r.ip)),
        }
    }

    lines.push(format!("interface={}", pool.interface));
    if pool.authoritative {
        lines.push("dhcp-authoritative".to_string());
    }
    lines.push(DNSMASQ_END.to_string());
    lines
}

fn is_dhcp_directive(line: &str) -> bool {
    let key = line.split('=').next().unwrap_or_default().trim();
    DNSMASQ_DHCP_DIRECTIVES.contains(&key)
}

/// Replaces the managed block in `existing` with `block`.
///
/// Unrelated lines keep their order; the block goes at the end.
pub fn merge(existing: &str, block: &[String]) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut in_block = false;

    for line in existing.lines() {
        let trimmed = line.trim();
        if trimmed == DNSMASQ_BEGIN {
            in_block = true;
            continue;
        }
        if in_block {
            if trimmed == DNSMASQ_END {
                in_block = false;
            }
            continue;
        }
        if is_dhcp_directive(trimmed) {
            debug!("Dropping unmanaged dnsmasq directive: {}", trimmed);
            continue;
        }
        kept.push(line);
    }
    while kept.last().is_some_and(|l| l.trim().is_empty()) {
        kept.pop();
    }

    let mut out = String::new();
    for line in &kept {
        out.push_str(line);
        out.push('\n');
    }
    if !block.is_empty() {
        if !kept.is_empty() {
            out.push('\n');
        }
        for line in block {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Strips a leading `tag:`/`set:`/`interface:` qualifier list.
fn strip_tags(fields: &[&str]) -> usize {
    fields
        .iter()
        .take_while(|f| {
            f.starts_with("tag:")
                || f.starts_with("set:")
                || f.starts_with("interface:")
                || f.starts_with("net:")
        })
        .count()
}

#[derive(Default)]
struct PoolFields {
    range: Option<RangeFields>,
    interface: Option<String>,
    authoritative: bool,
    router: Option<Ipv4Addr>,
    dns_servers: Vec<Ipv4Addr>,
    domain: Option<String>,
    options: std::collections::BTreeMap<String, String>,
}

type RangeFields = (Ipv4Addr, Ipv4Addr, Option<Ipv4Addr>, LeaseTime);

fn parse_range(
    value: &str,
    lineno: usize,
    outcome: &mut ParseOutcome<DhcpConfig>,
) -> Option<RangeFields> {
    let fields: Vec<&str> = value.split(',').map(str::trim).collect();
    let rest = &fields[strip_tags(&fields)..];

    let start = rest.first().and_then(|f| f.parse::<Ipv4Addr>().ok());
    let end = rest.get(1).and_then(|f| f.parse::<Ipv4Addr>().ok());
    let (start, end) = match (start, end) {
        (Some(s), Some(e)) => (s, e),
        _ => {
            outcome.warn(format!("line {}: unsupported dhcp-range {}", lineno, value));
            return None;
        }
    };

    let mut netmask = None;
    let mut lease = LeaseTime::default();
    for field in rest.iter().skip(2) {
        if let Ok(mask) = field.parse::<Ipv4Addr>() {
            netmask = Some(mask);
        } else if let Ok(l) = field.parse::<LeaseTime>() {
            lease = l;
        } else {
            outcome.warn(format!("line {}: ignoring dhcp-range field {}", lineno, field));
        }
    }
    Some((start, end, netmask, lease))
}

fn parse_option(value: &str, fields: &mut PoolFields) {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    let parts = &parts[strip_tags(&parts)..];
    let Some((key, values)) = parts.split_first() else {
        return;
    };

    match *key {
        dnsmasq_options::ROUTER | dnsmasq_options::ROUTER_CODE => {
            fields.router = values.first().and_then(|v| v.parse().ok());
        }
        dnsmasq_options::DNS_SERVER | dnsmasq_options::DNS_SERVER_CODE => {
            fields.dns_servers = values.iter().filter_map(|v| v.parse().ok()).collect();
        }
        dnsmasq_options::DOMAIN_NAME | dnsmasq_options::DOMAIN_NAME_CODE => {
            fields.domain = values.first().map(|v| v.to_string());
        }
        _ => {
            fields.options.insert(key.to_string(), values.join(","));
        }
    }
}

fn parse_host(
    value: &str,
    lineno: usize,
    outcome: &mut ParseOutcome<DhcpConfig>,
) -> Option<DhcpReservationIntent> {
    let mut mac = None;
    let mut ip = None;
    let mut hostname = None;

    for field in value.split(',').map(str::trim) {
        if field.is_empty() || (field.contains(':') && strip_tags(&[field]) == 1) {
            continue;
        }
        if let Ok(addr) = field.parse::<Ipv4Addr>() {
            ip = Some(addr);
        } else if let (None, Ok(m)) = (&mac, normalize_mac(field)) {
            mac = Some(m);
        } else if field.starts_with("id:") || field.parse::<LeaseTime>().is_ok() {
            continue;
        } else {
            hostname = Some(field);
        }
    }

    match (mac, ip) {
        (Some(mac), Some(ip)) => match DhcpReservationIntent::new(&mac, ip, hostname) {
            Ok(r) => Some(r),
            Err(e) => {
                outcome.warn(format!("line {}: {}", lineno, e));
                None
            }
        },
        _ => {
            outcome.warn(format!("line {}: dhcp-host without MAC and IPv4 address: {}", lineno, value));
            None
        }
    }
}

/// Parses the DHCP directives of a dnsmasq config.
///
/// DNS and other non-DHCP directives are ignored silently; unsupported
/// `dhcp-*` directives become warnings.
pub fn parse_dnsmasq(text: &str) -> ParseOutcome<DhcpConfig> {
    let mut outcome = ParseOutcome::new(DhcpConfig::default());
    let mut fields = PoolFields::default();
    let mut reservations: Vec<DhcpReservationIntent> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (line, ""),
        };

        match key {
            "dhcp-range" => {
                if fields.range.is_some() {
                    outcome.warn(format!("line {}: ignoring additional dhcp-range", lineno));
                } else {
                    fields.range = parse_range(value, lineno, &mut outcome);
                }
            }
            "dhcp-option" => parse_option(value, &mut fields),
            "dhcp-host" => {
                if let Some(r) = parse_host(value, lineno, &mut outcome) {
                    if let Some(slot) = reservations.iter_mut().find(|e| e.mac == r.mac) {
                        *slot = r;
                    } else {
                        reservations.push(r);
                    }
                }
            }
            "interface" => {
                if fields.interface.is_none() {
                    fields.interface = value.split(',').next().map(|s| s.trim().to_string());
                }
            }
            "domain" => {
                if fields.domain.is_none() {
                    fields.domain = value.split(',').next().map(|s| s.trim().to_string());
                }
            }
            "dhcp-authoritative" => fields.authoritative = true,
            k if k.starts_with("dhcp-") => {
                outcome.warn(format!("line {}: unsupported directive {}", lineno, k));
            }
            _ => {}
        }
    }

    if let Some((start, end, netmask, lease_time)) = fields.range {
        let mut pool = DhcpPoolIntent::new(fields.interface.unwrap_or_default(), start, end);
        pool.netmask = netmask;
        pool.lease_time = lease_time;
        pool.authoritative = fields.authoritative;
        pool.router = fields.router;
        pool.dns_servers = fields.dns_servers;
        pool.domain = fields.domain;
        pool.options = fields.options;
        if pool.interface.is_empty() {
            outcome.warn("dhcp-range without an interface binding");
        }
        outcome.records.settings.mode = DhcpMode::Server;
        outcome.records.settings.pool = Some(pool);
    } else {
        outcome.records.settings.mode = DhcpMode::Disabled;
    }
    outcome.records.reservations = reservations;
    outcome
}

/// dnsmasq backend bound to one config file.
///
/// Rendering merges into `existing`, the file's contents when the backend
/// was loaded.
#[derive(Debug, Clone)]
pub struct DnsmasqBackend {
    conf: PathBuf,
    existing: String,
}

impl DnsmasqBackend {
    pub fn new(conf: impl Into<PathBuf>) -> Self {
        Self {
            conf: conf.into(),
            existing: String::new(),
        }
    }

    /// Reads the current file so rendering preserves unrelated lines.
    pub async fn load(conf: &Path) -> NetCfgResult<Self> {
        let existing = read_native_file(conf).await?;
        Ok(Self::new(conf).with_existing(existing))
    }

    pub fn with_existing(mut self, existing: impl Into<String>) -> Self {
        self.existing = existing.into();
        self
    }

    pub fn conf(&self) -> &Path {
        &self.conf
    }

    /// True when the loaded file carries a managed block.
    pub fn has_managed_block(&self) -> bool {
        self.existing.lines().any(|l| l.trim() == DNSMASQ_BEGIN)
    }

    pub fn render(&self, config: &DhcpConfig) -> String {
        merge(&self.existing, &render_block(config))
    }
}

#[async_trait]
impl Backend for DnsmasqBackend {
    type Intent = DhcpConfig;
    type State = DhcpConfig;
    type Kind = DhcpBackendKind;

    fn kind(&self) -> DhcpBackendKind {
        DhcpBackendKind::IntegratedResolver
    }

    fn parse(&self, text: &str) -> NetCfgResult<ParseOutcome<DhcpConfig>> {
        Ok(parse_dnsmasq(text))
    }

    async fn read_live(&self, _exec: &dyn HostExecutor) -> NetCfgResult<ParseOutcome<DhcpConfig>> {
        let text = read_native_file(&self.conf).await?;
        self.parse(&text)
    }

    fn synthesize(&self, config: &DhcpConfig) -> NetCfgResult<Artifact> {
        let conf_arg = format!("--conf-file={}", self.conf.display());
        let mut artifact = Artifact::new(self.kind().to_string())
            .with_file(&self.conf, self.render(config))
            .validate_with(argv([DNSMASQ_CMD, "--test", conf_arg.as_str()]))
            .reload_with(argv([SYSTEMCTL_CMD, "restart", DNSMASQ_SERVICE]))
            .reload_with(argv([SERVICE_CMD, DNSMASQ_SERVICE, "restart"]));

        if config.settings.mode == DhcpMode::Server {
            for &service in &[DHCPD_SERVICE, RELAY_SERVICE] {
                artifact = artifact.then_run(argv([SYSTEMCTL_CMD, "stop", service]));
            }
        }
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lan_config() -> DhcpConfig {
        let mut pool = DhcpPoolIntent::new(
            "br0",
            Ipv4Addr::new(192, 168, 1, 100),
            Ipv4Addr::new(192, 168, 1, 200),
        );
        pool.domain = Some("local".to_string());
        DhcpConfig {
            settings: sbc_netcfg_common::model::DhcpSettings {
                mode: DhcpMode::Server,
                pool: Some(pool),
                ..Default::default()
            },
            reservations: vec![DhcpReservationIntent::new(
                "AA:BB:CC:DD:EE:01",
                Ipv4Addr::new(192, 168, 1, 50),
                Some("nas"),
            )
            .unwrap()],
        }
    }

    #[test]
    fn test_render_block_order() {
        let block = render_block(&lan_config());
        assert_eq!(
            block,
            vec![
                DNSMASQ_BEGIN,
                "dhcp-range=192.168.1.100,192.168.1.200,24h",
                "dhcp-option=option:domain-name,local",
                "dhcp-host=aa:bb:cc:dd:ee:01,192.168.1.50,nas",
                "interface=br0",
                "dhcp-authoritative",
                DNSMASQ_END,
            ]
        );
    }

    #[test]
    fn test_round_trip() {
        let config = lan_config();
        let backend = DnsmasqBackend::new("/etc/dnsmasq.conf");
        let parsed = backend.parse(&backend.render(&config)).unwrap();
        assert!(parsed.warnings.is_empty());
        assert_eq!(parsed.records, config);
        let pool = parsed.records.settings.pool.unwrap();
        assert_eq!(pool.lease_time, LeaseTime::hours(24));
    }

    #[test]
    fn test_merge_preserves_dns_lines() {
        let existing = "\
# local resolver
server=1.1.1.1
dhcp-range=10.0.0.10,10.0.0.20,1h
cache-size=1000
";
        let first = merge(existing, &render_block(&lan_config()));
        assert!(first.starts_with("# local resolver\nserver=1.1.1.1\ncache-size=1000\n\n"));
        assert!(!first.contains("10.0.0.10"));

        // Re-merging replaces the block instead of stacking a second one.
        let second = merge(&first, &render_block(&lan_config()));
        assert_eq!(first, second);
        assert_eq!(second.matches(DNSMASQ_BEGIN).count(), 1);
    }

    #[test]
    fn test_disabled_strips_block() {
        let rendered = merge("server=1.1.1.1\n", &render_block(&lan_config()));
        let mut disabled = lan_config();
        disabled.settings.mode = DhcpMode::Disabled;
        let stripped = merge(&rendered, &render_block(&disabled));
        assert_eq!(stripped, "server=1.1.1.1\n");
        assert_eq!(parse_dnsmasq(&stripped).records.settings.mode, DhcpMode::Disabled);
    }

    #[test]
    fn test_parse_hand_written() {
        let text = "\
interface=eth1
domain=lab.example,10.1.0.0/24
dhcp-range=set:lan,10.1.0.50,10.1.0.150,255.255.255.0,12h
dhcp-option=3,10.1.0.1
dhcp-option=option:dns-server,10.1.0.1,9.9.9.9
dhcp-option=option:ntp-server,10.1.0.1
dhcp-host=10.1.0.5,00-11-22-33-44-55,printer
dhcp-host=printer2
dhcp-boot=pxelinux.0
";
        let outcome = parse_dnsmasq(text);
        let pool = outcome.records.settings.pool.clone().unwrap();
        assert_eq!(pool.interface, "eth1");
        assert_eq!(pool.domain.as_deref(), Some("lab.example"));
        assert_eq!(pool.netmask, Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(pool.lease_time, LeaseTime::hours(12));
        assert_eq!(pool.router, Some(Ipv4Addr::new(10, 1, 0, 1)));
        assert_eq!(pool.dns_servers.len(), 2);
        assert_eq!(pool.options.get("option:ntp-server").map(String::as_str), Some("10.1.0.1"));
        assert!(!pool.authoritative);

        assert_eq!(outcome.records.reservations.len(), 1);
        assert_eq!(outcome.records.reservations[0].mac, "00:11:22:33:44:55");
        assert_eq!(outcome.records.reservations[0].hostname.as_deref(), Some("printer"));

        // dhcp-host without MAC/IP and the unsupported dhcp-boot
        assert_eq!(outcome.warnings.len(), 2);
    }

    #[test]
    fn test_oversized_lease_time_is_a_warning() {
        let outcome =
            parse_dnsmasq("interface=br0\ndhcp-range=192.168.1.100,192.168.1.200,30000000000000000w\n");
        let pool = outcome.records.settings.pool.unwrap();
        assert_eq!(pool.range_end, Ipv4Addr::new(192, 168, 1, 200));
        assert_eq!(pool.lease_time, LeaseTime::default());
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("30000000000000000w"));

        assert!("30000000000000000w".parse::<LeaseTime>().unwrap_err().is_validation());
        assert_eq!(LeaseTime::hours(u64::MAX), LeaseTime::Seconds(u64::MAX));
    }

    #[test]
    fn test_synthesize_commands() {
        let backend = DnsmasqBackend::new("/etc/dnsmasq.conf");
        let artifact = backend.synthesize(&lan_config()).unwrap();
        assert_eq!(
            artifact.validate,
            vec![argv(["dnsmasq", "--test", "--conf-file=/etc/dnsmasq.conf"])]
        );
        assert_eq!(artifact.reload[0], argv(["systemctl", "restart", "dnsmasq"]));
        assert!(artifact.post.contains(&argv(["systemctl", "stop", "isc-dhcp-server"])));
    }
}
