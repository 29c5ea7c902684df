//! ISC dhcrelay backend: `/etc/default/isc-dhcp-relay`.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;

use sbc_netcfg_common::backend::read_native_file;
use sbc_netcfg_common::model::{DhcpConfig, DhcpMode, DhcpSettings};
use sbc_netcfg_common::shell::{argv, HostExecutor, SERVICE_CMD, SYSTEMCTL_CMD};
use sbc_netcfg_common::{
    Artifact, Backend, DhcpBackendKind, NetCfgError, NetCfgResult, ParseOutcome,
};

use crate::iscdhcp::defaults_value;
use crate::tables::{DHCPD_SERVICE, ISC_HEADER, RELAY_SERVICE};

pub fn render_relay_defaults(settings: &DhcpSettings) -> String {
    let servers: Vec<String> = settings.relay_servers.iter().map(|s| s.to_string()).collect();
    format!(
        "{}\nSERVERS=\"{}\"\nINTERFACES=\"{}\"\nOPTIONS=\"\"\n",
        ISC_HEADER,
        servers.join(" "),
        settings.relay_interfaces.join(" ")
    )
}

pub fn parse_relay_defaults(text: &str) -> ParseOutcome<DhcpConfig> {
    let mut outcome = ParseOutcome::new(DhcpConfig::default());

    let mut servers = Vec::new();
    for word in defaults_value(text, "SERVERS").unwrap_or_default().split_whitespace() {
        match word.parse::<Ipv4Addr>() {
            Ok(addr) => servers.push(addr),
            Err(_) => outcome.warn(format!("relay server {} is not an IPv4 address", word)),
        }
    }
    let interfaces: Vec<String> = defaults_value(text, "INTERFACES")
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();

    if let Some(options) = defaults_value(text, "OPTIONS").filter(|o| !o.is_empty()) {
        outcome.warn(format!("relay OPTIONS \"{}\" not managed", options));
    }

    let settings = &mut outcome.records.settings;
    settings.mode = if servers.is_empty() {
        DhcpMode::Disabled
    } else {
        DhcpMode::Relay
    };
    settings.relay_servers = servers;
    settings.relay_interfaces = interfaces;
    outcome
}

#[derive(Debug, Clone)]
pub struct RelayBackend {
    defaults: PathBuf,
}

impl RelayBackend {
    pub fn new(defaults: impl Into<PathBuf>) -> Self {
        Self {
            defaults: defaults.into(),
        }
    }
}

#[async_trait]
impl Backend for RelayBackend {
    type Intent = DhcpConfig;
    type State = DhcpConfig;
    type Kind = DhcpBackendKind;

    fn kind(&self) -> DhcpBackendKind {
        DhcpBackendKind::Relay
    }

    fn parse(&self, text: &str) -> NetCfgResult<ParseOutcome<DhcpConfig>> {
        Ok(parse_relay_defaults(text))
    }

    async fn read_live(&self, _exec: &dyn HostExecutor) -> NetCfgResult<ParseOutcome<DhcpConfig>> {
        let text = read_native_file(&self.defaults).await?;
        self.parse(&text)
    }

    fn synthesize(&self, config: &DhcpConfig) -> NetCfgResult<Artifact> {
        if config.settings.mode != DhcpMode::Relay {
            return Err(NetCfgError::validation(
                "mode",
                "the relay backend renders relay mode only",
            ));
        }
        Ok(Artifact::new(self.kind().to_string())
            .with_file(&self.defaults, render_relay_defaults(&config.settings))
            .reload_with(argv([SYSTEMCTL_CMD, "restart", RELAY_SERVICE]))
            .reload_with(argv([SERVICE_CMD, RELAY_SERVICE, "restart"]))
            .then_run(argv([SYSTEMCTL_CMD, "enable", RELAY_SERVICE]))
            .then_run(argv([SYSTEMCTL_CMD, "stop", DHCPD_SERVICE]))
            .then_run(argv([SYSTEMCTL_CMD, "disable", DHCPD_SERVICE])))
    }
}
