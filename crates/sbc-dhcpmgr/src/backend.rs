//! DHCP backend selection.

use async_trait::async_trait;

use sbc_netcfg_common::model::{DhcpConfig, DhcpMode};
use sbc_netcfg_common::settings::Settings;
use sbc_netcfg_common::shell::{argv, HostExecutor, SYSTEMCTL_CMD};
use sbc_netcfg_common::{Artifact, Backend, DhcpBackendKind, NetCfgResult, ParseOutcome};

use crate::dnsmasq::DnsmasqBackend;
use crate::iscdhcp::IscDhcpBackend;
use crate::relay::RelayBackend;
use crate::tables::{DHCPD_SERVICE, RELAY_SERVICE};

/// Stops the ISC services; owns no files.
#[derive(Debug, Clone, Default)]
pub struct DisabledBackend;

#[async_trait]
impl Backend for DisabledBackend {
    type Intent = DhcpConfig;
    type State = DhcpConfig;
    type Kind = DhcpBackendKind;

    fn kind(&self) -> DhcpBackendKind {
        DhcpBackendKind::Disabled
    }

    fn parse(&self, _text: &str) -> NetCfgResult<ParseOutcome<DhcpConfig>> {
        let mut config = DhcpConfig::default();
        config.settings.mode = DhcpMode::Disabled;
        Ok(ParseOutcome::new(config))
    }

    async fn read_live(&self, _exec: &dyn HostExecutor) -> NetCfgResult<ParseOutcome<DhcpConfig>> {
        self.parse("")
    }

    fn synthesize(&self, _config: &DhcpConfig) -> NetCfgResult<Artifact> {
        let mut artifact = Artifact::new(self.kind().to_string());
        for &service in &[DHCPD_SERVICE, RELAY_SERVICE] {
            artifact = artifact
                .then_run(argv([SYSTEMCTL_CMD, "stop", service]))
                .then_run(argv([SYSTEMCTL_CMD, "disable", service]));
        }
        Ok(artifact)
    }
}

/// The concrete DHCP backend for one service role.
#[derive(Debug, Clone)]
pub enum DhcpBackend {
    Dnsmasq(DnsmasqBackend),
    IscDhcp(IscDhcpBackend),
    Relay(RelayBackend),
    Disabled(DisabledBackend),
}

impl DhcpBackend {
    /// Builds the backend without reading any existing file.
    pub fn for_kind(kind: DhcpBackendKind, settings: &Settings) -> Self {
        let paths = &settings.paths;
        match kind {
            DhcpBackendKind::IntegratedResolver => {
                Self::Dnsmasq(DnsmasqBackend::new(&paths.dnsmasq_conf))
            }
            DhcpBackendKind::StandaloneServer => {
                Self::IscDhcp(IscDhcpBackend::new(&paths.dhcpd_conf, &paths.dhcpd_defaults))
            }
            DhcpBackendKind::Relay => Self::Relay(RelayBackend::new(&paths.relay_defaults)),
            DhcpBackendKind::Disabled => Self::Disabled(DisabledBackend),
        }
    }

    /// Builds the backend for rendering, loading dnsmasq's shared file first.
    pub async fn load(kind: DhcpBackendKind, settings: &Settings) -> NetCfgResult<Self> {
        match kind {
            DhcpBackendKind::IntegratedResolver => Ok(Self::Dnsmasq(
                DnsmasqBackend::load(&settings.paths.dnsmasq_conf).await?,
            )),
            other => Ok(Self::for_kind(other, settings)),
        }
    }
}

#[async_trait]
impl Backend for DhcpBackend {
    type Intent = DhcpConfig;
    type State = DhcpConfig;
    type Kind = DhcpBackendKind;

    fn kind(&self) -> DhcpBackendKind {
        match self {
            Self::Dnsmasq(b) => b.kind(),
            Self::IscDhcp(b) => b.kind(),
            Self::Relay(b) => b.kind(),
            Self::Disabled(b) => b.kind(),
        }
    }

    fn parse(&self, text: &str) -> NetCfgResult<ParseOutcome<DhcpConfig>> {
        match self {
            Self::Dnsmasq(b) => b.parse(text),
            Self::IscDhcp(b) => b.parse(text),
            Self::Relay(b) => b.parse(text),
            Self::Disabled(b) => b.parse(text),
        }
    }

    async fn read_live(&self, exec: &dyn HostExecutor) -> NetCfgResult<ParseOutcome<DhcpConfig>> {
        match self {
            Self::Dnsmasq(b) => b.read_live(exec).await,
            Self::IscDhcp(b) => b.read_live(exec).await,
            Self::Relay(b) => b.read_live(exec).await,
            Self::Disabled(b) => b.read_live(exec).await,
        }
    }

    fn synthesize(&self, config: &DhcpConfig) -> NetCfgResult<Artifact> {
        match self {
            Self::Dnsmasq(b) => b.synthesize(config),
            Self::IscDhcp(b) => b.synthesize(config),
            Self::Relay(b) => b.synthesize(config),
            Self::Disabled(b) => b.synthesize(config),
        }
    }
}
