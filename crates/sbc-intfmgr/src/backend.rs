//! Interface backend selection.

use async_trait::async_trait;

use sbc_netcfg_common::model::{InterfaceDeclarations, StaticRouteIntent};
use sbc_netcfg_common::settings::Settings;
use sbc_netcfg_common::shell::HostExecutor;
use sbc_netcfg_common::{Artifact, Backend, InterfaceBackendKind, NetCfgResult, ParseOutcome};

use crate::ifupdown::IfupdownBackend;
use crate::netplan::NetplanBackend;

/// The interface whose configuration a static route is persisted with.
///
/// An explicit device wins; otherwise the declared interface whose static
/// subnet contains the gateway.
pub fn route_owner<'a>(
    decl: &'a InterfaceDeclarations,
    route: &'a StaticRouteIntent,
) -> Option<&'a str> {
    if let Some(dev) = route.interface.as_deref() {
        return decl.interface(dev).map(|i| i.name.as_str());
    }
    let gateway = route.gateway?;
    decl.interfaces
        .iter()
        .find(|i| i.subnet().is_some_and(|net| net.contains(gateway)))
        .map(|i| i.name.as_str())
}

/// The concrete interface backend in use on this host.
#[derive(Debug, Clone)]
pub enum InterfaceBackend {
    Netplan(NetplanBackend),
    Ifupdown(IfupdownBackend),
}

impl InterfaceBackend {
    pub fn for_kind(kind: InterfaceBackendKind, settings: &Settings) -> Self {
        match kind {
            InterfaceBackendKind::DeclarativeManager => Self::Netplan(NetplanBackend::new(
                &settings.paths.netplan_dir,
                &settings.paths.netplan_file,
            )),
            InterfaceBackendKind::LegacyStanzaFile => {
                Self::Ifupdown(IfupdownBackend::new(&settings.paths.interfaces_file))
            }
        }
    }
}

#[async_trait]
impl Backend for InterfaceBackend {
    type Intent = InterfaceDeclarations;
    type State = InterfaceDeclarations;
    type Kind = InterfaceBackendKind;

    fn kind(&self) -> InterfaceBackendKind {
        match self {
            Self::Netplan(b) => b.kind(),
            Self::Ifupdown(b) => b.kind(),
        }
    }

    fn parse(&self, text: &str) -> NetCfgResult<ParseOutcome<InterfaceDeclarations>> {
        match self {
            Self::Netplan(b) => b.parse(text),
            Self::Ifupdown(b) => b.parse(text),
        }
    }

    async fn read_live(
        &self,
        exec: &dyn HostExecutor,
    ) -> NetCfgResult<ParseOutcome<InterfaceDeclarations>> {
        match self {
            Self::Netplan(b) => b.read_live(exec).await,
            Self::Ifupdown(b) => b.read_live(exec).await,
        }
    }

    fn synthesize(&self, decl: &InterfaceDeclarations) -> NetCfgResult<Artifact> {
        match self {
            Self::Netplan(b) => b.synthesize(decl),
            Self::Ifupdown(b) => b.synthesize(decl),
        }
    }
}
