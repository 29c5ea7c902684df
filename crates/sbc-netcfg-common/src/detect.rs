//! Backend detection.
//!
//! Probes the host once per subsystem and caches the result for the life of
//! the process. [`Detector::refresh`] drops the cache so the next query
//! probes again.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{NetCfgError, NetCfgResult};
use crate::settings::Settings;
use crate::shell::{self, HostExecutor, DHCPD_CMD, DHCRELAY_CMD, DNSMASQ_CMD, IPTABLES_CMD, NETPLAN_CMD, NFT_CMD};

/// Interface configuration backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceBackendKind {
    /// netplan YAML rendered to systemd-networkd.
    DeclarativeManager,
    /// ifupdown `/etc/network/interfaces` stanzas.
    LegacyStanzaFile,
}

/// Packet filter backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FirewallBackendKind {
    NFTables,
    IPTables,
}

/// DHCP service backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DhcpBackendKind {
    /// dnsmasq serving DHCP alongside DNS.
    IntegratedResolver,
    /// ISC dhcpd.
    StandaloneServer,
    /// ISC dhcrelay forwarding to upstream servers.
    Relay,
    /// No DHCP service running.
    Disabled,
}

impl fmt::Display for InterfaceBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InterfaceBackendKind::DeclarativeManager => "netplan",
            InterfaceBackendKind::LegacyStanzaFile => "ifupdown",
        })
    }
}

impl fmt::Display for FirewallBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FirewallBackendKind::NFTables => "nftables",
            FirewallBackendKind::IPTables => "iptables",
        })
    }
}

impl fmt::Display for DhcpBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DhcpBackendKind::IntegratedResolver => "dnsmasq",
            DhcpBackendKind::StandaloneServer => "isc-dhcp-server",
            DhcpBackendKind::Relay => "isc-dhcp-relay",
            DhcpBackendKind::Disabled => "disabled",
        })
    }
}

/// Backends detected so far. A `None` slot has not been probed successfully.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSelection {
    pub interface: Option<InterfaceBackendKind>,
    pub firewall: Option<FirewallBackendKind>,
    pub dhcp: Option<DhcpBackendKind>,
}

/// Selects the active backend for each subsystem.
pub struct Detector {
    exec: Arc<dyn HostExecutor>,
    settings: Arc<Settings>,
    selection: RwLock<BackendSelection>,
}

impl Detector {
    pub fn new(exec: Arc<dyn HostExecutor>, settings: Arc<Settings>) -> Self {
        Self {
            exec,
            settings,
            selection: RwLock::new(BackendSelection::default()),
        }
    }

    /// Snapshot of what has been detected so far.
    pub async fn selection(&self) -> BackendSelection {
        *self.selection.read().await
    }

    /// Forgets every cached selection.
    pub async fn refresh(&self) {
        *self.selection.write().await = BackendSelection::default();
        info!("Backend selection cleared, next query re-probes the host");
    }

    /// Probes every subsystem, filling the cache. Unavailable subsystems stay `None`.
    pub async fn detect_all(&self) -> BackendSelection {
        if let Err(e) = self.interface_backend().await {
            debug!("Interface backend unavailable: {}", e);
        }
        if let Err(e) = self.firewall_backend().await {
            debug!("Firewall backend unavailable: {}", e);
        }
        if let Err(e) = self.dhcp_backend().await {
            debug!("DHCP backend unavailable: {}", e);
        }
        self.selection().await
    }

    /// Cached interface backend, probing on first use.
    pub async fn interface_backend(&self) -> NetCfgResult<InterfaceBackendKind> {
        if let Some(kind) = self.selection.read().await.interface {
            return Ok(kind);
        }
        let kind = self.detect_interface_backend().await?;
        self.selection.write().await.interface = Some(kind);
        Ok(kind)
    }

    /// Cached firewall backend, probing on first use.
    pub async fn firewall_backend(&self) -> NetCfgResult<FirewallBackendKind> {
        if let Some(kind) = self.selection.read().await.firewall {
            return Ok(kind);
        }
        let kind = self.detect_firewall_backend().await?;
        self.selection.write().await.firewall = Some(kind);
        Ok(kind)
    }

    /// Cached running-DHCP backend, probing on first use.
    pub async fn dhcp_backend(&self) -> NetCfgResult<DhcpBackendKind> {
        if let Some(kind) = self.selection.read().await.dhcp {
            return Ok(kind);
        }
        let kind = self.detect_dhcp_backend().await?;
        self.selection.write().await.dhcp = Some(kind);
        Ok(kind)
    }

    /// netplan wins when both its directory and CLI are present.
    pub async fn detect_interface_backend(&self) -> NetCfgResult<InterfaceBackendKind> {
        let paths = &self.settings.paths;
        let kind = if self.exec.path_exists(&paths.netplan_dir)
            && self.exec.resolve_tool(NETPLAN_CMD).is_some()
        {
            InterfaceBackendKind::DeclarativeManager
        } else if self.exec.path_exists(&paths.interfaces_file) {
            InterfaceBackendKind::LegacyStanzaFile
        } else {
            return Err(NetCfgError::backend_unavailable(
                "interface",
                format!(
                    "neither {} with netplan nor {} found",
                    paths.netplan_dir.display(),
                    paths.interfaces_file.display()
                ),
            ));
        };
        info!("Detected interface backend: {}", kind);
        Ok(kind)
    }

    /// nftables wins when `nft` resolves and can list tables.
    pub async fn detect_firewall_backend(&self) -> NetCfgResult<FirewallBackendKind> {
        if self.exec.resolve_tool(NFT_CMD).is_some() {
            match self.exec.exec(&shell::argv([NFT_CMD, "list", "tables"])).await {
                Ok(result) if result.success() => {
                    info!("Detected firewall backend: nftables");
                    return Ok(FirewallBackendKind::NFTables);
                }
                Ok(result) => debug!("nft present but unusable: {}", result.combined_output()),
                Err(e) => debug!("nft probe failed: {}", e),
            }
        }
        if self.exec.resolve_tool(IPTABLES_CMD).is_some() {
            info!("Detected firewall backend: iptables");
            return Ok(FirewallBackendKind::IPTables);
        }
        Err(NetCfgError::backend_unavailable(
            "firewall",
            "neither a working nft nor iptables found on PATH",
        ))
    }

    /// What DHCP service is running right now.
    pub async fn detect_dhcp_backend(&self) -> NetCfgResult<DhcpBackendKind> {
        let exec = self.exec.as_ref();
        let kind = if shell::process_running(exec, DNSMASQ_CMD).await
            && config_has_dhcp_range(&self.settings.paths.dnsmasq_conf).await
        {
            DhcpBackendKind::IntegratedResolver
        } else if shell::process_running(exec, DHCPD_CMD).await {
            DhcpBackendKind::StandaloneServer
        } else if shell::process_running(exec, DHCRELAY_CMD).await {
            DhcpBackendKind::Relay
        } else {
            DhcpBackendKind::Disabled
        };
        info!("Detected running DHCP backend: {}", kind);
        Ok(kind)
    }

    /// Which server to configure when DHCP is being set up fresh.
    pub async fn detect_dhcp_target(&self) -> NetCfgResult<DhcpBackendKind> {
        if self.exec.resolve_tool(DNSMASQ_CMD).is_some() {
            Ok(DhcpBackendKind::IntegratedResolver)
        } else if self.exec.resolve_tool(DHCPD_CMD).is_some() {
            Ok(DhcpBackendKind::StandaloneServer)
        } else {
            Err(NetCfgError::backend_unavailable(
                "dhcp",
                "neither dnsmasq nor dhcpd found on PATH",
            ))
        }
    }

    /// The server backend to render a server-mode configuration with.
    ///
    /// Prefers whatever is already serving, else the install-time preference.
    pub async fn dhcp_server_backend(&self) -> NetCfgResult<DhcpBackendKind> {
        match self.dhcp_backend().await? {
            kind @ (DhcpBackendKind::IntegratedResolver | DhcpBackendKind::StandaloneServer) => {
                Ok(kind)
            }
            DhcpBackendKind::Relay | DhcpBackendKind::Disabled => self.detect_dhcp_target().await,
        }
    }
}

async fn config_has_dhcp_range(path: &Path) -> bool {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .any(|line| line.starts_with("dhcp-range")),
        Err(_) => false,
    }
}
