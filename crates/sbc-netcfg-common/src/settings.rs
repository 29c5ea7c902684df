//! Engine settings.
//!
//! Loads netcfg settings from a YAML file with defaults for every field.
//! Default location: /etc/routersbc/netcfg.yaml
//!
//! Environment overrides:
//! - `NETCFG_DB`: intent store path
//! - `NETCFG_COMMAND_TIMEOUT`: external command timeout in seconds

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NetCfgError, NetCfgResult};
use crate::model::LeaseTime;

/// Default settings file location.
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/routersbc/netcfg.yaml";

/// Environment variable overriding the intent store path.
pub const ENV_DB_PATH: &str = "NETCFG_DB";

/// Environment variable overriding the command timeout.
pub const ENV_COMMAND_TIMEOUT: &str = "NETCFG_COMMAND_TIMEOUT";

/// Intent store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

/// External command configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Seconds before a running command is killed
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

/// Canonical artifact and state paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_netplan_dir")]
    pub netplan_dir: PathBuf,
    #[serde(default = "default_netplan_file")]
    pub netplan_file: PathBuf,
    #[serde(default = "default_interfaces_file")]
    pub interfaces_file: PathBuf,
    #[serde(default = "default_nftables_conf")]
    pub nftables_conf: PathBuf,
    #[serde(default = "default_iptables_rules")]
    pub iptables_rules: PathBuf,
    #[serde(default = "default_dnsmasq_conf")]
    pub dnsmasq_conf: PathBuf,
    #[serde(default = "default_dhcpd_conf")]
    pub dhcpd_conf: PathBuf,
    #[serde(default = "default_dhcpd_defaults")]
    pub dhcpd_defaults: PathBuf,
    #[serde(default = "default_relay_defaults")]
    pub relay_defaults: PathBuf,
    #[serde(default = "default_dhcpd_leases")]
    pub dhcpd_leases: PathBuf,
    #[serde(default = "default_dnsmasq_leases")]
    pub dnsmasq_leases: PathBuf,
    #[serde(default = "default_rt_tables")]
    pub rt_tables: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

/// Defaults applied to DHCP intents that omit them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpDefaults {
    #[serde(default = "default_dhcp_interface")]
    pub interface: String,
    #[serde(default = "default_dhcp_domain")]
    pub domain: String,
    #[serde(default)]
    pub lease_time: LeaseTime,
}

/// Complete netcfg settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub exec: ExecConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub dhcp: DhcpDefaults,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/routersbc/netcfg.db")
}

fn default_command_timeout() -> u64 {
    30
}

fn default_netplan_dir() -> PathBuf {
    PathBuf::from("/etc/netplan")
}

fn default_netplan_file() -> PathBuf {
    PathBuf::from("/etc/netplan/01-router-sbc.yaml")
}

fn default_interfaces_file() -> PathBuf {
    PathBuf::from("/etc/network/interfaces")
}

fn default_nftables_conf() -> PathBuf {
    PathBuf::from("/etc/nftables.conf")
}

fn default_iptables_rules() -> PathBuf {
    PathBuf::from("/etc/iptables/rules.v4")
}

fn default_dnsmasq_conf() -> PathBuf {
    PathBuf::from("/etc/dnsmasq.conf")
}

fn default_dhcpd_conf() -> PathBuf {
    PathBuf::from("/etc/dhcp/dhcpd.conf")
}

fn default_dhcpd_defaults() -> PathBuf {
    PathBuf::from("/etc/default/isc-dhcp-server")
}

fn default_relay_defaults() -> PathBuf {
    PathBuf::from("/etc/default/isc-dhcp-relay")
}

fn default_dhcpd_leases() -> PathBuf {
    PathBuf::from("/var/lib/dhcp/dhcpd.leases")
}

fn default_dnsmasq_leases() -> PathBuf {
    PathBuf::from("/var/lib/dhcp/dnsmasq.leases")
}

fn default_rt_tables() -> PathBuf {
    PathBuf::from("/etc/iproute2/rt_tables")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/routersbc")
}

fn default_dhcp_interface() -> String {
    "br0".to_string()
}

fn default_dhcp_domain() -> String {
    "local".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            netplan_dir: default_netplan_dir(),
            netplan_file: default_netplan_file(),
            interfaces_file: default_interfaces_file(),
            nftables_conf: default_nftables_conf(),
            iptables_rules: default_iptables_rules(),
            dnsmasq_conf: default_dnsmasq_conf(),
            dhcpd_conf: default_dhcpd_conf(),
            dhcpd_defaults: default_dhcpd_defaults(),
            relay_defaults: default_relay_defaults(),
            dhcpd_leases: default_dhcpd_leases(),
            dnsmasq_leases: default_dnsmasq_leases(),
            rt_tables: default_rt_tables(),
            state_dir: default_state_dir(),
        }
    }
}

impl Default for DhcpDefaults {
    fn default() -> Self {
        Self {
            interface: default_dhcp_interface(),
            domain: default_dhcp_domain(),
            lease_time: LeaseTime::default(),
        }
    }
}

impl PathsConfig {
    /// Rebases every absolute path under `root`.
    pub fn rebased(&self, root: &Path) -> Self {
        let rebase = |p: &PathBuf| root.join(p.strip_prefix("/").unwrap_or(p));
        Self {
            netplan_dir: rebase(&self.netplan_dir),
            netplan_file: rebase(&self.netplan_file),
            interfaces_file: rebase(&self.interfaces_file),
            nftables_conf: rebase(&self.nftables_conf),
            iptables_rules: rebase(&self.iptables_rules),
            dnsmasq_conf: rebase(&self.dnsmasq_conf),
            dhcpd_conf: rebase(&self.dhcpd_conf),
            dhcpd_defaults: rebase(&self.dhcpd_defaults),
            relay_defaults: rebase(&self.relay_defaults),
            dhcpd_leases: rebase(&self.dhcpd_leases),
            dnsmasq_leases: rebase(&self.dnsmasq_leases),
            rt_tables: rebase(&self.rt_tables),
            state_dir: rebase(&self.state_dir),
        }
    }
}

impl Settings {
    /// Load settings from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> NetCfgResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let settings: Settings = serde_yaml::from_str(&content).map_err(|e| {
                    NetCfgError::parse_failure(path.display().to_string(), e.to_string())
                })?;
                settings.validate()?;
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Settings file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(NetCfgError::io(path, e)),
        }
    }

    /// Load from the default location, then apply environment overrides
    pub fn load() -> NetCfgResult<Self> {
        let mut settings = Self::load_or_default(DEFAULT_SETTINGS_PATH)?;
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    /// Applies `NETCFG_DB` and `NETCFG_COMMAND_TIMEOUT` when set.
    pub fn apply_env_overrides(&mut self) -> NetCfgResult<()> {
        if let Ok(db) = std::env::var(ENV_DB_PATH) {
            if !db.is_empty() {
                self.database.path = PathBuf::from(db);
            }
        }
        if let Ok(timeout) = std::env::var(ENV_COMMAND_TIMEOUT) {
            self.exec.command_timeout_secs = timeout.trim().parse().map_err(|_| {
                NetCfgError::validation(ENV_COMMAND_TIMEOUT, format!("{:?} is not a number", timeout))
            })?;
        }
        self.validate()
    }

    /// Settings whose host paths all live under `root`, for sandboxed runs.
    pub fn rooted_at(root: &Path) -> Self {
        let defaults = Self::default();
        Self {
            database: DatabaseConfig {
                path: root.join("netcfg.db"),
            },
            paths: defaults.paths.rebased(root),
            ..defaults
        }
    }

    /// Get command timeout as Duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.exec.command_timeout_secs)
    }

    /// Validate settings
    pub fn validate(&self) -> NetCfgResult<()> {
        if self.exec.command_timeout_secs == 0 {
            return Err(NetCfgError::validation(
                "command_timeout_secs",
                "must be > 0",
            ));
        }
        if self.dhcp.interface.is_empty() {
            return Err(NetCfgError::validation("dhcp.interface", "must not be empty"));
        }
        Ok(())
    }
}
