//! Command line definition for `netcfgd`.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use ipnetwork::{IpNetwork, Ipv4Network};

use sbc_netcfg_common::model::{LeaseTime, PortSpec, Protocol, RuleAction, WanMember};
use sbc_netcfg_common::settings::DEFAULT_SETTINGS_PATH;

/// RouterSBC network configuration engine
#[derive(Debug, Parser)]
#[command(name = "netcfgd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true, subcommand_required = true, arg_required_else_help = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Settings file (YAML)
    #[arg(short = 'c', long, global = true, env = "NETCFG_CONFIG", default_value = DEFAULT_SETTINGS_PATH)]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error); NETCFG_LOG takes precedence
    #[arg(short = 'l', long, global = true, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Probe the host and print the active backend of every subsystem
    Detect,

    /// Declared network interfaces
    #[command(subcommand)]
    Interfaces(InterfaceCommand),

    /// Declared firewall rules
    #[command(subcommand)]
    Firewall(FirewallCommand),

    /// DHCP service, pool and reservations
    #[command(subcommand)]
    Dhcp(DhcpCommand),

    /// Leases handed out by the running DHCP server
    Leases,

    /// Static routes, kernel routes and policy rules
    #[command(subcommand)]
    Routes(RouteCommand),

    /// WAN uplink and multi-WAN load balancing
    #[command(subcommand)]
    Wan(WanCommand),
}

#[derive(Debug, Subcommand)]
pub enum InterfaceCommand {
    /// List declared interfaces
    List,
    /// Show one declared interface
    Show { name: String },
    /// Declare a statically addressed interface
    SetStatic {
        name: String,
        #[arg(long)]
        address: Ipv4Addr,
        #[arg(long)]
        netmask: Ipv4Addr,
        #[arg(long)]
        gateway: Option<Ipv4Addr>,
        #[arg(long, value_delimiter = ',')]
        dns: Vec<IpAddr>,
    },
    /// Declare a DHCP-addressed interface
    SetDhcp {
        name: String,
        #[arg(long, value_delimiter = ',')]
        dns: Vec<IpAddr>,
    },
    /// Remove a declared interface
    Delete { name: String },
    /// Parse what the interface backend currently has configured
    Live,
    /// Import live interfaces and routes that are not declared yet
    Adopt,
    /// Re-render and apply the declared set
    Apply,
}

#[derive(Debug, Subcommand)]
pub enum FirewallCommand {
    /// List declared rules
    List,
    /// Declare a rule
    Add {
        /// Chain (INPUT, FORWARD, OUTPUT, PREROUTING, POSTROUTING)
        chain: String,
        /// accept, drop, reject, masquerade, snat:ADDR or dnat:ADDR[:PORT]
        #[arg(value_parser = parse_action)]
        action: RuleAction,
        #[arg(long)]
        protocol: Option<Protocol>,
        #[arg(long)]
        source: Option<IpNetwork>,
        #[arg(long)]
        destination: Option<IpNetwork>,
        /// Port or range (22, 8000-8080)
        #[arg(long)]
        port: Option<PortSpec>,
        /// Insert at this position instead of appending
        #[arg(long)]
        position: Option<u32>,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Remove a rule by id
    Delete { id: i64 },
    /// Enable a rule by id
    Enable { id: i64 },
    /// Disable a rule by id
    Disable { id: i64 },
    /// Parse the rules the firewall backend currently has loaded
    Live,
    /// Import live rules that are not declared yet
    Adopt,
    /// Re-render and apply the declared rules
    Apply,
}

#[derive(Debug, Subcommand)]
pub enum DhcpCommand {
    /// Show declared settings and reservations
    Show,
    /// Serve a pool (defaults come from the settings file)
    Server {
        #[arg(long)]
        start: Ipv4Addr,
        #[arg(long)]
        end: Ipv4Addr,
        #[arg(long)]
        interface: Option<String>,
        #[arg(long)]
        netmask: Option<Ipv4Addr>,
        /// Lease time (e.g. 12h, 3600, infinite)
        #[arg(long)]
        lease: Option<LeaseTime>,
        #[arg(long)]
        router: Option<Ipv4Addr>,
        #[arg(long, value_delimiter = ',')]
        dns: Vec<Ipv4Addr>,
        #[arg(long)]
        domain: Option<String>,
    },
    /// Relay requests to upstream servers
    Relay {
        #[arg(long, value_delimiter = ',', required = true)]
        servers: Vec<Ipv4Addr>,
        #[arg(long, value_delimiter = ',')]
        interfaces: Vec<String>,
    },
    /// Stop serving DHCP
    Disable,
    /// Reserve an address for a MAC (replaces any reservation for that MAC)
    Reserve {
        mac: String,
        ip: Ipv4Addr,
        #[arg(long)]
        hostname: Option<String>,
    },
    /// Drop the reservation for a MAC
    Unreserve { mac: String },
    /// Parse what the running DHCP backend has configured
    Live,
    /// Re-render and apply the declared configuration
    Apply,
}

#[derive(Debug, Subcommand)]
pub enum RouteCommand {
    /// List declared static routes
    List,
    /// Routes in the kernel main table
    Live,
    /// Routes in one kernel routing table
    Table { id: u32 },
    /// Declare a static route and install it now
    Add {
        /// Destination CIDR or "default"
        #[arg(value_parser = parse_destination)]
        destination: Ipv4Network,
        #[arg(long)]
        via: Option<Ipv4Addr>,
        #[arg(long)]
        dev: Option<String>,
        #[arg(long, default_value_t = 0)]
        metric: u32,
    },
    /// Remove a declared static route
    Delete {
        #[arg(value_parser = parse_destination)]
        destination: Ipv4Network,
    },
    /// Show the kernel default route
    Default,
    /// Replace the kernel default route (not persisted)
    SetDefault {
        gateway: Ipv4Addr,
        #[arg(long)]
        dev: Option<String>,
    },
    /// Default gateway, route counts and UPnP state
    Status,
    /// Add a policy routing rule
    RuleAdd(RuleArgs),
    /// Delete a policy routing rule
    RuleDel(RuleArgs),
    /// Remove every route from a routing table
    Flush { table: u32 },
}

#[derive(Debug, Args)]
pub struct RuleArgs {
    #[arg(long)]
    pub from: Option<Ipv4Network>,
    #[arg(long)]
    pub to: Option<Ipv4Network>,
    #[arg(long)]
    pub iif: Option<String>,
    #[arg(long)]
    pub table: u32,
}

#[derive(Debug, Subcommand)]
pub enum WanCommand {
    /// Show WAN settings
    Show,
    /// Address the uplink by DHCP
    Dhcp {
        interface: String,
        #[arg(long, value_delimiter = ',')]
        dns: Vec<IpAddr>,
    },
    /// Address the uplink statically
    Static {
        interface: String,
        #[arg(long)]
        address: Ipv4Addr,
        #[arg(long)]
        netmask: Ipv4Addr,
        #[arg(long)]
        gateway: Option<Ipv4Addr>,
        #[arg(long, value_delimiter = ',')]
        dns: Vec<IpAddr>,
    },
    /// Show multi-WAN settings
    MultiShow,
    /// Load balance the default route over weighted uplinks
    MultiSet {
        /// Members as NAME[:WEIGHT], in priority order
        #[arg(value_parser = parse_member, required = true)]
        members: Vec<WanMember>,
    },
    /// Stop load balancing
    MultiDisable,
}

/// Parses a firewall action word.
pub fn parse_action(s: &str) -> Result<RuleAction, String> {
    let (word, target) = match s.split_once(':') {
        Some((w, t)) => (w, Some(t)),
        None => (s, None),
    };
    match (word.to_ascii_lowercase().as_str(), target) {
        ("accept", None) => Ok(RuleAction::Accept),
        ("drop", None) => Ok(RuleAction::Drop),
        ("reject", None) => Ok(RuleAction::Reject),
        ("masquerade", None) => Ok(RuleAction::Masquerade),
        ("snat", Some(to)) if !to.is_empty() => Ok(RuleAction::Snat { to: to.to_string() }),
        ("dnat", Some(to)) if !to.is_empty() => Ok(RuleAction::Dnat { to: to.to_string() }),
        _ => Err(format!("unknown action {:?}", s)),
    }
}

/// Parses a route destination, accepting `default`.
pub fn parse_destination(s: &str) -> Result<Ipv4Network, String> {
    if s == "default" {
        return Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).map_err(|e| e.to_string());
    }
    s.parse().map_err(|e| format!("{}: {}", s, e))
}

/// Parses `NAME[:WEIGHT]`.
pub fn parse_member(s: &str) -> Result<WanMember, String> {
    match s.split_once(':') {
        Some((name, weight)) => {
            let weight = weight
                .parse()
                .map_err(|_| format!("weight {:?} is not a number", weight))?;
            Ok(WanMember::new(name, weight))
        }
        None => Ok(WanMember::new(s, 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_route_add() {
        let cli = Cli::try_parse_from([
            "netcfgd", "routes", "add", "10.10.0.0/16", "--via", "192.168.1.1", "--metric", "20",
        ])
        .unwrap();
        match cli.command {
            Command::Routes(RouteCommand::Add {
                destination,
                via,
                dev,
                metric,
            }) => {
                assert_eq!(destination.to_string(), "10.10.0.0/16");
                assert_eq!(via, Some(Ipv4Addr::new(192, 168, 1, 1)));
                assert_eq!(dev, None);
                assert_eq!(metric, 20);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.global.log_level, "info");
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_action("ACCEPT").unwrap(), RuleAction::Accept);
        assert_eq!(
            parse_action("dnat:192.168.1.20:8080").unwrap(),
            RuleAction::Dnat {
                to: "192.168.1.20:8080".to_string()
            }
        );
        assert!(parse_action("snat:").is_err());
        assert!(parse_action("bounce").is_err());

        assert_eq!(parse_destination("default").unwrap().prefix(), 0);
        assert!(parse_destination("10.0.0.0/33").is_err());

        assert_eq!(parse_member("eth1:3").unwrap(), WanMember::new("eth1", 3));
        assert_eq!(parse_member("eth0").unwrap().weight, 1);
        assert!(parse_member("eth0:x").is_err());
    }

    #[test]
    fn test_parse_multi_wan_members() {
        let cli = Cli::try_parse_from(["netcfgd", "wan", "multi-set", "eth0:1", "eth1:3"]).unwrap();
        match cli.command {
            Command::Wan(WanCommand::MultiSet { members }) => {
                assert_eq!(members.len(), 2);
                assert_eq!(members[1].weight, 3);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
