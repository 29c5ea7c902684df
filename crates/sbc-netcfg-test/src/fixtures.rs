//! Intent fixtures for common router setups
//!
//! Addresses follow one layout: LAN 192.168.1.0/24 with the router at .1 and
//! the upstream gateway at .254, management hosts in 10.0.0.0/24.

use std::net::Ipv4Addr;

use ipnetwork::{IpNetwork, Ipv4Network};

/// LAN subnet every fixture lives in.
pub const LAN_SUBNET: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 0);
pub const LAN_ROUTER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const LAN_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 254);
pub const LAN_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

fn v4_net(addr: Ipv4Addr, prefix: u8) -> Ipv4Network {
    Ipv4Network::new(addr, prefix).expect("fixture prefix is at most 32")
}

/// Common interface fixtures
pub mod interface_fixtures {
    use super::*;
    use sbc_netcfg_common::model::{InterfaceType, NetworkInterfaceIntent};

    /// eth0 at 192.168.1.1/24 via 192.168.1.254
    pub fn lan_static() -> NetworkInterfaceIntent {
        NetworkInterfaceIntent::static_v4("eth0", LAN_ROUTER, LAN_NETMASK).with_gateway(LAN_GATEWAY)
    }

    /// br0 over `ports` at 192.168.1.1/24; br0 is the default DHCP interface
    pub fn lan_bridge(ports: &[&str]) -> NetworkInterfaceIntent {
        let mut intent = NetworkInterfaceIntent::static_v4("br0", LAN_ROUTER, LAN_NETMASK)
            .with_kind(InterfaceType::Bridge);
        intent.bridge_ports = ports.iter().map(|p| p.to_string()).collect();
        intent
    }

    pub fn wan_dhcp(name: &str) -> NetworkInterfaceIntent {
        NetworkInterfaceIntent::dhcp(name)
    }
}

/// Common firewall rule fixtures
pub mod firewall_fixtures {
    use super::*;
    use sbc_netcfg_common::model::{FirewallRuleIntent, PortSpec, Protocol, RuleAction};

    /// SSH from the management subnet
    pub fn ssh_from_mgmt() -> FirewallRuleIntent {
        FirewallRuleIntent::new("INPUT", RuleAction::Accept)
            .with_protocol(Protocol::Tcp)
            .with_source(IpNetwork::V4(v4_net(Ipv4Addr::new(10, 0, 0, 0), 24)))
            .with_port(PortSpec::single(22))
    }

    pub fn drop_input() -> FirewallRuleIntent {
        FirewallRuleIntent::new("INPUT", RuleAction::Drop)
    }

    /// Source NAT for the LAN
    pub fn lan_masquerade() -> FirewallRuleIntent {
        FirewallRuleIntent::new("POSTROUTING", RuleAction::Masquerade)
            .with_source(IpNetwork::V4(v4_net(LAN_SUBNET, 24)))
    }

    /// tcp/8080 on the WAN forwarded to a LAN web server
    pub fn web_port_forward() -> FirewallRuleIntent {
        FirewallRuleIntent::new(
            "PREROUTING",
            RuleAction::Dnat {
                to: "192.168.1.20:80".to_string(),
            },
        )
        .with_protocol(Protocol::Tcp)
        .with_port(PortSpec::single(8080))
    }
}

/// Common DHCP fixtures
pub mod dhcp_fixtures {
    use super::*;
    use sbc_netcfg_common::model::{
        DhcpMode, DhcpPoolIntent, DhcpReservationIntent, DhcpSettings, LeaseTime,
    };
    use sbc_netcfg_common::NetCfgResult;

    /// 192.168.1.100-200 on br0, 24h leases, domain `local`
    pub fn lan_pool() -> DhcpPoolIntent {
        let mut pool = DhcpPoolIntent::new(
            "br0",
            Ipv4Addr::new(192, 168, 1, 100),
            Ipv4Addr::new(192, 168, 1, 200),
        );
        pool.lease_time = LeaseTime::hours(24);
        pool.domain = Some("local".to_string());
        pool
    }

    pub fn lan_server() -> DhcpSettings {
        DhcpSettings {
            mode: DhcpMode::Server,
            pool: Some(lan_pool()),
            ..Default::default()
        }
    }

    pub fn relay_to(server: Ipv4Addr) -> DhcpSettings {
        DhcpSettings {
            mode: DhcpMode::Relay,
            pool: None,
            relay_servers: vec![server],
            relay_interfaces: vec!["br0".to_string()],
        }
    }

    /// Reservation for `mac` at 192.168.1.`last_octet`
    pub fn reservation(
        mac: &str,
        last_octet: u8,
        hostname: Option<&str>,
    ) -> NetCfgResult<DhcpReservationIntent> {
        DhcpReservationIntent::new(mac, Ipv4Addr::new(192, 168, 1, last_octet), hostname)
    }
}

/// Common routing fixtures
pub mod route_fixtures {
    use super::*;
    use sbc_netcfg_common::model::{StaticRouteIntent, WanMember};

    /// 10.10.0.0/16 via a LAN router at 192.168.1.253
    pub fn office_route() -> StaticRouteIntent {
        StaticRouteIntent::via(
            v4_net(Ipv4Addr::new(10, 10, 0, 0), 16),
            Ipv4Addr::new(192, 168, 1, 253),
        )
    }

    /// Members from `(name, weight)` pairs, in priority order
    pub fn wan_members(pairs: &[(&str, u32)]) -> Vec<WanMember> {
        pairs
            .iter()
            .map(|&(name, weight)| WanMember::new(name, weight))
            .collect()
    }

    /// `ip route show dev DEV` output for an uplink with a DHCP default route.
    pub fn uplink_routes(gateway: Ipv4Addr, local: Ipv4Addr) -> String {
        let octets = gateway.octets();
        format!(
            "default via {gw} proto dhcp src {local} metric 100\n\
             {a}.{b}.{c}.0/24 proto kernel scope link src {local} metric 100\n",
            gw = gateway,
            local = local,
            a = octets[0],
            b = octets[1],
            c = octets[2],
        )
    }
}
