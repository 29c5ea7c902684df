//! Static routes, uplink settings and multi-WAN load balancing

use std::net::Ipv4Addr;

use pretty_assertions::assert_eq;

use sbc_netcfg_common::model::{
    AddressingMode, MultiWanMode, MultiWanSettings, StaticRouteIntent, WanConnection, WanSettings,
};
use sbc_netcfg_common::NetCfgError;
use sbc_netcfg_test::{interface_fixtures, route_fixtures, HostBuilder, HostVerifier};

/// Test static route replacement
///
/// Scenario:
/// 1. Route 10.10.0.0/16 via 192.168.1.253
/// 2. Route the same destination via 192.168.1.252
/// 3. The kernel route is swapped and only the new declaration remains
#[tokio::test]
async fn test_static_route_replacement() {
    let host = HostBuilder::new().unwrap().netplan().build().unwrap();
    host.intf.save(interface_fixtures::lan_static()).await.unwrap();
    host.routes
        .add_static_route(route_fixtures::office_route())
        .await
        .unwrap();

    let office = route_fixtures::office_route();
    let moved = StaticRouteIntent::via(office.destination, Ipv4Addr::new(192, 168, 1, 252));
    host.routes.add_static_route(moved.clone()).await.unwrap();

    let verifier = HostVerifier::new(&host);
    verifier
        .assert_ran_before(
            "ip route del 10.10.0.0/16 via 192.168.1.253",
            "ip route add 10.10.0.0/16 via 192.168.1.252",
        )
        .unwrap();
    verifier
        .assert_file_contains(&host.settings.paths.netplan_file, &["192.168.1.252"])
        .unwrap();
    verifier
        .assert_file_lacks(&host.settings.paths.netplan_file, &["192.168.1.253"])
        .unwrap();
    assert_eq!(host.routes.list_static_routes().unwrap(), vec![moved]);
}

/// A route the kernel refuses is not declared
#[tokio::test]
async fn test_rejected_route_not_declared() {
    let host = HostBuilder::new()
        .unwrap()
        .netplan()
        .fail(
            "ip route add 10.10.0.0/16 via 192.168.1.253",
            2,
            "Error: Nexthop has invalid gateway.",
        )
        .build()
        .unwrap();

    let err = host
        .routes
        .add_static_route(route_fixtures::office_route())
        .await
        .unwrap_err();
    assert!(matches!(err, NetCfgError::CommandFailed { .. }));
    assert!(host.routes.list_static_routes().unwrap().is_empty());
    HostVerifier::new(&host)
        .assert_not_ran("netplan apply")
        .unwrap();
}

/// Deleting an unknown destination is a validation error
#[tokio::test]
async fn test_delete_unknown_route() {
    let host = HostBuilder::new().unwrap().netplan().build().unwrap();
    let err = host
        .routes
        .delete_static_route(route_fixtures::office_route().destination)
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

/// Test multi-WAN load balancing
///
/// Scenario:
/// 1. eth0 and eth1 have DHCP default routes, ppp0 has none
/// 2. Enable load balancing over all three with weights 1, 3 and 1
/// 3. The default route spreads over eth0 and eth1; ppp0 is skipped
#[tokio::test]
async fn test_multi_wan_load_balance() {
    let host = HostBuilder::new()
        .unwrap()
        .respond(
            "ip route show dev eth0",
            &route_fixtures::uplink_routes(
                Ipv4Addr::new(192, 168, 1, 254),
                Ipv4Addr::new(192, 168, 1, 1),
            ),
        )
        .respond(
            "ip route show dev eth1",
            &route_fixtures::uplink_routes(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)),
        )
        .build()
        .unwrap();

    let multi = MultiWanSettings {
        enabled: true,
        mode: MultiWanMode::LoadBalance,
        members: route_fixtures::wan_members(&[("eth0", 1), ("eth1", 3), ("ppp0", 1)]),
        ..Default::default()
    };
    let applied = host.routes.set_multi_wan(multi.clone()).await.unwrap().unwrap();
    assert_eq!(applied.backend, "iproute2");

    let verifier = HostVerifier::new(&host);
    verifier
        .assert_ran(
            "ip route replace default \
             nexthop via 192.168.1.254 dev eth0 weight 1 \
             nexthop via 10.0.0.1 dev eth1 weight 3",
        )
        .unwrap();
    verifier
        .assert_ran("ip route replace default via 10.0.0.1 dev eth1 table 101")
        .unwrap();
    verifier
        .assert_file_contains(&host.settings.paths.rt_tables, &["100\twan1", "101\twan2"])
        .unwrap();
    verifier
        .assert_file_lacks(&host.settings.paths.rt_tables, &["wan3"])
        .unwrap();
    assert_eq!(host.routes.get_multi_wan().unwrap(), multi);

    // Disabling flushes the member tables.
    let disabled = MultiWanSettings {
        enabled: false,
        ..multi
    };
    assert!(host.routes.set_multi_wan(disabled).await.unwrap().is_none());
    verifier.assert_ran("ip route flush table 100").unwrap();
    verifier.assert_ran("ip route flush table 101").unwrap();
}

/// No member with a gateway means nothing is installed
#[tokio::test]
async fn test_multi_wan_without_gateways() {
    let host = HostBuilder::new().unwrap().build().unwrap();
    let multi = MultiWanSettings {
        enabled: true,
        members: route_fixtures::wan_members(&[("eth0", 1), ("eth1", 1)]),
        ..Default::default()
    };

    let err = host.routes.set_multi_wan(multi).await.unwrap_err();
    assert!(err.is_validation());
    assert!(host.exec.commands_starting_with("ip route replace").is_empty());
}

/// Failover settings are kept even though failover cannot be installed
#[tokio::test]
async fn test_failover_stored_not_installed() {
    let host = HostBuilder::new().unwrap().build().unwrap();
    let multi = MultiWanSettings {
        enabled: true,
        mode: MultiWanMode::Failover,
        members: route_fixtures::wan_members(&[("eth0", 1), ("eth1", 1)]),
        ..Default::default()
    };

    let err = host.routes.set_multi_wan(multi.clone()).await.unwrap_err();
    assert!(matches!(err, NetCfgError::NotImplemented { .. }));
    assert_eq!(host.routes.get_multi_wan().unwrap(), multi);
}

#[tokio::test]
async fn test_routing_status() {
    let host = HostBuilder::new()
        .unwrap()
        .respond(
            "ip route show",
            "default via 192.168.1.254 dev eth0 proto dhcp src 192.168.1.1 metric 100\n\
             10.10.0.0/16 via 192.168.1.253 dev eth0\n\
             192.168.1.0/24 dev eth0 proto kernel scope link src 192.168.1.1\n",
        )
        .fail("pgrep -x miniupnpd", 1, "")
        .build()
        .unwrap();

    let status = host.routes.routing_status().await.unwrap();
    assert_eq!(status.default_gateway, Some(Ipv4Addr::new(192, 168, 1, 254)));
    assert_eq!(status.default_interface.as_deref(), Some("eth0"));
    assert_eq!(status.total_routes, 3);
    assert_eq!(status.static_routes, 1);
    assert!(!status.upnp_enabled);
    assert!(!status.upnp_running);
}

/// Test static WAN settings
///
/// The uplink becomes a static interface declaration; PPPoE is refused
/// before anything is stored.
#[tokio::test]
async fn test_static_wan() {
    let host = HostBuilder::new().unwrap().netplan().build().unwrap();
    let wan = WanSettings {
        interface: "eth1".to_string(),
        connection: WanConnection::Static,
        address: Some(Ipv4Addr::new(203, 0, 113, 10)),
        netmask: Some(Ipv4Addr::new(255, 255, 255, 0)),
        gateway: Some(Ipv4Addr::new(203, 0, 113, 1)),
        ..WanSettings::default()
    };
    host.routes.set_wan(wan.clone()).await.unwrap();

    let eth1 = host.intf.get("eth1").unwrap().unwrap();
    assert_eq!(eth1.mode, AddressingMode::Static);
    assert_eq!(eth1.address, wan.address);
    HostVerifier::new(&host)
        .assert_file_contains(&host.settings.paths.netplan_file, &["203.0.113.10/24"])
        .unwrap();
    assert_eq!(host.routes.get_wan().unwrap(), wan);

    let pppoe = WanSettings {
        connection: WanConnection::Pppoe,
        pppoe_username: Some("subscriber".to_string()),
        ..wan.clone()
    };
    let err = host.routes.set_wan(pppoe).await.unwrap_err();
    assert!(matches!(err, NetCfgError::NotImplemented { .. }));
    assert_eq!(host.routes.get_wan().unwrap(), wan);
}
