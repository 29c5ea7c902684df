//! Interface declarations through both interface backends
//!
//! Declares a LAN, a DHCP uplink and a static route, then reads the rendered
//! configuration back through the same backend.

use pretty_assertions::assert_eq;

use sbc_netcfg_common::model::NetworkInterfaceIntent;
use sbc_netcfg_common::{InterfaceBackendKind, NetCfgError};
use sbc_netcfg_test::{
    interface_fixtures, route_fixtures, HostBuilder, HostVerifier, TestHost,
};

fn by_name(mut interfaces: Vec<NetworkInterfaceIntent>) -> Vec<NetworkInterfaceIntent> {
    interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    interfaces
}

async fn declare_router(host: &TestHost) {
    host.intf.save(interface_fixtures::lan_static()).await.unwrap();
    host.intf
        .save(interface_fixtures::wan_dhcp("eth1"))
        .await
        .unwrap();
    host.routes
        .add_static_route(route_fixtures::office_route())
        .await
        .unwrap();
}

async fn assert_reads_back(host: &TestHost) {
    let live = host.intf.live().await.unwrap();
    assert_eq!(
        by_name(live.records.interfaces),
        by_name(host.intf.list().unwrap())
    );

    let office = route_fixtures::office_route();
    assert_eq!(live.records.routes.len(), 1);
    assert_eq!(live.records.routes[0].destination, office.destination);
    assert_eq!(live.records.routes[0].gateway, office.gateway);
}

/// Test netplan round trip
///
/// Scenario:
/// 1. Declare eth0 static, eth1 DHCP and a route via the LAN
/// 2. Verify the YAML and the netplan activation sequence
/// 3. Parse the YAML back into the same declarations
#[tokio::test]
async fn test_netplan_round_trip() {
    let host = HostBuilder::new().unwrap().netplan().build().unwrap();
    declare_router(&host).await;

    let verifier = HostVerifier::new(&host);
    verifier
        .assert_file_contains(
            &host.settings.paths.netplan_file,
            &["192.168.1.1/24", "dhcp4: true", "10.10.0.0/16"],
        )
        .unwrap();
    verifier
        .assert_ran_before("netplan generate", "netplan apply")
        .unwrap();
    verifier
        .assert_ran("ip route add 10.10.0.0/16 via 192.168.1.253")
        .unwrap();

    assert_reads_back(&host).await;
}

/// Test ifupdown round trip with the same declarations
#[tokio::test]
async fn test_ifupdown_round_trip() {
    let host = HostBuilder::new().unwrap().ifupdown().build().unwrap();
    declare_router(&host).await;

    HostVerifier::new(&host)
        .assert_file_contains(
            &host.settings.paths.interfaces_file,
            &[
                "iface eth0 inet static",
                "address 192.168.1.1",
                "netmask 255.255.255.0",
                "gateway 192.168.1.254",
                "iface eth1 inet dhcp",
                "10.10.0.0/16 via 192.168.1.253",
            ],
        )
        .unwrap();

    assert_reads_back(&host).await;
}

/// Re-applying unchanged declarations rewrites nothing
#[tokio::test]
async fn test_reapply_is_idempotent() {
    for host in [
        HostBuilder::new().unwrap().netplan().build().unwrap(),
        HostBuilder::new().unwrap().ifupdown().build().unwrap(),
    ] {
        declare_router(&host).await;
        let path = match host.detector.interface_backend().await.unwrap() {
            InterfaceBackendKind::DeclarativeManager => host.settings.paths.netplan_file.clone(),
            InterfaceBackendKind::LegacyStanzaFile => host.settings.paths.interfaces_file.clone(),
        };
        let before = host.read(&path);

        let applied = host.intf.apply().await.unwrap();
        assert!(!applied.changed);
        assert_eq!(host.read(&path), before);
    }
}

/// Deleting an interface drops it and its routes from the rendered file
#[tokio::test]
async fn test_delete_interface() {
    let host = HostBuilder::new().unwrap().netplan().build().unwrap();
    declare_router(&host).await;

    host.intf.delete("eth1").await.unwrap();
    let live = host.intf.live().await.unwrap();
    assert_eq!(live.records.interfaces, vec![interface_fixtures::lan_static()]);

    let err = host.intf.delete("eth1").await.unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_no_interface_backend() {
    let host = HostBuilder::new().unwrap().build().unwrap();
    let err = host
        .intf
        .save(interface_fixtures::lan_static())
        .await
        .unwrap_err();
    assert!(matches!(err, NetCfgError::BackendUnavailable { .. }));
    // Nothing ran against the host.
    assert!(host.exec.commands().is_empty());
}
