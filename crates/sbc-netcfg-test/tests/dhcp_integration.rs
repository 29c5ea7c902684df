//! DHCP service configuration across servers and modes

use std::net::Ipv4Addr;

use pretty_assertions::assert_eq;

use sbc_dhcpmgr::parse_dhcpd_conf;
use sbc_netcfg_common::model::DhcpMode;
use sbc_netcfg_common::DhcpBackendKind;
use sbc_netcfg_test::{dhcp_fixtures, interface_fixtures, HostBuilder, HostVerifier, TestHost};

async fn lan_bridge_host(host: &TestHost) {
    host.intf
        .save(interface_fixtures::lan_bridge(&["eth1", "eth2"]))
        .await
        .unwrap();
}

/// Test dnsmasq round trip
///
/// Scenario:
/// 1. Declare br0 and serve 192.168.1.100-200 with 24h leases
/// 2. Reserve an address for a NAS
/// 3. Once dnsmasq runs, the live configuration equals the declared one
#[tokio::test]
async fn test_dnsmasq_round_trip() {
    let host = HostBuilder::new()
        .unwrap()
        .netplan()
        .dnsmasq()
        .isc_dhcp()
        .build()
        .unwrap();
    lan_bridge_host(&host).await;

    let applied = host.dhcp.set_settings(dhcp_fixtures::lan_server()).await.unwrap();
    assert_eq!(applied.backend, "dnsmasq");
    host.dhcp
        .add_reservation(dhcp_fixtures::reservation("AA:BB:CC:DD:EE:01", 50, Some("nas")).unwrap())
        .await
        .unwrap();

    let conf = &host.settings.paths.dnsmasq_conf;
    let verifier = HostVerifier::new(&host);
    verifier
        .assert_file_contains(
            conf,
            &[
                "dhcp-range=192.168.1.100,192.168.1.200,24h",
                "dhcp-host=aa:bb:cc:dd:ee:01,192.168.1.50,nas",
                "interface=br0",
            ],
        )
        .unwrap();
    verifier.assert_ran("systemctl restart dnsmasq").unwrap();

    host.start_process("dnsmasq");
    host.detector.refresh().await;
    assert_eq!(
        host.detector.dhcp_backend().await.unwrap(),
        DhcpBackendKind::IntegratedResolver
    );

    let live = host.dhcp.live().await.unwrap();
    assert!(live.warnings.is_empty(), "{:?}", live.warnings);
    assert_eq!(live.records, host.dhcp.get_config().unwrap());
}

/// Resolver lines outside the managed block survive every apply
#[tokio::test]
async fn test_dnsmasq_keeps_dns_configuration() {
    let host = HostBuilder::new().unwrap().dnsmasq().build().unwrap();
    let conf = host.settings.paths.dnsmasq_conf.clone();
    host.write(&conf, "# upstream resolvers\nserver=1.1.1.1\ncache-size=1000\n")
        .unwrap();

    host.dhcp.set_settings(dhcp_fixtures::lan_server()).await.unwrap();
    let first = host.read(&conf);
    assert!(first.starts_with("# upstream resolvers\nserver=1.1.1.1\ncache-size=1000\n"));

    // Identical intent, identical bytes.
    let applied = host.dhcp.apply().await.unwrap();
    assert!(!applied.changed);
    assert_eq!(host.read(&conf), first);
}

/// Test ISC dhcpd when dnsmasq is not installed
#[tokio::test]
async fn test_isc_server_configuration() {
    let host = HostBuilder::new().unwrap().isc_dhcp().build().unwrap();
    let applied = host.dhcp.set_settings(dhcp_fixtures::lan_server()).await.unwrap();
    assert_eq!(applied.backend, "isc-dhcp-server");
    host.dhcp
        .add_reservation(dhcp_fixtures::reservation("aa:bb:cc:dd:ee:02", 60, None).unwrap())
        .await
        .unwrap();

    let parsed = parse_dhcpd_conf(&host.read(&host.settings.paths.dhcpd_conf)).unwrap();
    let pool = parsed.records.settings.pool.unwrap();
    assert_eq!(pool.range_start, Ipv4Addr::new(192, 168, 1, 100));
    assert_eq!(pool.range_end, Ipv4Addr::new(192, 168, 1, 200));
    assert_eq!(pool.lease_time, dhcp_fixtures::lan_pool().lease_time);
    assert_eq!(parsed.records.reservations, host.dhcp.list_reservations().unwrap());

    HostVerifier::new(&host)
        .assert_file_contains(&host.settings.paths.dhcpd_defaults, &["INTERFACESv4=\"br0\""])
        .unwrap();
}

/// Test reservation identity
///
/// A MAC identifies a reservation in any notation; an address belongs to at
/// most one MAC.
#[tokio::test]
async fn test_reservation_identity() {
    let host = HostBuilder::new().unwrap().dnsmasq().build().unwrap();
    host.dhcp.set_settings(dhcp_fixtures::lan_server()).await.unwrap();

    host.dhcp
        .add_reservation(dhcp_fixtures::reservation("aa:bb:cc:dd:ee:01", 50, None).unwrap())
        .await
        .unwrap();
    host.dhcp
        .add_reservation(dhcp_fixtures::reservation("AA-BB-CC-DD-EE-01", 51, None).unwrap())
        .await
        .unwrap();

    let all = host.dhcp.list_reservations().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].ip, Ipv4Addr::new(192, 168, 1, 51));

    let err = host
        .dhcp
        .add_reservation(dhcp_fixtures::reservation("aa:bb:cc:dd:ee:02", 51, None).unwrap())
        .await
        .unwrap_err();
    assert!(err.is_validation());

    host.dhcp.remove_reservation("AA:BB:CC:DD:EE:01").await.unwrap();
    assert!(host.dhcp.list_reservations().unwrap().is_empty());
    HostVerifier::new(&host)
        .assert_file_lacks(&host.settings.paths.dnsmasq_conf, &["dhcp-host="])
        .unwrap();
}

/// Switching to relay mode hands the LAN to dhcrelay
#[tokio::test]
async fn test_server_to_relay() {
    let host = HostBuilder::new().unwrap().dnsmasq().build().unwrap();
    host.dhcp.set_settings(dhcp_fixtures::lan_server()).await.unwrap();

    let applied = host
        .dhcp
        .set_settings(dhcp_fixtures::relay_to(Ipv4Addr::new(10, 0, 0, 2)))
        .await
        .unwrap();
    assert_eq!(applied.backend, "isc-dhcp-relay");
    assert_eq!(host.dhcp.get_config().unwrap().settings.mode, DhcpMode::Relay);

    let verifier = HostVerifier::new(&host);
    verifier
        .assert_file_lacks(&host.settings.paths.dnsmasq_conf, &["dhcp-range"])
        .unwrap();
    verifier
        .assert_file_contains(&host.settings.paths.relay_defaults, &["SERVERS=\"10.0.0.2\""])
        .unwrap();
}

/// Leases come from the running server's lease file
#[tokio::test]
async fn test_dnsmasq_leases() {
    let host = HostBuilder::new().unwrap().dnsmasq().build().unwrap();
    host.write(
        &host.settings.paths.dnsmasq_leases,
        "0 aa:bb:cc:dd:ee:01 192.168.1.50 nas *\n\
         1000000000 aa:bb:cc:dd:ee:02 192.168.1.120 * 01:aa:bb:cc:dd:ee:02\n",
    )
    .unwrap();
    host.write(&host.settings.paths.dnsmasq_conf, "dhcp-range=192.168.1.100,192.168.1.200,24h\n")
        .unwrap();
    host.start_process("dnsmasq");

    let leases = host.dhcp.leases().await.unwrap();
    assert!(leases.warnings.is_empty(), "{:?}", leases.warnings);
    assert_eq!(leases.records.len(), 2);
    assert_eq!(leases.records[0].hostname.as_deref(), Some("nas"));
    assert!(leases.records[0].active);
    assert_eq!(leases.records[1].hostname, None);
    assert!(!leases.records[1].active);
}
