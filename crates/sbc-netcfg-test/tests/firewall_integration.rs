//! Firewall backend selection and rule set round trips

use pretty_assertions::assert_eq;

use sbc_fwmgr::{parse_iptables, parse_nft};
use sbc_netcfg_common::model::FirewallRuleIntent;
use sbc_netcfg_common::{FirewallBackendKind, NetCfgError};
use sbc_netcfg_test::{firewall_fixtures, HostBuilder, HostVerifier, TestHost};

/// Stored rules without their row ids, in chain then position order.
fn declared(host: &TestHost) -> Vec<FirewallRuleIntent> {
    let mut rules: Vec<FirewallRuleIntent> = host
        .fw
        .list_rules()
        .unwrap()
        .into_iter()
        .map(|mut r| {
            r.id = None;
            r
        })
        .collect();
    sorted(&mut rules);
    rules
}

fn sorted(rules: &mut [FirewallRuleIntent]) {
    rules.sort_by(|a, b| (&a.chain, a.position).cmp(&(&b.chain, b.position)));
}

async fn declare_rules(host: &TestHost) {
    for rule in [
        firewall_fixtures::ssh_from_mgmt(),
        firewall_fixtures::drop_input(),
        firewall_fixtures::lan_masquerade(),
        firewall_fixtures::web_port_forward(),
    ] {
        host.fw.create_rule(rule, None).await.unwrap();
    }
}

/// Test backend precedence
///
/// Scenario:
/// 1. A working nft wins over iptables
/// 2. An nft that cannot list tables falls back to iptables
/// 3. Neither tool is an error
#[tokio::test]
async fn test_detection_precedence() {
    let both = HostBuilder::new().unwrap().nftables().iptables().build().unwrap();
    assert_eq!(
        both.detector.firewall_backend().await.unwrap(),
        FirewallBackendKind::NFTables
    );

    let broken = HostBuilder::new()
        .unwrap()
        .broken_nftables()
        .iptables()
        .build()
        .unwrap();
    assert_eq!(
        broken.detector.firewall_backend().await.unwrap(),
        FirewallBackendKind::IPTables
    );
    let (_, applied) = broken
        .fw
        .create_rule(firewall_fixtures::ssh_from_mgmt(), None)
        .await
        .unwrap();
    assert_eq!(applied.backend, "iptables");

    let bare = HostBuilder::new().unwrap().build().unwrap();
    let err = bare.detector.firewall_backend().await.unwrap_err();
    assert!(matches!(err, NetCfgError::BackendUnavailable { .. }));
}

/// Test iptables round trip
///
/// The restore document written for the declared rules parses back into the
/// same rules.
#[tokio::test]
async fn test_iptables_round_trip() {
    let host = HostBuilder::new().unwrap().iptables().build().unwrap();
    declare_rules(&host).await;

    let path = &host.settings.paths.iptables_rules;
    HostVerifier::new(&host)
        .assert_file_contains(
            path,
            &[
                "*filter",
                "-A INPUT -p tcp -s 10.0.0.0/24 --dport 22 -j ACCEPT",
                "-A INPUT -j DROP",
                "*nat",
                "-A POSTROUTING -s 192.168.1.0/24 -j MASQUERADE",
                "COMMIT",
            ],
        )
        .unwrap();

    let restore = format!("iptables-restore {}", path.display());
    HostVerifier::new(&host)
        .assert_ran_before(&format!("iptables-restore --test {}", path.display()), &restore)
        .unwrap();

    let mut parsed = parse_iptables(&host.read(path));
    assert!(parsed.warnings.is_empty(), "{:?}", parsed.warnings);
    sorted(&mut parsed.records);
    assert_eq!(parsed.records, declared(&host));
}

/// Test nftables round trip with the same rule set
#[tokio::test]
async fn test_nftables_round_trip() {
    let host = HostBuilder::new().unwrap().nftables().build().unwrap();
    declare_rules(&host).await;

    let path = &host.settings.paths.nftables_conf;
    HostVerifier::new(&host)
        .assert_file_contains(
            path,
            &[
                "tcp dport 22 accept",
                "masquerade",
                "tcp dport 8080 dnat to 192.168.1.20:80",
            ],
        )
        .unwrap();

    let mut parsed = parse_nft(&host.read(path));
    assert!(parsed.warnings.is_empty(), "{:?}", parsed.warnings);
    sorted(&mut parsed.records);
    assert_eq!(parsed.records, declared(&host));
}

/// Disabled rules stay declared but leave the rendered set
#[tokio::test]
async fn test_disabled_rule_not_rendered() {
    let host = HostBuilder::new().unwrap().iptables().build().unwrap();
    let (id, _) = host
        .fw
        .create_rule(firewall_fixtures::ssh_from_mgmt(), None)
        .await
        .unwrap();

    let applied = host.fw.set_rule_enabled(id, false).await.unwrap();
    assert!(applied.changed);
    HostVerifier::new(&host)
        .assert_file_lacks(&host.settings.paths.iptables_rules, &["--dport 22"])
        .unwrap();
    assert_eq!(host.fw.list_rules().unwrap().len(), 1);

    // Same declarations, same bytes.
    let before = host.read(&host.settings.paths.iptables_rules);
    assert!(!host.fw.apply().await.unwrap().changed);
    assert_eq!(host.read(&host.settings.paths.iptables_rules), before);
}

/// A rejected rule set is reported but not rolled back
///
/// The rendered file is already in place when validation fails and the rule
/// stays declared; the reload never runs.
#[tokio::test]
async fn test_validation_failure_not_rolled_back() {
    let host = HostBuilder::new().unwrap().iptables().build().unwrap();
    let path = host.settings.paths.iptables_rules.clone();
    host.exec.set_response(
        &format!("iptables-restore --test {}", path.display()),
        sbc_netcfg_common::ExecResult::failed(2, "iptables-restore: line 5 failed"),
    );

    let err = host
        .fw
        .create_rule(firewall_fixtures::drop_input(), None)
        .await
        .unwrap_err();
    match err {
        NetCfgError::ApplyFailed { stderr, .. } => assert!(stderr.contains("line 5 failed")),
        other => panic!("unexpected error {:?}", other),
    }

    assert!(host.read(&path).contains("-A INPUT -j DROP"));
    assert_eq!(host.fw.list_rules().unwrap().len(), 1);
    HostVerifier::new(&host)
        .assert_not_ran(&format!("iptables-restore {}", path.display()))
        .unwrap();
}
