//! DHCP Lease/Reservation Manager - Core implementation

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use sbc_netcfg_common::backend::read_native_file;
use sbc_netcfg_common::model::{
    normalize_mac, AddressingMode, DhcpConfig, DhcpMode, DhcpPoolIntent, DhcpReservationIntent,
    DhcpSettings, LeaseRecord,
};
use sbc_netcfg_common::settings::Settings;
use sbc_netcfg_common::shell::HostExecutor;
use sbc_netcfg_common::{
    Applied, Applier, Backend, Detector, DhcpBackendKind, IntentStore, NetCfgError, NetCfgResult,
    ParseOutcome,
};

use crate::backend::DhcpBackend;
use crate::dnsmasq::DnsmasqBackend;
use crate::leases::{parse_dnsmasq_leases, parse_isc_leases};

/// DHCP Lease/Reservation Manager
///
/// Holds the service settings (mode, pool, relay targets) and the
/// reservation list, renders them with the backend for the current mode
/// and reads leases from whichever server is running.
pub struct DhcpMgr {
    store: Arc<IntentStore>,
    exec: Arc<dyn HostExecutor>,
    settings: Arc<Settings>,
    detector: Arc<Detector>,
    applier: Arc<Applier>,
}

impl DhcpMgr {
    pub fn new(
        store: Arc<IntentStore>,
        exec: Arc<dyn HostExecutor>,
        settings: Arc<Settings>,
        detector: Arc<Detector>,
        applier: Arc<Applier>,
    ) -> Self {
        Self {
            store,
            exec,
            settings,
            detector,
            applier,
        }
    }

    /// Backend of the DHCP service running right now.
    pub async fn running_backend(&self) -> NetCfgResult<DhcpBackend> {
        let kind = self.detector.dhcp_backend().await?;
        Ok(DhcpBackend::for_kind(kind, &self.settings))
    }

    /// Backend that renders `mode`.
    async fn target_kind(&self, mode: DhcpMode) -> NetCfgResult<DhcpBackendKind> {
        match mode {
            DhcpMode::Server => self.detector.dhcp_server_backend().await,
            DhcpMode::Relay => Ok(DhcpBackendKind::Relay),
            DhcpMode::Disabled => Ok(DhcpBackendKind::Disabled),
        }
    }

    /// A pool on the default DHCP interface with the configured defaults.
    pub fn default_pool(&self, range_start: Ipv4Addr, range_end: Ipv4Addr) -> DhcpPoolIntent {
        let defaults = &self.settings.dhcp;
        let mut pool = DhcpPoolIntent::new(defaults.interface.as_str(), range_start, range_end);
        pool.lease_time = defaults.lease_time;
        pool.domain = Some(defaults.domain.clone());
        pool
    }

    pub fn get_config(&self) -> NetCfgResult<DhcpConfig> {
        Ok(DhcpConfig {
            settings: self.store.dhcp_settings()?,
            reservations: self.store.list_reservations()?,
        })
    }

    pub fn list_reservations(&self) -> NetCfgResult<Vec<DhcpReservationIntent>> {
        self.store.list_reservations()
    }

    /// The pool must sit inside its interface's subnet when that interface
    /// is declared with a static address.
    fn check_pool_interface(&self, pool: &DhcpPoolIntent) -> NetCfgResult<()> {
        let Some(intf) = self.store.get_interface(&pool.interface)? else {
            debug!("{} is not declared, skipping subnet check", pool.interface);
            return Ok(());
        };
        if intf.mode != AddressingMode::Static {
            return Ok(());
        }
        if let Some(subnet) = intf.subnet() {
            if !subnet.contains(pool.range_start) || !subnet.contains(pool.range_end) {
                return Err(NetCfgError::validation(
                    "pool",
                    format!(
                        "range {}-{} is outside {} subnet {}",
                        pool.range_start, pool.range_end, pool.interface, subnet
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Validates, persists and applies the service settings.
    #[instrument(skip(self, settings), fields(mode = ?settings.mode))]
    pub async fn set_settings(&self, settings: DhcpSettings) -> NetCfgResult<Applied> {
        settings.validate()?;
        if let Some(pool) = settings.pool.as_ref().filter(|_| settings.mode == DhcpMode::Server) {
            self.check_pool_interface(pool)?;
        }

        let previous = self.store.dhcp_settings()?.mode;
        self.store.save_dhcp_settings(&settings)?;
        info!("Saved DHCP settings, mode {:?}", settings.mode);

        let applied = self.apply().await;
        // The host may have changed even when the apply failed part way.
        if previous != settings.mode {
            self.detector.refresh().await;
        }
        applied
    }

    /// Adds a reservation, replacing any existing one for the same MAC in place.
    #[instrument(skip(self, reservation), fields(mac = %reservation.mac))]
    pub async fn add_reservation(
        &self,
        reservation: DhcpReservationIntent,
    ) -> NetCfgResult<Applied> {
        reservation.validate()?;

        let existing = self.store.list_reservations()?;
        if let Some(other) = existing
            .iter()
            .find(|r| r.ip == reservation.ip && r.mac != reservation.mac)
        {
            return Err(NetCfgError::validation(
                "ip",
                format!("{} is already reserved for {}", reservation.ip, other.mac),
            ));
        }
        if let Some(pool) = self.store.dhcp_settings()?.pool {
            if pool.contains(reservation.ip) {
                warn!(
                    "Reservation {} overlaps the dynamic range {}-{}",
                    reservation.ip, pool.range_start, pool.range_end
                );
            }
        }

        self.store.upsert_reservation(&reservation)?;
        info!("Reserved {} for {}", reservation.ip, reservation.mac);
        self.apply().await
    }

    #[instrument(skip(self))]
    pub async fn remove_reservation(&self, mac: &str) -> NetCfgResult<Applied> {
        let mac = normalize_mac(mac)?;
        if !self.store.delete_reservation(&mac)? {
            return Err(NetCfgError::validation("mac", format!("no reservation for {}", mac)));
        }
        info!("Removed reservation for {}", mac);
        self.apply().await
    }

    /// Renders the stored configuration for its mode and applies it.
    ///
    /// A dnsmasq DHCP block left over from server mode is stripped whenever
    /// dnsmasq is not the target.
    #[instrument(skip(self))]
    pub async fn apply(&self) -> NetCfgResult<Applied> {
        let config = self.get_config()?;
        let kind = self.target_kind(config.settings.mode).await?;

        if kind != DhcpBackendKind::IntegratedResolver {
            let dnsmasq = DnsmasqBackend::load(&self.settings.paths.dnsmasq_conf).await?;
            if dnsmasq.has_managed_block() {
                let mut off = config.clone();
                off.settings.mode = DhcpMode::Disabled;
                info!("Removing DHCP block from {}", dnsmasq.conf().display());
                self.applier.apply(&dnsmasq.synthesize(&off)?).await?;
            }
        }

        let backend = DhcpBackend::load(kind, &self.settings).await?;
        let artifact = backend.synthesize(&config)?;
        info!(
            "Applying DHCP {:?} config with {} reservations via {}",
            config.settings.mode,
            config.reservations.len(),
            kind
        );
        self.applier.apply(&artifact).await
    }

    /// Configuration of the running DHCP service.
    pub async fn live(&self) -> NetCfgResult<ParseOutcome<DhcpConfig>> {
        let backend = self.running_backend().await?;
        let outcome = backend.read_live(self.exec.as_ref()).await?;
        outcome.log_warnings(&backend.kind().to_string());
        Ok(outcome)
    }

    pub async fn leases(&self) -> NetCfgResult<ParseOutcome<Vec<LeaseRecord>>> {
        self.leases_at(Utc::now()).await
    }

    /// Leases of the running server, with activity judged at `now`.
    ///
    /// With no server running, whichever lease file has content is read,
    /// dnsmasq's first.
    pub async fn leases_at(
        &self,
        now: DateTime<Utc>,
    ) -> NetCfgResult<ParseOutcome<Vec<LeaseRecord>>> {
        let paths = &self.settings.paths;
        let outcome = match self.detector.dhcp_backend().await? {
            DhcpBackendKind::IntegratedResolver => {
                parse_dnsmasq_leases(&read_native_file(&paths.dnsmasq_leases).await?, now)
            }
            DhcpBackendKind::StandaloneServer => {
                parse_isc_leases(&read_native_file(&paths.dhcpd_leases).await?, now)
            }
            DhcpBackendKind::Relay | DhcpBackendKind::Disabled => {
                let dnsmasq = read_native_file(&paths.dnsmasq_leases).await?;
                if dnsmasq.trim().is_empty() {
                    parse_isc_leases(&read_native_file(&paths.dhcpd_leases).await?, now)
                } else {
                    parse_dnsmasq_leases(&dnsmasq, now)
                }
            }
        };
        outcome.log_warnings("leases");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbc_netcfg_common::model::NetworkInterfaceIntent;
    use sbc_netcfg_common::{ExecResult, FixtureExecutor};

    struct Harness {
        _root: tempfile::TempDir,
        exec: Arc<FixtureExecutor>,
        store: Arc<IntentStore>,
        settings: Arc<Settings>,
        detector: Arc<Detector>,
        mgr: DhcpMgr,
    }

    fn harness(exec: FixtureExecutor) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let settings = Arc::new(Settings::rooted_at(root.path()));
        let store = Arc::new(IntentStore::open_in_memory().unwrap());
        let exec = Arc::new(exec);
        let dyn_exec: Arc<dyn HostExecutor> = exec.clone();
        let detector = Arc::new(Detector::new(dyn_exec.clone(), settings.clone()));
        let mgr = DhcpMgr::new(
            store.clone(),
            dyn_exec.clone(),
            settings.clone(),
            detector.clone(),
            Arc::new(Applier::new(dyn_exec)),
        );
        Harness {
            _root: root,
            exec,
            store,
            settings,
            detector,
            mgr,
        }
    }

    /// Nothing running; `tools` on PATH.
    fn idle_host(tools: &[&str]) -> FixtureExecutor {
        let mut exec = FixtureExecutor::new()
            .fail("pgrep -x dnsmasq", 1, "")
            .fail("pgrep -x dhcpd", 1, "")
            .fail("pgrep -x dhcrelay", 1, "");
        for &tool in tools {
            exec = exec.with_tool(tool);
        }
        exec
    }

    fn server(mgr: &DhcpMgr) -> DhcpSettings {
        DhcpSettings {
            mode: DhcpMode::Server,
            pool: Some(mgr.default_pool(
                Ipv4Addr::new(192, 168, 1, 100),
                Ipv4Addr::new(192, 168, 1, 200),
            )),
            ..Default::default()
        }
    }

    fn reservation(mac: &str, last: u8) -> DhcpReservationIntent {
        DhcpReservationIntent::new(mac, Ipv4Addr::new(192, 168, 1, last), None).unwrap()
    }

    #[tokio::test]
    async fn test_server_mode_prefers_dnsmasq() {
        let h = harness(idle_host(&["dnsmasq", "dhcpd"]));
        let applied = h.mgr.set_settings(server(&h.mgr)).await.unwrap();
        assert_eq!(applied.backend, "dnsmasq");
        assert!(applied.changed);

        let conf = std::fs::read_to_string(&h.settings.paths.dnsmasq_conf).unwrap();
        assert!(conf.contains("dhcp-range=192.168.1.100,192.168.1.200,24h\n"));
        assert!(conf.contains("dhcp-option=option:domain-name,local\n"));
        assert!(conf.contains("interface=br0\n"));

        let path = h.settings.paths.dnsmasq_conf.display().to_string();
        assert!(h.exec.ran(&format!("dnsmasq --test --conf-file={}", path)));
        assert!(h.exec.ran("systemctl restart dnsmasq"));
    }

    #[tokio::test]
    async fn test_isc_when_only_dhcpd() {
        let h = harness(idle_host(&["dhcpd"]));
        let applied = h.mgr.set_settings(server(&h.mgr)).await.unwrap();
        assert_eq!(applied.backend, "isc-dhcp-server");

        let conf = std::fs::read_to_string(&h.settings.paths.dhcpd_conf).unwrap();
        assert!(conf.contains("range 192.168.1.100 192.168.1.200;"));
        let defaults = std::fs::read_to_string(&h.settings.paths.dhcpd_defaults).unwrap();
        assert!(defaults.contains("INTERFACESv4=\"br0\""));
        assert!(h.exec.ran(&format!(
            "dhcpd -t -cf {}",
            h.settings.paths.dhcpd_conf.display()
        )));
    }

    #[tokio::test]
    async fn test_reservation_replaced_in_place() {
        let h = harness(idle_host(&["dnsmasq"]));
        h.mgr.set_settings(server(&h.mgr)).await.unwrap();
        h.mgr.add_reservation(reservation("aa:bb:cc:dd:ee:01", 50)).await.unwrap();
        h.mgr.add_reservation(reservation("aa:bb:cc:dd:ee:02", 51)).await.unwrap();
        h.mgr.add_reservation(reservation("AA-BB-CC-DD-EE-01", 60)).await.unwrap();

        let all = h.mgr.list_reservations().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].mac, "aa:bb:cc:dd:ee:01");
        assert_eq!(all[0].ip, Ipv4Addr::new(192, 168, 1, 60));

        let conf = std::fs::read_to_string(&h.settings.paths.dnsmasq_conf).unwrap();
        let first = conf.find("dhcp-host=aa:bb:cc:dd:ee:01,192.168.1.60").unwrap();
        let second = conf.find("dhcp-host=aa:bb:cc:dd:ee:02,192.168.1.51").unwrap();
        assert!(first < second);
        assert!(!conf.contains("192.168.1.50"));
    }

    #[tokio::test]
    async fn test_reservation_ip_conflict_rejected() {
        let h = harness(idle_host(&["dnsmasq"]));
        h.mgr.set_settings(server(&h.mgr)).await.unwrap();
        h.mgr.add_reservation(reservation("aa:bb:cc:dd:ee:01", 50)).await.unwrap();
        let err = h
            .mgr
            .add_reservation(reservation("aa:bb:cc:dd:ee:02", 50))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(h.mgr.list_reservations().unwrap().len(), 1);

        assert!(h.mgr.remove_reservation("aa:bb:cc:dd:ee:09").await.unwrap_err().is_validation());
        h.mgr.remove_reservation("AA:BB:CC:DD:EE:01").await.unwrap();
        assert!(h.mgr.list_reservations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pool_outside_static_interface_rejected() {
        let h = harness(idle_host(&["dnsmasq"]));
        h.store
            .upsert_interface(&NetworkInterfaceIntent::static_v4(
                "br0",
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(255, 255, 255, 0),
            ))
            .unwrap();
        let err = h.mgr.set_settings(server(&h.mgr)).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(h.store.dhcp_settings().unwrap(), DhcpSettings::default());
        assert!(!h.settings.paths.dnsmasq_conf.exists());
    }

    #[tokio::test]
    async fn test_relay_strips_dnsmasq_block() {
        let h = harness(idle_host(&["dnsmasq"]));
        h.mgr.set_settings(server(&h.mgr)).await.unwrap();

        let relay = DhcpSettings {
            mode: DhcpMode::Relay,
            relay_servers: vec![Ipv4Addr::new(10, 0, 0, 2)],
            relay_interfaces: vec!["br0".to_string()],
            ..Default::default()
        };
        let applied = h.mgr.set_settings(relay).await.unwrap();
        assert_eq!(applied.backend, "isc-dhcp-relay");

        let conf = std::fs::read_to_string(&h.settings.paths.dnsmasq_conf).unwrap();
        assert!(!conf.contains("dhcp-range"));
        let defaults = std::fs::read_to_string(&h.settings.paths.relay_defaults).unwrap();
        assert!(defaults.contains("SERVERS=\"10.0.0.2\""));
        assert!(h.exec.ran("systemctl stop isc-dhcp-server"));
        assert!(h.exec.ran("systemctl restart isc-dhcp-relay"));
    }

    #[tokio::test]
    async fn test_failed_mode_change_refreshes_detection() {
        let h = harness(idle_host(&["dnsmasq"]));
        h.mgr.set_settings(server(&h.mgr)).await.unwrap();
        h.exec.set_response("pgrep -x dnsmasq", ExecResult::ok("1234"));
        h.detector.refresh().await;
        assert_eq!(
            h.detector.dhcp_backend().await.unwrap(),
            DhcpBackendKind::IntegratedResolver
        );

        // dnsmasq is gone and the relay never comes up.
        h.exec.set_response("pgrep -x dnsmasq", ExecResult::failed(1, ""));
        h.exec.set_response(
            "systemctl restart isc-dhcp-relay",
            ExecResult::failed(1, "Unit isc-dhcp-relay.service not found."),
        );
        h.exec.set_response(
            "service isc-dhcp-relay restart",
            ExecResult::failed(1, "isc-dhcp-relay: unrecognized service"),
        );
        let relay = DhcpSettings {
            mode: DhcpMode::Relay,
            relay_servers: vec![Ipv4Addr::new(10, 0, 0, 2)],
            ..Default::default()
        };
        let err = h.mgr.set_settings(relay).await.unwrap_err();
        assert!(matches!(err, NetCfgError::ApplyFailed { .. }));
        assert_eq!(h.mgr.get_config().unwrap().settings.mode, DhcpMode::Relay);
        assert_eq!(h.detector.dhcp_backend().await.unwrap(), DhcpBackendKind::Disabled);
    }

    #[tokio::test]
    async fn test_disabled_stops_services() {
        let h = harness(idle_host(&["dnsmasq"]));
        let disabled = DhcpSettings {
            mode: DhcpMode::Disabled,
            ..Default::default()
        };
        let applied = h.mgr.set_settings(disabled).await.unwrap();
        assert_eq!(applied.backend, "disabled");
        assert!(!applied.changed);
        assert!(h.exec.ran("systemctl disable isc-dhcp-server"));
        assert!(h.exec.ran("systemctl disable isc-dhcp-relay"));
    }

    #[tokio::test]
    async fn test_live_reads_running_dnsmasq() {
        // pgrep answers success for every process by default.
        let h = harness(FixtureExecutor::new());
        std::fs::create_dir_all(h.settings.paths.dnsmasq_conf.parent().unwrap()).unwrap();
        std::fs::write(
            &h.settings.paths.dnsmasq_conf,
            "interface=lan0\ndhcp-range=10.9.0.10,10.9.0.20,1h\n",
        )
        .unwrap();

        let live = h.mgr.live().await.unwrap();
        let pool = live.records.settings.pool.unwrap();
        assert_eq!(pool.interface, "lan0");
        assert_eq!(pool.range_end, Ipv4Addr::new(10, 9, 0, 20));
    }

    #[tokio::test]
    async fn test_leases_fall_back_to_dnsmasq_file() {
        use chrono::TimeZone;

        let h = harness(idle_host(&[]));
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let path = &h.settings.paths.dnsmasq_leases;
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            path,
            format!("{} aa:bb:cc:dd:ee:01 192.168.1.101 laptop *\n", now.timestamp() + 600),
        )
        .unwrap();

        let leases = h.mgr.leases_at(now).await.unwrap().records;
        assert_eq!(leases.len(), 1);
        assert!(leases[0].active);

        // No lease files at all is an empty list, not an error.
        std::fs::remove_file(path).unwrap();
        assert!(h.mgr.leases_at(now).await.unwrap().records.is_empty());
    }
}
