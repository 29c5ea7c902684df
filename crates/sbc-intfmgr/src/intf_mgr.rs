//! Interface Manager - Core implementation

use std::sync::Arc;

use tracing::{info, instrument, warn};

use sbc_netcfg_common::model::{
    validate_interface_set, InterfaceDeclarations, NetworkInterfaceIntent,
};
use sbc_netcfg_common::settings::Settings;
use sbc_netcfg_common::shell::HostExecutor;
use sbc_netcfg_common::{
    Applied, Applier, Backend, Detector, IntentStore, NetCfgError, NetCfgResult, ParseOutcome,
};

use crate::backend::InterfaceBackend;

/// Interface Manager
///
/// Owns the declared interface set and keeps the active interface backend's
/// configuration in line with it:
/// - list/get/save/delete of interface intents
/// - rendering interfaces plus declared static routes
/// - reading back whatever the backend currently has configured
pub struct IntfMgr {
    store: Arc<IntentStore>,
    exec: Arc<dyn HostExecutor>,
    settings: Arc<Settings>,
    detector: Arc<Detector>,
    applier: Arc<Applier>,
}

impl IntfMgr {
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

    /// The backend the detector selected for this host.
    pub async fn backend(&self) -> NetCfgResult<InterfaceBackend> {
        let kind = self.detector.interface_backend().await?;
        Ok(InterfaceBackend::for_kind(kind, &self.settings))
    }

    pub fn list(&self) -> NetCfgResult<Vec<NetworkInterfaceIntent>> {
        self.store.list_interfaces()
    }

    pub fn get(&self, name: &str) -> NetCfgResult<Option<NetworkInterfaceIntent>> {
        self.store.get_interface(name)
    }

    /// Declared interfaces together with declared static routes.
    pub fn declarations(&self) -> NetCfgResult<InterfaceDeclarations> {
        Ok(InterfaceDeclarations {
            interfaces: self.store.list_interfaces()?,
            routes: self.store.list_static_routes()?,
        })
    }

    /// Validates, persists and applies one interface intent.
    #[instrument(skip(self, intent), fields(name = %intent.name))]
    pub async fn save(&self, intent: NetworkInterfaceIntent) -> NetCfgResult<Applied> {
        intent.validate()?;

        let mut set = self.list()?;
        set.retain(|i| i.name != intent.name);
        set.push(intent.clone());
        validate_interface_set(&set)?;

        self.store.upsert_interface(&intent)?;
        info!("Saved interface {} ({}, {})", intent.name, intent.kind, intent.mode.as_str());

        self.apply().await
    }

    /// Removes an interface intent and re-applies the remaining set.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> NetCfgResult<Applied> {
        if !self.store.delete_interface(name)? {
            return Err(NetCfgError::validation(
                "name",
                format!("no interface named {}", name),
            ));
        }
        info!("Deleted interface {}", name);
        self.apply().await
    }

    /// Renders the full declared set with the active backend and applies it.
    #[instrument(skip(self))]
    pub async fn apply(&self) -> NetCfgResult<Applied> {
        let decl = self.declarations()?;
        let backend = self.backend().await?;
        let artifact = backend.synthesize(&decl)?;
        info!(
            "Applying {} interfaces and {} routes via {}",
            decl.interfaces.len(),
            decl.routes.len(),
            backend.kind()
        );
        self.applier.apply(&artifact).await
    }

    /// What the active backend currently has configured.
    pub async fn live(&self) -> NetCfgResult<ParseOutcome<InterfaceDeclarations>> {
        let backend = self.backend().await?;
        let outcome = backend.read_live(self.exec.as_ref()).await?;
        outcome.log_warnings(&backend.kind().to_string());
        Ok(outcome)
    }

    /// Imports live interfaces and routes that have no intent yet.
    ///
    /// Declared intents are never overwritten. Returns the number of records
    /// imported. Nothing is applied.
    #[instrument(skip(self))]
    pub async fn adopt_live(&self) -> NetCfgResult<usize> {
        let live = self.live().await?.records;
        let declared = self.declarations()?;
        let mut imported = 0;

        for intf in live.interfaces {
            if declared.interface(&intf.name).is_some() {
                continue;
            }
            if let Err(e) = intf.validate() {
                warn!("Not adopting {}: {}", intf.name, e);
                continue;
            }
            self.store.upsert_interface(&intf)?;
            info!("Adopted interface {}", intf.name);
            imported += 1;
        }

        for route in live.routes {
            if declared
                .routes
                .iter()
                .any(|r| r.destination == route.destination)
            {
                continue;
            }
            if let Err(e) = route.validate() {
                warn!("Not adopting route to {}: {}", route.destination, e);
                continue;
            }
            self.store.upsert_static_route(&route)?;
            info!("Adopted route to {}", route.destination_str());
            imported += 1;
        }
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbc_netcfg_common::model::{InterfaceType, StaticRouteIntent};
    use sbc_netcfg_common::FixtureExecutor;
    use std::net::Ipv4Addr;
    use std::path::Path;

    struct Harness {
        _root: tempfile::TempDir,
        exec: Arc<FixtureExecutor>,
        settings: Arc<Settings>,
        mgr: IntfMgr,
    }

    fn harness(netplan: bool) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let settings = Arc::new(Settings::rooted_at(root.path()));
        let mut exec = FixtureExecutor::new();
        if netplan {
            exec = exec.with_tool("netplan").with_path(&settings.paths.netplan_dir);
        } else {
            exec = exec.with_path(&settings.paths.interfaces_file);
        }
        let exec = Arc::new(exec);
        let dyn_exec: Arc<dyn HostExecutor> = exec.clone();
        let store = Arc::new(IntentStore::open_in_memory().unwrap());
        let detector = Arc::new(Detector::new(dyn_exec.clone(), settings.clone()));
        let applier = Arc::new(Applier::new(dyn_exec.clone()));
        let mgr = IntfMgr::new(store, dyn_exec, settings.clone(), detector, applier);
        Harness {
            _root: root,
            exec,
            settings,
            mgr,
        }
    }

    fn lan() -> NetworkInterfaceIntent {
        NetworkInterfaceIntent::static_v4(
            "eth0",
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(255, 255, 255, 0),
        )
        .with_gateway(Ipv4Addr::new(192, 168, 1, 254))
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn test_save_applies_netplan() {
        let h = harness(true);
        let applied = h.mgr.save(lan()).await.unwrap();
        assert!(applied.changed);
        assert_eq!(applied.backend, "netplan");
        assert!(read(&h.settings.paths.netplan_file).contains("192.168.1.1/24"));
        assert_eq!(
            h.exec.commands(),
            vec!["netplan generate", "netplan apply"]
        );

        let live = h.mgr.live().await.unwrap();
        assert_eq!(live.records.interfaces, vec![lan()]);
    }

    #[tokio::test]
    async fn test_save_twice_is_idempotent() {
        let h = harness(false);
        h.mgr.save(lan()).await.unwrap();
        let first = read(&h.settings.paths.interfaces_file);
        let applied = h.mgr.apply().await.unwrap();
        assert!(!applied.changed);
        assert_eq!(read(&h.settings.paths.interfaces_file), first);
        assert_eq!(h.exec.commands_starting_with("systemctl restart").len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_intent_not_persisted() {
        let h = harness(true);
        let mut bad = lan();
        bad.netmask = None;
        let err = h.mgr.save(bad).await.unwrap_err();
        assert!(err.is_validation());
        assert!(h.mgr.list().unwrap().is_empty());
        assert!(h.exec.commands().is_empty());
    }

    #[tokio::test]
    async fn test_apply_failure_surfaces_stderr() {
        let h = harness(true);
        h.exec.set_response(
            "netplan generate",
            sbc_netcfg_common::ExecResult::failed(1, "Error in network definition"),
        );
        let err = h.mgr.save(lan()).await.unwrap_err();
        match err {
            NetCfgError::ApplyFailed { stderr, command, .. } => {
                assert_eq!(command, "netplan generate");
                assert!(stderr.contains("Error in network definition"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        // Persisted before apply.
        assert!(h.mgr.get("eth0").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_unknown_interface() {
        let h = harness(true);
        let err = h.mgr.delete("eth7").await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_adopt_live_imports_undeclared() {
        let h = harness(false);
        std::fs::create_dir_all(h.settings.paths.interfaces_file.parent().unwrap()).unwrap();
        std::fs::write(
            &h.settings.paths.interfaces_file,
            "auto eth0\niface eth0 inet dhcp\n\nauto br0\niface br0 inet static\n    address 10.0.0.1\n    netmask 255.255.255.0\n    bridge_ports eth1\n    post-up ip route add 172.16.0.0/16 via 10.0.0.2\n",
        )
        .unwrap();
        h.mgr.save(NetworkInterfaceIntent::dhcp("eth0").disabled()).await.unwrap();
        // save() rewrote the file; put the hand-written one back
        std::fs::write(
            &h.settings.paths.interfaces_file,
            "auto eth0\niface eth0 inet dhcp\n\nauto br0\niface br0 inet static\n    address 10.0.0.1\n    netmask 255.255.255.0\n    bridge_ports eth1\n    post-up ip route add 172.16.0.0/16 via 10.0.0.2\n",
        )
        .unwrap();

        let imported = h.mgr.adopt_live().await.unwrap();
        assert_eq!(imported, 2);

        let eth0 = h.mgr.get("eth0").unwrap().unwrap();
        assert!(!eth0.enabled, "declared intent must not be overwritten");
        let br0 = h.mgr.get("br0").unwrap().unwrap();
        assert_eq!(br0.kind, InterfaceType::Bridge);

        let decl = h.mgr.declarations().unwrap();
        assert_eq!(
            decl.routes,
            vec![StaticRouteIntent::via(
                "172.16.0.0/16".parse().unwrap(),
                Ipv4Addr::new(10, 0, 0, 2)
            )]
        );
    }

    #[tokio::test]
    async fn test_no_backend_available() {
        let root = tempfile::tempdir().unwrap();
        let settings = Arc::new(Settings::rooted_at(root.path()));
        let exec: Arc<dyn HostExecutor> = Arc::new(FixtureExecutor::new());
        let mgr = IntfMgr::new(
            Arc::new(IntentStore::open_in_memory().unwrap()),
            exec.clone(),
            settings.clone(),
            Arc::new(Detector::new(exec.clone(), settings)),
            Arc::new(Applier::new(exec)),
        );
        let err = mgr.save(lan()).await.unwrap_err();
        assert!(matches!(err, NetCfgError::BackendUnavailable { .. }));
    }
}
