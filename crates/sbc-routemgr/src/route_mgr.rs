//! Routing Manager - Core implementation

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use sbc_intfmgr::IntfMgr;
use sbc_netcfg_common::backend::read_native_file;
use sbc_netcfg_common::model::{
    validate_ifname, MultiWanMode, MultiWanSettings, StaticRouteIntent, TrafficShapingSettings,
    UpnpSettings, WanSettings,
};
use sbc_netcfg_common::settings::Settings;
use sbc_netcfg_common::shell::{
    argv, exec_or_fail, process_running, HostExecutor, IP_CMD, SYSTEMCTL_CMD,
};
use sbc_netcfg_common::store::keys;
use sbc_netcfg_common::{
    Applied, Applier, Artifact, Detector, IntentStore, NetCfgError, NetCfgResult, ParseOutcome,
};

use crate::multiwan::{merge_rt_tables, wan_table, MultipathPlan};
use crate::routes::{first_gateway, parse_ip_route, PolicyRule, SystemRoute};
use crate::tables::{MINIUPNPD_SERVICE, TC_CMD};
use crate::wan::{wan_from_interface, wan_to_interface};

/// Snapshot of the host's routing state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingStatus {
    pub default_gateway: Option<Ipv4Addr>,
    pub default_interface: Option<String>,
    pub total_routes: usize,
    pub static_routes: usize,
    pub upnp_enabled: bool,
    pub upnp_running: bool,
}

/// Routing Manager
///
/// Static routes go to the kernel immediately and are persisted as route
/// declarations of the interface backend, so they survive reboots. Also
/// owns the WAN uplink settings and multi-WAN load balancing.
pub struct RouteMgr {
    store: Arc<IntentStore>,
    exec: Arc<dyn HostExecutor>,
    settings: Arc<Settings>,
    applier: Arc<Applier>,
    intf: IntfMgr,
}

impl RouteMgr {
    pub fn new(
        store: Arc<IntentStore>,
        exec: Arc<dyn HostExecutor>,
        settings: Arc<Settings>,
        detector: Arc<Detector>,
        applier: Arc<Applier>,
    ) -> Self {
        let intf = IntfMgr::new(
            store.clone(),
            exec.clone(),
            settings.clone(),
            detector,
            applier.clone(),
        );
        Self {
            store,
            exec,
            settings,
            applier,
            intf,
        }
    }

    async fn ip(&self, args: &[String]) -> NetCfgResult<String> {
        let mut full = argv([IP_CMD]);
        full.extend_from_slice(args);
        exec_or_fail(self.exec.as_ref(), &full).await
    }

    async fn ip_routes(&self, args: &[&str]) -> NetCfgResult<ParseOutcome<Vec<SystemRoute>>> {
        let mut full = argv(["route", "show"]);
        full.extend(argv(args.iter().copied()));
        let out = self.ip(&full).await?;
        let outcome = parse_ip_route(&out);
        outcome.log_warnings("ip route show");
        Ok(outcome)
    }

    // ----- static routes -----

    pub fn list_static_routes(&self) -> NetCfgResult<Vec<StaticRouteIntent>> {
        self.store.list_static_routes()
    }

    /// Installs a static route now and persists it for the next boot.
    ///
    /// The intent is stored first; if the kernel rejects the route the
    /// previous intent and its kernel route are restored. Once the kernel has the route, a failure
    /// to re-render the interface configuration is reported as
    /// [`NetCfgError::RouteDiverged`].
    #[instrument(skip(self, route), fields(destination = %route.destination))]
    pub async fn add_static_route(&self, route: StaticRouteIntent) -> NetCfgResult<Applied> {
        route.validate()?;

        let previous = self
            .list_static_routes()?
            .into_iter()
            .find(|r| r.destination == route.destination);
        self.store.upsert_static_route(&route)?;

        let mut old_removed = false;
        if let Some(old) = &previous {
            let mut del = argv(["route", "del"]);
            del.extend(old.ip_args());
            match self.ip(&del).await {
                Ok(_) => old_removed = true,
                Err(e) => warn!("Replacing route to {}: {}", old.destination_str(), e),
            }
        }

        let mut add = argv(["route", "add"]);
        add.extend(route.ip_args());
        if let Err(e) = self.ip(&add).await {
            match &previous {
                Some(old) => self.store.upsert_static_route(old)?,
                None => {
                    self.store.delete_static_route(&route.destination.to_string())?;
                }
            }
            if let Some(old) = previous.as_ref().filter(|_| old_removed) {
                let mut restore = argv(["route", "add"]);
                restore.extend(old.ip_args());
                if let Err(restore_err) = self.ip(&restore).await {
                    error!(
                        "Route to {} is declared but gone from the kernel: {}",
                        old.destination_str(),
                        restore_err
                    );
                    return Err(NetCfgError::RouteDiverged {
                        what: format!("route to {}", old.destination_str()),
                        message: format!("{}; restoring the previous route: {}", e, restore_err),
                    });
                }
            }
            return Err(e);
        }
        info!("Added route to {}", route.destination_str());

        self.intf.apply().await.map_err(|e| {
            error!(
                "Route to {} is live but could not be persisted: {}",
                route.destination_str(),
                e
            );
            NetCfgError::RouteDiverged {
                what: format!("route to {}", route.destination_str()),
                message: e.to_string(),
            }
        })
    }

    /// Removes a declared route from the kernel and from the persisted declarations.
    #[instrument(skip(self))]
    pub async fn delete_static_route(&self, destination: Ipv4Network) -> NetCfgResult<Applied> {
        let Some(route) = self
            .list_static_routes()?
            .into_iter()
            .find(|r| r.destination == destination)
        else {
            return Err(NetCfgError::validation(
                "destination",
                format!("no static route to {}", destination),
            ));
        };

        let mut del = argv(["route", "del"]);
        del.extend(route.ip_args());
        if let Err(e) = self.ip(&del).await {
            // Usually "No such process": the kernel already dropped it.
            warn!("Kernel route to {} not removed: {}", route.destination_str(), e);
        }

        self.store.delete_static_route(&destination.to_string())?;
        info!("Deleted route to {}", route.destination_str());
        self.intf.apply().await
    }

    // ----- live routing state -----

    /// Routes in the main table.
    pub async fn live_routes(&self) -> NetCfgResult<ParseOutcome<Vec<SystemRoute>>> {
        self.ip_routes(&[]).await
    }

    pub async fn route_table(&self, table: u32) -> NetCfgResult<Vec<SystemRoute>> {
        let table = table.to_string();
        Ok(self.ip_routes(&["table", table.as_str()]).await?.records)
    }

    /// The kernel's default route, if there is one.
    pub async fn default_gateway(&self) -> NetCfgResult<Option<SystemRoute>> {
        let routes = self.ip_routes(&["default"]).await?.records;
        Ok(routes
            .into_iter()
            .find(|r| r.is_default() && (r.gateway.is_some() || !r.nexthops.is_empty())))
    }

    /// Replaces the kernel default route. Not persisted.
    #[instrument(skip(self))]
    pub async fn set_default_gateway(
        &self,
        gateway: Ipv4Addr,
        interface: Option<&str>,
    ) -> NetCfgResult<()> {
        if let Some(dev) = interface {
            validate_ifname(dev)?;
        }
        if let Err(e) = self.ip(&argv(["route", "del", "default"])).await {
            info!("No default route removed: {}", e);
        }

        let gateway = gateway.to_string();
        let mut add = argv(["route", "add", "default", "via", gateway.as_str()]);
        if let Some(dev) = interface {
            add.extend(argv(["dev", dev]));
        }
        self.ip(&add).await?;
        info!("Default gateway set to {}", gateway);
        Ok(())
    }

    pub async fn routing_status(&self) -> NetCfgResult<RoutingStatus> {
        let routes = self.live_routes().await?.records;
        let default = routes.iter().find(|r| r.is_default());
        Ok(RoutingStatus {
            default_gateway: default.and_then(|r| r.gateway),
            default_interface: default.and_then(|r| r.interface.clone()),
            total_routes: routes.len(),
            static_routes: routes.iter().filter(|r| r.is_static()).count(),
            upnp_enabled: self.get_upnp()?.enabled,
            upnp_running: process_running(self.exec.as_ref(), MINIUPNPD_SERVICE).await,
        })
    }

    #[instrument(skip(self))]
    pub async fn add_policy_rule(&self, rule: &PolicyRule) -> NetCfgResult<()> {
        rule.validate()?;
        let mut args = argv(["rule", "add"]);
        args.extend(rule.ip_args());
        self.ip(&args).await?;
        info!("Added policy rule -> table {}", rule.table);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove_policy_rule(&self, rule: &PolicyRule) -> NetCfgResult<()> {
        rule.validate()?;
        let mut args = argv(["rule", "del"]);
        args.extend(rule.ip_args());
        self.ip(&args).await?;
        info!("Removed policy rule -> table {}", rule.table);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn flush_route_table(&self, table: u32) -> NetCfgResult<()> {
        let table = table.to_string();
        self.ip(&argv(["route", "flush", "table", table.as_str()])).await?;
        info!("Flushed routing table {}", table);
        Ok(())
    }

    // ----- WAN -----

    /// Stored WAN settings, else what the declared WAN interface implies.
    pub fn get_wan(&self) -> NetCfgResult<WanSettings> {
        if let Some(wan) = self.store.get_config::<WanSettings>(keys::WAN)? {
            return Ok(wan);
        }
        let default = WanSettings::default();
        Ok(match self.intf.get(&default.interface)? {
            Some(intent) => wan_from_interface(&intent),
            None => default,
        })
    }

    /// Stores WAN settings and applies them as the uplink's interface intent.
    #[instrument(skip(self, wan), fields(interface = %wan.interface))]
    pub async fn set_wan(&self, wan: WanSettings) -> NetCfgResult<Applied> {
        validate_ifname(&wan.interface)?;
        let current = self.intf.get(&wan.interface)?;
        let intent = wan_to_interface(&wan, current.as_ref())?;
        if wan.mtu.is_some() {
            warn!("WAN MTU is stored but not rendered by the interface backends");
        }

        self.store.put_config(keys::WAN, &wan)?;
        info!("Saved WAN settings for {}", wan.interface);
        self.intf.save(intent).await
    }

    // ----- multi-WAN -----

    pub fn get_multi_wan(&self) -> NetCfgResult<MultiWanSettings> {
        Ok(self
            .store
            .get_config(keys::MULTI_WAN)?
            .unwrap_or_default())
    }

    /// Stores multi-WAN settings and, in load-balance mode, installs them.
    ///
    /// Returns `None` when nothing was applied (multi-WAN disabled).
    #[instrument(skip(self, multi))]
    pub async fn set_multi_wan(&self, multi: MultiWanSettings) -> NetCfgResult<Option<Applied>> {
        multi.validate()?;
        let previous = self.get_multi_wan()?;
        self.store.put_config(keys::MULTI_WAN, &multi)?;

        if !multi.enabled {
            if previous.enabled {
                self.flush_member_tables(&previous).await;
            }
            info!("Multi-WAN disabled");
            return Ok(None);
        }
        if multi.mode == MultiWanMode::Failover {
            return Err(NetCfgError::not_implemented("multi-WAN failover"));
        }

        let gateways = self.resolve_gateways(&multi).await;
        let plan = MultipathPlan::build(&multi.members, &gateways)?;

        let rt_tables = &self.settings.paths.rt_tables;
        let existing = read_native_file(rt_tables).await?;
        let (text, table_warnings) = merge_rt_tables(&existing, &plan.table_entries());

        let mut artifact = Artifact::new("iproute2")
            .with_file(rt_tables, text)
            .reload_with(plan.route_argv());
        for route in plan.table_routes() {
            artifact = artifact.then_run(route);
        }
        for warning in plan.warnings.iter().chain(&table_warnings) {
            artifact = artifact.with_warning(warning.clone());
        }

        info!(
            "Load balancing default route over {} of {} WAN members",
            plan.members.len(),
            multi.members.len()
        );
        Ok(Some(self.applier.apply(&artifact).await?))
    }

    /// Gateway of each enabled member, from `ip route show dev NAME`.
    async fn resolve_gateways(&self, multi: &MultiWanSettings) -> HashMap<String, Ipv4Addr> {
        let mut gateways = HashMap::new();
        for member in multi.members.iter().filter(|m| m.enabled) {
            let args = argv(["route", "show", "dev", member.name.as_str()]);
            match self.ip(&args).await {
                Ok(out) => {
                    if let Some(gw) = first_gateway(&out) {
                        gateways.insert(member.name.clone(), gw);
                    }
                }
                Err(e) => warn!("Cannot read routes of {}: {}", member.name, e),
            }
        }
        gateways
    }

    async fn flush_member_tables(&self, multi: &MultiWanSettings) {
        for (position, member) in multi.members.iter().enumerate() {
            if !member.enabled {
                continue;
            }
            let (table, _) = wan_table(position);
            if let Err(e) = self.flush_route_table(table).await {
                warn!("Flushing table {} for {}: {}", table, member.name, e);
            }
        }
    }

    // ----- UPnP and traffic shaping -----

    pub fn get_upnp(&self) -> NetCfgResult<UpnpSettings> {
        Ok(self.store.get_config(keys::UPNP)?.unwrap_or_default())
    }

    /// Stores UPnP settings. Disabling stops the daemon; enabling is not implemented.
    #[instrument(skip(self, upnp))]
    pub async fn set_upnp(&self, upnp: UpnpSettings) -> NetCfgResult<Applied> {
        validate_ifname(&upnp.external_interface)?;
        validate_ifname(&upnp.internal_interface)?;
        self.store.put_config(keys::UPNP, &upnp)?;

        if upnp.enabled {
            return Err(NetCfgError::not_implemented("UPnP port mapping"));
        }
        let artifact = Artifact::new(MINIUPNPD_SERVICE)
            .then_run(argv([SYSTEMCTL_CMD, "stop", MINIUPNPD_SERVICE]))
            .then_run(argv([SYSTEMCTL_CMD, "disable", MINIUPNPD_SERVICE]));
        self.applier.apply(&artifact).await
    }

    pub fn get_traffic_shaping(&self) -> NetCfgResult<TrafficShapingSettings> {
        Ok(self
            .store
            .get_config(keys::TRAFFIC_SHAPING)?
            .unwrap_or_default())
    }

    /// Stores shaping settings. Disabling removes the root qdisc; enabling is not implemented.
    #[instrument(skip(self, shaping))]
    pub async fn set_traffic_shaping(
        &self,
        shaping: TrafficShapingSettings,
    ) -> NetCfgResult<Applied> {
        validate_ifname(&shaping.interface)?;
        self.store.put_config(keys::TRAFFIC_SHAPING, &shaping)?;

        if shaping.enabled {
            return Err(NetCfgError::not_implemented("traffic shaping"));
        }
        let artifact = Artifact::new(TC_CMD).then_run(argv([
            TC_CMD,
            "qdisc",
            "del",
            "dev",
            shaping.interface.as_str(),
            "root",
        ]));
        self.applier.apply(&artifact).await
    }
}
