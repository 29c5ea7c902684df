//! Subcommand dispatch onto the subsystem managers.

use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use serde::Serialize;
use tracing::{debug, info};

use sbc_dhcpmgr::DhcpMgr;
use sbc_fwmgr::FwMgr;
use sbc_intfmgr::IntfMgr;
use sbc_netcfg_common::model::{
    DhcpMode, DhcpReservationIntent, DhcpSettings, FirewallRuleIntent, MultiWanMode,
    MultiWanSettings, NetworkInterfaceIntent, StaticRouteIntent, WanConnection, WanSettings,
};
use sbc_netcfg_common::{
    Applied, Applier, Detector, HostExecutor, IntentStore, ParseOutcome, Settings, SystemExecutor,
};
use sbc_routemgr::{PolicyRule, RouteMgr};

use crate::cli::{
    Command, DhcpCommand, FirewallCommand, InterfaceCommand, RouteCommand, RuleArgs, WanCommand,
};

/// Every manager wired to one store, executor, detector and applier.
pub struct Context {
    detector: Arc<Detector>,
    intf: IntfMgr,
    fw: FwMgr,
    dhcp: DhcpMgr,
    routes: RouteMgr,
}

impl Context {
    pub fn open(settings: Settings) -> Result<Self> {
        let settings = Arc::new(settings);
        let exec: Arc<dyn HostExecutor> = Arc::new(SystemExecutor::new(settings.command_timeout()));
        let store = Arc::new(
            IntentStore::open(&settings.database.path).with_context(|| {
                format!("opening intent store {}", settings.database.path.display())
            })?,
        );
        Ok(Self::with_parts(store, exec, settings))
    }

    pub fn with_parts(
        store: Arc<IntentStore>,
        exec: Arc<dyn HostExecutor>,
        settings: Arc<Settings>,
    ) -> Self {
        let detector = Arc::new(Detector::new(exec.clone(), settings.clone()));
        let applier = Arc::new(Applier::new(exec.clone()));
        Self {
            intf: IntfMgr::new(
                store.clone(),
                exec.clone(),
                settings.clone(),
                detector.clone(),
                applier.clone(),
            ),
            fw: FwMgr::new(
                store.clone(),
                exec.clone(),
                settings.clone(),
                detector.clone(),
                applier.clone(),
            ),
            dhcp: DhcpMgr::new(
                store.clone(),
                exec.clone(),
                settings.clone(),
                detector.clone(),
                applier.clone(),
            ),
            routes: RouteMgr::new(store, exec, settings, detector.clone(), applier),
            detector,
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_outcome<T: Serialize>(outcome: &ParseOutcome<T>) -> Result<()> {
    for warning in &outcome.warnings {
        eprintln!("warning: {}", warning);
    }
    print_json(&outcome.records)
}

fn print_applied(applied: &Applied) {
    let paths: Vec<String> = applied.paths.iter().map(|p| p.display().to_string()).collect();
    println!(
        "{}: {} ({})",
        applied.backend,
        if applied.changed { "updated" } else { "unchanged" },
        if paths.is_empty() {
            "no files".to_string()
        } else {
            paths.join(", ")
        }
    );
}

pub async fn dispatch(ctx: &Context, command: Command) -> Result<()> {
    debug!(command = ?command, "dispatching command");
    match command {
        Command::Detect => {
            let selection = ctx.detector.detect_all().await;
            print_json(&selection)
        }
        Command::Interfaces(cmd) => interfaces(ctx, cmd).await,
        Command::Firewall(cmd) => firewall(ctx, cmd).await,
        Command::Dhcp(cmd) => dhcp(ctx, cmd).await,
        Command::Leases => print_outcome(&ctx.dhcp.leases().await?),
        Command::Routes(cmd) => routes(ctx, cmd).await,
        Command::Wan(cmd) => wan(ctx, cmd).await,
    }
}

async fn interfaces(ctx: &Context, cmd: InterfaceCommand) -> Result<()> {
    match cmd {
        InterfaceCommand::List => print_json(&ctx.intf.list()?),
        InterfaceCommand::Show { name } => match ctx.intf.get(&name)? {
            Some(intent) => print_json(&intent),
            None => bail!("no interface named {}", name),
        },
        InterfaceCommand::SetStatic {
            name,
            address,
            netmask,
            gateway,
            dns,
        } => {
            let mut intent = NetworkInterfaceIntent::static_v4(name, address, netmask).with_dns(dns);
            intent.gateway = gateway;
            print_applied(&ctx.intf.save(intent).await?);
            Ok(())
        }
        InterfaceCommand::SetDhcp { name, dns } => {
            let intent = NetworkInterfaceIntent::dhcp(name).with_dns(dns);
            print_applied(&ctx.intf.save(intent).await?);
            Ok(())
        }
        InterfaceCommand::Delete { name } => {
            print_applied(&ctx.intf.delete(&name).await?);
            Ok(())
        }
        InterfaceCommand::Live => print_outcome(&ctx.intf.live().await?),
        InterfaceCommand::Adopt => {
            let imported = ctx.intf.adopt_live().await?;
            println!("adopted {} records", imported);
            Ok(())
        }
        InterfaceCommand::Apply => {
            print_applied(&ctx.intf.apply().await?);
            Ok(())
        }
    }
}

async fn firewall(ctx: &Context, cmd: FirewallCommand) -> Result<()> {
    match cmd {
        FirewallCommand::List => print_json(&ctx.fw.list_rules()?),
        FirewallCommand::Add {
            chain,
            action,
            protocol,
            source,
            destination,
            port,
            position,
            comment,
        } => {
            let mut rule = FirewallRuleIntent::new(chain, action);
            rule.protocol = protocol;
            rule.source = source;
            rule.destination = destination;
            rule.port = port;
            rule.comment = comment;
            let (id, applied) = ctx.fw.create_rule(rule, position).await?;
            println!("created rule {}", id);
            print_applied(&applied);
            Ok(())
        }
        FirewallCommand::Delete { id } => {
            print_applied(&ctx.fw.delete_rule(id).await?);
            Ok(())
        }
        FirewallCommand::Enable { id } => {
            print_applied(&ctx.fw.set_rule_enabled(id, true).await?);
            Ok(())
        }
        FirewallCommand::Disable { id } => {
            print_applied(&ctx.fw.set_rule_enabled(id, false).await?);
            Ok(())
        }
        FirewallCommand::Live => print_outcome(&ctx.fw.live().await?),
        FirewallCommand::Adopt => {
            let imported = ctx.fw.adopt_live().await?;
            println!("adopted {} rules", imported);
            Ok(())
        }
        FirewallCommand::Apply => {
            print_applied(&ctx.fw.apply().await?);
            Ok(())
        }
    }
}

async fn dhcp(ctx: &Context, cmd: DhcpCommand) -> Result<()> {
    let applied = match cmd {
        DhcpCommand::Show => return print_json(&ctx.dhcp.get_config()?),
        DhcpCommand::Live => return print_outcome(&ctx.dhcp.live().await?),
        DhcpCommand::Server {
            start,
            end,
            interface,
            netmask,
            lease,
            router,
            dns,
            domain,
        } => {
            let mut pool = ctx.dhcp.default_pool(start, end);
            if let Some(interface) = interface {
                pool.interface = interface;
            }
            if let Some(lease) = lease {
                pool.lease_time = lease;
            }
            if domain.is_some() {
                pool.domain = domain;
            }
            pool.netmask = netmask;
            pool.router = router;
            pool.dns_servers = dns;
            ctx.dhcp
                .set_settings(DhcpSettings {
                    mode: DhcpMode::Server,
                    pool: Some(pool),
                    ..DhcpSettings::default()
                })
                .await?
        }
        DhcpCommand::Relay {
            servers,
            interfaces,
        } => {
            ctx.dhcp
                .set_settings(DhcpSettings {
                    mode: DhcpMode::Relay,
                    pool: None,
                    relay_servers: servers,
                    relay_interfaces: interfaces,
                })
                .await?
        }
        DhcpCommand::Disable => {
            let mut settings = ctx.dhcp.get_config()?.settings;
            settings.mode = DhcpMode::Disabled;
            ctx.dhcp.set_settings(settings).await?
        }
        DhcpCommand::Reserve { mac, ip, hostname } => {
            let reservation = DhcpReservationIntent::new(&mac, ip, hostname.as_deref())?;
            ctx.dhcp.add_reservation(reservation).await?
        }
        DhcpCommand::Unreserve { mac } => ctx.dhcp.remove_reservation(&mac).await?,
        DhcpCommand::Apply => ctx.dhcp.apply().await?,
    };
    print_applied(&applied);
    Ok(())
}

fn policy_rule(args: RuleArgs) -> PolicyRule {
    PolicyRule {
        from: args.from,
        to: args.to,
        iif: args.iif,
        table: args.table,
    }
}

async fn routes(ctx: &Context, cmd: RouteCommand) -> Result<()> {
    let mgr = &ctx.routes;
    match cmd {
        RouteCommand::List => print_json(&mgr.list_static_routes()?),
        RouteCommand::Live => print_outcome(&mgr.live_routes().await?),
        RouteCommand::Table { id } => print_json(&mgr.route_table(id).await?),
        RouteCommand::Add {
            destination,
            via,
            dev,
            metric,
        } => {
            let route = StaticRouteIntent {
                destination,
                gateway: via,
                interface: dev,
                metric,
            };
            print_applied(&mgr.add_static_route(route).await?);
            Ok(())
        }
        RouteCommand::Delete { destination } => {
            print_applied(&mgr.delete_static_route(destination).await?);
            Ok(())
        }
        RouteCommand::Default => match mgr.default_gateway().await? {
            Some(route) => print_json(&route),
            None => bail!("no default route"),
        },
        RouteCommand::SetDefault { gateway, dev } => {
            mgr.set_default_gateway(gateway, dev.as_deref()).await?;
            Ok(())
        }
        RouteCommand::Status => print_json(&mgr.routing_status().await?),
        RouteCommand::RuleAdd(args) => Ok(mgr.add_policy_rule(&policy_rule(args)).await?),
        RouteCommand::RuleDel(args) => Ok(mgr.remove_policy_rule(&policy_rule(args)).await?),
        RouteCommand::Flush { table } => Ok(mgr.flush_route_table(table).await?),
    }
}

async fn wan(ctx: &Context, cmd: WanCommand) -> Result<()> {
    let mgr = &ctx.routes;
    match cmd {
        WanCommand::Show => print_json(&mgr.get_wan()?),
        WanCommand::Dhcp { interface, dns } => {
            let wan = WanSettings {
                interface,
                connection: WanConnection::Dhcp,
                dns,
                ..WanSettings::default()
            };
            print_applied(&mgr.set_wan(wan).await?);
            Ok(())
        }
        WanCommand::Static {
            interface,
            address,
            netmask,
            gateway,
            dns,
        } => {
            let wan = WanSettings {
                interface,
                connection: WanConnection::Static,
                address: Some(address),
                netmask: Some(netmask),
                gateway,
                dns,
                ..WanSettings::default()
            };
            print_applied(&mgr.set_wan(wan).await?);
            Ok(())
        }
        WanCommand::MultiShow => print_json(&mgr.get_multi_wan()?),
        WanCommand::MultiSet { members } => {
            let multi = MultiWanSettings {
                enabled: true,
                mode: MultiWanMode::LoadBalance,
                members,
                failover: mgr.get_multi_wan()?.failover,
            };
            if let Some(applied) = mgr.set_multi_wan(multi).await? {
                print_applied(&applied);
            }
            Ok(())
        }
        WanCommand::MultiDisable => {
            let multi = MultiWanSettings {
                enabled: false,
                ..mgr.get_multi_wan()?
            };
            mgr.set_multi_wan(multi).await?;
            info!("Multi-WAN disabled");
            Ok(())
        }
    }
}
