//! Routing manager.
//!
//! Static routes are installed with `ip route` immediately and persisted as
//! route declarations of the active interface backend. The same manager
//! owns the WAN uplink, multi-WAN load balancing across weighted uplinks,
//! policy rules, and the stored UPnP and traffic shaping settings.

pub mod multiwan;
pub mod route_mgr;
pub mod routes;
pub mod tables;
pub mod wan;

pub use multiwan::{merge_rt_tables, MultipathPlan};
pub use route_mgr::{RouteMgr, RoutingStatus};
pub use routes::{parse_ip_route, Nexthop, PolicyRule, SystemRoute};
pub use wan::{wan_from_interface, wan_to_interface};
