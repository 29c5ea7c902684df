//! Interface configuration manager.
//!
//! Keeps the host's interface configuration in line with the declared
//! interface intents, through whichever backend the host uses:
//!
//! - netplan YAML under `/etc/netplan` ([`NetplanBackend`])
//! - Debian ifupdown stanzas in `/etc/network/interfaces` ([`IfupdownBackend`])
//!
//! Declared static routes are persisted alongside the interface that owns
//! them, so they survive reboots on either backend.

pub mod backend;
pub mod ifupdown;
pub mod intf_mgr;
pub mod netplan;
pub mod tables;

pub use backend::{route_owner, InterfaceBackend};
pub use ifupdown::{parse_interfaces, IfupdownBackend};
pub use intf_mgr::IntfMgr;
pub use netplan::{parse_netplan, NetplanBackend};
