//! DHCP Lease/Reservation Manager
//!
//! Renders the declared DHCP service (pool, reservations, relay targets)
//! for whichever server the host provides and reads its leases back:
//!
//! - dnsmasq, sharing its config file with DNS through a managed block
//! - ISC dhcpd, with the `INTERFACESv4` defaults file
//! - ISC dhcrelay
//! - disabled, which stops the ISC services

pub mod backend;
pub mod dhcp_mgr;
pub mod dnsmasq;
pub mod isc_syntax;
pub mod iscdhcp;
pub mod leases;
pub mod relay;
pub mod tables;

pub use backend::{DhcpBackend, DisabledBackend};
pub use dhcp_mgr::DhcpMgr;
pub use dnsmasq::{parse_dnsmasq, DnsmasqBackend};
pub use iscdhcp::{parse_dhcpd_conf, IscDhcpBackend};
pub use leases::{parse_dnsmasq_leases, parse_isc_leases};
pub use relay::{parse_relay_defaults, RelayBackend};
