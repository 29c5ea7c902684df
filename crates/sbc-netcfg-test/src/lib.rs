//! Integration test infrastructure for the network configuration managers
//!
//! Provides:
//! - A sandboxed host whose config files live in a temp directory
//! - Canned host profiles (netplan or ifupdown, nftables or iptables, dnsmasq or dhcpd)
//! - Intent fixtures for common router setups
//! - File and command verification helpers

pub mod fixtures;
mod host_env;
mod verification;

pub use fixtures::*;
pub use host_env::{HostBuilder, TestHost};
pub use sbc_netcfg_common::FixtureExecutor;
pub use verification::*;
