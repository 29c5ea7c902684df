//! Firewall rule engine.
//!
//! Declared firewall rules are rendered for whichever packet filter the host
//! runs:
//!
//! - nftables, as an `nft -f` script ([`NftablesBackend`])
//! - iptables, as an `iptables-restore` document ([`IptablesBackend`])
//!
//! Both backends manage the `filter` (INPUT, FORWARD, OUTPUT) and `nat`
//! (PREROUTING, POSTROUTING) tables and read the live rule set back.

pub mod backend;
pub mod fw_mgr;
pub mod iptables;
pub mod nftables;
pub mod tables;

pub use backend::FirewallBackend;
pub use fw_mgr::FwMgr;
pub use iptables::{parse_iptables, IptablesBackend};
pub use nftables::{parse_nft, NftablesBackend};
