//! Constants for routing tables, route protocols and companion services.

/// First routing table number handed to multi-WAN members.
pub const WAN_TABLE_BASE: u32 = 100;

/// Routing table names are this prefix plus the member's 1-based position.
pub const WAN_TABLE_PREFIX: &str = "wan";

/// `ip route` protocols that the kernel or an address daemon installed.
///
/// Anything else (including no `proto` at all) counts as a static route.
pub const DYNAMIC_PROTOCOLS: &[&str] = &["kernel", "connected", "dhcp", "ra"];

/// Route types that may precede the destination in `ip route show` output.
pub const ROUTE_TYPES: &[&str] = &[
    "unicast",
    "local",
    "broadcast",
    "multicast",
    "anycast",
    "blackhole",
    "unreachable",
    "prohibit",
    "throw",
    "nat",
];

/// `ip route` attributes that take one value and are not modeled.
pub const IGNORED_ATTRIBUTES: &[&str] = &[
    "table", "pref", "expires", "mtu", "advmss", "realm", "realms", "rtt", "rttvar", "hoplimit",
    "initcwnd", "initrwnd", "congctl", "features", "quickack", "nhid",
];

/// UPnP IGD daemon.
pub const MINIUPNPD_SERVICE: &str = "miniupnpd";

/// Linux traffic control.
pub const TC_CMD: &str = "tc";

/// Reserved entries written when `rt_tables` does not exist yet.
pub const RT_TABLES_RESERVED: &str = "\
#
# reserved values
#
255\tlocal
254\tmain
253\tdefault
0\tunspec
#
# local
#
";
