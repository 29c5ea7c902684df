//! DHCP file markers, option names and service names

// dnsmasq managed block
pub const DNSMASQ_BEGIN: &str = "# BEGIN netcfgd DHCP (managed, do not edit)";
pub const DNSMASQ_END: &str = "# END netcfgd DHCP";

/// dnsmasq directives that belong to the managed block and are dropped
/// when found outside it.
pub const DNSMASQ_DHCP_DIRECTIVES: &[&str] = &[
    "dhcp-range",
    "dhcp-option",
    "dhcp-host",
    "dhcp-authoritative",
];

pub mod dnsmasq_options {
    pub const ROUTER: &str = "option:router";
    pub const ROUTER_CODE: &str = "3";
    pub const DNS_SERVER: &str = "option:dns-server";
    pub const DNS_SERVER_CODE: &str = "6";
    pub const DOMAIN_NAME: &str = "option:domain-name";
    pub const DOMAIN_NAME_CODE: &str = "15";
}

// ISC dhcpd
pub const ISC_HEADER: &str = "# Generated by netcfgd. Manual changes will be overwritten.";

/// Prefix of host block names derived from a MAC when no hostname is set.
pub const ISC_HOST_PREFIX: &str = "res-";

/// Global statements read without warning but not modeled.
pub const ISC_IGNORED_GLOBALS: &[&str] = &[
    "max-lease-time",
    "ddns-update-style",
    "log-facility",
    "one-lease-per-client",
];

// Services
pub const DNSMASQ_SERVICE: &str = "dnsmasq";
pub const DHCPD_SERVICE: &str = "isc-dhcp-server";
pub const RELAY_SERVICE: &str = "isc-dhcp-relay";
