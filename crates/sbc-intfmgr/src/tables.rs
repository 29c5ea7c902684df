//! Native format constants

// netplan
pub const NETPLAN_VERSION: u8 = 2;
pub const NETPLAN_RENDERER: &str = "networkd";
pub const NETPLAN_ACTIVATION_OFF: &str = "off";
pub const NETPLAN_HEADER: &str = "# Generated by netcfgd. Manual changes will be overwritten.\n";

// ifupdown
pub const IFUPDOWN_SOURCE_LINE: &str = "source /etc/network/interfaces.d/*";
pub const IFUPDOWN_HEADER: &[&str] = &[
    "# This file describes the network interfaces available on your system",
    "# and how to activate them. For more information, see interfaces(5).",
    "#",
    "# Generated by netcfgd. Manual changes will be overwritten.",
];
pub const LOOPBACK: &str = "lo";
pub const INDENT: &str = "    ";

// ifupdown stanza option keys
pub mod stanza_keys {
    pub const ADDRESS: &str = "address";
    pub const NETMASK: &str = "netmask";
    pub const GATEWAY: &str = "gateway";
    pub const DNS_NAMESERVERS: &str = "dns-nameservers";
    pub const DNS_SERVERS: &str = "dns-servers";
    pub const BRIDGE_PORTS: &str = "bridge_ports";
    pub const BRIDGE_STP: &str = "bridge_stp";
    pub const BRIDGE_FD: &str = "bridge_fd";
    pub const VLAN_RAW_DEVICE: &str = "vlan-raw-device";
    pub const WPA_SSID: &str = "wpa-ssid";
    pub const WPA_PSK: &str = "wpa-psk";
    pub const PRE_UP: &str = "pre-up";
    pub const UP: &str = "up";
    pub const POST_UP: &str = "post-up";
    pub const PRE_DOWN: &str = "pre-down";
    pub const DOWN: &str = "down";
    pub const POST_DOWN: &str = "post-down";
}

// Services
pub const NETWORKING_SERVICE: &str = "networking";
