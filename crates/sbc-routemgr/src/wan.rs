//! WAN uplink settings as interface intents.

use sbc_netcfg_common::model::{
    AddressingMode, NetworkInterfaceIntent, WanConnection, WanSettings,
};
use sbc_netcfg_common::{NetCfgError, NetCfgResult};

/// Builds the interface intent that realizes `wan`.
///
/// `current` is the declared intent for the same interface, if any; its type,
/// bridge ports and VLAN details are kept.
pub fn wan_to_interface(
    wan: &WanSettings,
    current: Option<&NetworkInterfaceIntent>,
) -> NetCfgResult<NetworkInterfaceIntent> {
    let base = match current {
        Some(intent) => intent.clone(),
        None => NetworkInterfaceIntent::dhcp(&wan.interface),
    };

    let intent = match wan.connection {
        WanConnection::Pppoe => return Err(NetCfgError::not_implemented("PPPoE WAN connection")),
        WanConnection::Dhcp => NetworkInterfaceIntent {
            mode: AddressingMode::Dhcp,
            address: None,
            netmask: None,
            gateway: None,
            dns: wan.dns.clone(),
            enabled: wan.enabled,
            ..base
        },
        WanConnection::Static => {
            let address = wan.address.ok_or_else(|| {
                NetCfgError::validation("address", "static WAN requires an address")
            })?;
            let netmask = wan.netmask.ok_or_else(|| {
                NetCfgError::validation("netmask", "static WAN requires a netmask")
            })?;
            NetworkInterfaceIntent {
                mode: AddressingMode::Static,
                address: Some(address),
                netmask: Some(netmask),
                gateway: wan.gateway,
                dns: wan.dns.clone(),
                enabled: wan.enabled,
                ..base
            }
        }
    };
    intent.validate()?;
    Ok(intent)
}

/// WAN settings seen through a declared interface intent.
pub fn wan_from_interface(intent: &NetworkInterfaceIntent) -> WanSettings {
    WanSettings {
        interface: intent.name.clone(),
        connection: match intent.mode {
            AddressingMode::Dhcp => WanConnection::Dhcp,
            AddressingMode::Static => WanConnection::Static,
        },
        address: intent.address,
        netmask: intent.netmask,
        gateway: intent.gateway,
        dns: intent.dns.clone(),
        enabled: intent.enabled,
        ..WanSettings::default()
    }
}
