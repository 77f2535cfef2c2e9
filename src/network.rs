//! Network interface enumeration and address helpers.

use std::net::{IpAddr, Ipv4Addr};

use crate::errors::ControlPointError;

/// One bindable address of a network interface.
#[derive(Debug, Clone)]
pub struct InterfaceAddress {
    /// Interface name (`eth0`, `en0`, ...).
    pub name: String,
    /// Address assigned to the interface.
    pub address: IpAddr,
    /// Prefix length of the attached subnet (0 when unknown).
    pub prefix_length: u8,
}

impl InterfaceAddress {
    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }
}

/// Enumerate candidate interface addresses for SSDP: every address of every
/// non-loopback interface. Link-local scoping for IPv6 is handled at socket
/// setup.
pub fn interface_addresses() -> Result<Vec<InterfaceAddress>, ControlPointError> {
    let mut result = Vec::new();
    for iface in get_if_addrs::get_if_addrs().map_err(ControlPointError::network)? {
        if iface.is_loopback() {
            continue;
        }
        let (address, prefix_length) = match &iface.addr {
            get_if_addrs::IfAddr::V4(v4) => {
                (IpAddr::V4(v4.ip), prefix_length_v4(v4.netmask))
            }
            get_if_addrs::IfAddr::V6(v6) => (IpAddr::V6(v6.ip), 0),
        };
        result.push(InterfaceAddress {
            name: iface.name.clone(),
            address,
            prefix_length,
        });
    }
    Ok(result)
}

/// Prefix length of a contiguous IPv4 netmask.
pub fn prefix_length_v4(netmask: Ipv4Addr) -> u8 {
    u32::from(netmask).count_ones() as u8
}

/// True when `source` lies inside the subnet `interface_address/prefix`.
///
/// A zero prefix matches everything; prefixes of 32 require an exact match.
pub fn in_same_segment(interface_address: Ipv4Addr, prefix: u8, source: Ipv4Addr) -> bool {
    if prefix == 0 {
        return true;
    }
    let prefix = prefix.min(32) as u32;
    let mask = if prefix == 32 {
        u32::MAX
    } else {
        !(u32::MAX >> prefix)
    };
    (u32::from(interface_address) & mask) == (u32::from(source) & mask)
}

/// Format an address for inclusion in a URL authority.
pub fn format_ip(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    }
}
