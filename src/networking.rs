//! Networking helpers: IPv4 subnet arithmetic and local interface
//! enumeration, used by the subnet-binding connection and by transports
//! that advertise themselves per interface.

use std::io;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 subnet in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Subnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Subnet {
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> io::Result<Self> {
        if prefix_len > 32 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid prefix length: {prefix_len}"),
            ));
        }
        let mask = Self::mask_of(prefix_len);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(network) & mask),
            prefix_len,
        })
    }

    fn mask_of(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix_len))
        }
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & Self::mask_of(self.prefix_len) == u32::from(self.network)
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

impl FromStr for Ipv4Subnet {
    type Err = io::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (addr, len) = value.split_once('/').ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a CIDR subnet: {value}"),
            )
        })?;
        let network: Ipv4Addr = addr.parse().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid address: {addr}"))
        })?;
        let prefix_len: u8 = len.parse().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid prefix: {len}"))
        })?;
        Self::new(network, prefix_len)
    }
}

impl std::fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Finds the local interfaces that have an IPv4 address inside the given
/// subnet. Returns `(interface name, address)` pairs.
pub fn find_interfaces_in_subnet(subnet: Ipv4Subnet) -> io::Result<Vec<(String, Ipv4Addr)>> {
    let mut result = Vec::new();
    for interface in if_addrs::get_if_addrs()? {
        if let std::net::IpAddr::V4(address) = interface.ip() {
            if subnet.contains(address) {
                result.push((interface.name.clone(), address));
            }
        }
    }
    Ok(result)
}

/// All IPv4 addresses of the local machine, loopback included.
pub fn get_all_ipv4_addresses() -> io::Result<Vec<Ipv4Addr>> {
    Ok(if_addrs::get_if_addrs()?
        .into_iter()
        .filter_map(|interface| match interface.ip() {
            std::net::IpAddr::V4(address) => Some(address),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_parsing_and_membership() {
        let subnet: Ipv4Subnet = "192.168.1.0/24".parse().unwrap();
        assert!(subnet.contains(Ipv4Addr::new(192, 168, 1, 42)));
        assert!(!subnet.contains(Ipv4Addr::new(192, 168, 2, 42)));
        assert_eq!(subnet.to_string(), "192.168.1.0/24");

        // Host bits are masked away.
        let subnet: Ipv4Subnet = "10.0.0.99/8".parse().unwrap();
        assert_eq!(subnet.to_string(), "10.0.0.0/8");
        assert!(subnet.contains(Ipv4Addr::new(10, 200, 0, 1)));

        assert!("10.0.0.0".parse::<Ipv4Subnet>().is_err());
        assert!("10.0.0.0/33".parse::<Ipv4Subnet>().is_err());
    }

    #[test]
    fn zero_prefix_contains_everything() {
        let subnet: Ipv4Subnet = "0.0.0.0/0".parse().unwrap();
        assert!(subnet.contains(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn loopback_is_enumerable() {
        // Virtually every machine has 127.0.0.1; tolerate the exotic ones.
        if let Ok(addresses) = get_all_ipv4_addresses() {
            if !addresses.is_empty() {
                let subnet: Ipv4Subnet = "127.0.0.0/8".parse().unwrap();
                assert!(addresses.iter().any(|address| subnet.contains(*address)));
            }
        }
    }
}
