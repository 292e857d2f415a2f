//! Address allocation
//!
//! This module provides the [`Network`] allocator: a CIDR block that hands
//! out interface addresses (address + prefix length) one at a time, with an
//! optional slot reserved for the subnet's router.

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AddressError {
    #[error("Invalid network specification: {0}")]
    InvalidNetwork(#[from] ipnetwork::IpNetworkError),

    #[error("Router offset {offset} is outside of {network}")]
    RouterOutOfRange { network: IpNetwork, offset: u32 },

    #[error("No more free addresses in {0}")]
    Exhausted(IpNetwork),
}

/// A network to draw interface addresses from.
///
/// The allocator yields consecutive host addresses of the block, skipping
/// the reserved router slot if one was requested. Each address is yielded at
/// most once; once the block is used up further requests fail with
/// [`AddressError::Exhausted`].
#[derive(Debug, Clone)]
pub struct Network {
    net: IpNetwork,
    router: Option<IpAddr>,
    cursor: u128,
}

impl Network {
    /// Parse a CIDR block, optionally reserving the host at `router` as the
    /// subnet's gateway address (counted from the network address).
    pub fn new(cidr: &str, router: Option<u32>) -> Result<Self, AddressError> {
        let net: IpNetwork = cidr.parse()?;
        let router_addr = match router {
            Some(offset) => {
                let addr = offset_addr(&net, u128::from(offset));
                if !net.contains(addr) {
                    return Err(AddressError::RouterOutOfRange {
                        network: net,
                        offset,
                    });
                }
                Some(addr)
            }
            None => None,
        };
        let (first, _) = host_offsets(&net);
        Ok(Self {
            net,
            router: router_addr,
            cursor: first,
        })
    }

    /// The underlying network block.
    pub fn network(&self) -> IpNetwork {
        self.net
    }

    /// The reserved router address, if one was requested.
    pub fn router(&self) -> Option<IpAddr> {
        self.router
    }

    /// The reserved router slot as an interface address.
    pub fn router_interface(&self) -> Option<IpNetwork> {
        self.router
            .map(|addr| interface_addr(addr, self.net.prefix()))
    }

    /// Yield the next free interface address of this block.
    pub fn next_interface(&mut self) -> Result<IpNetwork, AddressError> {
        let (_, last) = host_offsets(&self.net);
        loop {
            if self.cursor > last {
                return Err(AddressError::Exhausted(self.net));
            }
            let addr = offset_addr(&self.net, self.cursor);
            self.cursor += 1;
            if self.router == Some(addr) {
                continue;
            }
            return Ok(interface_addr(addr, self.net.prefix()));
        }
    }
}

/// Inclusive range of host offsets for a block, following the usual rules:
/// IPv4 blocks exclude the network and broadcast addresses (except /31 and
/// /32 point-to-point blocks), IPv6 blocks exclude only the subnet-router
/// anycast address.
fn host_offsets(net: &IpNetwork) -> (u128, u128) {
    match net {
        IpNetwork::V4(n) => {
            let bits = 32 - u32::from(n.prefix());
            match bits {
                0 => (0, 0),
                1 => (0, 1),
                _ => (1, (1u128 << bits) - 2),
            }
        }
        IpNetwork::V6(n) => {
            let bits = 128 - u32::from(n.prefix());
            match bits {
                0 => (0, 0),
                1 => (0, 1),
                128 => (1, u128::MAX),
                _ => (1, (1u128 << bits) - 1),
            }
        }
    }
}

/// Address at `offset` from the network address.
fn offset_addr(net: &IpNetwork, offset: u128) -> IpAddr {
    match net {
        IpNetwork::V4(n) => {
            let base = u32::from(n.network());
            IpAddr::V4(Ipv4Addr::from(base.wrapping_add(offset as u32)))
        }
        IpNetwork::V6(n) => {
            let base = u128::from(n.network());
            IpAddr::V6(Ipv6Addr::from(base.wrapping_add(offset)))
        }
    }
}

/// Interface address: a host address carrying its network's prefix length.
fn interface_addr(addr: IpAddr, prefix: u8) -> IpNetwork {
    match addr {
        IpAddr::V4(a) => IpNetwork::V4(
            Ipv4Network::new(a, prefix).expect("prefix comes from a valid network"),
        ),
        IpAddr::V6(a) => IpNetwork::V6(
            Ipv6Network::new(a, prefix).expect("prefix comes from a valid network"),
        ),
    }
}

/// The network containing an interface address, host bits masked off.
pub(crate) fn containing_network(ifaddr: &IpNetwork) -> IpNetwork {
    match ifaddr {
        IpNetwork::V4(n) => IpNetwork::V4(
            Ipv4Network::new(n.network(), n.prefix())
                .expect("prefix comes from a valid network"),
        ),
        IpNetwork::V6(n) => IpNetwork::V6(
            Ipv6Network::new(n.network(), n.prefix())
                .expect("prefix comes from a valid network"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_allocation() {
        let mut net = Network::new("192.168.0.0/24", None).unwrap();
        assert_eq!(net.next_interface().unwrap().to_string(), "192.168.0.1/24");
        assert_eq!(net.next_interface().unwrap().to_string(), "192.168.0.2/24");
        assert_eq!(net.next_interface().unwrap().to_string(), "192.168.0.3/24");
    }

    #[test]
    fn router_slot_is_skipped() {
        let mut net = Network::new("192.168.0.0/24", Some(1)).unwrap();
        assert_eq!(net.router().unwrap().to_string(), "192.168.0.1");
        assert_eq!(
            net.router_interface().unwrap().to_string(),
            "192.168.0.1/24"
        );
        assert_eq!(net.next_interface().unwrap().to_string(), "192.168.0.2/24");
        assert_eq!(net.next_interface().unwrap().to_string(), "192.168.0.3/24");
    }

    #[test]
    fn small_block_exhausts() {
        let mut net = Network::new("192.168.0.0/30", None).unwrap();
        assert_eq!(net.next_interface().unwrap().to_string(), "192.168.0.1/30");
        assert_eq!(net.next_interface().unwrap().to_string(), "192.168.0.2/30");
        assert!(matches!(
            net.next_interface(),
            Err(AddressError::Exhausted(_))
        ));
    }

    #[test]
    fn ipv6_allocation() {
        let mut net = Network::new("fd00::/126", Some(1)).unwrap();
        assert_eq!(net.next_interface().unwrap().to_string(), "fd00::2/126");
        assert_eq!(net.next_interface().unwrap().to_string(), "fd00::3/126");
        assert!(matches!(
            net.next_interface(),
            Err(AddressError::Exhausted(_))
        ));
    }

    #[test]
    fn router_outside_block_is_rejected() {
        assert!(matches!(
            Network::new("10.0.0.0/30", Some(200)),
            Err(AddressError::RouterOutOfRange { .. })
        ));
    }

    #[test]
    fn containing_network_masks_host_bits() {
        let ifaddr: IpNetwork = "192.168.3.17/24".parse().unwrap();
        assert_eq!(containing_network(&ifaddr).to_string(), "192.168.3.0/24");
    }
}
