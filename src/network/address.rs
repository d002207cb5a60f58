//! Private address allocation for the veth link
//!
//! Provides:
//! - A snapshot of the IPv4 addresses already used by host interfaces
//! - First-free address search inside a private pool
//! - Egress/ingress pair allocation

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use nix::ifaddrs::getifaddrs;
use nix::sys::socket::SockaddrStorage;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::debug;

/// IPv4 addresses in use on this host
///
/// Both local and peer addresses count: a point-to-point peer lives in
/// another namespace, but its host route still claims the address here.
#[derive(Debug, Clone, Default)]
pub struct Interfaces {
    assigned: HashSet<Ipv4Addr>,
}

impl Interfaces {
    /// Scan the host's network interfaces
    pub fn scan() -> Result<Self> {
        let addrs = getifaddrs().map_err(|e| Error::privileged("getifaddrs", e))?;

        let mut assigned = HashSet::new();
        for ifaddr in addrs {
            for storage in [ifaddr.address, ifaddr.destination].into_iter().flatten() {
                if let Some(ip) = ipv4_of(&storage) {
                    assigned.insert(ip);
                }
            }
        }

        debug!(count = assigned.len(), "Scanned assigned IPv4 addresses");
        Ok(Self { assigned })
    }

    /// Build from a known set of addresses
    #[cfg(test)]
    pub fn from_assigned(addrs: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        Self {
            assigned: addrs.into_iter().collect(),
        }
    }

    /// Check whether an address is in use
    pub fn is_assigned(&self, addr: &Ipv4Addr) -> bool {
        self.assigned.contains(addr)
    }

    /// First unused address of `pool` at or after host number `offset`
    ///
    /// Host number 0 is the network address; the search never returns the
    /// network or broadcast address. Returns the address and its host number.
    pub fn first_unassigned_address(&self, pool: Ipv4Net, offset: u32) -> Result<(Ipv4Addr, u32)> {
        let network = u32::from(pool.network());
        let last_host = u32::from(pool.broadcast()).saturating_sub(network);

        for host in offset.max(1)..last_host {
            let addr = Ipv4Addr::from(network + host);
            if !self.is_assigned(&addr) {
                return Ok((addr, host));
            }
        }

        Err(Error::ResourceExhausted(pool.to_string()))
    }

    /// Allocate the egress and ingress addresses, scanning from `start_offset`
    ///
    /// The ingress search starts right after the egress address, so the two
    /// never overlap.
    pub fn allocate_pair(&self, pool: Ipv4Net, start_offset: u32) -> Result<(Ipv4Addr, Ipv4Addr)> {
        let (egress, egress_host) = self.first_unassigned_address(pool, start_offset)?;
        let (ingress, _) = self.first_unassigned_address(pool, egress_host + 1)?;

        debug!(%egress, %ingress, "Allocated veth addresses");
        Ok((egress, ingress))
    }
}

fn ipv4_of(storage: &SockaddrStorage) -> Option<Ipv4Addr> {
    storage
        .as_sockaddr_in()
        .map(|sin| *SocketAddrV4::from(*sin).ip())
}
