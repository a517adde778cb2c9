//! The longest-prefix-match route table.

use heapless::Vec;

use crate::config::ROUTE_TABLE_SIZE;
use crate::error::Error;
use crate::iface::NetifId;
use crate::wire::{Ipv4Address, Ipv4AddressExt};
use crate::Result;

/// How a route entry came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteType {
    /// The directly connected network of an active interface.
    LocalNet,
    /// The interface's own host address.
    Netif,
    /// Anything added by hand (default routes, static routes).
    Other,
}

/// One route: packets for `net`/`mask` leave through `netif`, addressed
/// to `next_hop` on the link (the destination itself when the route is
/// direct, i.e. `next_hop` is unspecified).
#[derive(Debug, Clone, Copy)]
pub struct RouteEntry {
    pub net: Ipv4Address,
    pub mask: Ipv4Address,
    pub mask_ones: u32,
    pub next_hop: Ipv4Address,
    pub netif: NetifId,
    pub rtype: RouteType,
}

impl RouteEntry {
    fn matches(&self, addr: Ipv4Address) -> bool {
        addr.network(self.mask) == self.net.network(self.mask)
    }
}

/// A routing table.
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry, ROUTE_TABLE_SIZE>,
}

impl RouteTable {
    pub fn new() -> RouteTable {
        RouteTable {
            entries: Vec::new(),
        }
    }

    pub fn add(
        &mut self,
        net: Ipv4Address,
        mask: Ipv4Address,
        next_hop: Ipv4Address,
        netif: NetifId,
        rtype: RouteType,
    ) -> Result<()> {
        let entry = RouteEntry {
            net,
            mask,
            mask_ones: mask.to_bits().count_ones(),
            next_hop,
            netif,
            rtype,
        };
        self.entries.push(entry).map_err(|_| Error::Full)
    }

    pub fn remove(&mut self, net: Ipv4Address, mask: Ipv4Address) {
        if let Some(i) = self
            .entries
            .iter()
            .position(|e| e.net == net && e.mask == mask)
        {
            self.entries.swap_remove(i);
        }
    }

    /// Drop every route that leaves through `netif`.
    pub fn remove_netif(&mut self, netif: NetifId) {
        while let Some(i) = self.entries.iter().position(|e| e.netif == netif) {
            self.entries.swap_remove(i);
        }
    }

    /// Longest-prefix match: of the entries whose network contains
    /// `addr`, the one with the most mask bits wins.
    pub fn find(&self, addr: Ipv4Address) -> Option<&RouteEntry> {
        self.entries
            .iter()
            .filter(|e| e.matches(addr))
            .max_by_key(|e| e.mask_ones)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: [u8; 4]) -> Ipv4Address {
        Ipv4Address::new(s[0], s[1], s[2], s[3])
    }

    fn table() -> RouteTable {
        let mut t = RouteTable::new();
        // Default route via gateway, direct net, and a host route.
        t.add(ip([0, 0, 0, 0]), ip([0, 0, 0, 0]), ip([10, 0, 0, 1]), 0, RouteType::Other)
            .unwrap();
        t.add(
            ip([10, 0, 0, 0]),
            ip([255, 255, 255, 0]),
            ip([0, 0, 0, 0]),
            0,
            RouteType::LocalNet,
        )
        .unwrap();
        t.add(
            ip([10, 0, 0, 2]),
            ip([255, 255, 255, 255]),
            ip([0, 0, 0, 0]),
            0,
            RouteType::Netif,
        )
        .unwrap();
        t
    }

    #[test]
    fn longest_prefix_wins() {
        let t = table();
        assert_eq!(t.find(ip([10, 0, 0, 2])).unwrap().mask_ones, 32);
        assert_eq!(t.find(ip([10, 0, 0, 77])).unwrap().mask_ones, 24);
        assert_eq!(t.find(ip([192, 168, 1, 1])).unwrap().mask_ones, 0);
    }

    #[test]
    fn no_match_without_default() {
        let mut t = table();
        t.remove(ip([0, 0, 0, 0]), ip([0, 0, 0, 0]));
        assert!(t.find(ip([192, 168, 1, 1])).is_none());
    }

    #[test]
    fn result_beats_every_other_match() {
        let t = table();
        for probe in [ip([10, 0, 0, 2]), ip([10, 0, 0, 9]), ip([8, 8, 8, 8])] {
            let best = t.find(probe).unwrap();
            for e in t.iter() {
                if e.matches(probe) {
                    assert!(e.mask_ones <= best.mask_ones);
                }
            }
        }
    }

    #[test]
    fn remove_netif_routes() {
        let mut t = table();
        t.remove_netif(0);
        assert!(t.find(ip([10, 0, 0, 2])).is_none());
    }
}
