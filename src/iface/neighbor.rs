//! The ARP resolver: cache, per-entry state machine, timer-driven aging.
//!
//! The cache is a small vector kept in most-recently-used order; the tail
//! entry is recycled when a new mapping is needed and no slot is free.
//! Each entry ages in one-second scan ticks. A pending entry re-sends its
//! request every tick until its retry budget runs out; a resolved entry
//! falls back to pending when its stable lifetime expires, re-validating
//! the mapping before traffic trusts it again.

use std::collections::VecDeque;

use crate::config::{
    ARP_CACHE_SIZE, ARP_ENTRY_PENDING_TICKS, ARP_ENTRY_RETRIES, ARP_ENTRY_STABLE_TICKS,
    ARP_WAIT_PKT_MAX,
};
use crate::iface::NetifId;
use crate::pktbuf::PktBuf;
use crate::stack::Stack;
use crate::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetProtocol, Ipv4Address,
    Ipv4AddressExt, ARP_PACKET_LEN,
};
use crate::Result;

/// Resolution state of a cache entry. A free slot is simply absent from
/// the cache vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Request sent, mapping unknown, buffers may be parked here.
    Waiting,
    /// Mapping known and usable.
    Resolved,
}

#[derive(Debug)]
pub struct NeighborEntry {
    pub ip: Ipv4Address,
    pub hardware_addr: EthernetAddress,
    pub netif: NetifId,
    pub state: EntryState,
    /// Scan ticks until the next lifecycle step.
    pub ttl: u32,
    /// Requests left before a waiting entry is given up on.
    pub retries: u32,
    /// Buffers awaiting resolution, oldest first.
    pub pending: VecDeque<PktBuf>,
}

impl NeighborEntry {
    fn new_waiting(ip: Ipv4Address, netif: NetifId) -> NeighborEntry {
        NeighborEntry {
            ip,
            hardware_addr: EthernetAddress::default(),
            netif,
            state: EntryState::Waiting,
            ttl: ARP_ENTRY_PENDING_TICKS,
            // The caller broadcasts the first request itself.
            retries: ARP_ENTRY_RETRIES - 1,
            pending: VecDeque::new(),
        }
    }

    fn resolve(&mut self, hardware_addr: EthernetAddress) {
        self.hardware_addr = hardware_addr;
        self.state = EntryState::Resolved;
        self.ttl = ARP_ENTRY_STABLE_TICKS;
        self.retries = ARP_ENTRY_RETRIES - 1;
    }
}

/// The cache itself, index 0 being the most recently used entry.
#[derive(Debug, Default)]
pub struct ArpCache {
    entries: Vec<NeighborEntry>,
}

impl ArpCache {
    pub fn new() -> ArpCache {
        ArpCache {
            entries: Vec::new(),
        }
    }

    /// Look an address up and promote the entry to the head.
    pub fn lookup(&mut self, ip: Ipv4Address) -> Option<&mut NeighborEntry> {
        let index = self.entries.iter().position(|e| e.ip == ip)?;
        let entry = self.entries.remove(index);
        self.entries.insert(0, entry);
        self.entries.first_mut()
    }

    pub fn get(&self, ip: Ipv4Address) -> Option<&NeighborEntry> {
        self.entries.iter().find(|e| e.ip == ip)
    }

    /// Record `ip -> hardware_addr`, returning any buffers that were
    /// parked waiting for exactly this mapping.
    ///
    /// `force` distinguishes "this packet was unicast to us, learn it
    /// even if it costs an eviction" from "overheard on the wire, take
    /// it only if a slot is free".
    pub fn insert(
        &mut self,
        ip: Ipv4Address,
        hardware_addr: EthernetAddress,
        netif: NetifId,
        force: bool,
    ) -> VecDeque<PktBuf> {
        if let Some(entry) = self.lookup(ip) {
            entry.resolve(hardware_addr);
            entry.netif = netif;
            return core::mem::take(&mut entry.pending);
        }
        if self.entries.len() >= ARP_CACHE_SIZE {
            if !force {
                return VecDeque::new();
            }
            self.entries.pop();
        }
        let mut entry = NeighborEntry::new_waiting(ip, netif);
        entry.resolve(hardware_addr);
        self.entries.insert(0, entry);
        VecDeque::new()
    }

    /// Create a pending entry for `ip`, recycling the least recently
    /// used slot if none is free. The parked buffers of a recycled entry
    /// are dropped.
    pub fn alloc_waiting(&mut self, ip: Ipv4Address, netif: NetifId) -> &mut NeighborEntry {
        if self.entries.len() >= ARP_CACHE_SIZE {
            self.entries.pop();
        }
        self.entries.insert(0, NeighborEntry::new_waiting(ip, netif));
        &mut self.entries[0]
    }

    pub fn remove(&mut self, ip: Ipv4Address) {
        self.entries.retain(|e| e.ip != ip);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.entries.iter()
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut NeighborEntry> {
        self.entries.iter_mut()
    }
}

/// What the scan decided to do with one entry.
enum ScanAction {
    Request(Ipv4Address, NetifId),
    Free,
}

impl Stack {
    /// Resolve `target` on `id` and emit `buf`, parking it if the
    /// mapping is not known yet.
    pub(crate) fn arp_resolve(
        &mut self,
        id: NetifId,
        target: Ipv4Address,
        buf: PktBuf,
    ) -> Result<()> {
        // Broadcast targets never go through the cache.
        let netif = self.netif_ref(id)?;
        if target.is_broadcast_in(netif.addr.network(netif.netmask), netif.netmask) {
            return self.ether_raw_out(id, EthernetProtocol::Ipv4, EthernetAddress::BROADCAST, buf);
        }

        if let Some(entry) = self.arp.lookup(target) {
            match entry.state {
                EntryState::Resolved => {
                    let hw = entry.hardware_addr;
                    return self.ether_raw_out(id, EthernetProtocol::Ipv4, hw, buf);
                }
                EntryState::Waiting => {
                    if entry.pending.len() >= ARP_WAIT_PKT_MAX {
                        // Keep the freshest traffic.
                        entry.pending.pop_front();
                    }
                    entry.pending.push_back(buf);
                    return Ok(());
                }
            }
        }

        let entry = self.arp.alloc_waiting(target, id);
        entry.pending.push_back(buf);
        self.arp_send_request(id, target)
    }

    /// The MAC to use for `target` right now, if any: broadcast for
    /// broadcast targets, the cached mapping when resolved. No request
    /// is sent on a miss.
    pub fn arp_find(&self, id: NetifId, target: Ipv4Address) -> Option<EthernetAddress> {
        let netif = self.netif_ref(id).ok()?;
        if target.is_broadcast_in(netif.addr.network(netif.netmask), netif.netmask) {
            return Some(EthernetAddress::BROADCAST);
        }
        match self.arp.get(target) {
            Some(entry) if entry.state == EntryState::Resolved => Some(entry.hardware_addr),
            _ => None,
        }
    }

    /// Opportunistic (non-forcing) learn used by the IPv4 ingress hook.
    pub(crate) fn arp_learn(&mut self, id: NetifId, ip: Ipv4Address, hw: EthernetAddress) {
        let flushed = self.arp.insert(ip, hw, id, false);
        for parked in flushed {
            if let Err(err) = self.ether_raw_out(id, EthernetProtocol::Ipv4, hw, parked) {
                net_debug!("arp: flushing parked buffer failed: {}", err);
            }
        }
    }

    pub(crate) fn arp_send_request(&mut self, id: NetifId, target: Ipv4Address) -> Result<()> {
        let netif = self.netif_ref(id)?;
        let repr = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr: netif.hardware_addr,
            source_protocol_addr: netif.addr,
            target_hardware_addr: EthernetAddress::default(),
            target_protocol_addr: target,
        };
        let mut buf = self.pool.alloc(ARP_PACKET_LEN)?;
        repr.emit(&mut ArpPacket::new_unchecked(buf.head_mut()));
        net_debug!("arp: request who-has {} on netif {}", target, id);
        self.ether_raw_out(id, EthernetProtocol::Arp, EthernetAddress::BROADCAST, buf)
    }

    /// ARP ingress: validate, learn, answer requests addressed to us.
    pub(crate) fn arp_in(&mut self, id: NetifId, mut buf: PktBuf) -> Result<()> {
        buf.set_cont(ARP_PACKET_LEN)?;
        let repr = ArpRepr::parse(&ArpPacket::new_checked(buf.head())?)?;
        let ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_protocol_addr,
            ..
        } = repr;

        if !matches!(operation, ArpOperation::Request | ArpOperation::Reply) {
            net_trace!("arp: unknown opcode, dropped");
            return Ok(());
        }
        if !source_protocol_addr.x_is_unicast() {
            net_trace!("arp: non-unicast sender, dropped");
            return Ok(());
        }

        let our_addr = self.netif_ref(id)?.addr;
        if target_protocol_addr == our_addr {
            // Addressed to us: learn unconditionally, answer requests.
            let pending = self
                .arp
                .insert(source_protocol_addr, source_hardware_addr, id, true);
            for parked in pending {
                self.ether_raw_out(id, EthernetProtocol::Ipv4, source_hardware_addr, parked)?;
            }
            if operation == ArpOperation::Request {
                self.arp_send_reply(id, buf)?;
            }
        } else {
            // Overheard: take the mapping only if it is free to keep.
            let pending = self
                .arp
                .insert(source_protocol_addr, source_hardware_addr, id, false);
            for parked in pending {
                self.ether_raw_out(id, EthernetProtocol::Ipv4, source_hardware_addr, parked)?;
            }
        }
        Ok(())
    }

    /// Turn a received request around in place and send it back.
    fn arp_send_reply(&mut self, id: NetifId, mut buf: PktBuf) -> Result<()> {
        let netif = self.netif_ref(id)?;
        let (our_hw, our_ip) = (netif.hardware_addr, netif.addr);
        let target_hw;
        {
            let mut packet = ArpPacket::new_unchecked(buf.head_mut());
            target_hw = EthernetAddress::from_bytes(packet.source_hardware_addr());
            let target_ip = packet.source_protocol_addr().to_vec();
            packet.set_operation(ArpOperation::Reply);
            packet.set_target_hardware_addr(target_hw.as_bytes());
            packet.set_target_protocol_addr(&target_ip);
            packet.set_source_hardware_addr(our_hw.as_bytes());
            packet.set_source_protocol_addr(&our_ip.octets());
        }
        net_debug!("arp: reply to {}", target_hw);
        self.ether_raw_out(id, EthernetProtocol::Arp, target_hw, buf)
    }

    /// One scan tick: age every entry, re-request or evict as the state
    /// machine dictates.
    pub(crate) fn arp_scan(&mut self) {
        let mut actions: Vec<(Ipv4Address, ScanAction)> = Vec::new();
        for entry in self.arp.iter_mut() {
            entry.ttl = entry.ttl.saturating_sub(1);
            if entry.ttl > 0 {
                continue;
            }
            let action = match entry.state {
                EntryState::Waiting => {
                    if entry.retries > 0 {
                        entry.retries -= 1;
                        entry.ttl = ARP_ENTRY_PENDING_TICKS;
                        ScanAction::Request(entry.ip, entry.netif)
                    } else {
                        ScanAction::Free
                    }
                }
                EntryState::Resolved => {
                    // Stale: re-validate before trusting it further.
                    entry.state = EntryState::Waiting;
                    entry.ttl = ARP_ENTRY_PENDING_TICKS;
                    entry.retries = ARP_ENTRY_RETRIES - 1;
                    ScanAction::Request(entry.ip, entry.netif)
                }
            };
            actions.push((entry.ip, action));
        }
        for (ip, action) in actions {
            match action {
                ScanAction::Request(target, netif) => {
                    if let Err(err) = self.arp_send_request(netif, target) {
                        net_debug!("arp: re-request for {} failed: {}", target, err);
                    }
                }
                ScanAction::Free => {
                    net_debug!("arp: entry for {} expired, dropped", ip);
                    self.arp.remove(ip);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktbuf::PktPool;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Address {
        Ipv4Address::new(a, b, c, d)
    }

    fn mac(last: u8) -> EthernetAddress {
        EthernetAddress([0x02, 0, 0, 0, 0, last])
    }

    #[test]
    fn insert_resolves_and_flushes_pending() {
        let pool = PktPool::new(16);
        let mut cache = ArpCache::new();
        let entry = cache.alloc_waiting(ip(10, 0, 0, 3), 0);
        entry.pending.push_back(pool.alloc(10).unwrap());
        assert_eq!(entry.state, EntryState::Waiting);

        let pending = cache.insert(ip(10, 0, 0, 3), mac(3), 0, true);
        assert_eq!(pending.len(), 1);
        let entry = cache.get(ip(10, 0, 0, 3)).unwrap();
        assert_eq!(entry.state, EntryState::Resolved);
        assert_eq!(entry.hardware_addr, mac(3));
        assert!(!entry.hardware_addr.is_zero());
    }

    #[test]
    fn lru_eviction_prefers_tail() {
        let mut cache = ArpCache::new();
        for i in 0..ARP_CACHE_SIZE as u8 {
            cache.insert(ip(10, 0, 0, i), mac(i), 0, true);
        }
        // Touch the oldest so it moves to the head.
        cache.lookup(ip(10, 0, 0, 0));
        cache.insert(ip(10, 0, 1, 1), mac(0xaa), 0, true);
        assert!(cache.get(ip(10, 0, 0, 0)).is_some());
        // 10.0.0.1 became the tail and was recycled.
        assert!(cache.get(ip(10, 0, 0, 1)).is_none());
    }

    #[test]
    fn non_forcing_insert_respects_capacity() {
        let mut cache = ArpCache::new();
        for i in 0..ARP_CACHE_SIZE as u8 {
            cache.insert(ip(10, 0, 0, i), mac(i), 0, true);
        }
        cache.insert(ip(10, 0, 2, 2), mac(0xbb), 0, false);
        assert!(cache.get(ip(10, 0, 2, 2)).is_none());
        assert_eq!(cache.len(), ARP_CACHE_SIZE);
    }

    #[test]
    fn waiting_entry_ttl_bounded() {
        let mut cache = ArpCache::new();
        let entry = cache.alloc_waiting(ip(10, 0, 0, 9), 0);
        assert!(entry.ttl <= ARP_ENTRY_PENDING_TICKS);
        assert_eq!(entry.retries, ARP_ENTRY_RETRIES - 1);
    }
}
