//! The protocol engine.
//!
//! A [`Stack`] owns every piece of protocol state: interfaces, routes,
//! the ARP cache, reassembly contexts, timers and the socket tables.
//! Exactly one thread — the dispatcher — drives it; everything else
//! talks to that thread through the work queue in [`msg`].
//!
//! The engine is clocked from outside: `poll(now)` drains interface
//! input queues and fires whatever timers the elapsed interval covers,
//! and `poll_delay()` reports how long the dispatcher may sleep.

pub mod msg;

use crate::config::{
    ARP_TIMER_PERIOD_MS, IP_FRAG_TIMER_PERIOD_MS, PORT_DYN_START, RAW_SOCK_MAX, TCP_SOCK_MAX,
    UDP_SOCK_MAX,
};
use crate::error::Error;
use crate::iface::neighbor::ArpCache;
use crate::iface::route::{RouteTable, RouteType};
use crate::iface::{loopback_config, Config, Driver, LinkLayer, LoopbackDriver, NetIf, NetifId,
                   State};
use crate::net::ipv4::FragSet;
use crate::pktbuf::{PktBuf, PktPool};
use crate::socket::raw::RawSock;
use crate::socket::tcp::Tcp;
use crate::socket::udp::UdpSock;
use crate::time::{Duration, Instant};
use crate::timer::{TimerEvent, TimerList};
use crate::wire::{Ipv4Address, Ipv4AddressExt};
use crate::Result;

/// The engine. One per process is typical; nothing stops several.
pub struct Stack {
    pub(crate) pool: PktPool,
    pub(crate) netifs: Vec<NetIf>,
    pub(crate) routes: RouteTable,
    pub(crate) arp: ArpCache,
    pub(crate) frags: FragSet,
    pub(crate) timers: TimerList,
    pub(crate) udp_socks: Vec<Option<UdpSock>>,
    pub(crate) raw_socks: Vec<Option<RawSock>>,
    pub(crate) tcp_socks: Vec<Option<Tcp>>,
    pub(crate) now: Instant,
    started: bool,
    /// IP identifier shared by all outgoing datagrams.
    pub(crate) packet_id: u16,
    /// Deterministic initial-sequence generator (fixed increment).
    pub(crate) next_iss: u32,
    pub(crate) udp_port_cursor: u16,
    pub(crate) tcp_port_cursor: u16,
}

impl Stack {
    /// Create an engine with a loopback interface already active.
    pub fn new(pool: PktPool) -> Result<Stack> {
        let mut stack = Stack {
            pool,
            netifs: Vec::new(),
            routes: RouteTable::new(),
            arp: ArpCache::new(),
            frags: FragSet::new(),
            timers: TimerList::new(),
            udp_socks: (0..UDP_SOCK_MAX).map(|_| None).collect(),
            raw_socks: (0..RAW_SOCK_MAX).map(|_| None).collect(),
            tcp_socks: (0..TCP_SOCK_MAX).map(|_| None).collect(),
            now: Instant::ZERO,
            started: false,
            packet_id: 0,
            next_iss: 0,
            udp_port_cursor: PORT_DYN_START,
            tcp_port_cursor: PORT_DYN_START,
        };
        stack.timers.add(
            TimerEvent::ArpScan,
            Duration::from_millis(ARP_TIMER_PERIOD_MS as u64),
            Some(Duration::from_millis(ARP_TIMER_PERIOD_MS as u64)),
        );
        stack.timers.add(
            TimerEvent::FragScan,
            Duration::from_millis(IP_FRAG_TIMER_PERIOD_MS as u64),
            Some(Duration::from_millis(IP_FRAG_TIMER_PERIOD_MS as u64)),
        );
        stack.add_netif(loopback_config(), Box::new(LoopbackDriver))?;
        Ok(stack)
    }

    /// Register and activate an interface. Activation installs its two
    /// routes: the directly connected network and the host address.
    pub fn add_netif(&mut self, config: Config, driver: Box<dyn Driver>) -> Result<NetifId> {
        let netif = NetIf::new(config, driver)?;
        let id = self.netifs.len();
        self.netifs.push(netif);
        self.set_netif_active(id)?;
        Ok(id)
    }

    pub fn set_netif_active(&mut self, id: NetifId) -> Result<()> {
        let (addr, netmask) = {
            let netif = self.netif_mut(id)?;
            if netif.state == State::Active {
                return Err(Error::State);
            }
            netif.state = State::Active;
            (netif.addr, netif.netmask)
        };
        self.routes.add(
            addr.network(netmask),
            netmask,
            Ipv4Address::UNSPECIFIED,
            id,
            RouteType::LocalNet,
        )?;
        self.routes.add(
            addr,
            Ipv4Address::BROADCAST,
            Ipv4Address::UNSPECIFIED,
            id,
            RouteType::Netif,
        )?;
        Ok(())
    }

    pub fn set_netif_inactive(&mut self, id: NetifId) -> Result<()> {
        let netif = self.netif_mut(id)?;
        if netif.state != State::Active {
            return Err(Error::State);
        }
        netif.state = State::Opened;
        self.routes.remove_netif(id);
        Ok(())
    }

    pub(crate) fn netif_ref(&self, id: NetifId) -> Result<&NetIf> {
        self.netifs.get(id).ok_or(Error::Param)
    }

    pub(crate) fn netif_mut(&mut self, id: NetifId) -> Result<&mut NetIf> {
        self.netifs.get_mut(id).ok_or(Error::Param)
    }

    /// Post a frame received by a driver onto its interface's input
    /// queue. The dispatcher picks it up on the next `poll`.
    pub fn netif_put_in(&mut self, id: NetifId, buf: PktBuf) -> Result<()> {
        self.netif_mut(id)?.put_in(buf)
    }

    /// The canonical send path out of the network layer: dispatch
    /// through the link layer if the interface has one (Ethernet goes
    /// through ARP resolution), else hand the buffer to the driver
    /// directly.
    pub(crate) fn netif_out(
        &mut self,
        id: NetifId,
        next_hop: Ipv4Address,
        buf: PktBuf,
    ) -> Result<()> {
        match self.netif_ref(id)?.link {
            LinkLayer::Ethernet => self.arp_resolve(id, next_hop, buf),
            LinkLayer::None => self.netif_mut(id)?.put_out(buf),
        }
    }

    /// Advance the engine to `now`: run expired timers, then process
    /// every queued ingress frame on every interface.
    pub fn poll(&mut self, now: Instant) {
        let elapsed = if self.started {
            now - self.now
        } else {
            self.started = true;
            Duration::ZERO
        };
        self.now = now;

        let mut expired = Vec::new();
        self.timers.advance(elapsed, &mut expired);
        for event in expired {
            self.handle_timer(event);
        }

        for id in 0..self.netifs.len() {
            loop {
                let (link, buf) = {
                    let Ok(netif) = self.netif_mut(id) else { break };
                    let link = netif.link;
                    match netif.get_in() {
                        Some(buf) => (link, buf),
                        None => break,
                    }
                };
                match link {
                    LinkLayer::Ethernet => {
                        if let Err(err) = self.ether_in(id, buf) {
                            net_trace!("netif {}: link input dropped: {}", id, err);
                        }
                    }
                    LinkLayer::None => {
                        if let Err(err) = self.ipv4_in(id, buf) {
                            net_trace!("netif {}: ip input dropped: {}", id, err);
                        }
                    }
                }
            }
        }
    }

    /// How long until the next timer needs service.
    pub fn poll_delay(&self) -> Option<Duration> {
        self.timers.next_timeout()
    }

    fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::ArpScan => self.arp_scan(),
            TimerEvent::FragScan => self.frag_scan(),
            TimerEvent::TcpSnd(id) => self.tcp_snd_timeout(id),
            TimerEvent::TcpConn(id) => self.tcp_conn_timeout(id),
        }
    }

    /// Pool handle for allocating buffers.
    pub fn pool(&self) -> &PktPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests;
