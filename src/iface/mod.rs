//! Network interfaces and the link layer.
//!
//! A [`NetIf`] couples addressing state with an input queue fed by its
//! driver, an output queue drained by its driver, and the link-layer
//! flavor that decides how buffers are framed on the way through.

pub(crate) mod ethernet;
pub mod neighbor;
pub mod route;

use core::fmt;

use crate::config::NETIF_QUEUE_SIZE;
use crate::error::Error;
use crate::fixq::FixQueue;
use crate::pktbuf::PktBuf;
use crate::wire::{EthernetAddress, Ipv4Address};
use crate::Result;

/// Index of an interface in the stack's interface list.
pub type NetifId = usize;

/// Interface lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Opened,
    Active,
}

/// Which link layer frames traffic on this interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    /// Ethernet II framing with ARP resolution.
    Ethernet,
    /// No framing; buffers carry IP packets directly (loopback).
    None,
}

/// Static description of an interface, handed to `Stack::add_netif`.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: &'static str,
    pub hardware_addr: EthernetAddress,
    pub addr: Ipv4Address,
    pub netmask: Ipv4Address,
    pub gateway: Ipv4Address,
    pub mtu: usize,
    pub link: LinkLayer,
}

/// The two queues a driver works against.
#[derive(Debug, Default)]
pub struct Queues {
    pub in_q: FixQueue<PktBuf, NETIF_QUEUE_SIZE>,
    pub out_q: FixQueue<PktBuf, NETIF_QUEUE_SIZE>,
}

/// Hardware access, reduced to the contract the stack needs.
///
/// `transmit` is called after frames were appended to `out_q`; the
/// driver drains as many as it can. A driver that loops frames back
/// (loopback, test fixtures) moves them onto `in_q` instead.
pub trait Driver: Send {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn transmit(&mut self, queues: &mut Queues) -> Result<()>;
}

/// A network interface.
pub struct NetIf {
    pub name: &'static str,
    pub hardware_addr: EthernetAddress,
    pub addr: Ipv4Address,
    pub netmask: Ipv4Address,
    pub gateway: Ipv4Address,
    pub mtu: usize,
    pub link: LinkLayer,
    pub state: State,
    pub queues: Queues,
    driver: Box<dyn Driver>,
}

impl NetIf {
    pub fn new(config: Config, mut driver: Box<dyn Driver>) -> Result<NetIf> {
        driver.open()?;
        Ok(NetIf {
            name: config.name,
            hardware_addr: config.hardware_addr,
            addr: config.addr,
            netmask: config.netmask,
            gateway: config.gateway,
            mtu: config.mtu,
            link: config.link,
            state: State::Opened,
            queues: Queues::default(),
            driver,
        })
    }

    /// Post a received buffer onto the input queue. A full queue drops
    /// the frame.
    pub fn put_in(&mut self, buf: PktBuf) -> Result<()> {
        match self.queues.in_q.push(buf) {
            Ok(()) => Ok(()),
            Err((err, _buf)) => {
                net_debug!("netif {}: input queue full, frame dropped", self.name);
                Err(err)
            }
        }
    }

    /// Dequeue a received buffer for the dispatcher.
    pub fn get_in(&mut self) -> Option<PktBuf> {
        self.queues.in_q.pop()
    }

    /// Queue a frame for transmission and kick the driver.
    pub fn put_out(&mut self, buf: PktBuf) -> Result<()> {
        match self.queues.out_q.push(buf) {
            Ok(()) => self.driver.transmit(&mut self.queues),
            Err((err, _buf)) => {
                net_debug!("netif {}: output queue full, frame dropped", self.name);
                Err(err)
            }
        }
    }

    /// Dequeue a frame for the driver.
    pub fn get_out(&mut self) -> Option<PktBuf> {
        self.queues.out_q.pop()
    }

    pub fn close(&mut self) {
        self.driver.close();
        self.queues.in_q.clear();
        self.queues.out_q.clear();
        self.state = State::Closed;
    }

    /// Whether `addr` is this interface, or a broadcast that includes it.
    pub fn accepts(&self, addr: Ipv4Address) -> bool {
        use crate::wire::Ipv4AddressExt;
        addr == self.addr
            || addr.is_broadcast_in(self.addr.network(self.netmask), self.netmask)
            || self.addr.is_unspecified()
    }
}

impl fmt::Debug for NetIf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NetIf {{ name: {}, addr: {}, state: {:?} }}",
            self.name, self.addr, self.state
        )
    }
}

/// The loopback driver: everything transmitted comes straight back in.
#[derive(Debug, Default)]
pub struct LoopbackDriver;

impl Driver for LoopbackDriver {
    fn transmit(&mut self, queues: &mut Queues) -> Result<()> {
        while let Some(buf) = queues.out_q.pop() {
            if queues.in_q.push(buf).is_err() {
                return Err(Error::Full);
            }
        }
        Ok(())
    }
}

/// Configuration of the loopback interface every stack starts with.
pub fn loopback_config() -> Config {
    Config {
        name: "lo",
        hardware_addr: EthernetAddress::default(),
        addr: Ipv4Address::new(127, 0, 0, 1),
        netmask: Ipv4Address::new(255, 0, 0, 0),
        gateway: Ipv4Address::UNSPECIFIED,
        mtu: 65535,
        link: LinkLayer::None,
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! A driver that records what the stack transmits.

    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Default, Clone)]
    pub struct TxCapture {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl TxCapture {
        pub fn take(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.frames.lock().unwrap())
        }
    }

    #[derive(Debug)]
    pub struct CaptureDriver {
        pub tx: TxCapture,
    }

    impl CaptureDriver {
        pub fn new() -> (CaptureDriver, TxCapture) {
            let tx = TxCapture::default();
            (CaptureDriver { tx: tx.clone() }, tx)
        }
    }

    impl Driver for CaptureDriver {
        fn transmit(&mut self, queues: &mut Queues) -> Result<()> {
            while let Some(buf) = queues.out_q.pop() {
                self.tx.frames.lock().unwrap().push(buf.to_vec());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktbuf::PktPool;

    #[test]
    fn loopback_reflects_frames() {
        let pool = PktPool::new(16);
        let mut netif =
            NetIf::new(loopback_config(), Box::new(LoopbackDriver)).unwrap();
        let mut buf = pool.alloc(32).unwrap();
        buf.fill(0xab, 32).unwrap();
        netif.put_out(buf).unwrap();
        let back = netif.get_in().unwrap();
        assert_eq!(back.total_len(), 32);
        assert!(back.to_vec().iter().all(|&b| b == 0xab));
    }

    #[test]
    fn accepts_own_and_broadcast() {
        let mut config = loopback_config();
        config.addr = Ipv4Address::new(10, 0, 0, 2);
        config.netmask = Ipv4Address::new(255, 255, 255, 0);
        let netif = NetIf::new(config, Box::new(LoopbackDriver)).unwrap();
        assert!(netif.accepts(Ipv4Address::new(10, 0, 0, 2)));
        assert!(netif.accepts(Ipv4Address::new(10, 0, 0, 255)));
        assert!(netif.accepts(Ipv4Address::BROADCAST));
        assert!(!netif.accepts(Ipv4Address::new(10, 0, 0, 3)));
    }
}
