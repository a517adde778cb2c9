//! Raw IP sockets: protocol-level taps used by ping-style clients.

use std::collections::VecDeque;

use crate::config::SOCK_RECV_QUEUE_MAX;
use crate::error::Error;
use crate::pktbuf::PktBuf;
use crate::socket::{vacant, Family, SockBase, SockId};
use crate::stack::Stack;
use crate::wire::{IpEndpoint, IpProtocol, Ipv4Address, Ipv4Packet};
use crate::Result;

/// A raw socket. Received buffers keep their IP header, the way BSD
/// delivers raw IPv4.
#[derive(Debug)]
pub struct RawSock {
    pub base: SockBase,
    pub recv_q: VecDeque<(IpEndpoint, PktBuf)>,
}

impl RawSock {
    fn new(protocol: IpProtocol) -> RawSock {
        RawSock {
            base: SockBase::new(Family::Inet, protocol),
            recv_q: VecDeque::new(),
        }
    }

    fn matches(&self, protocol: IpProtocol, src: Ipv4Address, dst: Ipv4Address) -> bool {
        if self.base.protocol != protocol {
            return false;
        }
        if !self.base.local.addr.is_unspecified() && self.base.local.addr != dst {
            return false;
        }
        if !self.base.remote.addr.is_unspecified() && self.base.remote.addr != src {
            return false;
        }
        true
    }
}

impl Stack {
    pub(crate) fn raw_ref(&self, i: usize) -> Result<&RawSock> {
        self.raw_socks
            .get(i)
            .and_then(|s| s.as_ref())
            .ok_or(Error::Param)
    }

    pub(crate) fn raw_mut(&mut self, i: usize) -> Result<&mut RawSock> {
        self.raw_socks
            .get_mut(i)
            .and_then(|s| s.as_mut())
            .ok_or(Error::Param)
    }

    pub(crate) fn raw_create(&mut self, protocol: IpProtocol) -> Result<SockId> {
        let slot = vacant(&self.raw_socks)?;
        self.raw_socks[slot] = Some(RawSock::new(protocol));
        Ok(SockId::Raw(slot))
    }

    /// Send `data` as the payload of an IP datagram carrying the
    /// socket's protocol.
    pub(crate) fn raw_sendto(&mut self, i: usize, data: &[u8], dst: Ipv4Address) -> Result<usize> {
        if dst.is_unspecified() {
            return Err(Error::Param);
        }
        let (protocol, local) = {
            let sock = self.raw_ref(i)?;
            (sock.base.protocol, sock.base.local.addr)
        };
        let mut buf = self.pool.alloc(data.len())?;
        buf.write(data)?;
        self.ipv4_out(protocol, dst, local, buf)?;
        Ok(data.len())
    }

    pub(crate) fn raw_recvfrom(&mut self, i: usize, max: usize) -> Result<(Vec<u8>, IpEndpoint)> {
        let sock = self.raw_mut(i)?;
        if let Some(err) = sock.base.err.take() {
            return Err(err);
        }
        match sock.recv_q.pop_front() {
            Some((from, buf)) => {
                let bytes = buf.to_vec();
                let take = bytes.len().min(max);
                Ok((bytes[..take].to_vec(), from))
            }
            None => Err(Error::NeedWait),
        }
    }

    /// Offer an ingress datagram (header attached) to the raw sockets.
    /// The first match takes it; no match quietly drops it.
    pub(crate) fn raw_in(&mut self, protocol: IpProtocol, buf: PktBuf) -> Result<()> {
        let (src, dst) = {
            let packet = Ipv4Packet::new_checked(buf.head())?;
            (packet.src_addr(), packet.dst_addr())
        };
        let slot = self
            .raw_socks
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.matches(protocol, src, dst)));
        let Some(slot) = slot else {
            net_trace!("raw: no socket for protocol {}, dropped", protocol);
            return Ok(());
        };
        let sock = self.raw_mut(slot)?;
        if sock.recv_q.len() >= SOCK_RECV_QUEUE_MAX {
            net_debug!("raw: receive queue full, datagram dropped");
            return Ok(());
        }
        sock.recv_q.push_back((IpEndpoint::new(src, 0), buf));
        sock.base.rcv_wait.wake(Ok(()));
        Ok(())
    }
}
