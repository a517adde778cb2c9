//! UDP sockets: datagram send/receive over a four-tuple match.

use std::collections::VecDeque;

use crate::config::{PORT_DYN_END, PORT_DYN_START, SOCK_RECV_QUEUE_MAX};
use crate::error::Error;
use crate::iface::NetifId;
use crate::pktbuf::PktBuf;
use crate::socket::{vacant, Family, SockBase, SockId};
use crate::stack::Stack;
use crate::wire::{
    checksum, Icmpv4DstUnreachable, IpEndpoint, IpProtocol, Ipv4Packet, UdpPacket, UDP_HEADER_LEN,
};
use crate::Result;

/// A UDP socket: the shared base plus a bounded queue of datagrams that
/// arrived for it.
#[derive(Debug)]
pub struct UdpSock {
    pub base: SockBase,
    pub recv_q: VecDeque<(IpEndpoint, PktBuf)>,
}

impl UdpSock {
    fn new() -> UdpSock {
        UdpSock {
            base: SockBase::new(Family::Inet, IpProtocol::Udp),
            recv_q: VecDeque::new(),
        }
    }

    /// The §4.6 match: local port must equal, everything else wildcards
    /// when unspecified.
    fn matches(&self, src: IpEndpoint, dst: IpEndpoint) -> bool {
        if self.base.local.port != dst.port {
            return false;
        }
        if !self.base.local.addr.is_unspecified() && self.base.local.addr != dst.addr {
            return false;
        }
        if !self.base.remote.addr.is_unspecified() && self.base.remote.addr != src.addr {
            return false;
        }
        if self.base.remote.port != 0 && self.base.remote.port != src.port {
            return false;
        }
        true
    }
}

impl Stack {
    pub(crate) fn udp_ref(&self, i: usize) -> Result<&UdpSock> {
        self.udp_socks
            .get(i)
            .and_then(|s| s.as_ref())
            .ok_or(Error::Param)
    }

    pub(crate) fn udp_mut(&mut self, i: usize) -> Result<&mut UdpSock> {
        self.udp_socks
            .get_mut(i)
            .and_then(|s| s.as_mut())
            .ok_or(Error::Param)
    }

    pub(crate) fn udp_create(&mut self) -> Result<SockId> {
        let slot = vacant(&self.udp_socks)?;
        self.udp_socks[slot] = Some(UdpSock::new());
        Ok(SockId::Udp(slot))
    }

    /// Bind to a local endpoint, rejecting an exact (address, port)
    /// collision with any other UDP socket.
    pub(crate) fn udp_bind(&mut self, i: usize, ep: IpEndpoint) -> Result<()> {
        if ep.port == 0 {
            return Err(Error::Param);
        }
        for (j, sock) in self.udp_socks.iter().enumerate() {
            let Some(sock) = sock else { continue };
            if j != i && sock.base.local.port == ep.port && sock.base.local.addr == ep.addr {
                return Err(Error::AddrInUse);
            }
        }
        self.udp_mut(i)?.base.local = ep;
        Ok(())
    }

    /// Pick a free dynamic port, advancing the shared cursor.
    fn udp_alloc_port(&mut self) -> Result<u16> {
        for _ in PORT_DYN_START..PORT_DYN_END {
            let port = self.udp_port_cursor;
            self.udp_port_cursor = if self.udp_port_cursor + 1 >= PORT_DYN_END {
                PORT_DYN_START
            } else {
                self.udp_port_cursor + 1
            };
            let taken = self
                .udp_socks
                .iter()
                .flatten()
                .any(|s| s.base.local.port == port);
            if !taken {
                return Ok(port);
            }
        }
        Err(Error::NoMem)
    }

    /// Build a datagram and hand it to IPv4.
    pub(crate) fn udp_sendto(&mut self, i: usize, data: &[u8], dst: IpEndpoint) -> Result<usize> {
        if dst.port == 0 || dst.addr.is_unspecified() {
            return Err(Error::Param);
        }
        {
            // A connected socket only talks to its peer.
            let sock = self.udp_ref(i)?;
            if !sock.base.remote.addr.is_unspecified() && sock.base.remote != dst {
                return Err(Error::Param);
            }
        }
        if self.udp_ref(i)?.base.local.port == 0 {
            let port = self.udp_alloc_port()?;
            self.udp_mut(i)?.base.local.port = port;
        }
        let local = self.udp_ref(i)?.base.local;

        // The checksum needs the source address, which routing decides.
        let src = if local.addr.is_unspecified() {
            let route = self.routes.find(dst.addr).ok_or(Error::NoRoute)?;
            self.netif_ref(route.netif)?.addr
        } else {
            local.addr
        };

        let udp_len = UDP_HEADER_LEN + data.len();
        let mut buf = self.pool.alloc(udp_len)?;
        {
            let mut packet = UdpPacket::new_unchecked(buf.head_mut());
            packet.set_src_port(local.port);
            packet.set_dst_port(dst.port);
            packet.set_len(udp_len as u16);
            packet.set_checksum(0);
        }
        buf.seek(UDP_HEADER_LEN)?;
        buf.write(data)?;

        buf.reset_acc();
        let preload = checksum::pseudo_header(&src, &dst.addr, IpProtocol::Udp, udp_len as u32);
        let sum = buf.checksum16(udp_len, preload, true)?;
        UdpPacket::new_unchecked(buf.head_mut()).set_checksum(if sum == 0 { 0xffff } else { sum });

        self.ipv4_out(IpProtocol::Udp, dst.addr, src, buf)?;
        Ok(data.len())
    }

    /// Take the oldest queued datagram, or park the caller.
    pub(crate) fn udp_recvfrom(&mut self, i: usize, max: usize) -> Result<(Vec<u8>, IpEndpoint)> {
        let sock = self.udp_mut(i)?;
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

    /// UDP ingress. `buf` starts at the IP header; a datagram nobody
    /// wants triggers a port unreachable.
    pub(crate) fn udp_in(&mut self, _id: NetifId, mut buf: PktBuf) -> Result<()> {
        let (hlen, src_addr, dst_addr) = {
            let packet = Ipv4Packet::new_checked(buf.head())?;
            (
                usize::from(packet.header_len()),
                packet.src_addr(),
                packet.dst_addr(),
            )
        };
        buf.set_cont(hlen + UDP_HEADER_LEN)?;
        let (src_port, dst_port, udp_len, cksum) = {
            let packet = UdpPacket::new_unchecked(&buf.head()[hlen..]);
            (
                packet.src_port(),
                packet.dst_port(),
                usize::from(packet.len()),
                packet.checksum(),
            )
        };
        if udp_len < UDP_HEADER_LEN || udp_len > buf.total_len() - hlen {
            return Err(Error::Size);
        }
        if cksum != 0 {
            buf.seek(hlen)?;
            let preload =
                checksum::pseudo_header(&src_addr, &dst_addr, IpProtocol::Udp, udp_len as u32);
            if buf.checksum16(udp_len, preload, false)? != 0xffff {
                return Err(Error::Checksum);
            }
        }

        let src = IpEndpoint::new(src_addr, src_port);
        let dst = IpEndpoint::new(dst_addr, dst_port);
        let slot = self
            .udp_socks
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.matches(src, dst)));

        let Some(slot) = slot else {
            net_debug!("udp: no socket for {}, unreachable", dst);
            self.ip_unreach(Icmpv4DstUnreachable::PortUnreachable, &mut buf)?;
            return Ok(());
        };

        buf.remove_header(hlen + UDP_HEADER_LEN)?;
        buf.resize(udp_len - UDP_HEADER_LEN)?;
        let sock = self.udp_mut(slot)?;
        if sock.recv_q.len() >= SOCK_RECV_QUEUE_MAX {
            net_debug!("udp: receive queue full, datagram dropped");
            return Ok(());
        }
        sock.recv_q.push_back((src, buf));
        sock.base.rcv_wait.wake(Ok(()));
        Ok(())
    }
}
