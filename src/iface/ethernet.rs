//! Ethernet II framing and inbound dispatch.

use crate::pktbuf::PktBuf;
use crate::stack::Stack;
use crate::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, Ipv4AddressExt, Ipv4Packet,
    ETHERNET_HEADER_LEN, ETHERNET_PAYLOAD_MIN, IPV4_HEADER_LEN,
};
use crate::{iface::NetifId, Result};

impl Stack {
    /// Link-layer input: strip the frame header and route the payload
    /// by EtherType.
    pub(crate) fn ether_in(&mut self, id: NetifId, mut buf: PktBuf) -> Result<()> {
        buf.set_cont(ETHERNET_HEADER_LEN)?;
        let frame = EthernetFrame::new_checked(buf.head())?;
        let netif = self.netif_ref(id)?;
        let dst = frame.dst_addr();
        if !(dst == netif.hardware_addr || dst.is_broadcast() || dst.is_multicast()) {
            net_trace!("ether: frame for {} not ours, dropped", dst);
            return Ok(());
        }
        let ethertype = frame.ethertype();
        let src_mac = frame.src_addr();
        let unicast_to_us = dst == netif.hardware_addr;

        match ethertype {
            EthernetProtocol::Arp => {
                buf.remove_header(ETHERNET_HEADER_LEN)?;
                self.arp_in(id, buf)
            }
            EthernetProtocol::Ipv4 => {
                // Learn the sender's mapping from frames addressed to us
                // before the IP layer sees the packet.
                if unicast_to_us {
                    buf.set_cont(ETHERNET_HEADER_LEN + IPV4_HEADER_LEN)?;
                    let ip = Ipv4Packet::new_checked(&buf.head()[ETHERNET_HEADER_LEN..])?;
                    let src_ip = ip.src_addr();
                    if src_ip.x_is_unicast() {
                        self.arp_learn(id, src_ip, src_mac);
                    }
                }
                buf.remove_header(ETHERNET_HEADER_LEN)?;
                self.ipv4_in(id, buf)
            }
            ty => {
                net_trace!("ether: unhandled ethertype {}, dropped", ty);
                Ok(())
            }
        }
    }

    /// Frame `buf` and hand it to the driver. A frame addressed to the
    /// interface's own MAC loops straight onto the input queue.
    pub(crate) fn ether_raw_out(
        &mut self,
        id: NetifId,
        protocol: EthernetProtocol,
        dst_addr: EthernetAddress,
        mut buf: PktBuf,
    ) -> Result<()> {
        let src_addr = self.netif_ref(id)?.hardware_addr;

        if buf.total_len() < ETHERNET_PAYLOAD_MIN {
            let old = buf.total_len();
            buf.resize(ETHERNET_PAYLOAD_MIN)?;
            buf.seek(old)?;
            buf.fill(0, ETHERNET_PAYLOAD_MIN - old)?;
        }

        buf.add_header(ETHERNET_HEADER_LEN, true)?;
        {
            let mut frame = EthernetFrame::new_unchecked(buf.head_mut());
            frame.set_dst_addr(dst_addr);
            frame.set_src_addr(src_addr);
            frame.set_ethertype(protocol);
        }

        let netif = self.netif_mut(id)?;
        if dst_addr == src_addr {
            netif.put_in(buf)
        } else {
            netif.put_out(buf)
        }
    }
}
