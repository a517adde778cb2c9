//! ICMPv4: answering echo requests, generating destination-unreachable.

use crate::config::ICMP_UNREACH_DATA_MAX;
use crate::error::Error;
use crate::iface::NetifId;
use crate::pktbuf::PktBuf;
use crate::stack::Stack;
use crate::wire::{
    Icmpv4DstUnreachable, Icmpv4Message, Icmpv4Packet, IpProtocol, Ipv4Address, Ipv4Packet,
    ICMPV4_HEADER_LEN,
};
use crate::Result;

impl Stack {
    /// ICMP ingress. `buf` starts at the IP header. Echo requests for
    /// one of our addresses are answered; everything else is offered to
    /// raw sockets (which is how ping clients see their replies).
    pub(crate) fn icmpv4_in(&mut self, id: NetifId, mut buf: PktBuf) -> Result<()> {
        let (hlen, src, dst) = {
            let packet = Ipv4Packet::new_checked(buf.head())?;
            (
                usize::from(packet.header_len()),
                packet.src_addr(),
                packet.dst_addr(),
            )
        };
        let icmp_len = buf.total_len() - hlen;
        if icmp_len < ICMPV4_HEADER_LEN {
            return Err(Error::Size);
        }

        buf.seek(hlen)?;
        if buf.checksum16(icmp_len, 0, false)? != 0xffff {
            return Err(Error::Checksum);
        }

        buf.set_cont(hlen + ICMPV4_HEADER_LEN)?;
        let msg_type = Icmpv4Packet::new_unchecked(&buf.head()[hlen..]).msg_type();

        match msg_type {
            Icmpv4Message::EchoRequest if self.netif_ref(id)?.accepts(dst) => {
                self.icmpv4_echo_reply(buf, hlen, src, dst)
            }
            _ => self.raw_in(IpProtocol::Icmp, buf),
        }
    }

    /// Rewrite a request into a reply in place and send it back.
    fn icmpv4_echo_reply(
        &mut self,
        mut buf: PktBuf,
        hlen: usize,
        peer: Ipv4Address,
        our: Ipv4Address,
    ) -> Result<()> {
        buf.remove_header(hlen)?;
        {
            let mut packet = Icmpv4Packet::new_unchecked(buf.head_mut());
            packet.set_msg_type(Icmpv4Message::EchoReply);
            packet.set_checksum(0);
        }
        let total = buf.total_len();
        buf.reset_acc();
        let sum = buf.checksum16(total, 0, true)?;
        Icmpv4Packet::new_unchecked(buf.head_mut()).set_checksum(sum);
        net_debug!("icmpv4: echo reply to {}", peer);
        self.ipv4_out(IpProtocol::Icmp, peer, our, buf)
    }

    /// Build and send a destination-unreachable for `orig`, echoing its
    /// IP header and the first bytes of its payload.
    pub(crate) fn icmpv4_send_unreach(
        &mut self,
        code: Icmpv4DstUnreachable,
        orig: &mut PktBuf,
        orig_hlen: usize,
        reply_to: Ipv4Address,
        our: Ipv4Address,
    ) -> Result<()> {
        let copy_len = orig
            .total_len()
            .min(orig_hlen + ICMP_UNREACH_DATA_MAX);
        let mut buf = self.pool.alloc(ICMPV4_HEADER_LEN + copy_len)?;
        {
            let mut packet = Icmpv4Packet::new_unchecked(buf.head_mut());
            packet.set_msg_type(Icmpv4Message::DstUnreachable);
            packet.set_msg_code(code.into());
            packet.clear_unused();
            packet.set_checksum(0);
        }
        buf.seek(ICMPV4_HEADER_LEN)?;
        orig.reset_acc();
        buf.copy_from(orig, copy_len)?;

        let total = buf.total_len();
        buf.reset_acc();
        let sum = buf.checksum16(total, 0, true)?;
        Icmpv4Packet::new_unchecked(buf.head_mut()).set_checksum(sum);

        net_debug!("icmpv4: unreachable ({:?}) to {}", code, reply_to);
        self.ipv4_out(IpProtocol::Icmp, reply_to, our, buf)
    }
}
