//! The IPv4 pipeline: input validation, reassembly, routed and
//! fragmenting output.

use crate::config::{IP_FRAG_MAX_BUF_NR, IP_FRAG_MAX_NR, IP_FRAG_TICKS};
use crate::error::Error;
use crate::iface::NetifId;
use crate::pktbuf::PktBuf;
use crate::stack::Stack;
use crate::wire::{
    Icmpv4DstUnreachable, IpProtocol, Ipv4Address, Ipv4FragKey, Ipv4Packet, Ipv4Repr,
    IPV4_HEADER_LEN,
};
use crate::Result;

const DEFAULT_TTL: u8 = 64;

/// Per-fragment geometry pulled out of the embedded IP header.
#[derive(Debug, Clone, Copy)]
struct FragMeta {
    start: usize,
    end: usize,
    more: bool,
}

fn frag_meta(buf: &PktBuf) -> Result<FragMeta> {
    let packet = Ipv4Packet::new_checked(buf.head())?;
    let start = usize::from(packet.frag_offset());
    let data = usize::from(packet.total_len()) - usize::from(packet.header_len());
    Ok(FragMeta {
        start,
        end: start + data,
        more: packet.more_frags(),
    })
}

/// One in-progress reassembly: fragments held in ascending offset order,
/// each still carrying its IP header.
#[derive(Debug)]
struct FragCtx {
    key: Ipv4FragKey,
    ticks: u32,
    bufs: Vec<PktBuf>,
}

/// All in-progress reassemblies, oldest context first.
#[derive(Debug, Default)]
pub struct FragSet {
    ctxs: Vec<FragCtx>,
}

impl FragSet {
    pub fn new() -> FragSet {
        FragSet { ctxs: Vec::new() }
    }

    fn find_or_alloc(&mut self, key: Ipv4FragKey) -> &mut FragCtx {
        if let Some(index) = self.ctxs.iter().position(|c| c.key == key) {
            return &mut self.ctxs[index];
        }
        if self.ctxs.len() >= IP_FRAG_MAX_NR {
            // Recycle the oldest context, buffers and all.
            net_debug!("ipv4: reassembly table full, oldest context recycled");
            self.ctxs.remove(0);
        }
        self.ctxs.push(FragCtx {
            key,
            ticks: IP_FRAG_TICKS,
            bufs: Vec::new(),
        });
        let last = self.ctxs.len() - 1;
        &mut self.ctxs[last]
    }

    fn release(&mut self, key: Ipv4FragKey) {
        self.ctxs.retain(|c| c.key != key);
    }

    pub fn len(&self) -> usize {
        self.ctxs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ctxs.is_empty()
    }
}

impl Stack {
    /// IPv4 ingress. `buf` starts at the IP header.
    pub(crate) fn ipv4_in(&mut self, id: NetifId, mut buf: PktBuf) -> Result<()> {
        buf.set_cont(IPV4_HEADER_LEN)?;
        let header_len = {
            let packet = Ipv4Packet::new_checked(buf.head())?;
            if packet.version() != 4 {
                return Err(Error::Format);
            }
            usize::from(packet.header_len())
        };
        if header_len < IPV4_HEADER_LEN {
            return Err(Error::Format);
        }
        buf.set_cont(header_len)?;

        let (total_len, dst, frag) = {
            let packet = Ipv4Packet::new_checked(buf.head())?;
            let total_len = usize::from(packet.total_len());
            if total_len < header_len || total_len > buf.total_len() {
                return Err(Error::Size);
            }
            if !packet.verify_checksum() {
                return Err(Error::Checksum);
            }
            (
                total_len,
                packet.dst_addr(),
                packet.frag_offset() != 0 || packet.more_frags(),
            )
        };

        // Drivers may pad short frames; trim to what the header claims.
        buf.resize(total_len)?;

        if !self.netif_ref(id)?.accepts(dst) {
            net_trace!("ipv4: packet for {} not ours, dropped", dst);
            return Ok(());
        }

        if frag {
            self.ip_frag_in(id, buf)
        } else {
            self.ip_deliver(id, buf)
        }
    }

    /// Hand a whole datagram (header still attached) to its protocol.
    pub(crate) fn ip_deliver(&mut self, id: NetifId, buf: PktBuf) -> Result<()> {
        let protocol = Ipv4Packet::new_checked(buf.head())?.next_header();
        match protocol {
            IpProtocol::Icmp => self.icmpv4_in(id, buf),
            IpProtocol::Udp => self.udp_in(id, buf),
            IpProtocol::Tcp => self.tcp_seg_in(id, buf),
            other => self.raw_in(other, buf),
        }
    }

    /// Insert one fragment, joining and delivering when the datagram is
    /// whole.
    fn ip_frag_in(&mut self, id: NetifId, buf: PktBuf) -> Result<()> {
        let (key, meta) = {
            let packet = Ipv4Packet::new_checked(buf.head())?;
            (
                Ipv4FragKey {
                    src_addr: packet.src_addr(),
                    ident: packet.ident(),
                },
                frag_meta(&buf)?,
            )
        };

        let ctx = self.frags.find_or_alloc(key);
        if ctx.bufs.len() >= IP_FRAG_MAX_BUF_NR {
            net_debug!("ipv4: too many fragments for one datagram, context dropped");
            self.frags.release(key);
            return Ok(());
        }

        // Ascending insertion; an exact duplicate of a start offset is
        // dropped.
        let mut insert_at = ctx.bufs.len();
        for (i, existing) in ctx.bufs.iter().enumerate() {
            let other = frag_meta(existing)?;
            if meta.start == other.start {
                net_trace!("ipv4: duplicate fragment, dropped");
                return Ok(());
            }
            if meta.end <= other.start {
                insert_at = i;
                break;
            }
        }
        ctx.bufs.insert(insert_at, buf);

        if !Self::frag_complete(ctx)? {
            return Ok(());
        }

        // Strip every header but the first, splice, and repair the head
        // header so the datagram reads as an unfragmented whole.
        let mut bufs = std::mem::take(&mut ctx.bufs);
        self.frags.release(key);
        let mut whole = bufs.remove(0);
        for mut frag in bufs {
            let hlen = usize::from(Ipv4Packet::new_checked(frag.head())?.header_len());
            frag.remove_header(hlen)?;
            whole.join(frag)?;
        }
        let total = whole.total_len();
        {
            let mut packet = Ipv4Packet::new_unchecked(whole.head_mut());
            packet.set_total_len(total as u16);
            packet.clear_flags();
            packet.fill_checksum();
        }
        self.ip_deliver(id, whole)
    }

    /// Offsets must tile `[0, end)` and the last fragment must clear the
    /// MORE bit.
    fn frag_complete(ctx: &FragCtx) -> Result<bool> {
        let mut expect = 0;
        for buf in &ctx.bufs {
            let meta = frag_meta(buf)?;
            if meta.start != expect {
                return Ok(false);
            }
            expect = meta.end;
        }
        match ctx.bufs.last() {
            Some(last) => Ok(!frag_meta(last)?.more),
            None => Ok(false),
        }
    }

    /// Age reassembly contexts; an expired context takes its fragments
    /// with it.
    pub(crate) fn frag_scan(&mut self) {
        self.frags.ctxs.retain_mut(|ctx| {
            ctx.ticks = ctx.ticks.saturating_sub(1);
            if ctx.ticks == 0 {
                net_debug!("ipv4: reassembly timed out, {} fragments dropped", ctx.bufs.len());
                false
            } else {
                true
            }
        });
    }

    pub(crate) fn next_packet_id(&mut self) -> u16 {
        let id = self.packet_id;
        self.packet_id = self.packet_id.wrapping_add(1);
        id
    }

    /// Network-layer egress: route, prepend a header, and either send
    /// whole or fragment to the path MTU.
    pub(crate) fn ipv4_out(
        &mut self,
        protocol: IpProtocol,
        dst: Ipv4Address,
        src: Ipv4Address,
        mut buf: PktBuf,
    ) -> Result<()> {
        let route = *self.routes.find(dst).ok_or(Error::NoRoute)?;
        let netif = self.netif_ref(route.netif)?;
        let src = if src.is_unspecified() { netif.addr } else { src };
        let next_hop = if route.next_hop.is_unspecified() {
            dst
        } else {
            route.next_hop
        };
        let mtu = netif.mtu;

        if buf.total_len() + IPV4_HEADER_LEN > mtu {
            return self.ip_frag_out(protocol, dst, src, buf, next_hop, route.netif);
        }

        buf.add_header(IPV4_HEADER_LEN, true)?;
        let ident = self.next_packet_id();
        let repr = Ipv4Repr {
            src_addr: src,
            dst_addr: dst,
            next_header: protocol,
            payload_len: buf.total_len() - IPV4_HEADER_LEN,
            hop_limit: DEFAULT_TTL,
        };
        repr.emit(&mut Ipv4Packet::new_unchecked(buf.head_mut()), ident);
        self.netif_out(route.netif, next_hop, buf)
    }

    /// Slice an oversized payload into 8-byte-aligned fragments sharing
    /// one identifier.
    fn ip_frag_out(
        &mut self,
        protocol: IpProtocol,
        dst: Ipv4Address,
        src: Ipv4Address,
        mut buf: PktBuf,
        next_hop: Ipv4Address,
        netif: NetifId,
    ) -> Result<()> {
        let mtu = self.netif_ref(netif)?.mtu;
        let per_frag = (mtu - IPV4_HEADER_LEN) & !7;
        if per_frag == 0 {
            return Err(Error::Size);
        }
        let ident = self.next_packet_id();
        let total = buf.total_len();
        buf.reset_acc();

        let mut offset = 0;
        while offset < total {
            let size = per_frag.min(total - offset);
            let mut frag = self.pool.alloc(IPV4_HEADER_LEN + size)?;
            frag.seek(IPV4_HEADER_LEN)?;
            frag.copy_from(&mut buf, size)?;
            {
                let mut packet = Ipv4Packet::new_unchecked(frag.head_mut());
                packet.set_version(4);
                packet.set_header_len(IPV4_HEADER_LEN as u8);
                packet.set_dscp_ecn(0);
                packet.set_total_len((IPV4_HEADER_LEN + size) as u16);
                packet.set_ident(ident);
                packet.clear_flags();
                packet.set_more_frags(offset + size < total);
                packet.set_frag_offset(offset as u16);
                packet.set_hop_limit(DEFAULT_TTL);
                packet.set_next_header(protocol);
                packet.set_src_addr(src);
                packet.set_dst_addr(dst);
                packet.fill_checksum();
            }
            self.netif_out(netif, next_hop, frag)?;
            offset += size;
        }
        Ok(())
    }

    /// Emit a port-unreachable (or similar) carrying the head of the
    /// offending datagram. `orig` still has its IP header attached.
    pub(crate) fn ip_unreach(
        &mut self,
        code: Icmpv4DstUnreachable,
        orig: &mut PktBuf,
    ) -> Result<()> {
        let (orig_src, orig_dst, hlen) = {
            let packet = Ipv4Packet::new_checked(orig.head())?;
            (
                packet.src_addr(),
                packet.dst_addr(),
                usize::from(packet.header_len()),
            )
        };
        self.icmpv4_send_unreach(code, orig, hlen, orig_src, orig_dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktbuf::PktPool;

    fn frag_buf(pool: &PktPool, src: [u8; 4], ident: u16, offset: u16, len: usize, more: bool) -> PktBuf {
        let mut buf = pool.alloc(IPV4_HEADER_LEN + len).unwrap();
        {
            let mut packet = Ipv4Packet::new_unchecked(buf.head_mut());
            packet.set_version(4);
            packet.set_header_len(IPV4_HEADER_LEN as u8);
            packet.set_total_len((IPV4_HEADER_LEN + len) as u16);
            packet.set_ident(ident);
            packet.clear_flags();
            packet.set_more_frags(more);
            packet.set_frag_offset(offset);
            packet.set_src_addr(Ipv4Address::new(src[0], src[1], src[2], src[3]));
            packet.fill_checksum();
        }
        buf
    }

    #[test]
    fn frag_meta_reads_geometry() {
        let pool = PktPool::new(32);
        let buf = frag_buf(&pool, [10, 0, 0, 3], 7, 552, 96, false);
        let meta = frag_meta(&buf).unwrap();
        assert_eq!(meta.start, 552);
        assert_eq!(meta.end, 648);
        assert!(!meta.more);
    }

    #[test]
    fn oldest_context_recycled_under_pressure() {
        let pool = PktPool::new(64);
        let mut set = FragSet::new();
        for i in 0..IP_FRAG_MAX_NR as u16 {
            let ctx = set.find_or_alloc(Ipv4FragKey {
                src_addr: Ipv4Address::new(10, 0, 0, 3),
                ident: i,
            });
            ctx.bufs.push(frag_buf(&pool, [10, 0, 0, 3], i, 0, 8, true));
        }
        let first = Ipv4FragKey {
            src_addr: Ipv4Address::new(10, 0, 0, 3),
            ident: 0,
        };
        assert!(set.ctxs.iter().any(|c| c.key == first));
        set.find_or_alloc(Ipv4FragKey {
            src_addr: Ipv4Address::new(10, 0, 0, 3),
            ident: 999,
        });
        assert_eq!(set.len(), IP_FRAG_MAX_NR);
        assert!(!set.ctxs.iter().any(|c| c.key == first));
    }
}
