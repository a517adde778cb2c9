//! TCP ingress: segment parsing, acceptability, and the connection
//! state machine.
//!
//! One function per state, dispatched from a single `match`; each takes
//! the whole engine plus the socket index so it can both mutate the
//! control block and emit answers.

use super::output::OutEvent;
use super::TcpState;
use crate::error::Error;
use crate::iface::NetifId;
use crate::pktbuf::PktBuf;
use crate::stack::Stack;
use crate::time::Duration;
use crate::timer::TimerEvent;
use crate::wire::{
    checksum, parse_mss, IpEndpoint, IpProtocol, Ipv4Packet, TcpPacket,
    TcpSeqNumber as SeqNumber, TCP_HEADER_LEN,
};
use crate::Result;
use crate::config::TCP_MSL_MS;

/// A parsed inbound segment. `buf` holds the payload only; headers are
/// gone by the time the state machine sees it.
#[derive(Debug)]
pub(crate) struct Segment {
    pub src: IpEndpoint,
    pub dst: IpEndpoint,
    pub seq: SeqNumber,
    pub ack: SeqNumber,
    pub syn: bool,
    pub ack_flag: bool,
    pub fin: bool,
    pub rst: bool,
    pub wnd: usize,
    pub mss: Option<u16>,
    pub data_len: usize,
    /// Payload plus one for each of SYN and FIN.
    pub seq_len: usize,
    pub buf: PktBuf,
}

impl Stack {
    /// TCP ingress entry point. `buf` starts at the IP header.
    pub(crate) fn tcp_seg_in(&mut self, _id: NetifId, mut buf: PktBuf) -> Result<()> {
        let (hlen, src_addr, dst_addr) = {
            let packet = Ipv4Packet::new_checked(buf.head())?;
            (
                usize::from(packet.header_len()),
                packet.src_addr(),
                packet.dst_addr(),
            )
        };
        let tcp_len = buf.total_len() - hlen;
        if tcp_len < TCP_HEADER_LEN {
            return Err(Error::Size);
        }

        buf.seek(hlen)?;
        let preload =
            checksum::pseudo_header(&src_addr, &dst_addr, IpProtocol::Tcp, tcp_len as u32);
        if buf.checksum16(tcp_len, preload, false)? != 0xffff {
            return Err(Error::Checksum);
        }

        buf.remove_header(hlen)?;
        buf.set_cont(TCP_HEADER_LEN)?;
        let header_len = usize::from(TcpPacket::new_unchecked(buf.head()).header_len());
        if header_len < TCP_HEADER_LEN || header_len > tcp_len {
            return Err(Error::Format);
        }
        buf.set_cont(header_len)?;

        let (src_port, dst_port, seq, ack, syn, ack_flag, fin, rst, wnd, mss) = {
            let packet = TcpPacket::new_unchecked(buf.head());
            (
                packet.src_port(),
                packet.dst_port(),
                packet.seq_number(),
                packet.ack_number(),
                packet.syn(),
                packet.ack(),
                packet.fin(),
                packet.rst(),
                usize::from(packet.window_len()),
                parse_mss(packet.options()),
            )
        };
        buf.remove_header(header_len)?;
        let data_len = buf.total_len();
        let mut seg = Segment {
            src: IpEndpoint::new(src_addr, src_port),
            dst: IpEndpoint::new(dst_addr, dst_port),
            seq,
            ack,
            syn,
            ack_flag,
            fin,
            rst,
            wnd,
            mss,
            data_len,
            seq_len: data_len + usize::from(syn) + usize::from(fin),
            buf,
        };

        match self.tcp_find(seg.dst, seg.src) {
            Some(i) => self.tcp_state_in(i, &mut seg),
            None => {
                net_debug!("tcp: no socket for {} -> {}", seg.src, seg.dst);
                self.tcp_send_reset(&seg)
            }
        }
    }

    /// §4.7's acceptability table, applied once the peer's ISN is known.
    fn tcp_seq_acceptable(&self, i: usize, seg: &Segment) -> bool {
        let Ok(tcp) = self.tcp_ref(i) else { return false };
        let wnd = tcp.rcv_window();
        let nxt = tcp.rcv.nxt;
        let in_wnd = |seq: SeqNumber| seq >= nxt && seq < nxt + wnd;
        if seg.seq_len == 0 {
            if wnd == 0 {
                seg.seq == nxt
            } else {
                in_wnd(seg.seq)
            }
        } else if wnd == 0 {
            false
        } else {
            in_wnd(seg.seq) || in_wnd(seg.seq + seg.seq_len - 1)
        }
    }

    /// Route one segment through the state machine.
    pub(crate) fn tcp_state_in(&mut self, i: usize, seg: &mut Segment) -> Result<()> {
        let state = self.tcp_ref(i)?.state;

        // TIME-WAIT keeps its own rules: a duplicate FIN restarts the
        // 2×MSL clock, a RST releases immediately.
        if state == TcpState::TimeWait {
            return self.tcp_time_wait_in(i, seg);
        }

        if state.is_synchronized() && !self.tcp_seq_acceptable(i, seg) {
            if !seg.rst {
                net_trace!("tcp {}: unacceptable segment seq={}, acked", i, seg.seq);
                self.tcp_send_ack(i, seg)?;
            }
            return Ok(());
        }
        if state.is_synchronized() {
            self.tcp_keepalive_restart(i);
        }

        match state {
            TcpState::Closed => self.tcp_send_reset(seg),
            TcpState::Listen => self.tcp_listen_in(i, seg),
            TcpState::SynSent => self.tcp_syn_sent_in(i, seg),
            TcpState::SynRecvd => self.tcp_syn_recvd_in(i, seg),
            TcpState::Established => self.tcp_established_in(i, seg),
            TcpState::FinWait1 => self.tcp_fin_wait_1_in(i, seg),
            TcpState::FinWait2 => self.tcp_fin_wait_2_in(i, seg),
            TcpState::Closing => self.tcp_closing_in(i, seg),
            TcpState::CloseWait => self.tcp_close_wait_in(i, seg),
            TcpState::LastAck => self.tcp_last_ack_in(i, seg),
            TcpState::TimeWait => Ok(()),
        }
    }

    /// Passive open: a SYN spawns an inactive child answering SYN+ACK.
    fn tcp_listen_in(&mut self, i: usize, seg: &mut Segment) -> Result<()> {
        if seg.rst {
            return Ok(());
        }
        if seg.ack_flag {
            // Nothing to acknowledge on a listener.
            return self.tcp_send_reset(seg);
        }
        if !seg.syn {
            return Ok(());
        }

        if self.tcp_backlog_count(i) >= self.tcp_ref(i)?.conn.backlog {
            net_debug!("tcp {}: backlog full, SYN dropped", i);
            return Ok(());
        }

        let mss_limit = self.tcp_mss_for(seg.src);
        let iss = self.tcp_next_iss();
        let child = self.tcp_spawn_child(i)?;
        {
            let tcp = self.tcp_mut(child)?;
            tcp.base.local = seg.dst;
            tcp.base.remote = seg.src;
            tcp.mss = seg
                .mss
                .map(|m| usize::from(m).min(mss_limit))
                .unwrap_or(mss_limit);
            tcp.snd.iss = iss;
            tcp.snd.una = iss;
            tcp.snd.nxt = iss;
            tcp.snd.win = seg.wnd;
            tcp.snd.wl1_seq = seg.seq;
            tcp.snd.wl2_ack = seg.ack;
            tcp.rcv.iss = seg.seq;
            tcp.rcv.nxt = seg.seq + 1;
            tcp.flags.irs_valid = true;
            tcp.flags.syn_out = true;
            tcp.state = TcpState::SynRecvd;
        }
        net_debug!("tcp {}: SYN from {}, child {} answers", i, seg.src, child);
        self.tcp_out_event(child, OutEvent::Send)
    }

    /// Active open in progress: waiting for SYN+ACK (or a simultaneous
    /// SYN).
    fn tcp_syn_sent_in(&mut self, i: usize, seg: &mut Segment) -> Result<()> {
        // The ACK, if any, must cover exactly our SYN; there is no
        // sequence check possible yet.
        if seg.ack_flag {
            let (iss, nxt) = {
                let tcp = self.tcp_ref(i)?;
                (tcp.snd.iss, tcp.snd.nxt)
            };
            if seg.ack <= iss || seg.ack > nxt {
                net_debug!("tcp {}: bad ACK in SYN_SENT", i);
                return self.tcp_send_reset(seg);
            }
        }
        // A RST only counts when its ACK passed the check above.
        if seg.rst {
            if !seg.ack_flag {
                return Ok(());
            }
            net_debug!("tcp {}: reset while connecting", i);
            return self.tcp_abort(i, Error::Reset);
        }
        if !seg.syn {
            return Ok(());
        }

        {
            let tcp = self.tcp_mut(i)?;
            tcp.rcv.iss = seg.seq;
            tcp.rcv.nxt = seg.seq + 1;
            tcp.flags.irs_valid = true;
            if let Some(mss) = seg.mss {
                tcp.mss = tcp.mss.min(usize::from(mss));
            }
            tcp.snd.win = seg.wnd;
            tcp.snd.wl1_seq = seg.seq;
            tcp.snd.wl2_ack = seg.ack;
        }

        if seg.ack_flag {
            let _ = self.tcp_ack_process(i, seg)?;
        }

        let syn_acked = !self.tcp_ref(i)?.flags.syn_out;
        if syn_acked {
            // Our SYN and theirs have both been seen: connected.
            {
                let tcp = self.tcp_mut(i)?;
                tcp.state = TcpState::Established;
            }
            self.tcp_send_ack(i, seg)?;
            self.tcp_ref(i)?.base.conn_wait.wake(Ok(()));
            let keep = self.tcp_ref(i)?.flags.keep_enable;
            if keep {
                self.tcp_set_keepalive(i, true)?;
            }
            self.tcp_out_event(i, OutEvent::Xmit)?;
        } else {
            // Simultaneous open: answer their SYN with SYN+ACK.
            self.tcp_mut(i)?.state = TcpState::SynRecvd;
            self.tcp_retransmit(i, true)?;
        }
        Ok(())
    }

    /// Passive (or simultaneous) open completing.
    fn tcp_syn_recvd_in(&mut self, i: usize, seg: &mut Segment) -> Result<()> {
        if seg.rst {
            // A reset here refuses an active opener; a passive child
            // just dies quietly back into the pool.
            let err = if self.tcp_ref(i)?.parent.is_none() {
                Error::Refused
            } else {
                Error::Reset
            };
            return self.tcp_abort(i, err);
        }
        if seg.syn && !seg.ack_flag {
            // Retransmitted SYN: answer with the SYN+ACK again.
            return self.tcp_retransmit(i, true);
        }
        if !seg.ack_flag {
            return Ok(());
        }

        if self.tcp_ack_process(i, seg).is_err() {
            return Ok(());
        }
        if self.tcp_ref(i)?.flags.syn_out {
            // Our SYN+ACK still unacknowledged; keep waiting.
            return Ok(());
        }

        self.tcp_mut(i)?.state = TcpState::Established;
        net_debug!("tcp {}: established", i);
        match self.tcp_ref(i)?.parent {
            Some(parent) => {
                // Tell the listener a child is ready for accept().
                if let Ok(listener) = self.tcp_ref(parent) {
                    listener.base.conn_wait.wake(Ok(()));
                }
            }
            None => self.tcp_ref(i)?.base.conn_wait.wake(Ok(())),
        }
        if self.tcp_ref(i)?.flags.keep_enable {
            self.tcp_set_keepalive(i, true)?;
        }

        let fin = self.tcp_data_in(i, seg)?;
        if fin {
            self.tcp_mut(i)?.state = TcpState::CloseWait;
        }
        self.tcp_out_event(i, OutEvent::Xmit)
    }

    fn tcp_established_in(&mut self, i: usize, seg: &mut Segment) -> Result<()> {
        if seg.rst {
            net_debug!("tcp {}: reset by peer", i);
            return self.tcp_abort(i, Error::Reset);
        }
        if seg.syn {
            // A SYN inside the window is fatal.
            self.tcp_send_reset(seg)?;
            return self.tcp_abort(i, Error::Reset);
        }
        let mut advanced = false;
        if seg.ack_flag {
            match self.tcp_ack_process(i, seg) {
                Ok(moved) => advanced = moved,
                Err(_) => return Ok(()),
            }
        }
        let fin = self.tcp_data_in(i, seg)?;
        if fin {
            net_debug!("tcp {}: peer closed, entering CLOSE_WAIT", i);
            self.tcp_mut(i)?.state = TcpState::CloseWait;
        }
        if advanced {
            self.tcp_out_event(i, OutEvent::Xmit)?;
        }
        Ok(())
    }

    fn tcp_fin_wait_1_in(&mut self, i: usize, seg: &mut Segment) -> Result<()> {
        if seg.rst {
            return self.tcp_abort(i, Error::Reset);
        }
        if seg.syn {
            self.tcp_send_reset(seg)?;
            return self.tcp_abort(i, Error::Reset);
        }
        let mut advanced = false;
        if seg.ack_flag {
            match self.tcp_ack_process(i, seg) {
                Ok(moved) => advanced = moved,
                Err(_) => return Ok(()),
            }
        }
        let fin = self.tcp_data_in(i, seg)?;
        let fin_acked = !self.tcp_ref(i)?.flags.fin_out;
        match (fin, fin_acked) {
            (true, true) => return self.tcp_enter_time_wait(i),
            (true, false) => self.tcp_mut(i)?.state = TcpState::Closing,
            (false, true) => self.tcp_mut(i)?.state = TcpState::FinWait2,
            (false, false) => {}
        }
        if advanced {
            self.tcp_out_event(i, OutEvent::Xmit)?;
        }
        Ok(())
    }

    fn tcp_fin_wait_2_in(&mut self, i: usize, seg: &mut Segment) -> Result<()> {
        if seg.rst {
            return self.tcp_abort(i, Error::Reset);
        }
        if seg.syn {
            self.tcp_send_reset(seg)?;
            return self.tcp_abort(i, Error::Reset);
        }
        if seg.ack_flag && matches!(self.tcp_ack_process(i, seg), Err(_)) {
            return Ok(());
        }
        let fin = self.tcp_data_in(i, seg)?;
        if fin {
            self.tcp_enter_time_wait(i)?;
        }
        Ok(())
    }

    fn tcp_closing_in(&mut self, i: usize, seg: &mut Segment) -> Result<()> {
        if seg.rst {
            return self.tcp_abort(i, Error::Reset);
        }
        if seg.syn {
            self.tcp_send_reset(seg)?;
            return self.tcp_abort(i, Error::Reset);
        }
        if seg.ack_flag && matches!(self.tcp_ack_process(i, seg), Err(_)) {
            return Ok(());
        }
        if !self.tcp_ref(i)?.flags.fin_out {
            self.tcp_enter_time_wait(i)?;
        }
        Ok(())
    }

    /// Half-closed by the peer: only ACKs matter inbound, data still
    /// flows outbound.
    fn tcp_close_wait_in(&mut self, i: usize, seg: &mut Segment) -> Result<()> {
        if seg.rst {
            return self.tcp_abort(i, Error::Reset);
        }
        if seg.syn {
            self.tcp_send_reset(seg)?;
            return self.tcp_abort(i, Error::Reset);
        }
        let mut advanced = false;
        if seg.ack_flag {
            match self.tcp_ack_process(i, seg) {
                Ok(moved) => advanced = moved,
                Err(_) => return Ok(()),
            }
        }
        if advanced {
            self.tcp_out_event(i, OutEvent::Xmit)?;
        }
        Ok(())
    }

    fn tcp_last_ack_in(&mut self, i: usize, seg: &mut Segment) -> Result<()> {
        if seg.rst {
            return self.tcp_abort(i, Error::Reset);
        }
        if seg.ack_flag && matches!(self.tcp_ack_process(i, seg), Err(_)) {
            return Ok(());
        }
        if !self.tcp_ref(i)?.flags.fin_out {
            // Our FIN is acknowledged; the conversation is over.
            net_debug!("tcp {}: closed by both sides", i);
            return self.tcp_abort(i, Error::Close);
        }
        Ok(())
    }

    fn tcp_time_wait_in(&mut self, i: usize, seg: &mut Segment) -> Result<()> {
        if seg.rst {
            self.tcp_free(i);
            return Ok(());
        }
        if seg.fin {
            // The peer never saw our last ACK; repeat it and hold the
            // socket for another two lifetimes.
            self.tcp_send_ack(i, seg)?;
            self.timers.add(
                TimerEvent::TcpConn(i),
                Duration::from_millis(2 * TCP_MSL_MS as u64),
                None,
            );
        }
        Ok(())
    }

    /// §4.8 data acceptance: clip to the window, refuse holes, feed the
    /// receive ring, consume an aligned FIN. Returns whether a FIN was
    /// consumed.
    pub(crate) fn tcp_data_in(&mut self, i: usize, seg: &mut Segment) -> Result<bool> {
        if seg.data_len == 0 && !seg.fin {
            return Ok(false);
        }

        enum Outcome {
            Stale,
            Hole,
            Took,
        }

        let outcome = {
            let nxt = self.tcp_ref(i)?.rcv.nxt;

            // Clip the left edge to what we have already consumed.
            if seg.seq < nxt {
                let clip = nxt - seg.seq;
                if clip > seg.data_len {
                    // Nothing new, not even a FIN edge.
                    Outcome::Stale
                } else {
                    seg.buf.remove_header(clip)?;
                    seg.data_len -= clip;
                    seg.seq = nxt;
                    Outcome::Took
                }
            } else if seg.seq > nxt {
                Outcome::Hole
            } else {
                Outcome::Took
            }
        };

        match outcome {
            Outcome::Stale => {
                self.tcp_send_ack(i, seg)?;
                return Ok(false);
            }
            Outcome::Hole => {
                // No out-of-order queue: re-advertise what we expect.
                net_trace!("tcp {}: hole at {}, duplicate ACK", i, seg.seq);
                self.tcp_send_ack(i, seg)?;
                return Ok(false);
            }
            Outcome::Took => {}
        }

        let (fin_consumed, advanced, closed) = {
            let tcp = self.tcp_mut(i)?;

            // Clip the right edge to the window; a FIN at or beyond it
            // falls off.
            let wnd = tcp.rcv_window();
            if seg.data_len > wnd {
                seg.buf.resize(wnd)?;
                seg.data_len = wnd;
            }
            if seg.fin && seg.data_len >= wnd && wnd > 0 {
                seg.fin = false;
            }

            let mut advanced = 0;
            if seg.data_len > 0 {
                seg.buf.reset_acc();
                let wrote = tcp.rcv.buf.write_from(&mut seg.buf, seg.data_len)?;
                tcp.rcv.nxt += wrote;
                advanced += wrote;
            }
            let mut fin_consumed = false;
            if seg.fin {
                tcp.rcv.nxt += 1;
                tcp.flags.fin_in = true;
                fin_consumed = true;
                advanced += 1;
            }
            (fin_consumed, advanced, tcp.flags.fin_in)
        };

        if advanced > 0 {
            let wait = self.tcp_ref(i)?.base.rcv_wait.clone();
            wait.wake(if closed { Err(Error::Close) } else { Ok(()) });
            self.tcp_send_ack(i, seg)?;
        }
        Ok(fin_consumed)
    }
}
