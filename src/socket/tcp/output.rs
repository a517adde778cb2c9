//! The TCP send side: what to send, when to send it, and when to try
//! again.
//!
//! Segments are built from the send ring on demand — nothing emitted is
//! kept, so a retransmission re-reads the ring at `snd.una`. One timer
//! per connection covers the whole flight; the four-substate machine
//! below decides whether its expiry means retransmit, probe, or give
//! up.

use super::input::Segment;
use super::{OutState, Tcp, TcpState};
use crate::config::{
    TCP_DUPTHRESH, TCP_PERSIST_RETRIES, TCP_PERSIST_TMO_MS, TCP_RESENDING_RETRIES, TCP_RTO_MAX_MS,
    TCP_RTO_MIN_MS,
};
use crate::error::Error;
use crate::pktbuf::{PktBuf, PktPool};
use crate::socket::tcp::buf::TcpBuf;
use crate::stack::Stack;
use crate::time::Duration;
use crate::timer::TimerEvent;
use crate::wire::{
    checksum, IpEndpoint, IpProtocol, TcpOption, TcpPacket, TcpSeqNumber as SeqNumber,
    TCP_HEADER_LEN,
};
use crate::Result;

/// Events driving the output substate machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutEvent {
    /// The application queued data (or a SYN/FIN wants out).
    Send,
    /// An acceptable ACK moved `snd.una`.
    Xmit,
}

/// Everything needed to emit one segment.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SegmentOut {
    pub seq: SeqNumber,
    pub ack: SeqNumber,
    pub syn: bool,
    pub ack_flag: bool,
    pub fin: bool,
    pub rst: bool,
    pub wnd: u16,
    /// MSS to advertise; present on SYN segments only.
    pub mss: Option<u16>,
    /// `(offset, len)` into the send ring.
    pub payload: Option<(usize, usize)>,
}

/// SYN option block: MSS, SACK-permitted, two NOPs of padding.
const SYN_OPTIONS_LEN: usize = 8;

/// Serialize one segment, checksummed, ready for the IP layer.
fn build_segment(
    pool: &PktPool,
    local: IpEndpoint,
    remote: IpEndpoint,
    seg: &SegmentOut,
    ring: Option<&TcpBuf>,
) -> Result<PktBuf> {
    let header_len = if seg.mss.is_some() {
        TCP_HEADER_LEN + SYN_OPTIONS_LEN
    } else {
        TCP_HEADER_LEN
    };
    let dlen = seg.payload.map(|(_, len)| len).unwrap_or(0);

    let mut buf = pool.alloc(header_len + dlen)?;
    {
        let mut packet = TcpPacket::new_unchecked(buf.head_mut());
        packet.set_src_port(local.port);
        packet.set_dst_port(remote.port);
        packet.set_seq_number(seg.seq);
        packet.set_ack_number(seg.ack);
        packet.clear_flags();
        packet.set_header_len(header_len as u8);
        packet.set_syn(seg.syn);
        packet.set_ack(seg.ack_flag);
        packet.set_fin(seg.fin);
        packet.set_rst(seg.rst);
        packet.set_window_len(seg.wnd);
        packet.set_urgent_at(0);
        packet.set_checksum(0);
        if let Some(mss) = seg.mss {
            let rest = TcpOption::MaxSegmentSize(mss).emit(packet.options_mut());
            let rest = TcpOption::SackPermitted.emit(rest);
            let rest = TcpOption::NoOperation.emit(rest);
            TcpOption::NoOperation.emit(rest);
        }
    }
    if let (Some((doff, len)), Some(ring)) = (seg.payload, ring) {
        if len > 0 {
            buf.seek(header_len)?;
            ring.peek_into(doff, len, &mut buf)?;
        }
    }

    let total = buf.total_len();
    buf.reset_acc();
    let preload =
        checksum::pseudo_header(&local.addr, &remote.addr, IpProtocol::Tcp, total as u32);
    let sum = buf.checksum16(total, preload, true)?;
    TcpPacket::new_unchecked(buf.head_mut()).set_checksum(sum);
    Ok(buf)
}

/// Decide offset and length of the next data transfer, §4.9's
/// `get_send_info`: from `snd.nxt` normally, from `snd.una` when
/// retransmitting, exactly one byte against a closed window.
fn get_send_info(tcp: &Tcp, rexmit: bool, no_newdata: bool) -> (usize, usize) {
    let in_flight = tcp.snd.nxt - tcp.snd.una;
    let count = tcp.snd.buf.count();

    let (doff, mut dlen);
    if rexmit {
        doff = 0;
        dlen = if no_newdata { in_flight } else { count };
    } else {
        doff = if tcp.flags.syn_out { 0 } else { in_flight };
        dlen = count.saturating_sub(doff);
    }
    // SYN and FIN occupy sequence space but not the ring.
    dlen = dlen.min(count.saturating_sub(doff));
    if dlen == 0 {
        return (doff, 0);
    }

    if tcp.snd.win == 0 {
        // Window probe: one byte, regardless.
        dlen = 1;
    } else {
        dlen = dlen.min(tcp.mss);
        if doff >= tcp.snd.win {
            return (doff, 0);
        }
        if doff + dlen > tcp.snd.win {
            dlen = tcp.snd.win - doff;
        }
    }
    (doff, dlen)
}

impl Stack {
    fn tcp_emit_sock(&mut self, i: usize, seg: SegmentOut) -> Result<()> {
        let pool = self.pool.clone();
        let (local, remote, buf) = {
            let tcp = self.tcp_ref(i)?;
            let buf = build_segment(&pool, tcp.base.local, tcp.base.remote, &seg, Some(&tcp.snd.buf))?;
            (tcp.base.local, tcp.base.remote, buf)
        };
        net_trace!(
            "tcp {}: out seq={} ack={} len={} {} -> {}",
            i,
            seg.seq,
            seg.ack,
            seg.payload.map(|(_, l)| l).unwrap_or(0),
            local,
            remote
        );
        self.ipv4_out(IpProtocol::Tcp, remote.addr, local.addr, buf)
    }

    /// Emit new data (and a pending SYN/FIN) starting at `snd.nxt`.
    pub(crate) fn tcp_transmit(&mut self, i: usize) -> Result<()> {
        let seg = {
            let tcp = self.tcp_mut(i)?;
            let (doff, dlen) = get_send_info(tcp, false, false);
            let syn = tcp.flags.syn_out;
            // A FIN waits for the ring to drain fully.
            let fin = tcp.flags.fin_out && tcp.snd.buf.is_empty();
            let seq_len = dlen + usize::from(syn) + usize::from(fin);
            if seq_len == 0 {
                return Ok(());
            }
            let seg = SegmentOut {
                seq: tcp.snd.nxt,
                ack: tcp.rcv.nxt,
                syn,
                ack_flag: tcp.flags.irs_valid,
                fin,
                rst: false,
                wnd: tcp.rcv_window().min(u16::MAX as usize) as u16,
                mss: if syn { Some(tcp.mss as u16) } else { None },
                payload: Some((doff, dlen)),
            };
            tcp.snd.nxt += dlen + usize::from(syn) + usize::from(fin);
            seg
        };
        self.tcp_emit_sock(i, seg)
    }

    /// Re-emit from `snd.una`. With `no_newdata` only the in-flight
    /// span is resent; otherwise whatever fits goes out.
    pub(crate) fn tcp_retransmit(&mut self, i: usize, no_newdata: bool) -> Result<()> {
        let seg = {
            let tcp = self.tcp_mut(i)?;
            let (doff, dlen) = get_send_info(tcp, true, no_newdata);
            let syn = tcp.flags.syn_out;
            let fin = tcp.flags.fin_out && tcp.snd.buf.is_empty();
            let seg = SegmentOut {
                seq: tcp.snd.una,
                ack: tcp.rcv.nxt,
                syn,
                ack_flag: tcp.flags.irs_valid,
                fin,
                rst: false,
                wnd: tcp.rcv_window().min(u16::MAX as usize) as u16,
                mss: if syn { Some(tcp.mss as u16) } else { None },
                payload: Some((doff, dlen)),
            };
            // Any tail of this segment beyond snd.nxt is new data.
            let reach = tcp.snd.una + dlen;
            if reach > tcp.snd.nxt {
                tcp.snd.nxt = reach;
            }
            seg
        };
        self.tcp_emit_sock(i, seg)
    }

    /// Push as much of the window as possible, one segment at a time.
    fn tcp_transmit_most(&mut self, i: usize) -> Result<()> {
        let mut budget = {
            let tcp = self.tcp_ref(i)?;
            let mut total = tcp.snd.win.min(tcp.snd.buf.count());
            total = total.saturating_sub(tcp.snd.nxt - tcp.snd.una);
            total += usize::from(tcp.flags.syn_out);
            if tcp.snd.buf.is_empty() && tcp.flags.fin_out {
                total += 1;
            }
            total
        };
        while budget > 0 {
            let before = self.tcp_ref(i)?.snd.nxt;
            self.tcp_transmit(i)?;
            let sent = self.tcp_ref(i)?.snd.nxt - before;
            if sent == 0 {
                break;
            }
            budget = budget.saturating_sub(sent);
        }
        Ok(())
    }

    /// A bare ACK carrying our current window. Never answers a RST.
    pub(crate) fn tcp_send_ack(&mut self, i: usize, seg: &Segment) -> Result<()> {
        if seg.rst {
            return Ok(());
        }
        let out = {
            let tcp = self.tcp_ref(i)?;
            SegmentOut {
                seq: tcp.snd.nxt,
                ack: tcp.rcv.nxt,
                ack_flag: true,
                wnd: tcp.rcv_window().min(u16::MAX as usize) as u16,
                ..SegmentOut::default()
            }
        };
        self.tcp_emit_sock(i, out)
    }

    /// Window-reopen notice: same shape as a bare ACK.
    pub(crate) fn tcp_send_win_update(&mut self, i: usize) -> Result<()> {
        let out = {
            let tcp = self.tcp_ref(i)?;
            SegmentOut {
                seq: tcp.snd.nxt,
                ack: tcp.rcv.nxt,
                ack_flag: true,
                wnd: tcp.rcv_window().min(u16::MAX as usize) as u16,
                ..SegmentOut::default()
            }
        };
        self.tcp_emit_sock(i, out)
    }

    /// A keepalive probe: a bare ACK one sequence number behind, which
    /// the peer must answer.
    pub(crate) fn tcp_send_keepalive(&mut self, i: usize) -> Result<()> {
        let out = {
            let tcp = self.tcp_ref(i)?;
            SegmentOut {
                seq: tcp.snd.nxt - 1,
                ack: tcp.rcv.nxt,
                ack_flag: true,
                wnd: tcp.rcv_window().min(u16::MAX as usize) as u16,
                ..SegmentOut::default()
            }
        };
        self.tcp_emit_sock(i, out)
    }

    /// Reset the peer of socket `i` (keepalive failure, abort).
    pub(crate) fn tcp_send_reset_for_sock(&mut self, i: usize) -> Result<()> {
        let out = {
            let tcp = self.tcp_ref(i)?;
            SegmentOut {
                seq: tcp.snd.nxt,
                ack: tcp.rcv.nxt,
                ack_flag: true,
                rst: true,
                wnd: 0,
                ..SegmentOut::default()
            }
        };
        self.tcp_emit_sock(i, out)
    }

    /// Answer an orphan or invalid segment with a RST the sender will
    /// accept: against an ACK, sit exactly on it; otherwise ACK the
    /// segment's span so the peer's SYN_SENT check passes. RSTs are
    /// never answered with RSTs.
    pub(crate) fn tcp_send_reset(&mut self, seg: &Segment) -> Result<()> {
        if seg.rst {
            return Ok(());
        }
        let out = if seg.ack_flag {
            SegmentOut {
                seq: seg.ack,
                rst: true,
                ..SegmentOut::default()
            }
        } else {
            SegmentOut {
                seq: SeqNumber(0),
                ack: seg.seq + seg.seq_len,
                ack_flag: true,
                rst: true,
                ..SegmentOut::default()
            }
        };
        let buf = build_segment(&self.pool.clone(), seg.dst, seg.src, &out, None)?;
        net_trace!("tcp: reset to {}", seg.src);
        self.ipv4_out(IpProtocol::Tcp, seg.src.addr, seg.dst.addr, buf)
    }

    /// Move the output machine and (re)arm its timer.
    pub(crate) fn tcp_set_ostate(&mut self, i: usize, state: OutState) -> Result<()> {
        let tmo = {
            let tcp = self.tcp_mut(i)?;
            tcp.snd.ostate = state;
            match state {
                OutState::Idle => {
                    self.timers.remove(TimerEvent::TcpSnd(i));
                    return Ok(());
                }
                OutState::Sending | OutState::Rexmit => tcp.snd.rto,
                OutState::Persist => {
                    tcp.snd.rexmit_cnt = 0;
                    TCP_PERSIST_TMO_MS
                }
            }
        };
        self.timers
            .add(TimerEvent::TcpSnd(i), Duration::from_millis(tmo as u64), None);
        Ok(())
    }

    /// §4.9's output substate machine, one arm per substate.
    pub(crate) fn tcp_out_event(&mut self, i: usize, event: OutEvent) -> Result<()> {
        let ostate = self.tcp_ref(i)?.snd.ostate;
        match ostate {
            OutState::Idle => self.tcp_ostate_idle(i, event),
            OutState::Sending => self.tcp_ostate_sending(i, event),
            OutState::Rexmit => self.tcp_ostate_rexmit(i, event),
            OutState::Persist => self.tcp_ostate_persist(i, event),
        }
    }

    fn tcp_ostate_idle(&mut self, i: usize, event: OutEvent) -> Result<()> {
        if event != OutEvent::Send {
            return Ok(());
        }
        if self.tcp_ref(i)?.snd.win > 0 {
            self.tcp_transmit_most(i)?;
            self.tcp_set_ostate(i, OutState::Sending)?;
            self.tcp_begin_rto(i);
        } else {
            self.tcp_transmit(i)?;
            self.tcp_set_ostate(i, OutState::Persist)?;
        }
        Ok(())
    }

    fn tcp_ostate_sending(&mut self, i: usize, event: OutEvent) -> Result<()> {
        match event {
            OutEvent::Send => {
                if self.tcp_ref(i)?.snd.win > 0 {
                    self.tcp_transmit_most(i)?;
                    // Restart the timer so it covers the last segment.
                    self.tcp_set_ostate(i, OutState::Sending)?;
                    self.tcp_begin_rto(i);
                } else {
                    self.tcp_transmit(i)?;
                    self.tcp_set_ostate(i, OutState::Persist)?;
                }
            }
            OutEvent::Xmit => {
                let (all_acked, more_work, win_open) = {
                    let tcp = self.tcp_ref(i)?;
                    (
                        tcp.snd.una == tcp.snd.nxt || tcp.flags.fin_out,
                        !tcp.snd.buf.is_empty() || tcp.flags.fin_out,
                        tcp.snd.win > 0,
                    )
                };
                if all_acked {
                    if more_work {
                        if win_open {
                            self.tcp_transmit_most(i)?;
                            self.tcp_set_ostate(i, OutState::Sending)?;
                            self.tcp_begin_rto(i);
                        } else {
                            self.tcp_set_ostate(i, OutState::Persist)?;
                            self.tcp_transmit(i)?;
                        }
                    } else {
                        self.tcp_set_ostate(i, OutState::Idle)?;
                    }
                }
                // A partial ACK leaves the timer running; expiry will
                // retransmit what is still missing.
            }
        }
        Ok(())
    }

    fn tcp_ostate_rexmit(&mut self, i: usize, event: OutEvent) -> Result<()> {
        if event != OutEvent::Xmit {
            return Ok(());
        }
        let (all_acked, more_work, win_open) = {
            let tcp = self.tcp_ref(i)?;
            (
                tcp.snd.una == tcp.snd.nxt || tcp.flags.fin_out,
                !tcp.snd.buf.is_empty() || tcp.flags.fin_out,
                tcp.snd.win > 0,
            )
        };
        if all_acked {
            if more_work {
                if win_open {
                    self.tcp_transmit_most(i)?;
                    self.tcp_set_ostate(i, OutState::Sending)?;
                } else {
                    self.tcp_set_ostate(i, OutState::Persist)?;
                    self.tcp_transmit(i)?;
                }
            } else {
                self.tcp_set_ostate(i, OutState::Idle)?;
            }
        } else {
            // Part of the flight came back; push the rest again.
            if win_open {
                self.tcp_set_ostate(i, OutState::Rexmit)?;
            } else {
                self.tcp_set_ostate(i, OutState::Persist)?;
            }
            self.tcp_retransmit(i, false)?;
        }
        Ok(())
    }

    fn tcp_ostate_persist(&mut self, i: usize, event: OutEvent) -> Result<()> {
        if event != OutEvent::Xmit {
            return Ok(());
        }
        if self.tcp_ref(i)?.snd.win == 0 {
            return Ok(());
        }
        let all_acked = {
            let tcp = self.tcp_ref(i)?;
            tcp.snd.una == tcp.snd.nxt || tcp.flags.fin_out
        };
        if all_acked {
            self.tcp_transmit_most(i)?;
            self.tcp_set_ostate(i, OutState::Sending)?;
        } else {
            self.tcp_set_ostate(i, OutState::Rexmit)?;
            self.tcp_retransmit(i, true)?;
        }
        Ok(())
    }

    /// Send-timer expiry, dispatched on the current substate.
    pub(crate) fn tcp_snd_timeout(&mut self, i: usize) {
        let Ok(tcp) = self.tcp_ref(i) else { return };
        let ostate = tcp.snd.ostate;
        net_debug!("tcp {}: send timer expired in {:?}", i, ostate);
        let result = match ostate {
            OutState::Idle => Ok(()),
            OutState::Sending => self.tcp_sending_expired(i),
            OutState::Rexmit => self.tcp_rexmit_expired(i),
            OutState::Persist => self.tcp_persist_expired(i),
        };
        if let Err(err) = result {
            net_debug!("tcp {}: timer handling failed: {}", i, err);
        }
    }

    fn tcp_sending_expired(&mut self, i: usize) -> Result<()> {
        // The sample spans a retransmission now; discard it (Karn).
        self.tcp_end_rto(i);
        self.tcp_retransmit(i, true)?;
        let rto = {
            let tcp = self.tcp_mut(i)?;
            tcp.snd.rexmit_cnt = 1;
            tcp.snd.rto = (tcp.snd.rto << 1).min(TCP_RTO_MAX_MS);
            tcp.snd.ostate = OutState::Rexmit;
            tcp.snd.rto
        };
        self.timers
            .add(TimerEvent::TcpSnd(i), Duration::from_millis(rto as u64), None);
        Ok(())
    }

    fn tcp_rexmit_expired(&mut self, i: usize) -> Result<()> {
        {
            let tcp = self.tcp_mut(i)?;
            tcp.snd.rexmit_cnt += 1;
            if tcp.snd.rexmit_cnt > TCP_RESENDING_RETRIES {
                net_debug!("tcp {}: retransmission budget exhausted", i);
                return self.tcp_abort(i, Error::Timeout);
            }
        }
        self.tcp_retransmit(i, true)?;
        let rto = {
            let tcp = self.tcp_mut(i)?;
            tcp.snd.rto = (tcp.snd.rto << 1).min(TCP_RTO_MAX_MS);
            tcp.snd.rto
        };
        self.timers
            .add(TimerEvent::TcpSnd(i), Duration::from_millis(rto as u64), None);
        Ok(())
    }

    fn tcp_persist_expired(&mut self, i: usize) -> Result<()> {
        let give_up = {
            let tcp = self.tcp_mut(i)?;
            tcp.snd.rexmit_cnt += 1;
            tcp.snd.rexmit_cnt > TCP_PERSIST_RETRIES
        };
        if give_up {
            net_debug!("tcp {}: persist probes exhausted", i);
            self.tcp_ref(i)?.base.snd_wait.wake(Err(Error::Timeout));
            return Ok(());
        }
        self.tcp_retransmit(i, true)?;
        let tmo = {
            let tcp = self.tcp_ref(i)?;
            ((tcp.snd.rto) << tcp.snd.rexmit_cnt.min(16)).min(TCP_RTO_MAX_MS)
        };
        self.timers
            .add(TimerEvent::TcpSnd(i), Duration::from_millis(tmo as u64), None);
        Ok(())
    }

    /// Start an RTT sample if none is running and real transmission is
    /// happening.
    pub(crate) fn tcp_begin_rto(&mut self, i: usize) {
        let now = self.now;
        let Ok(tcp) = self.tcp_mut(i) else { return };
        if !tcp.flags.rto_going {
            tcp.flags.rto_going = true;
            tcp.snd.rttseq = tcp.snd.nxt;
            tcp.snd.rtt_start = now;
        }
    }

    pub(crate) fn tcp_end_rto(&mut self, i: usize) {
        if let Ok(tcp) = self.tcp_mut(i) {
            tcp.flags.rto_going = false;
        }
    }

    /// Fold a completed RTT sample into `srtt`/`rttvar` and refresh the
    /// RTO (Jacobson, fixed point: `srtt` scaled ×8, `rttvar` ×4).
    pub(crate) fn tcp_cal_rto(&mut self, i: usize) {
        let now = self.now;
        let Ok(tcp) = self.tcp_mut(i) else { return };
        if !tcp.flags.rto_going {
            return;
        }
        let rtt = ((now - tcp.snd.rtt_start).total_millis() as i64).max(1);
        if tcp.snd.srtt != 0 {
            let delta = rtt - (tcp.snd.srtt >> 3);
            tcp.snd.srtt += delta;
            tcp.snd.rttvar += delta.abs() - (tcp.snd.rttvar >> 2);
        } else {
            tcp.snd.srtt = rtt << 3;
            tcp.snd.rttvar = rtt << 1;
        }
        tcp.snd.rto = ((tcp.snd.srtt >> 3) + tcp.snd.rttvar).clamp(TCP_RTO_MIN_MS, TCP_RTO_MAX_MS);
        tcp.flags.rto_going = false;
        net_trace!(
            "tcp {}: rtt sample {}ms, srtt {}ms, rto {}ms",
            i,
            rtt,
            tcp.snd.srtt >> 3,
            tcp.snd.rto
        );
    }

    /// Whether a window update should be treated as an XMIT event: a
    /// persisting sender resumes the moment the peer's window reopens.
    fn tcp_window_resumed(&self, i: usize) -> Result<bool> {
        let tcp = self.tcp_ref(i)?;
        Ok(tcp.snd.ostate == OutState::Persist && tcp.snd.win > 0)
    }

    /// The §4.9 window-update guard: only newer segments (or the same
    /// segment re-acknowledged) may change `snd.win`.
    pub(crate) fn tcp_cal_snd_win(&mut self, i: usize, seg: &Segment) {
        let Ok(tcp) = self.tcp_mut(i) else { return };
        if tcp.snd.wl1_seq < seg.seq
            || (tcp.snd.wl1_seq == seg.seq && tcp.snd.wl2_ack <= seg.ack)
        {
            tcp.snd.win = seg.wnd;
            tcp.snd.wl1_seq = seg.seq;
            tcp.snd.wl2_ack = seg.ack;
        }
    }

    /// Process an inbound ACK. `Ok(true)` means `snd.una` advanced (an
    /// XMIT event for the output machine); `Err(Unreach)` means the ACK
    /// covers data never sent and the segment must not be processed
    /// further.
    pub(crate) fn tcp_ack_process(&mut self, i: usize, seg: &Segment) -> Result<bool> {
        enum Verdict {
            Stale,
            Duplicate(bool),
            Future,
            Fresh,
        }
        let verdict = {
            let tcp = self.tcp_ref(i)?;
            if seg.ack < tcp.snd.una {
                Verdict::Stale
            } else if seg.ack == tcp.snd.una {
                // RFC 5681: a duplicate carries nothing — no data, no
                // flags, no window change — while data is outstanding.
                let is_dup = tcp.snd.nxt > tcp.snd.una
                    && seg.data_len == 0
                    && !seg.syn
                    && !seg.fin
                    && !seg.rst
                    && seg.wnd == tcp.snd.win;
                Verdict::Duplicate(is_dup)
            } else if seg.ack > tcp.snd.nxt {
                Verdict::Future
            } else {
                Verdict::Fresh
            }
        };

        match verdict {
            Verdict::Stale => {
                self.tcp_cal_snd_win(i, seg);
                self.tcp_window_resumed(i)
            }
            Verdict::Duplicate(is_dup) => {
                if is_dup {
                    let fire = {
                        let tcp = self.tcp_mut(i)?;
                        tcp.snd.dup_ack += 1;
                        tcp.snd.ostate == OutState::Sending && tcp.snd.dup_ack >= TCP_DUPTHRESH
                    };
                    if fire {
                        net_debug!("tcp {}: fast retransmit", i);
                        self.tcp_mut(i)?.snd.dup_ack = 0;
                        self.tcp_retransmit(i, false)?;
                        self.tcp_set_ostate(i, OutState::Rexmit)?;
                    }
                    Ok(false)
                } else {
                    self.tcp_cal_snd_win(i, seg);
                    self.tcp_window_resumed(i)
                }
            }
            Verdict::Future => {
                if self.tcp_ref(i)?.state == TcpState::SynRecvd {
                    self.tcp_send_reset(seg)?;
                } else {
                    self.tcp_send_ack(i, seg)?;
                }
                Err(Error::Unreach)
            }
            Verdict::Fresh => {
                let run_rto = {
                    let tcp = self.tcp_mut(i)?;
                    tcp.snd.dup_ack = 0;
                    if tcp.flags.syn_out {
                        tcp.snd.una += 1;
                        tcp.flags.syn_out = false;
                    }
                    let acked = seg.ack - tcp.snd.una;
                    let unacked = tcp.snd.nxt - tcp.snd.una;
                    let curr = acked.min(unacked);
                    tcp.snd.una += curr;
                    let removed = tcp.snd.buf.remove(curr);
                    let leftover = curr - removed;
                    // A leftover sequence number with an empty ring is
                    // the FIN coming back acknowledged.
                    if tcp.snd.buf.is_empty() && leftover > 0 && tcp.flags.fin_out {
                        tcp.flags.fin_out = false;
                    }
                    tcp.base.snd_wait.wake(Ok(()));
                    tcp.flags.rto_going && tcp.snd.rttseq <= tcp.snd.una
                };
                self.tcp_cal_snd_win(i, seg);
                if run_rto {
                    self.tcp_cal_rto(i);
                }
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::tcp::{ConnCtl, RecvCtl, SendCtl};
    use crate::config::{TCP_RBUF_SIZE, TCP_SBUF_SIZE};
    use crate::time::Instant;

    fn tcb() -> Tcp {
        let mut tcp = Tcp {
            base: crate::socket::SockBase::new(
                crate::socket::Family::Inet,
                IpProtocol::Tcp,
            ),
            state: TcpState::Established,
            mss: 100,
            flags: Default::default(),
            snd: SendCtl {
                iss: SeqNumber(1000),
                una: SeqNumber(1000),
                nxt: SeqNumber(1000),
                win: 500,
                wl1_seq: SeqNumber::default(),
                wl2_ack: SeqNumber::default(),
                buf: TcpBuf::new(TCP_SBUF_SIZE),
                srtt: 0,
                rttvar: 0,
                rto: 1000,
                rttseq: SeqNumber::default(),
                rtt_start: Instant::ZERO,
                ostate: OutState::Idle,
                rexmit_cnt: 0,
                dup_ack: 0,
            },
            rcv: RecvCtl {
                iss: SeqNumber(0),
                nxt: SeqNumber(0),
                buf: TcpBuf::new(TCP_RBUF_SIZE),
            },
            conn: ConnCtl {
                backlog: 0,
                keep_idle: 7200,
                keep_intvl: 75,
                keep_cnt: 9,
                keep_retry: 0,
            },
            parent: None,
        };
        tcp.snd.buf.write_slice(&[0xaa; 300]);
        tcp
    }

    #[test]
    fn send_info_normal() {
        let tcp = tcb();
        // Nothing in flight: send from the ring start, clipped to MSS.
        assert_eq!(get_send_info(&tcp, false, false), (0, 100));
    }

    #[test]
    fn send_info_with_in_flight() {
        let mut tcp = tcb();
        tcp.snd.nxt = SeqNumber(1200);
        assert_eq!(get_send_info(&tcp, false, false), (200, 100));
    }

    #[test]
    fn send_info_window_clips() {
        let mut tcp = tcb();
        tcp.snd.win = 250;
        tcp.snd.nxt = SeqNumber(1200);
        // Only 50 bytes of window remain past the in-flight span.
        assert_eq!(get_send_info(&tcp, false, false), (200, 50));
        tcp.snd.win = 150;
        // The flight already fills the window.
        assert_eq!(get_send_info(&tcp, false, false), (200, 0));
    }

    #[test]
    fn send_info_zero_window_probe() {
        let mut tcp = tcb();
        tcp.snd.win = 0;
        assert_eq!(get_send_info(&tcp, false, false), (0, 1));
    }

    #[test]
    fn send_info_rexmit() {
        let mut tcp = tcb();
        tcp.snd.nxt = SeqNumber(1200);
        // Timer-driven: only the unacknowledged span, from the front.
        assert_eq!(get_send_info(&tcp, true, true), (0, 100));
        // Dup-ACK-driven: everything available.
        assert_eq!(get_send_info(&tcp, true, false), (0, 100));
    }

    #[test]
    fn send_info_syn_rexmit_has_no_data() {
        let mut tcp = tcb();
        tcp.snd.buf.clear();
        tcp.flags.syn_out = true;
        tcp.snd.nxt = SeqNumber(1001);
        assert_eq!(get_send_info(&tcp, true, true), (0, 0));
    }

    #[test]
    fn build_segment_emits_options_and_checksum() {
        let pool = PktPool::new(16);
        let local = IpEndpoint::new(crate::wire::Ipv4Address::new(10, 0, 0, 2), 49152);
        let remote = IpEndpoint::new(crate::wire::Ipv4Address::new(10, 0, 0, 3), 80);
        let seg = SegmentOut {
            seq: SeqNumber(32435),
            ack: SeqNumber(0),
            syn: true,
            wnd: 4096,
            mss: Some(1460),
            ..SegmentOut::default()
        };
        let buf = build_segment(&pool, local, remote, &seg, None).unwrap();
        let bytes = buf.to_vec();
        let packet = TcpPacket::new_checked(&bytes[..]).unwrap();
        assert!(packet.syn() && !packet.ack());
        assert_eq!(packet.header_len(), 28);
        assert_eq!(crate::wire::parse_mss(packet.options()), Some(1460));
        assert!(packet.verify_checksum(&local.addr, &remote.addr));
    }
}
