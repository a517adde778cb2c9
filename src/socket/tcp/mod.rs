//! TCP: the connection control block and its application-side edge.
//!
//! The connection state machine over ingress segments lives in
//! [`input`]; the output substate machine, segment builder and RTT
//! estimator live in [`output`]. This module owns the control block
//! itself, the socket-table operations (open, bind, connect, listen,
//! accept, close), and keepalive.

pub mod buf;
pub(crate) mod input;
pub(crate) mod output;

use self::buf::TcpBuf;
use crate::config::{
    TCP_DEFAULT_MSS, TCP_ISS_INCREMENT, TCP_KEEPALIVE_CNT, TCP_KEEPALIVE_IDLE_S,
    TCP_KEEPALIVE_INTVL_S, TCP_MSL_MS, TCP_RBUF_SIZE, TCP_RTO_INITIAL_MS, TCP_SBUF_SIZE,
    PORT_DYN_END, PORT_DYN_START,
};
use crate::error::Error;
use crate::iface::route::RouteType;
use crate::socket::{vacant, Family, SockBase, SockId};
use crate::stack::Stack;
use crate::time::{Duration, Instant};
use crate::timer::TimerEvent;
use crate::wire::{IpEndpoint, IpProtocol, TcpSeqNumber as SeqNumber, IPV4_HEADER_LEN,
                  TCP_HEADER_LEN};
use crate::Result;

/// Connection state, RFC 793. A free table slot stands in for FREE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRecvd,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

impl TcpState {
    /// Whether the handshake has completed (peer ISN known and ACKed).
    pub fn is_synchronized(self) -> bool {
        !matches!(self, TcpState::Closed | TcpState::Listen | TcpState::SynSent)
    }
}

/// Output substate of the send side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutState {
    /// Nothing outstanding.
    Idle,
    /// Data in flight, retransmit timer armed at the current RTO.
    Sending,
    /// Timer- or dup-ACK-driven retransmission in progress.
    Rexmit,
    /// Peer window is zero; probing.
    Persist,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpFlags {
    /// SYN queued for (re)transmission.
    pub syn_out: bool,
    /// FIN queued; sent once the send ring drains.
    pub fin_out: bool,
    /// Peer's FIN consumed; no more data will arrive.
    pub fin_in: bool,
    /// Peer's initial sequence received; ACKs belong on every segment.
    pub irs_valid: bool,
    pub keep_enable: bool,
    /// Application closed while the connection still had work to do.
    pub delayed_free: bool,
    /// Spawned by a listener and not yet claimed by `accept`.
    pub inactive: bool,
    /// An RTT measurement is in flight.
    pub rto_going: bool,
}

/// Send-side sequence state and machinery.
#[derive(Debug)]
pub struct SendCtl {
    pub iss: SeqNumber,
    pub una: SeqNumber,
    pub nxt: SeqNumber,
    /// The peer's advertised window.
    pub win: usize,
    /// Segment seq/ack that last updated `win` (stale-update guard).
    pub wl1_seq: SeqNumber,
    pub wl2_ack: SeqNumber,
    pub buf: TcpBuf,
    /// Smoothed RTT, scaled by 8 (Jacobson fixed point), ms.
    pub srtt: i64,
    /// RTT variance, scaled by 4, ms.
    pub rttvar: i64,
    /// Current retransmission timeout, ms.
    pub rto: i64,
    /// Sequence the running RTT sample was taken at.
    pub rttseq: SeqNumber,
    pub rtt_start: Instant,
    pub ostate: OutState,
    pub rexmit_cnt: u32,
    pub dup_ack: u32,
}

/// Receive-side sequence state.
#[derive(Debug)]
pub struct RecvCtl {
    pub iss: SeqNumber,
    pub nxt: SeqNumber,
    pub buf: TcpBuf,
}

/// Listener and keepalive state.
#[derive(Debug)]
pub struct ConnCtl {
    pub backlog: usize,
    /// Seconds idle before the first probe.
    pub keep_idle: u32,
    /// Seconds between probes.
    pub keep_intvl: u32,
    /// Probes before the peer is declared dead.
    pub keep_cnt: u32,
    pub keep_retry: u32,
}

/// A TCP control block.
#[derive(Debug)]
pub struct Tcp {
    pub base: SockBase,
    pub state: TcpState,
    pub mss: usize,
    pub flags: TcpFlags,
    pub snd: SendCtl,
    pub rcv: RecvCtl,
    pub conn: ConnCtl,
    /// The listener this socket was spawned from, while unaccepted.
    pub parent: Option<usize>,
}

impl Tcp {
    fn new() -> Tcp {
        Tcp {
            base: SockBase::new(Family::Inet, IpProtocol::Tcp),
            state: TcpState::Closed,
            mss: TCP_DEFAULT_MSS,
            flags: TcpFlags::default(),
            snd: SendCtl {
                iss: SeqNumber::default(),
                una: SeqNumber::default(),
                nxt: SeqNumber::default(),
                win: 0,
                wl1_seq: SeqNumber::default(),
                wl2_ack: SeqNumber::default(),
                buf: TcpBuf::new(TCP_SBUF_SIZE),
                srtt: 0,
                rttvar: 0,
                rto: TCP_RTO_INITIAL_MS,
                rttseq: SeqNumber::default(),
                rtt_start: Instant::ZERO,
                ostate: OutState::Idle,
                rexmit_cnt: 0,
                dup_ack: 0,
            },
            rcv: RecvCtl {
                iss: SeqNumber::default(),
                nxt: SeqNumber::default(),
                buf: TcpBuf::new(TCP_RBUF_SIZE),
            },
            conn: ConnCtl {
                backlog: 0,
                keep_idle: TCP_KEEPALIVE_IDLE_S,
                keep_intvl: TCP_KEEPALIVE_INTVL_S,
                keep_cnt: TCP_KEEPALIVE_CNT,
                keep_retry: 0,
            },
            parent: None,
        }
    }

    /// The window to advertise: free space in the receive ring.
    pub fn rcv_window(&self) -> usize {
        self.rcv.buf.free()
    }
}

impl Stack {
    pub(crate) fn tcp_ref(&self, i: usize) -> Result<&Tcp> {
        self.tcp_socks
            .get(i)
            .and_then(|s| s.as_ref())
            .ok_or(Error::Param)
    }

    pub(crate) fn tcp_mut(&mut self, i: usize) -> Result<&mut Tcp> {
        self.tcp_socks
            .get_mut(i)
            .and_then(|s| s.as_mut())
            .ok_or(Error::Param)
    }

    pub(crate) fn tcp_create(&mut self) -> Result<SockId> {
        let slot = vacant(&self.tcp_socks)?;
        self.tcp_socks[slot] = Some(Tcp::new());
        Ok(SockId::Tcp(slot))
    }

    /// Spawn a fresh control block for a listener's child.
    pub(crate) fn tcp_spawn_child(&mut self, parent: usize) -> Result<usize> {
        let slot = vacant(&self.tcp_socks)?;
        let mut child = Tcp::new();
        child.parent = Some(parent);
        child.flags.inactive = true;
        self.tcp_socks[slot] = Some(child);
        Ok(slot)
    }

    /// Release a control block and everything armed on its behalf.
    pub(crate) fn tcp_free(&mut self, i: usize) {
        self.timers.remove(TimerEvent::TcpSnd(i));
        self.timers.remove(TimerEvent::TcpConn(i));
        if let Some(slot) = self.tcp_socks.get_mut(i) {
            *slot = None;
        }
    }

    /// Terminate a connection: publish `err` to every waiter and drop
    /// to CLOSED. The slot survives until the application closes it.
    pub(crate) fn tcp_abort(&mut self, i: usize, err: Error) -> Result<()> {
        self.timers.remove(TimerEvent::TcpSnd(i));
        self.timers.remove(TimerEvent::TcpConn(i));
        let tcp = self.tcp_mut(i)?;
        tcp.state = TcpState::Closed;
        tcp.snd.ostate = OutState::Idle;
        tcp.base.err = Some(err);
        tcp.base.wake_all(err);
        Ok(())
    }

    /// Deterministic initial sequence numbers: a fixed stride, not
    /// RFC 6528. Predictable on purpose.
    pub(crate) fn tcp_next_iss(&mut self) -> SeqNumber {
        let iss = self.next_iss;
        self.next_iss = self.next_iss.wrapping_add(TCP_ISS_INCREMENT);
        SeqNumber(iss)
    }

    /// Pin the next initial sequence number. Tests use this for
    /// reproducible handshakes.
    #[doc(hidden)]
    pub fn set_next_iss(&mut self, iss: u32) {
        self.next_iss = iss;
    }

    pub(crate) fn tcp_bind(&mut self, i: usize, ep: IpEndpoint) -> Result<()> {
        if ep.port == 0 {
            return Err(Error::Param);
        }
        {
            let tcp = self.tcp_ref(i)?;
            if tcp.state != TcpState::Closed {
                return Err(Error::State);
            }
        }
        for (j, sock) in self.tcp_socks.iter().enumerate() {
            let Some(sock) = sock else { continue };
            if j != i && sock.base.local.port == ep.port && sock.base.local.addr == ep.addr {
                return Err(Error::AddrInUse);
            }
        }
        self.tcp_mut(i)?.base.local = ep;
        Ok(())
    }

    fn tcp_alloc_port(&mut self) -> Result<u16> {
        for _ in PORT_DYN_START..PORT_DYN_END {
            let port = self.tcp_port_cursor;
            self.tcp_port_cursor = if self.tcp_port_cursor + 1 >= PORT_DYN_END {
                PORT_DYN_START
            } else {
                self.tcp_port_cursor + 1
            };
            let taken = self
                .tcp_socks
                .iter()
                .flatten()
                .any(|s| s.base.local.port == port);
            if !taken {
                return Ok(port);
            }
        }
        Err(Error::NoMem)
    }

    /// The MSS to offer for a destination: path MTU minus headers on a
    /// directly connected route, the protocol default otherwise.
    fn tcp_mss_for(&self, dst: IpEndpoint) -> usize {
        match self.routes.find(dst.addr) {
            Some(route) if route.rtype != RouteType::Other => self
                .netif_ref(route.netif)
                .map(|n| n.mtu - IPV4_HEADER_LEN - TCP_HEADER_LEN)
                .unwrap_or(TCP_DEFAULT_MSS),
            _ => TCP_DEFAULT_MSS,
        }
    }

    /// Active open: emit a SYN and park the caller on the connect wait.
    pub(crate) fn tcp_connect(&mut self, i: usize, dst: IpEndpoint) -> Result<()> {
        if dst.port == 0 || dst.addr.is_unspecified() {
            return Err(Error::Param);
        }
        if self.tcp_ref(i)?.state != TcpState::Closed {
            return Err(Error::State);
        }

        let route = *self.routes.find(dst.addr).ok_or(Error::NoRoute)?;
        let local_addr = {
            let current = self.tcp_ref(i)?.base.local.addr;
            if current.is_unspecified() {
                self.netif_ref(route.netif)?.addr
            } else {
                current
            }
        };
        let local_port = {
            let current = self.tcp_ref(i)?.base.local.port;
            if current == 0 {
                self.tcp_alloc_port()?
            } else {
                current
            }
        };
        let mss = self.tcp_mss_for(dst);
        let iss = self.tcp_next_iss();

        let tcp = self.tcp_mut(i)?;
        tcp.base.local = IpEndpoint::new(local_addr, local_port);
        tcp.base.remote = dst;
        tcp.mss = mss;
        tcp.snd.iss = iss;
        tcp.snd.una = iss;
        tcp.snd.nxt = iss;
        // Nothing is known about the peer's window yet; assume one MSS
        // so the SYN itself can leave.
        tcp.snd.win = mss;
        tcp.state = TcpState::SynSent;
        tcp.flags.syn_out = true;

        self.tcp_out_event(i, output::OutEvent::Send)?;
        Err(Error::NeedWait)
    }

    /// Passive open. Valid only on a bound, closed socket.
    pub(crate) fn tcp_listen(&mut self, i: usize, backlog: usize) -> Result<()> {
        let tcp = self.tcp_mut(i)?;
        if tcp.state != TcpState::Closed {
            return Err(Error::State);
        }
        if tcp.base.local.port == 0 {
            return Err(Error::Param);
        }
        tcp.state = TcpState::Listen;
        tcp.conn.backlog = backlog.max(1);
        Ok(())
    }

    /// Children of `listener` still waiting to be accepted.
    pub(crate) fn tcp_backlog_count(&self, listener: usize) -> usize {
        self.tcp_socks
            .iter()
            .flatten()
            .filter(|t| t.parent == Some(listener) && t.flags.inactive)
            .count()
    }

    /// Claim an established child, or park on the listener's connect
    /// wait.
    pub(crate) fn tcp_accept(&mut self, i: usize) -> Result<(usize, IpEndpoint)> {
        if self.tcp_ref(i)?.state != TcpState::Listen {
            return Err(Error::State);
        }
        let ready = self.tcp_socks.iter().position(|s| {
            s.as_ref().is_some_and(|t| {
                t.parent == Some(i) && t.flags.inactive && t.state.is_synchronized()
                    && t.state != TcpState::SynRecvd
            })
        });
        match ready {
            Some(child) => {
                let tcp = self.tcp_mut(child)?;
                tcp.flags.inactive = false;
                Ok((child, tcp.base.remote))
            }
            None => Err(Error::NeedWait),
        }
    }

    /// Application close. Graceful paths queue a FIN and park the
    /// caller until the peer finishes the conversation.
    pub(crate) fn tcp_close(&mut self, i: usize) -> Result<()> {
        let state = self.tcp_ref(i)?.state;
        match state {
            TcpState::Closed | TcpState::Listen | TcpState::SynSent => {
                self.tcp_free(i);
                Ok(())
            }
            TcpState::SynRecvd if self.tcp_ref(i)?.flags.inactive => {
                self.tcp_free(i);
                Ok(())
            }
            TcpState::Established | TcpState::SynRecvd => {
                let tcp = self.tcp_mut(i)?;
                tcp.state = TcpState::FinWait1;
                tcp.flags.fin_out = true;
                tcp.flags.delayed_free = true;
                self.tcp_out_event(i, output::OutEvent::Send)?;
                Err(Error::NeedWait)
            }
            TcpState::CloseWait => {
                let tcp = self.tcp_mut(i)?;
                tcp.state = TcpState::LastAck;
                tcp.flags.fin_out = true;
                tcp.flags.delayed_free = true;
                self.tcp_out_event(i, output::OutEvent::Send)?;
                Err(Error::NeedWait)
            }
            // A close is already in flight; wait with everyone else.
            _ => Err(Error::NeedWait),
        }
    }

    /// Append to the send ring and kick the output machine.
    pub(crate) fn tcp_send(&mut self, i: usize, data: &[u8]) -> Result<usize> {
        let tcp = self.tcp_mut(i)?;
        if let Some(err) = tcp.base.err.take() {
            return Err(err);
        }
        match tcp.state {
            TcpState::Established | TcpState::CloseWait => {}
            _ => return Err(Error::State),
        }
        if tcp.flags.fin_out {
            return Err(Error::Close);
        }
        let wrote = tcp.snd.buf.write_slice(data);
        if wrote == 0 {
            return Err(Error::NeedWait);
        }
        self.tcp_out_event(i, output::OutEvent::Send)?;
        Ok(wrote)
    }

    /// Drain the receive ring; empty means park, unless the peer has
    /// already said goodbye.
    pub(crate) fn tcp_recv(&mut self, i: usize, max: usize) -> Result<(Vec<u8>, IpEndpoint)> {
        let (data, remote, reopened) = {
            let tcp = self.tcp_mut(i)?;
            if let Some(err) = tcp.base.err.take() {
                return Err(err);
            }
            match tcp.state {
                TcpState::Established
                | TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::CloseWait => {}
                _ => return Err(Error::State),
            }
            if tcp.rcv.buf.is_empty() {
                if tcp.flags.fin_in {
                    // Orderly end of stream.
                    return Ok((Vec::new(), tcp.base.remote));
                }
                return Err(Error::NeedWait);
            }
            let was_closed = tcp.rcv_window() == 0;
            let mut data = vec![0; max.min(tcp.rcv.buf.count())];
            let took = tcp.rcv.buf.read_slice(&mut data);
            data.truncate(took);
            (data, tcp.base.remote, was_closed && tcp.rcv_window() > 0)
        };
        if reopened {
            // The advertised window just came back from zero; tell a
            // persisting peer.
            self.tcp_send_win_update(i)?;
        }
        Ok((data, remote))
    }

    pub(crate) fn tcp_set_keepalive(&mut self, i: usize, on: bool) -> Result<()> {
        let (state, idle) = {
            let tcp = self.tcp_mut(i)?;
            tcp.flags.keep_enable = on;
            tcp.conn.keep_retry = 0;
            (tcp.state, tcp.conn.keep_idle)
        };
        if on && state == TcpState::Established {
            self.timers.add(
                TimerEvent::TcpConn(i),
                Duration::from_secs(u64::from(idle)),
                None,
            );
        } else if !on {
            self.timers.remove(TimerEvent::TcpConn(i));
        }
        Ok(())
    }

    /// Any valid inbound segment restarts the keepalive clock.
    pub(crate) fn tcp_keepalive_restart(&mut self, i: usize) {
        let Ok(tcp) = self.tcp_mut(i) else { return };
        if !tcp.flags.keep_enable || tcp.state != TcpState::Established {
            return;
        }
        tcp.conn.keep_retry = 0;
        let idle = tcp.conn.keep_idle;
        self.timers.add(
            TimerEvent::TcpConn(i),
            Duration::from_secs(u64::from(idle)),
            None,
        );
    }

    /// Move into TIME-WAIT and arm the 2×MSL release timer.
    pub(crate) fn tcp_enter_time_wait(&mut self, i: usize) -> Result<()> {
        self.timers.remove(TimerEvent::TcpSnd(i));
        let tcp = self.tcp_mut(i)?;
        tcp.state = TcpState::TimeWait;
        tcp.snd.ostate = OutState::Idle;
        self.timers.add(
            TimerEvent::TcpConn(i),
            Duration::from_millis(2 * TCP_MSL_MS as u64),
            None,
        );
        Ok(())
    }

    /// Connection-timer expiry: TIME-WAIT release or a keepalive probe.
    pub(crate) fn tcp_conn_timeout(&mut self, i: usize) {
        let Ok(tcp) = self.tcp_ref(i) else { return };
        match tcp.state {
            TcpState::TimeWait => {
                net_debug!("tcp {}: 2msl elapsed, released", i);
                self.tcp_free(i);
            }
            TcpState::Established if tcp.flags.keep_enable => {
                let (retry, cnt, intvl) =
                    (tcp.conn.keep_retry, tcp.conn.keep_cnt, tcp.conn.keep_intvl);
                if retry >= cnt {
                    net_debug!("tcp {}: keepalive exhausted", i);
                    let _ = self.tcp_send_reset_for_sock(i);
                    let _ = self.tcp_abort(i, Error::Timeout);
                    return;
                }
                if let Err(err) = self.tcp_send_keepalive(i) {
                    net_debug!("tcp {}: keepalive probe failed: {}", i, err);
                }
                if let Ok(tcp) = self.tcp_mut(i) {
                    tcp.conn.keep_retry += 1;
                }
                self.timers.add(
                    TimerEvent::TcpConn(i),
                    Duration::from_secs(u64::from(intvl)),
                    None,
                );
            }
            _ => {}
        }
    }

    /// Locate the socket a segment belongs to: exact four-tuple first,
    /// then a listener on the destination port.
    pub(crate) fn tcp_find(&self, local: IpEndpoint, remote: IpEndpoint) -> Option<usize> {
        let exact = self.tcp_socks.iter().position(|s| {
            s.as_ref().is_some_and(|t| {
                t.state != TcpState::Listen
                    && t.base.local.port == local.port
                    && t.base.local.addr == local.addr
                    && t.base.remote == remote
            })
        });
        if exact.is_some() {
            return exact;
        }
        self.tcp_socks.iter().position(|s| {
            s.as_ref().is_some_and(|t| {
                t.state == TcpState::Listen
                    && t.base.local.port == local.port
                    && (t.base.local.addr.is_unspecified() || t.base.local.addr == local.addr)
            })
        })
    }
}
