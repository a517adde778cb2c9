//! Sockets and the request/reply contract user threads speak.
//!
//! Protocol code never blocks. An operation that cannot complete parks
//! the caller on one of the socket's three waits and returns
//! [`Error::NeedWait`]; the request layer turns that into a
//! [`Reply::NeedWait`] carrying the wait handle and a ticket, and the
//! calling thread sleeps outside the engine until a later event pulses
//! the wait.

pub mod raw;
pub mod tcp;
pub mod udp;

use std::sync::{Arc, Condvar, Mutex};

use crate::error::Error;
use crate::stack::Stack;
use crate::time::Duration;
use crate::wire::{IpEndpoint, IpProtocol};
use crate::Result;

/// Address family. Only IPv4 exists here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Inet,
}

/// Socket type, BSD-style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Dgram,
    Stream,
    Raw,
}

/// Handle to a socket in one of the engine's tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockId {
    Udp(usize),
    Raw(usize),
    Tcp(usize),
}

#[derive(Debug, Default)]
struct WaitState {
    pulses: u64,
    last: Option<core::result::Result<(), Error>>,
}

#[derive(Debug, Default)]
struct WaitInner {
    state: Mutex<WaitState>,
    cond: Condvar,
}

/// One waitable condition of a socket (connect, send, receive).
///
/// Wakes are pulses: the engine publishes a result and bumps a counter;
/// a waiter sleeps until the counter passes the ticket it took when it
/// was parked, so a wake can never be missed between parking and
/// sleeping.
#[derive(Debug, Clone, Default)]
pub struct SockWait {
    inner: Arc<WaitInner>,
}

impl SockWait {
    pub fn new() -> SockWait {
        SockWait::default()
    }

    /// The current pulse count; waits begun now sleep until it grows.
    pub fn ticket(&self) -> u64 {
        self.inner.state.lock().map(|s| s.pulses).unwrap_or(0)
    }

    /// Publish `result` to every current and future waiter of this pulse.
    pub fn wake(&self, result: core::result::Result<(), Error>) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.pulses += 1;
            state.last = Some(result);
            self.inner.cond.notify_all();
        }
    }

    /// Block until a pulse newer than `ticket` arrives, or `timeout`
    /// runs out.
    pub fn wait_after(&self, ticket: u64, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| std::time::Instant::now() + std::time::Duration::from(t));
        let mut state = self.inner.state.lock().map_err(|_| Error::Sys)?;
        loop {
            if state.pulses > ticket {
                return state.last.unwrap_or(Ok(()));
            }
            match deadline {
                None => {
                    state = self.inner.cond.wait(state).map_err(|_| Error::Sys)?;
                }
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    let (next, timed_out) = self
                        .inner
                        .cond
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| Error::Sys)?;
                    state = next;
                    if timed_out.timed_out() && state.pulses <= ticket {
                        return Err(Error::Timeout);
                    }
                }
            }
        }
    }

    /// The most recent pulse, if any. Single-threaded tests read this
    /// instead of blocking.
    pub fn last(&self) -> Option<core::result::Result<(), Error>> {
        self.inner.state.lock().ok().and_then(|s| s.last)
    }
}

/// State shared by every socket flavor.
#[derive(Debug)]
pub struct SockBase {
    pub family: Family,
    pub protocol: IpProtocol,
    pub local: IpEndpoint,
    pub remote: IpEndpoint,
    pub err: Option<Error>,
    pub rcv_tmo: Option<Duration>,
    pub snd_tmo: Option<Duration>,
    pub rcv_wait: SockWait,
    pub snd_wait: SockWait,
    pub conn_wait: SockWait,
}

impl SockBase {
    pub fn new(family: Family, protocol: IpProtocol) -> SockBase {
        SockBase {
            family,
            protocol,
            local: IpEndpoint::UNSPECIFIED,
            remote: IpEndpoint::UNSPECIFIED,
            err: None,
            rcv_tmo: None,
            snd_tmo: None,
            rcv_wait: SockWait::new(),
            snd_wait: SockWait::new(),
            conn_wait: SockWait::new(),
        }
    }

    /// Wake everything this socket could be waited on, with `err`.
    pub fn wake_all(&self, err: Error) {
        self.rcv_wait.wake(Err(err));
        self.snd_wait.wake(Err(err));
        self.conn_wait.wake(Err(err));
    }
}

/// A typed socket option, the flattened form of
/// `setsockopt(level, name, value)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOpt {
    /// `SOL_SOCKET` / `SO_RCVTIMEO`, milliseconds.
    RcvTimeout(Duration),
    /// `SOL_SOCKET` / `SO_SNDTIMEO`, milliseconds.
    SndTimeout(Duration),
    /// `SOL_SOCKET` / `SO_KEEPALIVE`.
    KeepAlive(bool),
    /// `SOL_TCP` / `TCP_KEEPIDLE`, seconds.
    KeepIdle(u32),
    /// `SOL_TCP` / `TCP_KEEPINTVL`, seconds.
    KeepIntvl(u32),
    /// `SOL_TCP` / `TCP_KEEPCNT`.
    KeepCnt(u32),
}

/// A request message posted to the dispatcher.
#[derive(Debug, Clone)]
pub enum Request {
    Create {
        family: Family,
        ty: SockType,
        protocol: IpProtocol,
    },
    Close(SockId),
    Destroy(SockId),
    Bind(SockId, IpEndpoint),
    Connect(SockId, IpEndpoint),
    Listen(SockId, usize),
    Accept(SockId),
    SendTo(SockId, Vec<u8>, IpEndpoint),
    RecvFrom(SockId, usize),
    Send(SockId, Vec<u8>),
    Recv(SockId, usize),
    SetOpt(SockId, SockOpt),
}

/// The dispatcher's answer.
#[derive(Debug)]
pub enum Reply {
    Created(SockId),
    Done,
    Sent(usize),
    Data(Vec<u8>, IpEndpoint),
    Accepted(SockId, IpEndpoint),
    /// The operation parked; retry after waiting on `wait` past `ticket`.
    NeedWait {
        wait: SockWait,
        ticket: u64,
        timeout: Option<Duration>,
    },
    Err(Error),
}

/// Which of a socket's waits a parked request sleeps on.
#[derive(Debug, Clone, Copy)]
enum WaitKind {
    Conn,
    Snd,
    Rcv,
}

impl Stack {
    /// Execute one request to completion (or to a park). This is the
    /// whole engine-side API surface.
    pub fn handle_request(&mut self, request: Request) -> Reply {
        match request {
            Request::Create {
                family,
                ty,
                protocol,
            } => match self.socket_create(family, ty, protocol) {
                Ok(id) => Reply::Created(id),
                Err(err) => Reply::Err(err),
            },
            Request::Close(id) => {
                let result = self.socket_close(id).map(|()| Reply::Done);
                self.finish(id, WaitKind::Conn, self.none_tmo(), result)
            }
            Request::Destroy(id) => match self.socket_destroy(id) {
                Ok(()) => Reply::Done,
                Err(err) => Reply::Err(err),
            },
            Request::Bind(id, ep) => match self.socket_bind(id, ep) {
                Ok(()) => Reply::Done,
                Err(err) => Reply::Err(err),
            },
            Request::Connect(id, ep) => {
                let result = self.socket_connect(id, ep).map(|()| Reply::Done);
                self.finish(id, WaitKind::Conn, self.none_tmo(), result)
            }
            Request::Listen(id, backlog) => match self.socket_listen(id, backlog) {
                Ok(()) => Reply::Done,
                Err(err) => Reply::Err(err),
            },
            Request::Accept(id) => {
                let result = self
                    .socket_accept(id)
                    .map(|(child, peer)| Reply::Accepted(child, peer));
                self.finish(id, WaitKind::Conn, self.none_tmo(), result)
            }
            Request::SendTo(id, data, dst) => {
                let tmo = self.snd_tmo_of(id);
                let result = self.socket_sendto(id, &data, dst).map(Reply::Sent);
                self.finish(id, WaitKind::Snd, tmo, result)
            }
            Request::RecvFrom(id, max) => {
                let tmo = self.rcv_tmo_of(id);
                let result = self
                    .socket_recvfrom(id, max)
                    .map(|(data, from)| Reply::Data(data, from));
                self.finish(id, WaitKind::Rcv, tmo, result)
            }
            Request::Send(id, data) => {
                let tmo = self.snd_tmo_of(id);
                let result = self.socket_send(id, &data).map(Reply::Sent);
                self.finish(id, WaitKind::Snd, tmo, result)
            }
            Request::Recv(id, max) => {
                let tmo = self.rcv_tmo_of(id);
                let result = self
                    .socket_recv(id, max)
                    .map(|(data, from)| Reply::Data(data, from));
                self.finish(id, WaitKind::Rcv, tmo, result)
            }
            Request::SetOpt(id, opt) => match self.socket_setopt(id, opt) {
                Ok(()) => Reply::Done,
                Err(err) => Reply::Err(err),
            },
        }
    }

    fn none_tmo(&self) -> Option<Duration> {
        None
    }

    fn snd_tmo_of(&self, id: SockId) -> Option<Duration> {
        self.base_of(id).ok().and_then(|b| b.snd_tmo)
    }

    fn rcv_tmo_of(&self, id: SockId) -> Option<Duration> {
        self.base_of(id).ok().and_then(|b| b.rcv_tmo)
    }

    /// Map `Err(NeedWait)` onto a `Reply::NeedWait` naming the right
    /// wait of `id`.
    fn finish(
        &self,
        id: SockId,
        kind: WaitKind,
        timeout: Option<Duration>,
        result: Result<Reply>,
    ) -> Reply {
        match result {
            Ok(reply) => reply,
            Err(Error::NeedWait) => {
                let Ok(base) = self.base_of(id) else {
                    return Reply::Err(Error::Param);
                };
                let wait = match kind {
                    WaitKind::Conn => base.conn_wait.clone(),
                    WaitKind::Snd => base.snd_wait.clone(),
                    WaitKind::Rcv => base.rcv_wait.clone(),
                };
                let ticket = wait.ticket();
                Reply::NeedWait {
                    wait,
                    ticket,
                    timeout,
                }
            }
            Err(err) => Reply::Err(err),
        }
    }

    pub(crate) fn base_of(&self, id: SockId) -> Result<&SockBase> {
        match id {
            SockId::Udp(i) => self
                .udp_socks
                .get(i)
                .and_then(|s| s.as_ref())
                .map(|s| &s.base)
                .ok_or(Error::Param),
            SockId::Raw(i) => self
                .raw_socks
                .get(i)
                .and_then(|s| s.as_ref())
                .map(|s| &s.base)
                .ok_or(Error::Param),
            SockId::Tcp(i) => self
                .tcp_socks
                .get(i)
                .and_then(|s| s.as_ref())
                .map(|s| &s.base)
                .ok_or(Error::Param),
        }
    }

    fn socket_create(
        &mut self,
        family: Family,
        ty: SockType,
        protocol: IpProtocol,
    ) -> Result<SockId> {
        match (family, ty) {
            (Family::Inet, SockType::Dgram) => self.udp_create(),
            (Family::Inet, SockType::Raw) => self.raw_create(protocol),
            (Family::Inet, SockType::Stream) => self.tcp_create(),
        }
    }

    fn socket_close(&mut self, id: SockId) -> Result<()> {
        match id {
            SockId::Udp(i) => {
                let sock = self.udp_socks.get_mut(i).ok_or(Error::Param)?;
                let sock = sock.take().ok_or(Error::Param)?;
                sock.base.wake_all(Error::Close);
                Ok(())
            }
            SockId::Raw(i) => {
                let sock = self.raw_socks.get_mut(i).ok_or(Error::Param)?;
                let sock = sock.take().ok_or(Error::Param)?;
                sock.base.wake_all(Error::Close);
                Ok(())
            }
            SockId::Tcp(i) => self.tcp_close(i),
        }
    }

    fn socket_destroy(&mut self, id: SockId) -> Result<()> {
        match id {
            SockId::Tcp(i) => {
                self.tcp_free(i);
                Ok(())
            }
            other => self.socket_close(other),
        }
    }

    fn socket_bind(&mut self, id: SockId, ep: IpEndpoint) -> Result<()> {
        match id {
            SockId::Udp(i) => self.udp_bind(i, ep),
            SockId::Raw(i) => {
                let sock = self.raw_mut(i)?;
                sock.base.local = ep;
                Ok(())
            }
            SockId::Tcp(i) => self.tcp_bind(i, ep),
        }
    }

    fn socket_connect(&mut self, id: SockId, ep: IpEndpoint) -> Result<()> {
        match id {
            SockId::Udp(i) => {
                let sock = self.udp_mut(i)?;
                sock.base.remote = ep;
                Ok(())
            }
            SockId::Raw(i) => {
                let sock = self.raw_mut(i)?;
                sock.base.remote = ep;
                Ok(())
            }
            SockId::Tcp(i) => self.tcp_connect(i, ep),
        }
    }

    fn socket_listen(&mut self, id: SockId, backlog: usize) -> Result<()> {
        match id {
            SockId::Tcp(i) => self.tcp_listen(i, backlog),
            _ => Err(Error::State),
        }
    }

    fn socket_accept(&mut self, id: SockId) -> Result<(SockId, IpEndpoint)> {
        match id {
            SockId::Tcp(i) => {
                let (child, peer) = self.tcp_accept(i)?;
                Ok((SockId::Tcp(child), peer))
            }
            _ => Err(Error::State),
        }
    }

    fn socket_sendto(&mut self, id: SockId, data: &[u8], dst: IpEndpoint) -> Result<usize> {
        match id {
            SockId::Udp(i) => self.udp_sendto(i, data, dst),
            SockId::Raw(i) => self.raw_sendto(i, data, dst.addr),
            SockId::Tcp(_) => Err(Error::Param),
        }
    }

    fn socket_recvfrom(&mut self, id: SockId, max: usize) -> Result<(Vec<u8>, IpEndpoint)> {
        match id {
            SockId::Udp(i) => self.udp_recvfrom(i, max),
            SockId::Raw(i) => self.raw_recvfrom(i, max),
            SockId::Tcp(i) => self.tcp_recv(i, max),
        }
    }

    fn socket_send(&mut self, id: SockId, data: &[u8]) -> Result<usize> {
        match id {
            SockId::Udp(i) => {
                let remote = self.udp_ref(i)?.base.remote;
                if remote.addr.is_unspecified() {
                    return Err(Error::Param);
                }
                self.udp_sendto(i, data, remote)
            }
            SockId::Raw(i) => {
                let remote = self.raw_ref(i)?.base.remote;
                if remote.addr.is_unspecified() {
                    return Err(Error::Param);
                }
                self.raw_sendto(i, data, remote.addr)
            }
            SockId::Tcp(i) => self.tcp_send(i, data),
        }
    }

    fn socket_recv(&mut self, id: SockId, max: usize) -> Result<(Vec<u8>, IpEndpoint)> {
        self.socket_recvfrom(id, max)
    }

    fn socket_setopt(&mut self, id: SockId, opt: SockOpt) -> Result<()> {
        match opt {
            SockOpt::RcvTimeout(tmo) => {
                self.base_of_mut(id)?.rcv_tmo = Some(tmo);
                Ok(())
            }
            SockOpt::SndTimeout(tmo) => {
                self.base_of_mut(id)?.snd_tmo = Some(tmo);
                Ok(())
            }
            SockOpt::KeepAlive(on) => match id {
                SockId::Tcp(i) => self.tcp_set_keepalive(i, on),
                _ => Err(Error::Param),
            },
            SockOpt::KeepIdle(secs) => match id {
                SockId::Tcp(i) => {
                    self.tcp_mut(i)?.conn.keep_idle = secs;
                    Ok(())
                }
                _ => Err(Error::Param),
            },
            SockOpt::KeepIntvl(secs) => match id {
                SockId::Tcp(i) => {
                    self.tcp_mut(i)?.conn.keep_intvl = secs;
                    Ok(())
                }
                _ => Err(Error::Param),
            },
            SockOpt::KeepCnt(count) => match id {
                SockId::Tcp(i) => {
                    self.tcp_mut(i)?.conn.keep_cnt = count;
                    Ok(())
                }
                _ => Err(Error::Param),
            },
        }
    }

    fn base_of_mut(&mut self, id: SockId) -> Result<&mut SockBase> {
        match id {
            SockId::Udp(i) => self.udp_mut(i).map(|s| &mut s.base),
            SockId::Raw(i) => self.raw_mut(i).map(|s| &mut s.base),
            SockId::Tcp(i) => self.tcp_mut(i).map(|s| &mut s.base),
        }
    }
}

/// Find the first vacant slot in a socket table.
pub(crate) fn vacant<T>(table: &[Option<T>]) -> Result<usize> {
    table
        .iter()
        .position(|slot| slot.is_none())
        .ok_or(Error::NoMem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_pulses_are_not_missed() {
        let wait = SockWait::new();
        let ticket = wait.ticket();
        wait.wake(Ok(()));
        // The pulse landed before we slept; wait_after returns at once.
        assert_eq!(wait.wait_after(ticket, None), Ok(()));
    }

    #[test]
    fn wait_timeout_elapses() {
        let wait = SockWait::new();
        let ticket = wait.ticket();
        let err = wait
            .wait_after(ticket, Some(Duration::from_millis(10)))
            .unwrap_err();
        assert_eq!(err, Error::Timeout);
    }

    #[test]
    fn wait_delivers_error() {
        let wait = SockWait::new();
        let ticket = wait.ticket();
        wait.wake(Err(Error::Reset));
        assert_eq!(wait.wait_after(ticket, None), Err(Error::Reset));
    }

    #[test]
    fn cross_thread_wake() {
        let wait = SockWait::new();
        let ticket = wait.ticket();
        let waker = wait.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            waker.wake(Ok(()));
        });
        assert_eq!(wait.wait_after(ticket, Some(Duration::from_secs(5))), Ok(()));
        handle.join().unwrap();
    }
}
