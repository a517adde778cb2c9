//! The work queue and the dispatcher thread.
//!
//! All work reaches the engine as [`Msg`] values on one bounded queue:
//! frames posted by drivers, API calls posted by user threads, and a
//! shutdown note. The dispatcher owns the [`Stack`], pops messages, and
//! between messages polls the engine so timers fire on schedule. Each
//! message runs to completion; an API call that cannot finish comes
//! back as [`Reply::NeedWait`] and the *calling* thread sleeps, never
//! the dispatcher.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::config::WORKQ_SIZE;
use crate::error::Error;
use crate::iface::NetifId;
use crate::pktbuf::PktBuf;
use crate::socket::{Reply, Request};
use crate::stack::Stack;
use crate::time::{Duration, Instant};
use crate::Result;

/// One unit of work for the dispatcher.
pub enum Msg {
    /// A driver received a frame on `netif`.
    Rx { netif: NetifId, frame: PktBuf },
    /// A user thread wants a socket operation performed.
    Call { request: Request, reply: ReplySlot },
    /// Stop the dispatcher.
    Shutdown,
}

/// Where the dispatcher leaves the answer to a [`Msg::Call`].
#[derive(Clone, Default)]
pub struct ReplySlot {
    inner: Arc<(Mutex<Option<Reply>>, Condvar)>,
}

impl ReplySlot {
    pub fn new() -> ReplySlot {
        ReplySlot::default()
    }

    pub fn set(&self, reply: Reply) {
        let (lock, cond) = &*self.inner;
        if let Ok(mut slot) = lock.lock() {
            *slot = Some(reply);
            cond.notify_all();
        }
    }

    pub fn take_blocking(&self) -> Result<Reply> {
        let (lock, cond) = &*self.inner;
        let mut slot = lock.lock().map_err(|_| Error::Sys)?;
        loop {
            if let Some(reply) = slot.take() {
                return Ok(reply);
            }
            slot = cond.wait(slot).map_err(|_| Error::Sys)?;
        }
    }
}

/// The bounded multi-producer queue feeding the dispatcher.
pub struct WorkQueue {
    items: Mutex<VecDeque<Msg>>,
    avail: Condvar,
}

impl WorkQueue {
    pub fn new() -> WorkQueue {
        WorkQueue {
            items: Mutex::new(VecDeque::new()),
            avail: Condvar::new(),
        }
    }

    /// Append a message; a full queue refuses it (drivers drop the
    /// frame, API callers see a transient failure).
    pub fn post(&self, msg: Msg) -> Result<()> {
        let mut items = self.items.lock().map_err(|_| Error::Sys)?;
        if items.len() >= WORKQ_SIZE {
            return Err(Error::Full);
        }
        items.push_back(msg);
        self.avail.notify_one();
        Ok(())
    }

    /// Wait up to `timeout` for the next message.
    pub fn pop(&self, timeout: Duration) -> Option<Msg> {
        let mut items = self.items.lock().ok()?;
        loop {
            if let Some(msg) = items.pop_front() {
                return Some(msg);
            }
            let (next, result) = self
                .avail
                .wait_timeout(items, std::time::Duration::from(timeout))
                .ok()?;
            items = next;
            if result.timed_out() {
                return items.pop_front();
            }
        }
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        WorkQueue::new()
    }
}

/// Longest the dispatcher sleeps when no timer is due sooner.
const IDLE_TICK: Duration = Duration::from_millis(50);

/// Owns the engine thread.
pub struct Dispatcher {
    queue: Arc<WorkQueue>,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Move `stack` onto its own thread and start serving the queue.
    pub fn spawn(mut stack: Stack) -> Dispatcher {
        let queue = Arc::new(WorkQueue::new());
        let served = queue.clone();
        let thread = std::thread::spawn(move || {
            stack.poll(Instant::now());
            loop {
                let wait = stack.poll_delay().unwrap_or(IDLE_TICK).min(IDLE_TICK);
                let msg = served.pop(wait);
                match msg {
                    Some(Msg::Shutdown) => break,
                    Some(Msg::Rx { netif, frame }) => {
                        if let Err(err) = stack.netif_put_in(netif, frame) {
                            net_debug!("dispatcher: rx frame dropped: {}", err);
                        }
                    }
                    Some(Msg::Call { request, reply }) => {
                        reply.set(stack.handle_request(request));
                    }
                    None => {}
                }
                stack.poll(Instant::now());
            }
        });
        Dispatcher {
            queue,
            thread: Some(thread),
        }
    }

    /// A cloneable front door for user threads.
    pub fn handle(&self) -> NetHandle {
        NetHandle {
            queue: self.queue.clone(),
        }
    }

    pub fn shutdown(mut self) {
        let _ = self.queue.post(Msg::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = self.queue.post(Msg::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// What user threads hold: post a request, sleep until the engine has
/// an answer, park-and-retry when told to wait.
#[derive(Clone)]
pub struct NetHandle {
    queue: Arc<WorkQueue>,
}

impl NetHandle {
    fn call_once(&self, request: Request) -> Result<Reply> {
        let reply = ReplySlot::new();
        self.queue.post(Msg::Call {
            request,
            reply: reply.clone(),
        })?;
        reply.take_blocking()
    }

    /// Run `request` to completion, sleeping through `NeedWait` rounds.
    ///
    /// A wait that ends in `Timeout` surfaces as such; any other wake
    /// (data arrived, connection settled, peer went away) retries the
    /// request so the engine gives the definitive answer.
    pub fn call(&self, request: Request) -> Result<Reply> {
        loop {
            match self.call_once(request.clone())? {
                Reply::NeedWait {
                    wait,
                    ticket,
                    timeout,
                } => match wait.wait_after(ticket, timeout) {
                    Err(Error::Timeout) => return Err(Error::Timeout),
                    _ => continue,
                },
                Reply::Err(err) => return Err(err),
                reply => return Ok(reply),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktbuf::PktPool;
    use crate::socket::{Family, Reply, SockType};
    use crate::wire::{IpEndpoint, IpProtocol, Ipv4Address};

    fn spawn_stack() -> Dispatcher {
        let _ = env_logger::builder().is_test(true).try_init();
        let stack = Stack::new(PktPool::new(64)).unwrap();
        Dispatcher::spawn(stack)
    }

    #[test]
    fn workqueue_bounds_and_orders() {
        let q = WorkQueue::new();
        q.post(Msg::Shutdown).unwrap();
        assert!(matches!(q.pop(Duration::from_millis(1)), Some(Msg::Shutdown)));
        assert!(q.pop(Duration::from_millis(1)).is_none());
    }

    /// Loopback datagram through the real dispatcher thread, blocking
    /// API and all.
    #[test]
    fn udp_over_loopback_end_to_end() {
        let dispatcher = spawn_stack();
        let net = dispatcher.handle();

        let local = Ipv4Address::new(127, 0, 0, 1);
        let server = match net
            .call(Request::Create {
                family: Family::Inet,
                ty: SockType::Dgram,
                protocol: IpProtocol::Udp,
            })
            .unwrap()
        {
            Reply::Created(id) => id,
            other => panic!("unexpected reply {other:?}"),
        };
        net.call(Request::Bind(server, IpEndpoint::new(local, 7)))
            .unwrap();

        let client = match net
            .call(Request::Create {
                family: Family::Inet,
                ty: SockType::Dgram,
                protocol: IpProtocol::Udp,
            })
            .unwrap()
        {
            Reply::Created(id) => id,
            other => panic!("unexpected reply {other:?}"),
        };
        let sent = net
            .call(Request::SendTo(
                client,
                b"over the loop".to_vec(),
                IpEndpoint::new(local, 7),
            ))
            .unwrap();
        assert!(matches!(sent, Reply::Sent(13)));

        match net.call(Request::RecvFrom(server, 64)).unwrap() {
            Reply::Data(data, from) => {
                assert_eq!(data, b"over the loop");
                assert_eq!(from.addr, local);
            }
            other => panic!("unexpected reply {other:?}"),
        }

        net.call(Request::Close(client)).unwrap();
        net.call(Request::Close(server)).unwrap();
        dispatcher.shutdown();
    }

    /// A receive with SO_RCVTIMEO times out instead of hanging.
    #[test]
    fn recv_timeout_elapses() {
        let dispatcher = spawn_stack();
        let net = dispatcher.handle();

        let sock = match net
            .call(Request::Create {
                family: Family::Inet,
                ty: SockType::Dgram,
                protocol: IpProtocol::Udp,
            })
            .unwrap()
        {
            Reply::Created(id) => id,
            other => panic!("unexpected reply {other:?}"),
        };
        net.call(Request::Bind(
            sock,
            IpEndpoint::new(Ipv4Address::new(127, 0, 0, 1), 9),
        ))
        .unwrap();
        net.call(Request::SetOpt(
            sock,
            crate::socket::SockOpt::RcvTimeout(Duration::from_millis(30)),
        ))
        .unwrap();

        let started = std::time::Instant::now();
        let err = net.call(Request::RecvFrom(sock, 64)).unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert!(started.elapsed() >= std::time::Duration::from_millis(25));
        dispatcher.shutdown();
    }
}
