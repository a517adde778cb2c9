//! Ordered software timers over relative deltas.
//!
//! The list keeps one entry per pending timeout, sorted by deadline, with
//! each entry storing only the time *after its predecessor*. Advancing the
//! clock touches the head entry alone until it expires, so a tick is O(1)
//! in the common case regardless of how many timers are armed.
//!
//! Expired timers surface as [`TimerEvent`] values; the engine dispatches
//! on the tag instead of through callbacks, which keeps the list free of
//! function pointers into protocol state.

use crate::time::Duration;

/// What to do when a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Walk the ARP cache, aging entries.
    ArpScan,
    /// Walk the reassembly contexts, aging them.
    FragScan,
    /// A TCP send-side timeout (retransmit or persist) for this socket.
    TcpSnd(usize),
    /// A TCP connection timeout (keepalive, TIME-WAIT, delayed free).
    TcpConn(usize),
}

#[derive(Debug)]
struct Entry {
    event: TimerEvent,
    /// Time after the previous entry expires.
    delta: Duration,
    /// Re-arm period, if periodic.
    reload: Option<Duration>,
}

/// The engine-wide timer list.
#[derive(Debug, Default)]
pub struct TimerList {
    entries: Vec<Entry>,
}

impl TimerList {
    pub fn new() -> TimerList {
        TimerList {
            entries: Vec::new(),
        }
    }

    /// Arm `event` to fire after `timeout`, re-arming every `reload` if
    /// given. An already-armed instance of the same event is replaced.
    pub fn add(&mut self, event: TimerEvent, timeout: Duration, reload: Option<Duration>) {
        self.remove(event);

        let mut acc = Duration::ZERO;
        let mut index = self.entries.len();
        for (i, entry) in self.entries.iter().enumerate() {
            if acc + entry.delta > timeout {
                index = i;
                break;
            }
            acc += entry.delta;
        }
        let delta = timeout - acc;
        if let Some(next) = self.entries.get_mut(index) {
            next.delta -= delta;
        }
        self.entries.insert(
            index,
            Entry {
                event,
                delta,
                reload,
            },
        );
    }

    /// Disarm `event` if armed.
    pub fn remove(&mut self, event: TimerEvent) {
        if let Some(i) = self.entries.iter().position(|e| e.event == event) {
            let removed = self.entries.remove(i);
            if let Some(next) = self.entries.get_mut(i) {
                next.delta += removed.delta;
            }
        }
    }

    /// Time remaining until `event` fires, if armed.
    pub fn remaining(&self, event: TimerEvent) -> Option<Duration> {
        let mut acc = Duration::ZERO;
        for entry in &self.entries {
            acc += entry.delta;
            if entry.event == event {
                return Some(acc);
            }
        }
        None
    }

    /// Time until the nearest timer fires.
    pub fn next_timeout(&self) -> Option<Duration> {
        self.entries.first().map(|e| e.delta)
    }

    /// Move the clock forward by `elapsed`, appending every event that
    /// fired to `expired` in deadline order. Periodic events re-arm with
    /// their reload period.
    pub fn advance(&mut self, elapsed: Duration, expired: &mut Vec<TimerEvent>) {
        let mut remain = elapsed;
        let mut reloads: Vec<(TimerEvent, Duration)> = Vec::new();
        loop {
            let Some(head) = self.entries.first_mut() else {
                break;
            };
            if head.delta > remain {
                head.delta -= remain;
                break;
            }
            remain -= head.delta;
            let fired = self.entries.remove(0);
            expired.push(fired.event);
            if let Some(period) = fired.reload {
                reloads.push((fired.event, period));
            }
        }
        for (event, period) in reloads {
            self.add(event, period, Some(period));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn fire(list: &mut TimerList, elapsed: u64) -> Vec<TimerEvent> {
        let mut out = Vec::new();
        list.advance(ms(elapsed), &mut out);
        out
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut list = TimerList::new();
        list.add(TimerEvent::TcpSnd(1), ms(300), None);
        list.add(TimerEvent::TcpSnd(2), ms(100), None);
        list.add(TimerEvent::TcpSnd(3), ms(200), None);
        assert_eq!(list.next_timeout(), Some(ms(100)));
        assert_eq!(
            fire(&mut list, 250),
            vec![TimerEvent::TcpSnd(2), TimerEvent::TcpSnd(3)]
        );
        assert_eq!(list.remaining(TimerEvent::TcpSnd(1)), Some(ms(50)));
        assert_eq!(fire(&mut list, 50), vec![TimerEvent::TcpSnd(1)]);
        assert!(list.next_timeout().is_none());
    }

    #[test]
    fn remove_keeps_successor_deadline() {
        let mut list = TimerList::new();
        list.add(TimerEvent::TcpSnd(1), ms(100), None);
        list.add(TimerEvent::TcpSnd(2), ms(250), None);
        list.remove(TimerEvent::TcpSnd(1));
        assert_eq!(list.remaining(TimerEvent::TcpSnd(2)), Some(ms(250)));
    }

    #[test]
    fn re_add_replaces() {
        let mut list = TimerList::new();
        list.add(TimerEvent::TcpSnd(1), ms(100), None);
        list.add(TimerEvent::TcpSnd(1), ms(500), None);
        assert_eq!(fire(&mut list, 100), Vec::<TimerEvent>::new());
        assert_eq!(list.remaining(TimerEvent::TcpSnd(1)), Some(ms(400)));
    }

    #[test]
    fn periodic_reload() {
        let mut list = TimerList::new();
        list.add(TimerEvent::ArpScan, ms(1000), Some(ms(1000)));
        assert_eq!(fire(&mut list, 1000), vec![TimerEvent::ArpScan]);
        assert_eq!(list.remaining(TimerEvent::ArpScan), Some(ms(1000)));
        assert_eq!(fire(&mut list, 1000), vec![TimerEvent::ArpScan]);
    }

    #[test]
    fn zero_elapsed_is_harmless() {
        let mut list = TimerList::new();
        list.add(TimerEvent::FragScan, ms(10), None);
        assert_eq!(fire(&mut list, 0), Vec::<TimerEvent>::new());
        assert_eq!(list.remaining(TimerEvent::FragScan), Some(ms(10)));
    }
}
