//! A fixed-capacity FIFO.
//!
//! Backs the per-interface input and output queues. Capacity is a const
//! parameter so queue storage lives inline in the owning structure;
//! overflow is an error, never a reallocation.

use core::fmt;

use heapless::Deque;

use crate::error::Error;

pub struct FixQueue<T, const N: usize> {
    items: Deque<T, N>,
}

impl<T, const N: usize> fmt::Debug for FixQueue<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixQueue {{ len: {}, cap: {} }}", self.items.len(), N)
    }
}

impl<T, const N: usize> FixQueue<T, N> {
    pub fn new() -> FixQueue<T, N> {
        FixQueue {
            items: Deque::new(),
        }
    }

    /// Append to the tail. A full queue refuses the element and hands it
    /// back so the caller can drop or recycle it.
    pub fn push(&mut self, value: T) -> Result<(), (Error, T)> {
        self.items.push_back(value).map_err(|v| (Error::Full, v))
    }

    /// Take from the head.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.is_full()
    }

    pub fn clear(&mut self) {
        while self.items.pop_front().is_some() {}
    }
}

impl<T, const N: usize> Default for FixQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_and_overflow() {
        let mut q: FixQueue<u32, 3> = FixQueue::new();
        assert!(q.is_empty());
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.push(3).unwrap();
        assert!(q.is_full());
        let (err, rejected) = q.push(4).unwrap_err();
        assert_eq!(err, Error::Full);
        assert_eq!(rejected, 4);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }
}
