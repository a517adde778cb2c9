//! The circular byte ring behind each TCP socket.
//!
//! The send ring holds `[snd.una, snd.una + count)`: bytes stay in place
//! until acknowledged, so retransmission re-reads them by offset. The
//! receive ring is keyed from `rcv.nxt`: in-order payload is appended at
//! the tail and the application consumes from the head, and its free
//! space is the advertised window.

use managed::ManagedSlice;

use crate::error::Error;
use crate::pktbuf::PktBuf;
use crate::Result;

pub struct TcpBuf {
    storage: ManagedSlice<'static, u8>,
    read_at: usize,
    length: usize,
}

impl core::fmt::Debug for TcpBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "TcpBuf {{ capacity: {}, count: {} }}",
            self.capacity(),
            self.length
        )
    }
}

impl TcpBuf {
    pub fn new(capacity: usize) -> TcpBuf {
        TcpBuf {
            storage: ManagedSlice::Owned(vec![0; capacity]),
            read_at: 0,
            length: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes currently held.
    pub fn count(&self) -> usize {
        self.length
    }

    /// Room left; for the receive ring this is the advertised window.
    pub fn free(&self) -> usize {
        self.capacity() - self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn clear(&mut self) {
        self.read_at = 0;
        self.length = 0;
    }

    fn index(&self, logical: usize) -> usize {
        (self.read_at + logical) % self.capacity()
    }

    /// Append as much of `data` as fits; returns the number taken.
    pub fn write_slice(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.free());
        for (i, &byte) in data[..take].iter().enumerate() {
            let at = self.index(self.length + i);
            self.storage[at] = byte;
        }
        self.length += take;
        take
    }

    /// Consume up to `dest.len()` bytes from the head.
    pub fn read_slice(&mut self, dest: &mut [u8]) -> usize {
        let take = dest.len().min(self.length);
        for slot in dest[..take].iter_mut() {
            *slot = self.storage[self.read_at];
            self.read_at = (self.read_at + 1) % self.capacity();
            self.length -= 1;
        }
        take
    }

    /// Copy `len` bytes starting `offset` into the held span onto
    /// `dest`'s cursor, without consuming them. The send path reads
    /// retransmissions this way.
    pub fn peek_into(&self, offset: usize, len: usize, dest: &mut PktBuf) -> Result<()> {
        if offset + len > self.length {
            return Err(Error::Size);
        }
        let mut chunk = [0u8; 64];
        let mut done = 0;
        while done < len {
            let step = (len - done).min(chunk.len());
            for (i, slot) in chunk[..step].iter_mut().enumerate() {
                *slot = self.storage[self.index(offset + done + i)];
            }
            dest.write(&chunk[..step])?;
            done += step;
        }
        Ok(())
    }

    /// Append `len` bytes from `src`'s cursor, bounded by free space;
    /// returns the number taken.
    pub fn write_from(&mut self, src: &mut PktBuf, len: usize) -> Result<usize> {
        let take = len.min(self.free()).min(src.remaining());
        let mut chunk = [0u8; 64];
        let mut done = 0;
        while done < take {
            let step = (take - done).min(chunk.len());
            src.read(&mut chunk[..step])?;
            let wrote = self.write_slice(&chunk[..step]);
            debug_assert_eq!(wrote, step);
            done += step;
        }
        Ok(take)
    }

    /// Drop up to `count` bytes from the head (acknowledged data);
    /// returns the number actually removed.
    pub fn remove(&mut self, count: usize) -> usize {
        let take = count.min(self.length);
        self.read_at = (self.read_at + take) % self.capacity();
        self.length -= take;
        take
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktbuf::PktPool;

    #[test]
    fn fill_wrap_and_drain() {
        let mut ring = TcpBuf::new(8);
        assert_eq!(ring.write_slice(b"abcdef"), 6);
        let mut out = [0u8; 4];
        assert_eq!(ring.read_slice(&mut out), 4);
        assert_eq!(&out, b"abcd");
        // Wraps across the physical end.
        assert_eq!(ring.write_slice(b"ghijkl"), 6);
        assert_eq!(ring.count(), 8);
        assert_eq!(ring.free(), 0);
        assert_eq!(ring.write_slice(b"x"), 0);
        let mut out = [0u8; 8];
        assert_eq!(ring.read_slice(&mut out), 8);
        assert_eq!(&out, b"efghijkl");
    }

    #[test]
    fn peek_does_not_consume() {
        let pool = PktPool::new(8);
        let mut ring = TcpBuf::new(200);
        let data: Vec<u8> = (0..150u8).collect();
        ring.write_slice(&data);
        // Force the span to wrap.
        ring.remove(100);
        ring.write_slice(&data[..100]);

        let mut buf = pool.alloc(120).unwrap();
        ring.peek_into(10, 120, &mut buf).unwrap();
        let mut expect: Vec<u8> = (110..150u8).collect();
        expect.extend(0..80u8);
        assert_eq!(buf.to_vec(), expect);
        assert_eq!(ring.count(), 150);
    }

    #[test]
    fn peek_past_end_fails() {
        let pool = PktPool::new(8);
        let mut ring = TcpBuf::new(16);
        ring.write_slice(b"hello");
        let mut buf = pool.alloc(10).unwrap();
        assert_eq!(ring.peek_into(2, 10, &mut buf).unwrap_err(), Error::Size);
    }

    #[test]
    fn write_from_respects_window() {
        let pool = PktPool::new(8);
        let mut src = pool.alloc(50).unwrap();
        src.write(&[7u8; 50]).unwrap();
        src.reset_acc();
        let mut ring = TcpBuf::new(32);
        let wrote = ring.write_from(&mut src, 50).unwrap();
        assert_eq!(wrote, 32);
        assert_eq!(ring.free(), 0);
        assert_eq!(src.remaining(), 18);
    }

    #[test]
    fn remove_frees_window() {
        let mut ring = TcpBuf::new(16);
        ring.write_slice(&[1; 16]);
        assert_eq!(ring.remove(20), 16);
        assert_eq!(ring.count(), 0);
        assert_eq!(ring.free(), 16);
    }
}
