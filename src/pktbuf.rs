//! Chained packet buffers over a shared block pool.
//!
//! A [`PktBuf`] is an ordered run of fixed-size blocks. Each block owns a
//! payload array and a `data`/`size` pair delimiting its live bytes, so a
//! buffer can grow a header into the reserved space in front of its first
//! block, or a payload into the space behind its last, without copying.
//! Blocks come from a bounded [`PktPool`] shared by drivers and protocol
//! code, and go back to it when the buffer is dropped.
//!
//! Buffers are uniquely owned: they move between queues, sockets and the
//! egress path, and ownership transfer replaces the reference counting a
//! C implementation would need. TCP rebuilds retransmitted segments from
//! its send ring instead of holding on to emitted frames.
//!
//! Every structural operation (`add_header`, `remove_header`, `resize`,
//! `join`, `set_cont`) resets the read/write cursor; callers re-seek
//! before the next access.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::config::{PKTBUF_BLK_CNT, PKTBUF_BLK_SIZE};
use crate::error::Error;
use crate::Result;

/// One pool block. `data..data + size` is the live range inside `payload`;
/// the space before is head room, the space after tail room.
struct Block {
    payload: Box<[u8]>,
    data: usize,
    size: usize,
}

impl Block {
    fn bytes(&self) -> &[u8] {
        &self.payload[self.data..self.data + self.size]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.payload[self.data..self.data + self.size]
    }

    fn head_room(&self) -> usize {
        self.data
    }

    fn tail_room(&self) -> usize {
        PKTBUF_BLK_SIZE - self.data - self.size
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block {{ data: {}, size: {} }}", self.data, self.size)
    }
}

/// Bounded source of payload blocks, shared between the dispatcher and
/// driver threads. Allocation and release are the only locked operations
/// in the crate besides the work queue.
#[derive(Clone)]
pub struct PktPool {
    free: Arc<Mutex<Vec<Box<[u8]>>>>,
}

impl PktPool {
    /// Create a pool holding `blocks` blocks.
    pub fn new(blocks: usize) -> PktPool {
        let free = (0..blocks)
            .map(|_| vec![0u8; PKTBUF_BLK_SIZE].into_boxed_slice())
            .collect();
        PktPool {
            free: Arc::new(Mutex::new(free)),
        }
    }

    fn take_block(&self) -> Result<Box<[u8]>> {
        let mut free = self.free.lock().map_err(|_| Error::Sys)?;
        free.pop().ok_or(Error::NoMem)
    }

    fn release(&self, payload: Box<[u8]>) {
        if let Ok(mut free) = self.free.lock() {
            free.push(payload);
        }
    }

    /// Blocks currently available.
    pub fn free_blocks(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }

    /// Allocate a buffer with `size` live bytes.
    ///
    /// Blocks are filled front-to-back, so any remainder becomes tail
    /// room in the last block; header room is claimed later by
    /// [`PktBuf::add_header`].
    pub fn alloc(&self, size: usize) -> Result<PktBuf> {
        let mut buf = PktBuf {
            blocks: VecDeque::new(),
            total: 0,
            pos: Pos::default(),
            pool: self.clone(),
        };
        if size > 0 {
            let blocks = self.alloc_block_list(size, false)?;
            buf.append_blocks(blocks, size);
        }
        Ok(buf)
    }

    /// Allocate a run of blocks covering `size` bytes.
    ///
    /// Forward runs put each block's bytes at the payload start (tail
    /// remainder last); `front` runs put them at the payload end, so the
    /// first block of the run carries the remainder and keeps head room
    /// in front of it.
    fn alloc_block_list(&self, size: usize, front: bool) -> Result<VecDeque<Block>> {
        let mut list: VecDeque<Block> = VecDeque::new();
        let mut remain = size;
        while remain > 0 {
            let payload = match self.take_block() {
                Ok(p) => p,
                Err(err) => {
                    for blk in list {
                        self.release(blk.payload);
                    }
                    net_debug!("pktbuf: pool exhausted allocating {} bytes", size);
                    return Err(err);
                }
            };
            let curr = remain.min(PKTBUF_BLK_SIZE);
            let blk = Block {
                payload,
                data: if front { PKTBUF_BLK_SIZE - curr } else { 0 },
                size: curr,
            };
            if front {
                list.push_front(blk);
            } else {
                list.push_back(blk);
            }
            remain -= curr;
        }
        Ok(list)
    }
}

impl fmt::Debug for PktPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PktPool {{ free: {} }}", self.free_blocks())
    }
}

impl Default for PktPool {
    fn default() -> Self {
        PktPool::new(PKTBUF_BLK_CNT)
    }
}

/// Read/write cursor: current block index, offset into that block's live
/// bytes, and the global byte offset.
#[derive(Debug, Default, Clone, Copy)]
struct Pos {
    blk: usize,
    blk_off: usize,
    offset: usize,
}

/// A chained variable-length packet buffer.
pub struct PktBuf {
    blocks: VecDeque<Block>,
    total: usize,
    pos: Pos,
    pool: PktPool,
}

impl PktBuf {
    /// Total live bytes across all blocks.
    pub fn total_len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Handle to the pool this buffer draws from.
    pub fn pool(&self) -> &PktPool {
        &self.pool
    }

    /// The live bytes of the first block. Headers made contiguous with
    /// [`set_cont`](Self::set_cont) are parsed out of this slice.
    pub fn head(&self) -> &[u8] {
        self.blocks.front().map(Block::bytes).unwrap_or(&[])
    }

    pub fn head_mut(&mut self) -> &mut [u8] {
        match self.blocks.front_mut() {
            Some(blk) => blk.bytes_mut(),
            None => &mut [],
        }
    }

    /// Copy the whole buffer out, without disturbing the cursor. Used by
    /// drivers putting a frame on the wire and by tests.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for blk in &self.blocks {
            out.extend_from_slice(blk.bytes());
        }
        out
    }

    fn append_blocks(&mut self, blocks: VecDeque<Block>, size: usize) {
        self.blocks.extend(blocks);
        self.total += size;
    }

    /// Grow the front of the buffer by `size` bytes of header space.
    ///
    /// Head room in the first block is consumed first; any shortfall is
    /// covered by freshly allocated blocks prepended to the chain. With
    /// `cont` the new header must land in one contiguous block, which
    /// bounds it to the block size.
    pub fn add_header(&mut self, size: usize, cont: bool) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        self.reset_acc();

        let resv = self.blocks.front().map(Block::head_room).unwrap_or(0);
        if size <= resv {
            let blk = self.blocks.front_mut().ok_or(Error::Param)?;
            blk.data -= size;
            blk.size += size;
            self.total += size;
            return Ok(());
        }

        if cont {
            if size > PKTBUF_BLK_SIZE {
                net_debug!("pktbuf: contiguous header of {} exceeds block", size);
                return Err(Error::Size);
            }
            let list = self.pool.alloc_block_list(size, true)?;
            for blk in list.into_iter().rev() {
                self.blocks.push_front(blk);
            }
            self.total += size;
        } else {
            let list = self.pool.alloc_block_list(size - resv, true)?;
            if resv > 0 {
                let blk = self.blocks.front_mut().ok_or(Error::Param)?;
                blk.data = 0;
                blk.size += resv;
            }
            for blk in list.into_iter().rev() {
                self.blocks.push_front(blk);
            }
            self.total += size;
        }
        Ok(())
    }

    /// Strip `size` bytes from the front, releasing whole blocks as they
    /// empty out.
    pub fn remove_header(&mut self, size: usize) -> Result<()> {
        if size > self.total {
            return Err(Error::Size);
        }
        self.reset_acc();

        let mut remain = size;
        while remain > 0 {
            let blk = self.blocks.front_mut().ok_or(Error::Size)?;
            if remain < blk.size {
                blk.data += remain;
                blk.size -= remain;
                self.total -= remain;
                break;
            }
            remain -= blk.size;
            self.total -= blk.size;
            let blk = self.blocks.pop_front().ok_or(Error::Size)?;
            self.pool.release(blk.payload);
        }
        Ok(())
    }

    /// Change the total length. Growth extends the tail block into its
    /// tail room and then appends blocks; shrinkage trims the tail.
    pub fn resize(&mut self, to_size: usize) -> Result<()> {
        use core::cmp::Ordering::*;
        self.reset_acc();
        match to_size.cmp(&self.total) {
            Equal => Ok(()),
            Greater => {
                if self.blocks.is_empty() {
                    let list = self.pool.alloc_block_list(to_size, false)?;
                    self.append_blocks(list, to_size);
                    return Ok(());
                }
                let inc = to_size - self.total;
                let room = self.blocks.back().map(Block::tail_room).unwrap_or(0);
                if room >= inc {
                    let blk = self.blocks.back_mut().ok_or(Error::Param)?;
                    blk.size += inc;
                    self.total += inc;
                } else {
                    let list = self.pool.alloc_block_list(inc - room, false)?;
                    let blk = self.blocks.back_mut().ok_or(Error::Param)?;
                    blk.size += room;
                    self.total += room;
                    self.append_blocks(list, inc - room);
                }
                Ok(())
            }
            Less => {
                // Locate the last block to keep and how much of it.
                let mut kept_before = 0;
                let mut keep_idx = 0;
                for (idx, blk) in self.blocks.iter().enumerate() {
                    if kept_before + blk.size >= to_size {
                        keep_idx = idx;
                        break;
                    }
                    kept_before += blk.size;
                }
                while self.blocks.len() > keep_idx + 1 {
                    if let Some(blk) = self.blocks.pop_back() {
                        self.pool.release(blk.payload);
                    }
                }
                if let Some(blk) = self.blocks.back_mut() {
                    blk.size = to_size - kept_before;
                }
                self.total = to_size;
                Ok(())
            }
        }
    }

    /// Transfer every block of `src` onto the tail of `self`. `src` is
    /// consumed; its (now empty) shell frees nothing.
    pub fn join(&mut self, mut src: PktBuf) -> Result<()> {
        self.reset_acc();
        let moved = src.total;
        let blocks = core::mem::take(&mut src.blocks);
        src.total = 0;
        self.append_blocks(blocks, moved);
        Ok(())
    }

    /// Make the first `size` bytes contiguous in the first block, pulling
    /// bytes forward from later blocks as needed.
    pub fn set_cont(&mut self, size: usize) -> Result<()> {
        if size > self.total {
            return Err(Error::Size);
        }
        if size > PKTBUF_BLK_SIZE {
            net_debug!("pktbuf: set_cont {} exceeds block size", size);
            return Err(Error::Size);
        }
        self.reset_acc();

        if self.blocks.front().map(|b| b.size).unwrap_or(0) >= size {
            return Ok(());
        }

        // Shift the first block's bytes down to the payload base to open
        // tail room, then drain from the following blocks.
        {
            let first = self.blocks.front_mut().ok_or(Error::Size)?;
            first.payload.copy_within(first.data..first.data + first.size, 0);
            first.data = 0;
        }
        while self.blocks[0].size < size {
            let need = size - self.blocks[0].size;
            let (taken, emptied) = {
                let next = self.blocks.get_mut(1).ok_or(Error::Size)?;
                let take = need.min(next.size);
                let from = next.data;
                let tmp: Vec<u8> = next.payload[from..from + take].to_vec();
                next.data += take;
                next.size -= take;
                (tmp, next.size == 0)
            };
            let first = &mut self.blocks[0];
            let at = first.size;
            first.payload[at..at + taken.len()].copy_from_slice(&taken);
            first.size += taken.len();
            if emptied {
                if let Some(blk) = self.blocks.remove(1) {
                    self.pool.release(blk.payload);
                }
            }
        }
        Ok(())
    }

    /// Rewind the cursor to the start of the buffer.
    pub fn reset_acc(&mut self) {
        self.pos = Pos::default();
    }

    /// Place the cursor at `offset` bytes from the start.
    pub fn seek(&mut self, offset: usize) -> Result<()> {
        if offset > self.total {
            return Err(Error::Size);
        }
        let mut pos = Pos {
            blk: 0,
            blk_off: 0,
            offset,
        };
        let mut remain = offset;
        for (idx, blk) in self.blocks.iter().enumerate() {
            if remain < blk.size {
                pos.blk = idx;
                pos.blk_off = remain;
                break;
            }
            remain -= blk.size;
            pos.blk = idx + 1;
        }
        self.pos = pos;
        Ok(())
    }

    /// Bytes between the cursor and the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.total - self.pos.offset
    }

    fn advance(&mut self, n: usize) {
        let mut remain = n;
        while remain > 0 {
            let in_blk = self.blocks[self.pos.blk].size - self.pos.blk_off;
            let step = remain.min(in_blk);
            self.pos.blk_off += step;
            self.pos.offset += step;
            remain -= step;
            if self.pos.blk_off == self.blocks[self.pos.blk].size {
                self.pos.blk += 1;
                self.pos.blk_off = 0;
            }
        }
    }

    /// Copy `dest.len()` bytes out at the cursor, advancing it.
    pub fn read(&mut self, dest: &mut [u8]) -> Result<()> {
        if dest.len() > self.remaining() {
            return Err(Error::Size);
        }
        let mut done = 0;
        while done < dest.len() {
            let blk = &self.blocks[self.pos.blk];
            let chunk = &blk.bytes()[self.pos.blk_off..];
            let step = chunk.len().min(dest.len() - done);
            dest[done..done + step].copy_from_slice(&chunk[..step]);
            done += step;
            self.advance(step);
        }
        Ok(())
    }

    /// Copy `src` in at the cursor, advancing it.
    pub fn write(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.remaining() {
            return Err(Error::Size);
        }
        let mut done = 0;
        while done < src.len() {
            let pos = self.pos;
            let blk = &mut self.blocks[pos.blk];
            let chunk = &mut blk.bytes_mut()[pos.blk_off..];
            let step = chunk.len().min(src.len() - done);
            chunk[..step].copy_from_slice(&src[done..done + step]);
            done += step;
            self.advance(step);
        }
        Ok(())
    }

    /// Write `n` copies of `value` at the cursor, advancing it.
    pub fn fill(&mut self, value: u8, n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(Error::Size);
        }
        let mut done = 0;
        while done < n {
            let pos = self.pos;
            let blk = &mut self.blocks[pos.blk];
            let chunk = &mut blk.bytes_mut()[pos.blk_off..];
            let step = chunk.len().min(n - done);
            chunk[..step].fill(value);
            done += step;
            self.advance(step);
        }
        Ok(())
    }

    /// Copy `n` bytes from `src`'s cursor to `self`'s cursor, advancing
    /// both.
    pub fn copy_from(&mut self, src: &mut PktBuf, n: usize) -> Result<()> {
        if n > self.remaining() || n > src.remaining() {
            return Err(Error::Size);
        }
        let mut tmp = [0u8; PKTBUF_BLK_SIZE];
        let mut remain = n;
        while remain > 0 {
            let step = remain.min(tmp.len());
            src.read(&mut tmp[..step])?;
            self.write(&tmp[..step])?;
            remain -= step;
        }
        Ok(())
    }

    /// RFC 1071 ones-complement sum of `len` bytes starting at the
    /// cursor, advancing it.
    ///
    /// `preload` threads in a partial sum (a transport pseudo-header);
    /// `complement` selects whether the final fold is inverted. Byte
    /// parity is tracked relative to the start of the summed range, so
    /// the result is independent of how the bytes are split into blocks.
    pub fn checksum16(&mut self, len: usize, preload: u32, complement: bool) -> Result<u16> {
        if len > self.remaining() {
            return Err(Error::Size);
        }
        let mut sum = preload;
        let mut index = 0;
        let mut remain = len;
        while remain > 0 {
            let blk = &self.blocks[self.pos.blk];
            let chunk = &blk.bytes()[self.pos.blk_off..];
            let step = chunk.len().min(remain);
            for &byte in &chunk[..step] {
                if index % 2 == 0 {
                    sum += u32::from(byte) << 8;
                } else {
                    sum += u32::from(byte);
                }
                index += 1;
            }
            remain -= step;
            self.advance(step);
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        let folded = sum as u16;
        Ok(if complement { !folded } else { folded })
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let mut sum = 0;
        for blk in &self.blocks {
            assert!(blk.data + blk.size <= PKTBUF_BLK_SIZE);
            sum += blk.size;
        }
        assert_eq!(sum, self.total);
    }
}

impl fmt::Debug for PktBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PktBuf {{ total: {}, blocks: {:?} }}",
            self.total, self.blocks
        )
    }
}

impl Drop for PktBuf {
    fn drop(&mut self) {
        for blk in self.blocks.drain(..) {
            self.pool.release(blk.payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> PktPool {
        PktPool::new(64)
    }

    fn patterned(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn alloc_layout() {
        let pool = pool();
        let buf = pool.alloc(300).unwrap();
        assert_eq!(buf.total_len(), 300);
        buf.check_invariants();
        // Forward allocation leaves the remainder as the tail block.
        assert_eq!(buf.blocks.len(), 3);
        assert_eq!(buf.blocks[0].size, PKTBUF_BLK_SIZE);
        assert_eq!(buf.blocks[2].size, 300 - 2 * PKTBUF_BLK_SIZE);
        assert_eq!(buf.blocks[2].data, 0);
    }

    #[test]
    fn pool_exhaustion() {
        let pool = PktPool::new(2);
        assert_eq!(
            pool.alloc(3 * PKTBUF_BLK_SIZE).unwrap_err(),
            Error::NoMem
        );
        // The failed allocation returned its partial chain.
        assert_eq!(pool.free_blocks(), 2);
    }

    #[test]
    fn drop_returns_blocks() {
        let pool = PktPool::new(4);
        {
            let _buf = pool.alloc(3 * PKTBUF_BLK_SIZE).unwrap();
            assert_eq!(pool.free_blocks(), 1);
        }
        assert_eq!(pool.free_blocks(), 4);
    }

    #[test]
    fn header_roundtrip_restores_total() {
        let pool = pool();
        for &(payload, hdr, cont) in
            &[(100, 14, false), (100, 20, true), (300, 60, false), (0, 20, true)]
        {
            let mut buf = pool.alloc(payload).unwrap();
            buf.add_header(hdr, cont).unwrap();
            assert_eq!(buf.total_len(), payload + hdr);
            buf.check_invariants();
            buf.remove_header(hdr).unwrap();
            assert_eq!(buf.total_len(), payload);
            buf.check_invariants();
        }
    }

    #[test]
    fn contiguous_header_too_large() {
        let pool = pool();
        let mut buf = pool.alloc(10).unwrap();
        assert_eq!(
            buf.add_header(PKTBUF_BLK_SIZE + 1, true).unwrap_err(),
            Error::Size
        );
    }

    #[test]
    fn header_reuses_head_room() {
        let pool = pool();
        let mut buf = pool.alloc(100).unwrap();
        buf.add_header(40, true).unwrap();
        let blocks_before = buf.blocks.len();
        buf.remove_header(8).unwrap();
        // The freed head room satisfies the next push without allocation.
        buf.add_header(8, false).unwrap();
        assert_eq!(buf.blocks.len(), blocks_before);
        buf.check_invariants();
    }

    #[test]
    fn resize_grow_and_shrink() {
        let pool = pool();
        let mut buf = pool.alloc(100).unwrap();
        buf.resize(400).unwrap();
        assert_eq!(buf.total_len(), 400);
        buf.check_invariants();
        buf.resize(30).unwrap();
        assert_eq!(buf.total_len(), 30);
        assert_eq!(buf.blocks.len(), 1);
        buf.check_invariants();
        buf.resize(0).unwrap();
        assert_eq!(buf.total_len(), 0);
        buf.check_invariants();
    }

    #[test]
    fn resize_preserves_data() {
        let pool = pool();
        let mut buf = pool.alloc(150).unwrap();
        let data = patterned(150);
        buf.write(&data).unwrap();
        buf.resize(500).unwrap();
        buf.resize(150).unwrap();
        buf.reset_acc();
        let mut out = vec![0; 150];
        buf.read(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn join_moves_blocks() {
        let pool = pool();
        let mut a = pool.alloc(100).unwrap();
        let mut b = pool.alloc(200).unwrap();
        a.write(&patterned(100)).unwrap();
        b.write(&vec![0xee; 200]).unwrap();
        a.join(b).unwrap();
        assert_eq!(a.total_len(), 300);
        a.check_invariants();
        let bytes = a.to_vec();
        assert_eq!(&bytes[..100], &patterned(100)[..]);
        assert!(bytes[100..].iter().all(|&b| b == 0xee));
    }

    #[test]
    fn set_cont_pulls_bytes_forward() {
        let pool = pool();
        // 20-byte header block in front of a full data block.
        let mut buf = pool.alloc(PKTBUF_BLK_SIZE).unwrap();
        buf.write(&patterned(PKTBUF_BLK_SIZE)).unwrap();
        buf.add_header(20, true).unwrap();
        buf.seek(0).unwrap();
        buf.write(&patterned(20)).unwrap();
        assert!(buf.blocks[0].size < 60);
        buf.set_cont(60).unwrap();
        assert!(buf.blocks[0].size >= 60);
        buf.check_invariants();
        let mut expect = patterned(20);
        expect.extend_from_slice(&patterned(PKTBUF_BLK_SIZE)[..40]);
        assert_eq!(&buf.head()[..60], &expect[..]);
        assert_eq!(buf.total_len(), PKTBUF_BLK_SIZE + 20);
    }

    #[test]
    fn cursor_io_across_blocks() {
        let pool = pool();
        let mut buf = pool.alloc(3 * PKTBUF_BLK_SIZE + 17).unwrap();
        let data = patterned(buf.total_len());
        buf.write(&data).unwrap();
        assert_eq!(buf.remaining(), 0);
        buf.seek(200).unwrap();
        let mut out = vec![0; 150];
        buf.read(&mut out).unwrap();
        assert_eq!(out, &data[200..350]);
        buf.seek(buf.total_len()).unwrap();
        assert_eq!(buf.read(&mut [0u8; 1]).unwrap_err(), Error::Size);
    }

    #[test]
    fn fill_and_copy() {
        let pool = pool();
        let mut src = pool.alloc(300).unwrap();
        src.write(&patterned(300)).unwrap();
        src.seek(50).unwrap();
        let mut dst = pool.alloc(300).unwrap();
        dst.fill(0, 300).unwrap();
        dst.seek(10).unwrap();
        dst.copy_from(&mut src, 200).unwrap();
        let bytes = dst.to_vec();
        assert_eq!(&bytes[10..210], &patterned(300)[50..250]);
        assert!(bytes[..10].iter().all(|&b| b == 0));
    }

    /// Reference RFC 1071 sum over a flat slice.
    fn flat_checksum(data: &[u8]) -> u16 {
        let mut sum = 0u32;
        for (i, &b) in data.iter().enumerate() {
            if i % 2 == 0 {
                sum += u32::from(b) << 8;
            } else {
                sum += u32::from(b);
            }
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }

    #[test]
    fn checksum_independent_of_layout() {
        use rand::Rng;
        let pool = pool();
        let mut rng = rand::thread_rng();
        for _ in 0..8 {
            let n = rng.gen_range(1..600);
            let data = patterned(n);

            let mut flat = pool.alloc(n).unwrap();
            flat.write(&data).unwrap();
            flat.reset_acc();

            // Same bytes, ragged block boundaries.
            let split = rng.gen_range(0..n);
            let mut ragged = pool.alloc(split).unwrap();
            ragged.join(pool.alloc(n - split).unwrap()).unwrap();
            ragged.add_header(rng.gen_range(0..40), false).unwrap();
            ragged.remove_header(ragged.total_len() - n).unwrap();
            ragged.reset_acc();
            ragged.write(&data).unwrap();
            ragged.reset_acc();

            let expect = flat_checksum(&data);
            assert_eq!(flat.checksum16(n, 0, true).unwrap(), expect);
            assert_eq!(ragged.checksum16(n, 0, true).unwrap(), expect);
        }
    }

    #[test]
    fn checksum_preload_and_advance() {
        let pool = pool();
        let mut buf = pool.alloc(40).unwrap();
        buf.write(&patterned(40)).unwrap();
        buf.seek(20).unwrap();
        let plain = buf.checksum16(20, 0, false).unwrap();
        assert_eq!(buf.remaining(), 0);
        buf.seek(20).unwrap();
        let loaded = buf.checksum16(20, 0x1_0000, false).unwrap();
        // A preload of 0x10000 folds back to +1.
        assert_eq!(loaded, plain.wrapping_add(1));
    }
}
