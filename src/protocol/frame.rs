//! Fixed-size packet buffers
//!
//! A [`Frame`] is a 4096 byte block with a movable window `[start, end)`.
//! Interface reads land after some headroom so the wire header can later be
//! written in front of the payload without copying it. Frames come from a
//! [`FramePool`] and go back to it when dropped, which lets a buffer outlive
//! the read that filled it and be handed to the task that consumes it.

use std::sync::{Arc, Mutex};

use crate::error::ProtocolError;

/// Maximum datagram and interface packet size
pub const MAX_PACKET_SIZE: usize = 4096;

/// Default number of idle blocks the pool keeps around
pub const DEFAULT_POOL_IDLE: usize = 8;

type Block = Box<[u8; MAX_PACKET_SIZE]>;

/// Pool usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocations: u64,
    pub reuses: u64,
    pub idle: usize,
}

struct PoolInner {
    free: Vec<Block>,
    max_idle: usize,
    stats: PoolStats,
}

/// Recycling pool of packet blocks, shared by the read pumps
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<Mutex<PoolInner>>,
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_IDLE)
    }
}

impl FramePool {
    /// Create a pool keeping at most `max_idle` released blocks
    pub fn new(max_idle: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                free: Vec::with_capacity(max_idle),
                max_idle,
                stats: PoolStats::default(),
            })),
        }
    }

    /// Take a block from the pool (or allocate one) with an empty window at `headroom`
    pub fn acquire(&self, headroom: usize) -> Frame {
        let reused = match self.inner.lock() {
            Ok(mut inner) => {
                let block = inner.free.pop();
                if block.is_some() {
                    inner.stats.reuses += 1;
                } else {
                    inner.stats.allocations += 1;
                }
                inner.stats.idle = inner.free.len();
                block
            }
            Err(_) => None,
        };

        let block = reused.unwrap_or_else(new_block);
        Frame::from_block(block, headroom, Some(self.clone()))
    }

    /// Snapshot of the pool counters
    pub fn stats(&self) -> PoolStats {
        self.inner
            .lock()
            .map(|inner| inner.stats)
            .unwrap_or_default()
    }

    fn release(&self, block: Block) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.free.len() < inner.max_idle {
                inner.free.push(block);
            }
            inner.stats.idle = inner.free.len();
        }
    }
}

fn new_block() -> Block {
    Box::new([0u8; MAX_PACKET_SIZE])
}

/// One packet buffer with a data window
pub struct Frame {
    block: Option<Block>,
    start: usize,
    end: usize,
    pool: Option<FramePool>,
}

impl Frame {
    /// Create an unpooled frame with an empty window at `headroom`
    pub fn new(headroom: usize) -> Self {
        Self::from_block(new_block(), headroom, None)
    }

    /// Create an unpooled frame holding a copy of `data` after `headroom` bytes
    pub fn with_payload(headroom: usize, data: &[u8]) -> Result<Self, ProtocolError> {
        let needed = headroom + data.len();
        if needed > MAX_PACKET_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                needed,
                capacity: MAX_PACKET_SIZE,
            });
        }

        let mut frame = Self::new(headroom);
        frame.spare_mut()[..data.len()].copy_from_slice(data);
        frame.set_len(data.len());
        Ok(frame)
    }

    fn from_block(block: Block, headroom: usize, pool: Option<FramePool>) -> Self {
        let start = headroom.min(MAX_PACKET_SIZE);
        Self {
            block: Some(block),
            start,
            end: start,
            pool,
        }
    }

    fn block(&self) -> &[u8; MAX_PACKET_SIZE] {
        // Only `Drop` takes the block out.
        self.block.as_deref().unwrap_or(&EMPTY_BLOCK)
    }

    fn block_mut(&mut self) -> &mut [u8; MAX_PACKET_SIZE] {
        self.block.get_or_insert_with(new_block)
    }

    /// Offset of the window inside the block
    pub fn start(&self) -> usize {
        self.start
    }

    /// Window length
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The window contents
    pub fn as_slice(&self) -> &[u8] {
        &self.block()[self.start..self.end]
    }

    /// Writable space from the window start to the end of the block (read target)
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let start = self.start;
        &mut self.block_mut()[start..]
    }

    /// Set the window length after a read into [`Frame::spare_mut`]
    pub fn set_len(&mut self, len: usize) {
        self.end = (self.start + len).min(MAX_PACKET_SIZE);
    }

    /// Drop `n` bytes from the front of the window
    pub fn advance(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
    }

    /// Write `bytes` into the headroom directly before the window and extend it
    pub fn prepend(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        if self.start < bytes.len() {
            return Err(ProtocolError::InsufficientHeadroom {
                offset: self.start,
                needed: bytes.len(),
            });
        }

        let new_start = self.start - bytes.len();
        self.block_mut()[new_start..new_start + bytes.len()].copy_from_slice(bytes);
        self.start = new_start;
        Ok(())
    }

    /// Whole block plus the current window bounds, for in-place transforms
    pub(crate) fn parts_mut(&mut self) -> (&mut [u8], usize, usize) {
        let (start, end) = (self.start, self.end);
        (&mut self.block_mut()[..], start, end)
    }

    /// Move the window to `[start, end)`
    pub(crate) fn set_window(&mut self, start: usize, end: usize) {
        let end = end.min(MAX_PACKET_SIZE);
        self.start = start.min(end);
        self.end = end;
    }
}

static EMPTY_BLOCK: [u8; MAX_PACKET_SIZE] = [0u8; MAX_PACKET_SIZE];

impl Drop for Frame {
    fn drop(&mut self) {
        if let (Some(block), Some(pool)) = (self.block.take(), self.pool.take()) {
            pool.release(block);
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("start", &self.start)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_payload_places_data_after_headroom() {
        let frame = Frame::with_payload(24, b"hello").unwrap();
        assert_eq!(frame.start(), 24);
        assert_eq!(frame.len(), 5);
        assert_eq!(frame.as_slice(), b"hello");
    }

    #[test]
    fn test_with_payload_too_large() {
        let data = vec![0u8; MAX_PACKET_SIZE];
        assert_eq!(
            Frame::with_payload(1, &data).unwrap_err(),
            ProtocolError::BufferTooSmall {
                needed: MAX_PACKET_SIZE + 1,
                capacity: MAX_PACKET_SIZE,
            }
        );
    }

    #[test]
    fn test_advance_and_prepend() {
        let mut frame = Frame::with_payload(4, &[0, 0, 0, 2, 0x45, 0x00]).unwrap();
        frame.advance(4);
        assert_eq!(frame.as_slice(), &[0x45, 0x00]);

        frame.prepend(&[9, 9]).unwrap();
        assert_eq!(frame.as_slice(), &[9, 9, 0x45, 0x00]);
        assert_eq!(frame.start(), 6);
    }

    #[test]
    fn test_prepend_without_headroom() {
        let mut frame = Frame::with_payload(2, b"abc").unwrap();
        assert_eq!(
            frame.prepend(&[0, 0, 0, 2]).unwrap_err(),
            ProtocolError::InsufficientHeadroom { offset: 2, needed: 4 }
        );
        assert_eq!(frame.as_slice(), b"abc");
    }

    #[test]
    fn test_advance_never_passes_end() {
        let mut frame = Frame::with_payload(0, b"ab").unwrap();
        frame.advance(10);
        assert!(frame.is_empty());
    }

    #[test]
    fn test_pool_reuses_released_blocks() {
        let pool = FramePool::new(2);

        let mut frame = pool.acquire(24);
        assert_eq!(frame.start(), 24);
        assert_eq!(frame.spare_mut().len(), MAX_PACKET_SIZE - 24);
        drop(frame);

        let stats = pool.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.idle, 1);

        let _frame = pool.acquire(0);
        let stats = pool.stats();
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.idle, 0);
    }

    #[test]
    fn test_pool_caps_idle_blocks() {
        let pool = FramePool::new(1);
        let a = pool.acquire(0);
        let b = pool.acquire(0);
        drop(a);
        drop(b);
        assert_eq!(pool.stats().idle, 1);
    }
}
