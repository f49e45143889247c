//! Fixed-size buffer pool shared across connections
//!
//! `borrow` never blocks: an empty pool allocates a fresh slot-sized buffer.
//! `recycle` keeps at most `capacity` buffers and rejects buffers of the
//! wrong size. Recycled buffers are not zeroed.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::{Config, DEFAULT_POOL_CAPACITY, DEFAULT_POOL_SLOT_SIZE};

/// Pool of equally sized byte buffers
#[derive(Debug)]
pub struct BufferPool {
    free_list: Mutex<Vec<Box<[u8]>>>,
    slot_size: usize,
    capacity: usize,
    rejected: AtomicUsize,
}

impl BufferPool {
    /// Create a pool of `slot_size`-byte buffers retaining at most `capacity`
    ///
    /// Slots are at least one byte long.
    pub fn new(slot_size: usize, capacity: usize) -> Self {
        Self {
            free_list: Mutex::new(Vec::with_capacity(capacity.min(64))),
            slot_size: slot_size.max(1),
            capacity,
            rejected: AtomicUsize::new(0),
        }
    }

    /// Create a pool sized by a connection config
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.pool_slot_size, config.pool_capacity)
    }

    /// Take a buffer, allocating when the pool is empty
    #[inline]
    pub fn borrow(&self) -> Box<[u8]> {
        let cached = self.free_list.lock().pop();
        cached.unwrap_or_else(|| vec![0u8; self.slot_size].into_boxed_slice())
    }

    /// Return a buffer to the pool
    ///
    /// A buffer whose length differs from the slot size is rejected; a full
    /// pool drops the buffer silently.
    pub fn recycle(&self, buffer: Box<[u8]>) -> Result<()> {
        if buffer.len() != self.slot_size {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                expected = self.slot_size,
                actual = buffer.len(),
                "rejected buffer of wrong size"
            );
            return Err(Error::BufferPoolMisuse {
                expected: self.slot_size,
                actual: buffer.len(),
            });
        }

        let mut free_list = self.free_list.lock();
        if free_list.len() < self.capacity {
            free_list.push(buffer);
        }
        Ok(())
    }

    /// Number of buffers ready to borrow
    #[inline]
    pub fn available(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Size of each buffer
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Maximum number of retained buffers
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers rejected by `recycle`
    #[inline]
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SLOT_SIZE, DEFAULT_POOL_CAPACITY)
    }
}
