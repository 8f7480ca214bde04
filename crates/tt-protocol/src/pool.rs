//! Reusable scratch buffers for the payload codec

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, OnceLock};

/// Buffers kept around for reuse; extra returns are dropped
const MAX_POOLED: usize = 8;

/// Buffers that grew beyond this are not returned to the pool
const MAX_RETAINED_CAPACITY: usize = 4 * crate::constants::BUFFER_SIZE_1MB;

/// A small pool of byte buffers.
///
/// A checked-out buffer belongs to exactly one caller until it is dropped,
/// at which point it is cleared and handed back.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    initial_capacity: usize,
}

impl BufferPool {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            initial_capacity,
        }
    }

    /// Process-wide pool used by [`crate::payload`]
    pub fn global() -> &'static BufferPool {
        static POOL: OnceLock<BufferPool> = OnceLock::new();
        POOL.get_or_init(|| BufferPool::new(crate::constants::CHUNK_SIZE))
    }

    /// Take a cleared buffer from the pool, allocating if none is free
    pub fn get(&self) -> PooledBuffer<'_> {
        let buf = self
            .buffers
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| Vec::with_capacity(self.initial_capacity));
        PooledBuffer { buf, pool: self }
    }

    /// Number of idle buffers
    pub fn idle(&self) -> usize {
        self.buffers.lock().map(|free| free.len()).unwrap_or(0)
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buf.clear();
        if let Ok(mut free) = self.buffers.lock() {
            if free.len() < MAX_POOLED {
                free.push(buf);
            }
        }
    }
}

/// Buffer on loan from a [`BufferPool`]
pub struct PooledBuffer<'a> {
    buf: Vec<u8>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}
