//! Fixed-capacity, fixed-slot-size buffer pool
//!
//! One contiguous allocation carved into `capacity` slots of `slot_size`
//! bytes. Free slots live in a bounded lock-free queue, so acquire/release
//! never allocate, block, or grow. Exhaustion is reported to the caller.
//!
//! Buffers are RAII: a [`PoolBuf`] returns its slot to the pool that issued
//! it when dropped.
//!
//! Acquire and release each touch two words (free queue, in-use counter).
//! Code that may be preempted between arbitrary instructions must wrap them
//! in a critical section so an observer never sees the two words disagree.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::error::PoolError;

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Slot alignment (one cache line)
const SLOT_ALIGN: usize = 64;

struct PoolInner {
    name: String,
    base: NonNull<u8>,
    layout: Layout,
    slot_size: usize,
    capacity: usize,
    free: ArrayQueue<u32>,
    in_use: AtomicUsize,
}

// Safety: slot memory is only reachable through a PoolBuf, and each index
// is owned by at most one PoolBuf at a time (the free queue hands it out once).
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

impl PoolInner {
    #[inline]
    fn slot_ptr(&self, index: u32) -> *mut u8 {
        // Safety: index < capacity, region is capacity * slot_size bytes
        unsafe { self.base.as_ptr().add(index as usize * self.slot_size) }
    }

    fn release_index(&self, index: u32) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        if self.free.push(index).is_err() {
            // Only reachable if an index were released twice.
            log::error!("mempool {}: double release of slot {}", self.name, index);
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Safety: allocated in Mempool::new with this layout
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Snapshot of pool accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub available: usize,
}

/// Handle to a fixed-size buffer pool. Clones share the same pool.
#[derive(Clone)]
pub struct Mempool {
    inner: Arc<PoolInner>,
}

impl Mempool {
    /// Create a pool of `capacity` slots, each `slot_size` bytes.
    pub fn new(name: &str, capacity: usize, slot_size: usize) -> PoolResult<Self> {
        if capacity == 0 || slot_size == 0 || capacity > u32::MAX as usize {
            return Err(PoolError::InvalidConfig);
        }
        let slot_size = slot_size.next_multiple_of(SLOT_ALIGN);
        let total = capacity.checked_mul(slot_size).ok_or(PoolError::InvalidConfig)?;
        let layout =
            Layout::from_size_align(total, SLOT_ALIGN).map_err(|_| PoolError::InvalidConfig)?;

        // Safety: layout has non-zero size
        let base = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(base).ok_or(PoolError::Exhausted)?;

        let free = ArrayQueue::new(capacity);
        for i in 0..capacity as u32 {
            let _ = free.push(i);
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                name: name.to_string(),
                base,
                layout,
                slot_size,
                capacity,
                free,
                in_use: AtomicUsize::new(0),
            }),
        })
    }

    /// Take one slot. Never blocks; `Exhausted` when none are free.
    #[inline]
    pub fn acquire(&self) -> PoolResult<PoolBuf> {
        let index = self.inner.free.pop().ok_or(PoolError::Exhausted)?;
        self.inner.in_use.fetch_add(1, Ordering::AcqRel);
        Ok(PoolBuf {
            pool: Arc::clone(&self.inner),
            index,
            len: 0,
        })
    }

    /// Take one slot and copy `data` into it
    pub fn acquire_with(&self, data: &[u8]) -> PoolResult<PoolBuf> {
        if data.len() > self.inner.slot_size {
            return Err(PoolError::TooLarge { len: data.len(), slot_size: self.inner.slot_size });
        }
        let mut buf = self.acquire()?;
        buf.fill_from(data)?;
        Ok(buf)
    }

    /// Return a buffer early. Dropping it has the same effect.
    #[inline]
    pub fn release(&self, buf: PoolBuf) {
        debug_assert!(
            Arc::ptr_eq(&self.inner, &buf.pool),
            "buffer released to a pool that did not issue it"
        );
        drop(buf);
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        self.inner.slot_size
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Acquire)
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            in_use: self.in_use(),
            available: self.available(),
        }
    }
}

impl fmt::Debug for Mempool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mempool")
            .field("name", &self.inner.name)
            .field("slot_size", &self.inner.slot_size)
            .field("stats", &self.stats())
            .finish()
    }
}

/// One slot checked out of a [`Mempool`]
///
/// `len` tracks the valid prefix; the full slot is `capacity()` bytes.
pub struct PoolBuf {
    pool: Arc<PoolInner>,
    index: u32,
    len: usize,
}

impl PoolBuf {
    /// Slot index within the owning pool
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.pool.slot_size
    }

    /// Valid bytes
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: this PoolBuf exclusively owns the slot; len <= slot_size
        unsafe { std::slice::from_raw_parts(self.pool.slot_ptr(self.index), self.len) }
    }

    /// Whole slot, for writing before `set_len`
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        // Safety: this PoolBuf exclusively owns the slot
        unsafe { std::slice::from_raw_parts_mut(self.pool.slot_ptr(self.index), self.pool.slot_size) }
    }

    pub fn set_len(&mut self, len: usize) -> PoolResult<()> {
        if len > self.pool.slot_size {
            return Err(PoolError::TooLarge { len, slot_size: self.pool.slot_size });
        }
        self.len = len;
        Ok(())
    }

    /// Replace contents with `data`
    pub fn fill_from(&mut self, data: &[u8]) -> PoolResult<()> {
        self.set_len(data.len())?;
        self.spare_mut()[..data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Drop for PoolBuf {
    #[inline]
    fn drop(&mut self) {
        self.pool.release_index(self.index);
    }
}

impl fmt::Debug for PoolBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuf")
            .field("pool", &self.pool.name)
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}
