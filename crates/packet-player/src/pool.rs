//! Fixed-capacity slot pool: the hand-off unit between accumulation and playback.
//!
//! The pool owns N byte buffers of identical capacity and hands them out as
//! move-only [`Slot`] values:
//! - decode thread acquires a slot (blocking — this is the single
//!   backpressure point of the pipeline)
//! - the filled slot travels to the output scheduler and on to the device
//! - the device-completion path releases it, waking blocked acquirers
//!
//! Because a `Slot` owns its storage and `release` consumes it by value,
//! use-after-release and double-release are unrepresentable.

use std::sync::{Condvar, Mutex};

/// One pool buffer, owned exclusively by whichever stage currently holds it.
#[derive(Debug)]
pub struct Slot {
    index: usize,
    data: Box<[u8]>,
}

impl Slot {
    /// Stable identity of this slot within its pool (0..N).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Fixed byte capacity of this slot.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Mutable view of the slot storage.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Read-only view of the slot storage.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

struct PoolInner {
    free: Vec<Slot>,
    closed: bool,
}

/// Bounded pool of fixed-size byte buffers with blocking acquire.
///
/// All slots are allocated up front in [`BufferPool::new`]; there is no
/// grow/re-allocate path, so a stream instance can never double-allocate.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    cv: Condvar,
    slot_count: usize,
    slot_bytes: usize,
}

impl BufferPool {
    /// Allocate a pool of `slot_count` buffers of `slot_bytes` each.
    pub fn new(slot_count: usize, slot_bytes: usize) -> Self {
        let free = (0..slot_count)
            .map(|index| Slot {
                index,
                data: vec![0u8; slot_bytes].into_boxed_slice(),
            })
            .collect();
        Self {
            inner: Mutex::new(PoolInner {
                free,
                closed: false,
            }),
            cv: Condvar::new(),
            slot_count,
            slot_bytes,
        }
    }

    /// Total slot count (N).
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Per-slot byte capacity (C).
    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    /// Block until a slot is free, then take ownership of it.
    ///
    /// Returns `None` once the pool is closed; callers treat that as
    /// "stream is shutting down" rather than an error. There is no timeout:
    /// a stalled device is expected to stall decode (that is the pacing
    /// contract, not a failure).
    pub fn acquire(&self) -> Option<Slot> {
        let mut g = self.inner.lock().unwrap();
        while g.free.is_empty() && !g.closed {
            g = self.cv.wait(g).unwrap();
        }
        if g.closed {
            return None;
        }
        g.free.pop()
    }

    /// Take a slot without blocking, if one is free.
    pub fn try_acquire(&self) -> Option<Slot> {
        let mut g = self.inner.lock().unwrap();
        if g.closed {
            return None;
        }
        g.free.pop()
    }

    /// Return a slot to the pool and wake blocked acquirers.
    ///
    /// Accepted even after [`BufferPool::close`] so teardown can reclaim
    /// slots that were in flight to the device.
    pub fn release(&self, slot: Slot) {
        debug_assert!(slot.index < self.slot_count);
        let mut g = self.inner.lock().unwrap();
        g.free.push(slot);
        drop(g);
        self.cv.notify_all();
    }

    /// Close the pool and wake every blocked acquirer.
    ///
    /// Idempotent. Subsequent acquires return `None` immediately.
    pub fn close(&self) {
        let mut g = self.inner.lock().unwrap();
        g.closed = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Slots currently handed out (best-effort snapshot).
    pub fn busy_slots(&self) -> usize {
        let g = self.inner.lock().unwrap();
        self.slot_count - g.free.len()
    }

    /// Slots currently free (best-effort snapshot).
    pub fn free_slots(&self) -> usize {
        let g = self.inner.lock().unwrap();
        g.free.len()
    }
}
