//! Size-classed storage pool backing [`Buffer`](super::Buffer).

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::Buffer;

/// Smallest pooled class: 64 bytes
const MIN_CLASS_SHIFT: u32 = 6;
/// Largest pooled class: 128 KiB, so a maximum-size datagram plus any framing
/// headroom is still pooled. Bigger requests are allocated exactly and dropped on release.
const MAX_CLASS_SHIFT: u32 = 17;
const CLASS_COUNT: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;
/// Idle regions kept per class before extra ones are freed
const DEFAULT_MAX_IDLE: usize = 256;

static GLOBAL: Lazy<BufferPool> = Lazy::new(BufferPool::new);

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers currently owned by callers
    pub leased: usize,
    /// Regions parked in the free lists
    pub idle: usize,
}

/// Thread-safe pool of byte regions grouped by power-of-two size class.
///
/// Cloning is cheap and every clone shares the same free lists.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

pub(super) struct PoolInner {
    classes: [Mutex<Vec<Vec<u8>>>; CLASS_COUNT],
    leased: AtomicUsize,
    max_idle: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_max_idle(DEFAULT_MAX_IDLE)
    }

    /// Pool that keeps at most `max_idle` free regions per size class.
    pub fn with_max_idle(max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                classes: std::array::from_fn(|_| Mutex::new(Vec::new())),
                leased: AtomicUsize::new(0),
                max_idle,
            }),
        }
    }

    /// Process-wide pool used by the protocol helpers.
    pub fn global() -> &'static BufferPool {
        &GLOBAL
    }

    /// Lease a buffer with `headroom` bytes reserved in front of the payload,
    /// `size` bytes of payload room and `tailroom` bytes reserved after it.
    ///
    /// The payload starts out empty: `start == end == headroom`.
    pub fn allocate(&self, size: usize, headroom: usize, tailroom: usize) -> Buffer<'static> {
        let capacity = headroom + size + tailroom;
        let data = self.inner.take(capacity);
        self.inner.leased.fetch_add(1, Ordering::Relaxed);
        Buffer::pooled(data, headroom, Arc::clone(&self.inner))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            leased: self.inner.leased.load(Ordering::Relaxed),
            idle: self.inner.classes.iter().map(|c| c.lock().len()).sum(),
        }
    }
}

/// Index of the smallest class that fits `capacity`, `None` when it is too big to pool.
fn class_of(capacity: usize) -> Option<usize> {
    let shift = capacity
        .max(1 << MIN_CLASS_SHIFT)
        .next_power_of_two()
        .trailing_zeros();
    (shift <= MAX_CLASS_SHIFT).then(|| (shift - MIN_CLASS_SHIFT) as usize)
}

impl PoolInner {
    fn take(&self, capacity: usize) -> Vec<u8> {
        match class_of(capacity) {
            Some(class) => self.classes[class]
                .lock()
                .pop()
                .unwrap_or_else(|| vec![0u8; 1 << (class as u32 + MIN_CLASS_SHIFT)]),
            None => vec![0u8; capacity],
        }
    }

    /// Return a region leased by [`BufferPool::allocate`].
    pub(super) fn put(&self, data: Vec<u8>) {
        self.leased.fetch_sub(1, Ordering::Relaxed);
        let len = data.len();
        if let Some(class) = class_of(len) {
            // Only exact class sizes go back; oversized one-offs are simply freed.
            if len == 1 << (class as u32 + MIN_CLASS_SHIFT) {
                let mut free = self.classes[class].lock();
                if free.len() < self.max_idle {
                    free.push(data);
                }
            }
        }
    }
}
