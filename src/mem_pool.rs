//! Fixed-capacity entry pool.
//!
//! Flow-cache entries are never taken from the general allocator: the pool
//! is sized once, at creation, from the firmware-advertised maximum flow
//! count, and `alloc` returning `None` means "cache full, skip the
//! optimization" rather than an error.

use parking_lot::Mutex;

/// Index handle into a [`MemoryPool`]. Handles are the only cross-reference
/// the rest of the crate holds; no pointers into the arena escape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle(pub(crate) u16);

struct PoolInner<T> {
    slots: Vec<Option<T>>,
    free: Vec<u16>,
}

pub struct MemoryPool<T> {
    inner: Mutex<PoolInner<T>>,
    capacity: usize,
}

impl<T> MemoryPool<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            inner: Mutex::new(PoolInner {
                slots,
                free: (0..capacity as u16).rev().collect(),
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }

    /// Place `value` into a free slot. `None` when the pool is exhausted.
    pub fn alloc(&self, value: T) -> Option<EntryHandle> {
        let mut inner = self.inner.lock();
        let idx = inner.free.pop()?;
        inner.slots[idx as usize] = Some(value);
        Some(EntryHandle(idx))
    }

    /// Return a slot to the free list, yielding the stored value. Freeing
    /// an already-free handle is a no-op returning `None`.
    pub fn free(&self, handle: EntryHandle) -> Option<T> {
        let mut inner = self.inner.lock();
        let value = inner.slots.get_mut(handle.0 as usize)?.take()?;
        inner.free.push(handle.0);
        Some(value)
    }

    /// Read access to a live entry.
    pub fn with<R>(&self, handle: EntryHandle, f: impl FnOnce(&T) -> R) -> Option<R> {
        let inner = self.inner.lock();
        inner.slots.get(handle.0 as usize)?.as_ref().map(f)
    }
}
