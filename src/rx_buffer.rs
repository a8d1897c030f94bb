//! Receive-buffer pool.
//!
//! Every ring owns a fixed array of receive buffers, allocated once at
//! ring-initialization time. A buffer is FREE on the pool's free list or
//! BUSY posted to the firmware, never both and never neither. Posting drains
//! the free list into descriptor slots and writes the producer index once
//! per batch. When mapping a replacement buffer fails, the slot stays
//! unbacked and the ring simply runs with fewer buffers than nominal; a
//! later release or watchdog pass retries the mapping.

use crate::dma::{DmaAllocator, DmaBuffer};
use crate::proto::{Owner, RxPostDescriptor};
use crate::ring::DescriptorRing;
use std::sync::Arc;

/// Index of a buffer in its pool. Handles travel through descriptors and
/// completions; the pool owns the storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RxBufferHandle(pub(crate) u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufState {
    Free,
    Busy,
}

struct BufSlot {
    dma: Option<DmaBuffer>,
    state: BufState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxPoolStats {
    pub alloc_failures: u64,
    pub posted: u64,
    pub reposted_under_watermark: u64,
}

pub struct ReceiveBufferPool {
    slots: Vec<BufSlot>,
    free: Vec<u16>,
    buf_len: usize,
    post_threshold: usize,
    allocator: Arc<dyn DmaAllocator>,
    stats: RxPoolStats,
}

impl ReceiveBufferPool {
    /// Allocate and map `capacity` buffers of `buf_len` bytes. Individual
    /// mapping failures are counted, not fatal: the pool comes up with
    /// fewer backed buffers.
    pub fn new(
        capacity: usize,
        buf_len: usize,
        post_threshold: usize,
        allocator: Arc<dyn DmaAllocator>,
    ) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        let mut slots = Vec::with_capacity(capacity);
        let mut stats = RxPoolStats::default();

        for _ in 0..capacity {
            let dma = allocator.alloc(buf_len);
            if dma.is_none() {
                stats.alloc_failures += 1;
            }
            slots.push(BufSlot {
                dma,
                state: BufState::Free,
            });
        }

        Self {
            slots,
            free: (0..capacity as u16).rev().collect(),
            buf_len,
            post_threshold,
            allocator,
            stats,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity() - self.free_count()
    }

    pub fn stats(&self) -> RxPoolStats {
        self.stats
    }

    /// Low-watermark admission gate: when handing one more buffer to the
    /// upper layer would leave fewer than `post_threshold` free, completed
    /// packets are reposted instead of delivered. Running the firmware out
    /// of receive buffers looks like a device hang; refusing admission
    /// does not.
    pub fn admit_upper(&self) -> bool {
        self.free_count() >= self.post_threshold
    }

    /// Note a packet turned away by the admission gate.
    pub fn count_repost(&mut self) {
        self.stats.reposted_under_watermark += 1;
    }

    /// Pop a FREE buffer and make sure it has a live mapping. `None` when
    /// the free list is empty or the mapping cannot be established.
    pub fn acquire(&mut self) -> Option<RxBufferHandle> {
        let idx = self.free.pop()?;
        let slot = &mut self.slots[idx as usize];

        if slot.dma.is_none() {
            slot.dma = self.allocator.alloc(self.buf_len);
            if slot.dma.is_none() {
                self.stats.alloc_failures += 1;
                self.free.push(idx);
                return None;
            }
        }

        slot.state = BufState::Busy;
        Some(RxBufferHandle(idx))
    }

    /// Return a buffer to FREE. With `refill`, an unbacked slot retries
    /// its mapping now instead of at the next acquire.
    pub fn release(&mut self, handle: RxBufferHandle, refill: bool) {
        let Some(slot) = self.slots.get_mut(handle.0 as usize) else {
            log::warn!("rx pool: release of invalid buffer handle {}", handle.0);
            return;
        };

        if slot.state == BufState::Free {
            log::warn!("rx pool: double release of buffer {}", handle.0);
            return;
        }

        if refill && slot.dma.is_none() {
            slot.dma = self.allocator.alloc(self.buf_len);
            if slot.dma.is_none() {
                self.stats.alloc_failures += 1;
            }
        }

        slot.state = BufState::Free;
        self.free.push(handle.0);
    }

    /// Copy `len` received bytes out of a BUSY buffer.
    pub fn copy_out(&self, handle: RxBufferHandle, len: usize) -> Option<Vec<u8>> {
        let slot = self.slots.get(handle.0 as usize)?;
        if slot.state != BufState::Busy {
            return None;
        }
        let dma = slot.dma.as_ref()?;
        Some(dma.as_slice().get(..len.min(dma.len()))?.to_vec())
    }

    /// Test access to a buffer's backing bytes, for fake-firmware writes.
    pub fn buffer_mut(&mut self, handle: RxBufferHandle) -> Option<&mut [u8]> {
        self.slots
            .get_mut(handle.0 as usize)?
            .dma
            .as_mut()
            .map(|d| d.as_mut_slice())
    }

    /// Drain up to `limit` FREE buffers into the posting ring. Descriptors
    /// are written per buffer but the producer index is committed by the
    /// caller once per batch, not per descriptor. Returns the number
    /// posted.
    pub fn post_batch(&mut self, ring: &mut DescriptorRing<RxPostDescriptor>, limit: u32) -> u32 {
        let mut posted = 0;

        while posted < limit {
            if ring.is_full() {
                break;
            }

            let Some(handle) = self.acquire() else {
                break;
            };

            let bus_addr = match self.slots[handle.0 as usize].dma.as_ref() {
                Some(d) => d.bus_addr(),
                None => 0,
            };

            let desc = RxPostDescriptor {
                owner: Owner::Device,
                buffer: handle,
                bus_addr,
                len: self.buf_len as u32,
            };

            if ring.post(desc).is_err() {
                // Full check raced nothing here; keep the buffer FREE.
                self.release(handle, false);
                break;
            }

            posted += 1;
            self.stats.posted += 1;
        }

        posted
    }
}
