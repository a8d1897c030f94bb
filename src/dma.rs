//! DMA buffer abstraction.
//!
//! Backing storage plus the bus address the firmware DMAs to. Allocation is
//! fallible by contract; a pool that cannot map a fresh buffer runs with
//! fewer buffers instead of failing its ring.

use core::sync::atomic::{AtomicU64, Ordering};

pub struct DmaBuffer {
    data: Box<[u8]>,
    bus_addr: u64,
}

impl DmaBuffer {
    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Maps host memory for device access. `alloc` returning `None` is an
/// expected under-pressure outcome, mirrored from the pool allocators this
/// sits in front of.
pub trait DmaAllocator: Send + Sync {
    fn alloc(&self, len: usize) -> Option<DmaBuffer>;
}

/// Host allocator handing out zeroed buffers with monotonically increasing
/// bus addresses. Real mappings come from the platform IOMMU layer, which
/// is outside this crate.
pub struct HostDmaAllocator {
    next_bus_addr: AtomicU64,
}

impl HostDmaAllocator {
    pub fn new() -> Self {
        Self {
            // Arbitrary non-zero base so a zero bus address stays invalid.
            next_bus_addr: AtomicU64::new(0x1000),
        }
    }
}

impl Default for HostDmaAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaAllocator for HostDmaAllocator {
    fn alloc(&self, len: usize) -> Option<DmaBuffer> {
        if len == 0 {
            return None;
        }

        let bus_addr = self
            .next_bus_addr
            .fetch_add(len.next_power_of_two() as u64, Ordering::Relaxed);

        Some(DmaBuffer {
            data: vec![0u8; len].into_boxed_slice(),
            bus_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_bus_addresses() {
        let a = HostDmaAllocator::new();
        let b1 = a.alloc(2048).unwrap();
        let b2 = a.alloc(2048).unwrap();
        assert_ne!(b1.bus_addr(), b2.bus_addr());
        assert_eq!(b1.len(), 2048);
    }

    #[test]
    fn zero_len_fails() {
        let a = HostDmaAllocator::new();
        assert!(a.alloc(0).is_none());
    }
}
