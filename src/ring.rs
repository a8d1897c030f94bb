//! Descriptor rings shared between host and firmware.
//!
//! A ring is a fixed, power-of-two array of owner-tagged slots with one
//! producer and one consumer. Indices are free-running `u32`s; the slot
//! index is the counter masked by `capacity - 1`, so wraparound costs one
//! AND. `(producer - consumer)` is the live count and never exceeds the
//! capacity: `post` fails fast with [`RingFull`] instead of overtaking the
//! peer, and the consumer never reads past a slot the device still owns.

use crate::proto::Owner;

/// Access to the ownership tag every ring slot carries.
pub trait OwnerTagged {
    fn owner(&self) -> Owner;
    fn set_owner(&mut self, owner: Owner);
}

/// The ring has no room for another descriptor. The caller queues its unit
/// of work and stops accepting more until a drain frees space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingCreateErr {
    /// Capacity must be a non-zero power of two.
    BadCapacity,
}

impl core::fmt::Display for RingCreateErr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BadCapacity => write!(f, "ring capacity must be a non-zero power of two"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub posted: u64,
    pub consumed: u64,
    pub full_rejections: u64,
}

pub struct DescriptorRing<T> {
    slots: Vec<T>,
    mask: u32,
    producer: u32,
    consumer: u32,
    stats: RingStats,
}

impl<T: OwnerTagged + Default + Clone> DescriptorRing<T> {
    pub fn new(capacity: u32) -> Result<Self, RingCreateErr> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(RingCreateErr::BadCapacity);
        }

        let mut slots = vec![T::default(); capacity as usize];
        for slot in slots.iter_mut() {
            slot.set_owner(Owner::Device);
        }

        Ok(Self {
            slots,
            mask: capacity - 1,
            producer: 0,
            consumer: 0,
            stats: RingStats::default(),
        })
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    /// Number of live descriptors.
    #[inline]
    pub fn len(&self) -> u32 {
        self.producer.wrapping_sub(self.consumer)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Free slots from the producer's point of view.
    #[inline]
    pub fn space(&self) -> u32 {
        self.capacity() - self.len()
    }

    /// Write one descriptor at the producer index. The ownership tag is
    /// taken from the descriptor itself: the host posts device-owned work,
    /// the firmware posts host-owned writebacks.
    pub fn post(&mut self, desc: T) -> Result<(), RingFull> {
        if self.is_full() {
            self.stats.full_rejections += 1;
            return Err(RingFull);
        }

        let idx = (self.producer & self.mask) as usize;
        self.slots[idx] = desc;
        self.producer = self.producer.wrapping_add(1);
        self.stats.posted += 1;

        Ok(())
    }

    /// Non-destructive look at the next consumable slot. Returns `None`
    /// when the ring is empty or the slot is still device-owned; the latter
    /// is the poller's sole blocking condition.
    pub fn peek_next(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }

        let slot = &self.slots[(self.consumer & self.mask) as usize];
        if slot.owner() == Owner::Host {
            Some(slot)
        } else {
            None
        }
    }

    /// True when a record spanning `n` slots is fully written back: the
    /// span is validated by the owner tag of its *last* slot, so a
    /// partially DMA'd message is never consumed.
    pub fn span_ready(&self, n: u32) -> bool {
        if n == 0 || n > self.len() {
            return false;
        }

        let last = self.consumer.wrapping_add(n - 1);
        self.slots[(last & self.mask) as usize].owner() == Owner::Host
    }

    /// Consume an `n`-slot span: copies the descriptors out, returns every
    /// slot to device ownership, and advances the consumer once.
    pub fn consume_span(&mut self, n: u32) -> Option<Vec<T>> {
        if !self.span_ready(n) {
            return None;
        }

        let mut out = Vec::with_capacity(n as usize);
        for i in 0..n {
            let idx = (self.consumer.wrapping_add(i) & self.mask) as usize;
            out.push(self.slots[idx].clone());
            self.slots[idx].set_owner(Owner::Device);
        }

        self.consumer = self.consumer.wrapping_add(n);
        self.stats.consumed += n as u64;

        Some(out)
    }

    pub fn consume(&mut self) -> Option<T> {
        self.consume_span(1).and_then(|mut v| v.pop())
    }

    /// Hand the current slot back to the device and move on without
    /// copying it out. A no-op on an empty ring; the consumer never
    /// overtakes the producer.
    pub fn advance_consumer(&mut self) {
        if self.is_empty() {
            return;
        }

        let idx = (self.consumer & self.mask) as usize;
        self.slots[idx].set_owner(Owner::Device);
        self.consumer = self.consumer.wrapping_add(1);
        self.stats.consumed += 1;
    }

    /// Reclaim `n` slots at once. Used on the command ring when the
    /// firmware reports how far its DMA engine has read.
    pub fn advance_consumer_by(&mut self, n: u32) {
        for _ in 0..n.min(self.len()) {
            self.advance_consumer();
        }
    }

    /// Masked producer index, the value written back to the firmware's
    /// producer register after a batch of posts.
    #[inline]
    pub fn committed_producer(&self) -> u32 {
        self.producer & self.mask
    }

    #[inline]
    pub fn consumer_index(&self) -> u32 {
        self.consumer & self.mask
    }

    pub fn stats(&self) -> RingStats {
        self.stats
    }

    /// Copies of all live slots, oldest first.
    pub fn snapshot_live(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len() as usize);
        for i in 0..self.len() {
            let idx = (self.consumer.wrapping_add(i) & self.mask) as usize;
            out.push(self.slots[idx].clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{StatusDescriptor, StatusRecord};

    fn pkt(op: u8) -> StatusDescriptor {
        StatusDescriptor::host_owned(StatusRecord::Unknown { opcode: op })
    }

    #[test]
    fn rejects_bad_capacity() {
        assert!(DescriptorRing::<StatusDescriptor>::new(0).is_err());
        assert!(DescriptorRing::<StatusDescriptor>::new(6).is_err());
        assert!(DescriptorRing::<StatusDescriptor>::new(8).is_ok());
    }

    #[test]
    fn post_until_full_then_reject() {
        // Ring of 8 with producer=6, consumer=2: 4 live descriptors, room
        // for exactly 4 more.
        let mut ring = DescriptorRing::<StatusDescriptor>::new(8).unwrap();
        for i in 0..6 {
            ring.post(pkt(i)).unwrap();
        }
        ring.advance_consumer_by(2);
        assert_eq!(ring.len(), 4);

        for i in 0..4 {
            ring.post(pkt(10 + i)).unwrap();
        }
        assert_eq!(ring.post(pkt(99)), Err(RingFull));
        assert_eq!(ring.stats().full_rejections, 1);
    }

    #[test]
    fn advance_on_empty_ring_is_noop() {
        let mut ring = DescriptorRing::<StatusDescriptor>::new(8).unwrap();
        ring.advance_consumer();
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.space(), ring.capacity());

        // Draining past the producer stops at empty.
        ring.post(pkt(1)).unwrap();
        ring.advance_consumer();
        ring.advance_consumer();
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.space(), ring.capacity());
        assert_eq!(ring.stats().consumed, 1);
    }

    #[test]
    fn live_count_never_exceeds_capacity() {
        let mut ring = DescriptorRing::<StatusDescriptor>::new(4).unwrap();
        for round in 0..3 {
            for i in 0..4 {
                ring.post(pkt(i)).unwrap();
                assert!(ring.len() <= ring.capacity());
            }
            assert!(ring.post(pkt(9)).is_err());
            for _ in 0..4 {
                ring.consume().unwrap();
                assert!(ring.len() <= ring.capacity());
            }
            assert!(ring.is_empty(), "round {round}");
        }
    }

    #[test]
    fn peek_respects_device_ownership() {
        let mut ring = DescriptorRing::<StatusDescriptor>::new(4).unwrap();
        ring.post(StatusDescriptor::device_owned(StatusRecord::Unknown {
            opcode: 1,
        }))
        .unwrap();

        // One live slot, but it is still being written by the device.
        assert_eq!(ring.len(), 1);
        assert!(ring.peek_next().is_none());
        assert!(ring.consume().is_none());
    }

    #[test]
    fn span_validated_by_last_slot() {
        let mut ring = DescriptorRing::<StatusDescriptor>::new(8).unwrap();
        ring.post(pkt(1)).unwrap();
        ring.post(pkt(2)).unwrap();
        ring.post(StatusDescriptor::device_owned(StatusRecord::Unknown {
            opcode: 3,
        }))
        .unwrap();

        // Last slot of the 3-span is device-owned: nothing may be consumed.
        assert!(!ring.span_ready(3));
        assert!(ring.consume_span(3).is_none());
        assert!(ring.span_ready(2));

        let got = ring.consume_span(2).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn consume_returns_slot_to_device() {
        let mut ring = DescriptorRing::<StatusDescriptor>::new(2).unwrap();
        ring.post(pkt(7)).unwrap();
        let d = ring.consume().unwrap();
        assert_eq!(d.record, StatusRecord::Unknown { opcode: 7 });

        // The slot was handed back; re-reading it must not be possible
        // even after the producer laps around to it.
        ring.post(StatusDescriptor::device_owned(StatusRecord::Unknown {
            opcode: 8,
        }))
        .unwrap();
        ring.post(StatusDescriptor::device_owned(StatusRecord::Unknown {
            opcode: 9,
        }))
        .unwrap();
        assert!(ring.peek_next().is_none());
    }

    #[test]
    fn wraparound_keeps_order() {
        let mut ring = DescriptorRing::<StatusDescriptor>::new(4).unwrap();
        let mut next = 0u8;
        let mut expect = 0u8;
        for _ in 0..20 {
            ring.post(pkt(next)).unwrap();
            next = next.wrapping_add(1);
            let d = ring.consume().unwrap();
            assert_eq!(d.record, StatusRecord::Unknown { opcode: expect });
            expect = expect.wrapping_add(1);
        }
        assert_eq!(ring.committed_producer(), ring.consumer_index());
    }
}
