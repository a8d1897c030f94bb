//! LRO flow cache.
//!
//! A sharded hash table from directional 4-tuple to flow entry. Entries
//! live in a [`MemoryPool`] arena sized by the firmware-advertised maximum
//! flow count; buckets hold index handles only, so the table can never
//! outgrow the pool. Each bucket has its own lock, so lookups and inserts
//! on different buckets never contend, and a table-level `RwLock` fences
//! per-entry operations against whole-table invalidation.
//!
//! Lock order: table read/write lock, then one bucket lock, then the pool
//! lock. Nothing acquires two bucket locks at once.

use crate::mem_pool::{EntryHandle, MemoryPool};
use parking_lot::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

/// Directional flow key. Equality is the full ordered tuple: `(a, b)` and
/// `(b, a)` are distinct flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_addr: [u8; 16],
    pub dst_addr: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
    pub version: IpVersion,
}

impl FlowKey {
    pub fn v4(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16) -> Self {
        let mut src_addr = [0u8; 16];
        let mut dst_addr = [0u8; 16];
        src_addr[..4].copy_from_slice(&src);
        dst_addr[..4].copy_from_slice(&dst);

        Self {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            version: IpVersion::V4,
        }
    }

    /// XOR/rotate mix of (dst addr, dst port, src addr, src port). Built
    /// for speed; flow keys are attacker-observable 4-tuples, not secrets,
    /// so no keyed hash is needed.
    pub fn hash(&self) -> u32 {
        let mut h = fold_addr(&self.dst_addr) ^ u32::from(self.dst_port);
        h = h.rotate_left(7) ^ fold_addr(&self.src_addr);
        h = h.rotate_left(7) ^ u32::from(self.src_port);
        h = h.rotate_left(7) ^ h >> 16;
        h.wrapping_mul(0x9e37_79b9)
    }
}

fn fold_addr(addr: &[u8; 16]) -> u32 {
    let mut h = 0u32;
    for chunk in addr.chunks_exact(4) {
        let mut word = [0u8; 4];
        word.copy_from_slice(chunk);
        h = h.rotate_left(5) ^ u32::from_le_bytes(word);
    }
    h
}

/// One admitted flow. The bucket index is a structural back-link, not
/// ownership; the pool owns the storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEntry {
    pub key: FlowKey,
    pub context_id: u32,
    pub bucket: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(EntryHandle),
    /// A flow with this key is already being aggregated. Idempotence, not
    /// an error.
    AlreadyExists,
    /// Entry pool exhausted. Skip aggregation for this flow this time.
    CacheFull,
}

pub struct FlowHashTable {
    buckets: Vec<Mutex<Vec<EntryHandle>>>,
    bucket_mask: u32,
    pool: MemoryPool<FlowEntry>,
    // Read-held by per-entry operations, write-held by invalidate_all, so
    // a reset sweep cannot interleave with a half-done insert.
    fence: RwLock<()>,
}

impl FlowHashTable {
    /// `max_flows` comes from the firmware capability query at
    /// initialization time.
    pub fn new(max_flows: usize) -> Self {
        let bucket_count = max_flows.next_power_of_two().clamp(16, 1 << 16);
        let mut buckets = Vec::with_capacity(bucket_count);
        buckets.resize_with(bucket_count, || Mutex::new(Vec::new()));

        Self {
            buckets,
            bucket_mask: bucket_count as u32 - 1,
            pool: MemoryPool::new(max_flows),
            fence: RwLock::new(()),
        }
    }

    #[inline]
    fn bucket_of(&self, key: &FlowKey) -> u32 {
        key.hash() & self.bucket_mask
    }

    pub fn len(&self) -> usize {
        self.pool.in_use()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Insert a new flow. At most one entry per key can exist; a duplicate
    /// insert reports [`InsertOutcome::AlreadyExists`] and changes nothing.
    pub fn insert(&self, key: FlowKey, context_id: u32) -> InsertOutcome {
        let _fence = self.fence.read();
        let bucket_idx = self.bucket_of(&key);
        let mut bucket = self.buckets[bucket_idx as usize].lock();

        for &h in bucket.iter() {
            if self.pool.with(h, |e| e.key == key) == Some(true) {
                return InsertOutcome::AlreadyExists;
            }
        }

        let entry = FlowEntry {
            key,
            context_id,
            bucket: bucket_idx,
        };
        match self.pool.alloc(entry) {
            Some(h) => {
                bucket.push(h);
                InsertOutcome::Inserted(h)
            }
            None => InsertOutcome::CacheFull,
        }
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<EntryHandle> {
        let _fence = self.fence.read();
        let bucket = self.buckets[self.bucket_of(key) as usize].lock();
        bucket
            .iter()
            .copied()
            .find(|&h| self.pool.with(h, |e| e.key == *key) == Some(true))
    }

    /// Remove a flow by key, returning the entry to the pool.
    pub fn delete(&self, key: &FlowKey) -> Option<FlowEntry> {
        let _fence = self.fence.read();
        let mut bucket = self.buckets[self.bucket_of(key) as usize].lock();

        let pos = bucket
            .iter()
            .position(|&h| self.pool.with(h, |e| e.key == *key) == Some(true))?;
        let h = bucket.swap_remove(pos);
        self.pool.free(h)
    }

    /// Visit every live entry matching `pred`. Buckets are visited one at
    /// a time under their own locks; inserts on other buckets proceed
    /// concurrently.
    pub fn for_each_matching(
        &self,
        pred: impl Fn(&FlowEntry) -> bool,
        mut f: impl FnMut(&FlowEntry),
    ) {
        let _fence = self.fence.read();
        for bucket in self.buckets.iter() {
            let bucket = bucket.lock();
            for &h in bucket.iter() {
                self.pool.with(h, |e| {
                    if pred(e) {
                        f(e);
                    }
                });
            }
        }
    }

    /// Bulk-delete every entry matching `pred`, returning the count.
    pub fn delete_matching(&self, pred: impl Fn(&FlowEntry) -> bool) -> usize {
        let _fence = self.fence.read();
        let mut removed = 0;
        for bucket in self.buckets.iter() {
            let mut bucket = bucket.lock();
            bucket.retain(|&h| {
                let doomed = self.pool.with(h, |e| pred(e)) == Some(true);
                if doomed {
                    self.pool.free(h);
                    removed += 1;
                }
                !doomed
            });
        }
        removed
    }

    /// Receive-context teardown: drop every flow the context owns.
    pub fn delete_for_context(&self, context_id: u32) -> usize {
        self.delete_matching(|e| e.context_id == context_id)
    }

    /// Reset path: invalidate everything. Excludes all per-entry
    /// operations for the duration.
    pub fn invalidate_all(&self) -> usize {
        let _fence = self.fence.write();
        let mut removed = 0;
        for bucket in self.buckets.iter() {
            let mut bucket = bucket.lock();
            for h in bucket.drain(..) {
                if self.pool.free(h).is_some() {
                    removed += 1;
                }
            }
        }
        removed
    }
}
