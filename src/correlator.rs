//! Firmware request/response correlation.
//!
//! A request that wants a reply draws a completion id from a 256-bit free
//! set (byte-indexed, bit-addressed), stamps it into the outgoing record,
//! and waits. The reply carries the id back and may arrive in any order
//! relative to other replies; correctness depends on the id alone.
//!
//! The id's bit is returned to the free set only by the explicit
//! [`CompletionCorrelator::release`] the waiter's caller performs after
//! `wait` returns, success or timeout. Freeing it from the response path
//! would let a new request reuse the id while the old waiter still reads
//! the slot.
//!
//! Per request: `Idle -> WaitingForReply -> {Replied | TimedOut}`.

use core::sync::atomic::{AtomicU8, Ordering};
use core::time::Duration;
use parking_lot::{Condvar, Mutex};
use std::time::Instant;

/// Maximum concurrently outstanding requests per device instance.
pub const MAX_PENDING: usize = 256;

/// Coarse increment for the bounded wait loop.
const WAIT_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionId(pub(crate) u8);

impl CompletionId {
    pub fn raw(&self) -> u8 {
        self.0
    }
}

/// The id space is exhausted. Try again later; not a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoIdsAvailable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// No reply within the caller's timeout.
    Timeout,
    /// A device reset flushed all pending waits.
    Cancelled,
    /// The id has no registered request.
    NotPending,
}

impl core::fmt::Display for WaitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out waiting for firmware response"),
            Self::Cancelled => write!(f, "wait cancelled by device reset"),
            Self::NotPending => write!(f, "completion id has no pending request"),
        }
    }
}

#[derive(Default)]
struct Pending {
    active: bool,
    triggered: bool,
    cancelled: bool,
    response: u64,
}

struct PendingSlot {
    state: Mutex<Pending>,
    cond: Condvar,
}

pub struct CompletionCorrelator {
    // Bit i of byte i/8 set = id i claimed.
    bitmap: [AtomicU8; MAX_PENDING / 8],
    slots: Vec<PendingSlot>,
}

impl CompletionCorrelator {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_PENDING);
        slots.resize_with(MAX_PENDING, || PendingSlot {
            state: Mutex::new(Pending::default()),
            cond: Condvar::new(),
        });

        Self {
            bitmap: core::array::from_fn(|_| AtomicU8::new(0)),
            slots,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.bitmap
            .iter()
            .map(|b| b.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Claim an id and register a wait entry for it. Fails fast when all
    /// 256 ids are in flight.
    pub fn setup(&self) -> Result<CompletionId, NoIdsAvailable> {
        for (byte_idx, byte) in self.bitmap.iter().enumerate() {
            let mut cur = byte.load(Ordering::Relaxed);
            while cur != 0xff {
                let bit = (!cur).trailing_zeros() as u8;
                match byte.compare_exchange_weak(
                    cur,
                    cur | (1 << bit),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let id = CompletionId(byte_idx as u8 * 8 + bit);
                        let mut p = self.slots[id.0 as usize].state.lock();
                        *p = Pending {
                            active: true,
                            ..Pending::default()
                        };
                        return Ok(id);
                    }
                    Err(now) => cur = now,
                }
            }
        }

        Err(NoIdsAvailable)
    }

    /// Block until the response for `id` arrives or `timeout` elapses.
    /// Polls in coarse increments; this is the only blocking operation in
    /// the crate.
    pub fn wait(&self, id: CompletionId, timeout: Duration) -> Result<u64, WaitError> {
        let slot = &self.slots[id.0 as usize];
        let deadline = Instant::now() + timeout;
        let mut p = slot.state.lock();

        if !p.active {
            return Err(WaitError::NotPending);
        }

        loop {
            if p.triggered {
                return Ok(p.response);
            }
            if p.cancelled {
                return Err(WaitError::Cancelled);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout);
            }

            let slice = WAIT_SLICE.min(deadline - now);
            let _ = slot.cond.wait_for(&mut p, slice);
        }
    }

    /// Firmware-event dispatch path: store the response word, set the
    /// triggered flag, wake the waiter. A response whose id has no pending
    /// entry (already timed out and released, or spurious) is logged and
    /// dropped. Never frees the id.
    pub fn handle_response(&self, id: CompletionId, word: u64) {
        let byte = &self.bitmap[id.0 as usize / 8];
        if byte.load(Ordering::Acquire) & (1 << (id.0 % 8)) == 0 {
            log::warn!("correlator: response for unclaimed id {}, dropped", id.0);
            return;
        }

        let slot = &self.slots[id.0 as usize];
        let mut p = slot.state.lock();
        if !p.active {
            log::warn!("correlator: response for stale id {}, dropped", id.0);
            return;
        }

        p.response = word;
        p.triggered = true;
        slot.cond.notify_all();
    }

    /// Return `id` to the free set. Performed by `wait`'s caller after the
    /// wait finished, success or timeout; the slot is dead from here on.
    pub fn release(&self, id: CompletionId) {
        {
            let mut p = self.slots[id.0 as usize].state.lock();
            *p = Pending::default();
        }
        self.bitmap[id.0 as usize / 8].fetch_and(!(1 << (id.0 % 8)), Ordering::Release);
    }

    /// Reset flush: force every outstanding wait to complete with
    /// [`WaitError::Cancelled`]. Ids stay claimed until their owners
    /// observe the cancellation and release them.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for (byte_idx, byte) in self.bitmap.iter().enumerate() {
            let bits = byte.load(Ordering::Acquire);
            if bits == 0 {
                continue;
            }
            for bit in 0..8 {
                if bits & (1 << bit) == 0 {
                    continue;
                }
                let slot = &self.slots[byte_idx * 8 + bit];
                let mut p = slot.state.lock();
                if p.active && !p.triggered {
                    p.cancelled = true;
                    cancelled += 1;
                }
                slot.cond.notify_all();
            }
        }
        cancelled
    }
}

impl Default for CompletionCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn response_before_wait_is_returned() {
        let c = CompletionCorrelator::new();
        let id = c.setup().unwrap();
        c.handle_response(id, 0xdead_beef);
        assert_eq!(c.wait(id, SHORT), Ok(0xdead_beef));
        c.release(id);
        assert_eq!(c.outstanding(), 0);
    }

    #[test]
    fn wait_times_out_without_response() {
        let c = CompletionCorrelator::new();
        let id = c.setup().unwrap();
        assert_eq!(c.wait(id, Duration::from_millis(30)), Err(WaitError::Timeout));
        c.release(id);
    }

    #[test]
    fn spurious_response_is_noop() {
        let c = CompletionCorrelator::new();
        c.handle_response(CompletionId(42), 1);

        // State is untouched: the id is still allocatable and behaves.
        let ids: Vec<_> = (0..=42).map(|_| c.setup().unwrap()).collect();
        assert_eq!(ids[42].raw(), 42);
        c.handle_response(ids[42], 7);
        assert_eq!(c.wait(ids[42], SHORT), Ok(7));
        for id in ids {
            c.release(id);
        }
    }

    #[test]
    fn id_space_exhaustion_and_single_reuse() {
        let c = CompletionCorrelator::new();
        let ids: Vec<_> = (0..MAX_PENDING).map(|_| c.setup().unwrap()).collect();
        assert_eq!(c.setup(), Err(NoIdsAvailable));

        // One wait completes and its caller releases: exactly one setup
        // succeeds again.
        c.handle_response(ids[17], 9);
        assert_eq!(c.wait(ids[17], SHORT), Ok(9));
        c.release(ids[17]);
        let again = c.setup().unwrap();
        assert_eq!(again.raw(), 17);
        assert_eq!(c.setup(), Err(NoIdsAvailable));
    }

    #[test]
    fn out_of_order_responses_match_by_id() {
        let c = CompletionCorrelator::new();
        let a = c.setup().unwrap();
        let b = c.setup().unwrap();
        c.handle_response(b, 2);
        c.handle_response(a, 1);
        assert_eq!(c.wait(a, SHORT), Ok(1));
        assert_eq!(c.wait(b, SHORT), Ok(2));
        c.release(a);
        c.release(b);
    }

    #[test]
    fn cross_thread_wake() {
        let c = Arc::new(CompletionCorrelator::new());
        let id = c.setup().unwrap();

        let waiter = {
            let c = c.clone();
            std::thread::spawn(move || c.wait(id, Duration::from_secs(5)))
        };

        std::thread::sleep(Duration::from_millis(20));
        c.handle_response(id, 0x55);
        assert_eq!(waiter.join().unwrap(), Ok(0x55));
        c.release(id);
    }

    #[test]
    fn cancel_all_flushes_pending_waits() {
        let c = Arc::new(CompletionCorrelator::new());
        let id = c.setup().unwrap();

        let waiter = {
            let c = c.clone();
            std::thread::spawn(move || c.wait(id, Duration::from_secs(5)))
        };

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(c.cancel_all(), 1);
        assert_eq!(waiter.join().unwrap(), Err(WaitError::Cancelled));

        // Cancellation does not free the id; the owner's release does.
        assert_eq!(c.outstanding(), 1);
        c.release(id);
        assert_eq!(c.outstanding(), 0);
    }
}
