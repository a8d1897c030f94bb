//! Device context: the external surface of the receive data path.
//!
//! One [`DeviceContext`] per adapter. Receive queues are independent and
//! each sits behind its own mutex, so interrupts for different queues can
//! be serviced on different cores in parallel. The TX command ring is one
//! shared structure drained by whichever poller wins its try-lock.
//!
//! Lock order: `inner` read/write lock, then one queue's `rx` mutex, then
//! flow-table locks. The TX mutex is only ever try-locked from poll
//! context, so it never participates in a cycle.

use crate::correlator::{CompletionCorrelator, NoIdsAvailable, WaitError};
use crate::dma::DmaAllocator;
use crate::flow::FlowHashTable;
use crate::lro::{parse_ipv4_tcp, try_initiate_lro, AdmissionOutcome, SampleGate};
use crate::poller::{
    reap_tx, PollOutcome, PollResult, RxQueue, RxQueueStats, TxQueue, TxQueueStats,
};
use crate::proto::{
    CommandRecord, DeliveredPacket, FirmwareRequest, HandoffFlags, RequestBody, StatusDescriptor,
};
use crate::ring::{RingCreateErr, RingStats};
use crate::rx_buffer::{ReceiveBufferPool, RxPoolStats};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use core::time::Duration;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPathConfig {
    pub num_queues: usize,
    pub status_ring_size: u32,
    pub rx_ring_size: u32,
    pub cmd_ring_size: u32,
    pub rx_buf_len: usize,
    /// Minimum free receive buffers kept in reserve for reposting.
    pub post_threshold: usize,
    pub lro_enabled: bool,
    /// Flow-cache capacity, normally the firmware-advertised maximum.
    pub max_lro_flows: usize,
    /// Admission sampling mask; 0 examines every packet.
    pub lro_sample_mask: u32,
    /// Descriptors processed per poll before yielding.
    pub poll_budget: u32,
}

impl Default for DataPathConfig {
    fn default() -> Self {
        Self {
            num_queues: 4,
            status_ring_size: 256,
            rx_ring_size: 256,
            cmd_ring_size: 256,
            rx_buf_len: 2048,
            post_threshold: 8,
            lro_enabled: true,
            max_lro_flows: 1024,
            lro_sample_mask: 3,
            poll_budget: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErr {
    BadConfig,
    RingCreate(RingCreateErr),
    InvalidQueue,
    NotRunning,
    /// Firmware overran the status ring; events were lost upstream.
    StatusRingFull,
    /// Command ring full. Backpressure, not failure: retry after reclaim.
    TxQueueStopped,
    NoCompletionIds,
    Wait(WaitError),
}

impl core::fmt::Display for DriverErr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BadConfig => write!(f, "invalid data path configuration"),
            Self::RingCreate(e) => write!(f, "{e}"),
            Self::InvalidQueue => write!(f, "queue id out of range"),
            Self::NotRunning => write!(f, "device is not up"),
            Self::StatusRingFull => write!(f, "status ring overrun"),
            Self::TxQueueStopped => write!(f, "command ring full, queue stopped"),
            Self::NoCompletionIds => write!(f, "all completion ids in flight"),
            Self::Wait(e) => write!(f, "{e}"),
        }
    }
}

impl From<RingCreateErr> for DriverErr {
    fn from(e: RingCreateErr) -> Self {
        Self::RingCreate(e)
    }
}

impl From<NoIdsAvailable> for DriverErr {
    fn from(_: NoIdsAvailable) -> Self {
        Self::NoCompletionIds
    }
}

impl From<WaitError> for DriverErr {
    fn from(e: WaitError) -> Self {
        Self::Wait(e)
    }
}

struct Queue {
    rx: Mutex<RxQueue>,
    /// Interrupt rearm state. Cleared on entry to interrupt service and set
    /// again only when the poll fully drained the ring.
    armed: AtomicBool,
}

struct DeviceInner {
    running: bool,
}

/// Aggregated counters for one snapshot call.
#[derive(Debug, Clone, Default)]
pub struct DeviceStats {
    pub queues: Vec<QueueStats>,
    pub tx: TxQueueStats,
    pub active_flows: usize,
    pub outstanding_requests: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub rx: RxQueueStats,
    pub pool: RxPoolStats,
    pub status_ring: RingStats,
    pub buf_ring: RingStats,
}

pub struct DeviceContext {
    cfg: DataPathConfig,
    que: Vec<Queue>,
    tx: Mutex<TxQueue>,
    /// TX descriptors reported reclaimable but not yet applied, kept here
    /// so a poller that loses the TX try-lock race loses no counts.
    tx_reclaim_pending: AtomicU32,
    flow_table: FlowHashTable,
    correlator: CompletionCorrelator,
    sample: SampleGate,
    inner: RwLock<DeviceInner>,
}

impl DeviceContext {
    pub fn new(
        cfg: DataPathConfig,
        allocator: Arc<dyn DmaAllocator>,
    ) -> Result<Self, DriverErr> {
        if cfg.num_queues == 0 || cfg.rx_buf_len == 0 {
            return Err(DriverErr::BadConfig);
        }

        let mut que = Vec::with_capacity(cfg.num_queues);
        for qid in 0..cfg.num_queues {
            let pool = ReceiveBufferPool::new(
                cfg.rx_ring_size as usize,
                cfg.rx_buf_len,
                cfg.post_threshold,
                allocator.clone(),
            );
            let rx = RxQueue::new(cfg.status_ring_size, cfg.rx_ring_size, pool, qid as u32)?;
            que.push(Queue {
                rx: Mutex::new(rx),
                armed: AtomicBool::new(false),
            });
        }

        Ok(Self {
            que,
            tx: Mutex::new(TxQueue::new(cfg.cmd_ring_size)?),
            tx_reclaim_pending: AtomicU32::new(0),
            flow_table: FlowHashTable::new(cfg.max_lro_flows),
            correlator: CompletionCorrelator::new(),
            sample: SampleGate::new(cfg.lro_sample_mask),
            inner: RwLock::new(DeviceInner { running: false }),
            cfg,
        })
    }

    pub fn num_queues(&self) -> usize {
        self.que.len()
    }

    /// Bring the data path up: post the initial buffer batches and arm
    /// every queue's interrupt.
    pub fn up(&self) {
        self.inner.write().running = true;
        for que in self.que.iter() {
            let mut rx = que.rx.lock();
            rx.accepting = true;
            rx.refill();
            que.armed.store(true, Ordering::Release);
        }
        log::info!("data path up, {} queues", self.que.len());
    }

    /// Stop delivering: completed packets drain their buffers back to FREE
    /// until the next `up`.
    pub fn down(&self) {
        self.inner.write().running = false;
        for que in self.que.iter() {
            que.rx.lock().accepting = false;
            que.armed.store(false, Ordering::Release);
        }
        log::info!("data path down");
    }

    fn queue(&self, que_id: usize) -> Result<&Queue, DriverErr> {
        self.que.get(que_id).ok_or(DriverErr::InvalidQueue)
    }

    /// Interrupt service entry for one queue. Runs a bounded poll and
    /// rearms only when the ring was fully drained; otherwise the caller
    /// must reschedule the poll.
    pub fn interrupt(&self, que_id: usize) -> Result<PollResult, DriverErr> {
        let que = self.queue(que_id)?;
        que.armed.store(false, Ordering::Release);

        let result = self.poll_queue(que_id)?;
        if result.outcome == PollOutcome::Drained {
            que.armed.store(true, Ordering::Release);
        }
        Ok(result)
    }

    pub fn is_armed(&self, que_id: usize) -> bool {
        self.que
            .get(que_id)
            .map(|q| q.armed.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// One bounded poll pass over a queue: drain its status ring, run LRO
    /// admission over the packets that arrived, then reap the shared TX
    /// ring if its lock is free.
    pub fn poll_queue(&self, que_id: usize) -> Result<PollResult, DriverErr> {
        if !self.inner.read().running {
            return Err(DriverErr::NotRunning);
        }
        let que = self.queue(que_id)?;

        let mut rx = que.rx.lock();
        let before = rx.read_queue.len();
        let result = rx.poll(
            &self.flow_table,
            &self.correlator,
            &self.tx_reclaim_pending,
            self.cfg.poll_budget,
        );

        let mut requests = Vec::new();
        if self.cfg.lro_enabled {
            let context_id = rx.context_id;
            for pkt in rx.read_queue.iter().skip(before) {
                if let Some(req) = self.admit(pkt, context_id) {
                    requests.push(req);
                }
            }
        }
        drop(rx);

        for req in requests {
            self.send_admission_request(req);
        }

        reap_tx(&self.tx, &self.tx_reclaim_pending);
        Ok(result)
    }

    fn admit(&self, pkt: &DeliveredPacket, context_id: u32) -> Option<FirmwareRequest> {
        if pkt.meta.flags.contains(HandoffFlags::LRO_AGGREGATED) {
            return None;
        }
        self.admit_segment(&pkt.data, context_id, pkt.meta.rss_hash)
    }

    fn admit_segment(&self, data: &[u8], context_id: u32, rss_hash: u32) -> Option<FirmwareRequest> {
        if !self.sample.admit() {
            return None;
        }
        let seg = parse_ipv4_tcp(data)?;
        match try_initiate_lro(&self.flow_table, &seg, context_id, rss_hash) {
            AdmissionOutcome::Requested(req) => Some(req),
            AdmissionOutcome::AlreadyAggregating
            | AdmissionOutcome::CacheFull
            | AdmissionOutcome::Ineligible => None,
        }
    }

    /// Transport-layer entry: examine one raw segment for LRO admission and,
    /// when a new flow is admitted, post the "add flow" request. Segments
    /// that fail the sampling gate, fail to parse, or are ineligible pass
    /// through unexamined; that is success, not an error.
    pub fn on_packet_in(
        &self,
        context_id: u32,
        segment: &[u8],
        rss_hash: u32,
    ) -> Result<(), DriverErr> {
        if !self.inner.read().running {
            return Err(DriverErr::NotRunning);
        }
        if context_id as usize >= self.que.len() {
            return Err(DriverErr::InvalidQueue);
        }
        if !self.cfg.lro_enabled {
            return Ok(());
        }

        if let Some(req) = self.admit_segment(segment, context_id, rss_hash) {
            self.send_admission_request(req);
        }
        Ok(())
    }

    /// Post a flow-admission request. The flow entry was inserted
    /// speculatively; if the command ring is full the entry is rolled back
    /// so a later packet of the flow retries admission.
    fn send_admission_request(&self, req: FirmwareRequest) {
        let key = match &req.body {
            RequestBody::AddLroFlow { key, .. } => Some(*key),
            _ => None,
        };

        if self.send_request(req).is_err() {
            if let Some(key) = key {
                self.flow_table.delete(&key);
            }
        }
    }

    /// Feed one firmware status event into a queue's ring. In production
    /// the firmware DMAs these; here the hardware adapter calls in.
    pub fn firmware_event(&self, que_id: usize, desc: StatusDescriptor) -> Result<(), DriverErr> {
        let que = self.queue(que_id)?;
        que.rx
            .lock()
            .status_ring
            .post(desc)
            .map_err(|_| DriverErr::StatusRingFull)
    }

    /// Pop the next delivered packet for the upper layer.
    pub fn recv(&self, que_id: usize) -> Result<Option<DeliveredPacket>, DriverErr> {
        Ok(self.queue(que_id)?.rx.lock().recv())
    }

    /// Queue an outbound frame. A full command ring is backpressure for
    /// the caller, never a drop inside this layer.
    pub fn send(&self, data: Vec<u8>) -> Result<(), DriverErr> {
        if !self.inner.read().running {
            return Err(DriverErr::NotRunning);
        }
        self.tx
            .lock()
            .enqueue(CommandRecord::TxPacket { data })
            .map_err(|_| DriverErr::TxQueueStopped)
    }

    /// Fire-and-forget firmware request. Descriptor reclaim is its only
    /// acknowledgement.
    pub fn send_request(&self, req: FirmwareRequest) -> Result<(), DriverErr> {
        self.tx
            .lock()
            .enqueue(CommandRecord::Request(req))
            .map_err(|_| DriverErr::TxQueueStopped)
    }

    /// Issue a request and block for its response word. The completion id
    /// is claimed here and released here, on every path out.
    pub fn send_request_wait(
        &self,
        mut req: FirmwareRequest,
        timeout: Duration,
    ) -> Result<u64, DriverErr> {
        let id = self.correlator.setup()?;
        req.completion_id = Some(id);

        if let Err(e) = self.send_request(req) {
            self.correlator.release(id);
            return Err(e);
        }

        let result = self.correlator.wait(id, timeout);
        self.correlator.release(id);
        Ok(result?)
    }

    /// Tear down one queue's receive context: stop deliveries, drop its
    /// flows, and tell the firmware to clean up its side. The cleanup
    /// request is best effort; descriptor reclaim acknowledges it.
    pub fn destroy_context(&self, que_id: usize) -> Result<(), DriverErr> {
        let que = self.queue(que_id)?;
        let context_id = {
            let mut rx = que.rx.lock();
            rx.accepting = false;
            rx.read_queue.clear();
            rx.context_id
        };

        let removed = self.flow_table.delete_for_context(context_id);
        log::info!("context {context_id} destroyed, {removed} flows dropped");

        let req = FirmwareRequest {
            context_id,
            completion_id: None,
            body: RequestBody::CleanupContext,
        };
        if self.send_request(req).is_err() {
            log::warn!("context {context_id}: cleanup request deferred, command ring full");
        }
        Ok(())
    }

    /// Device reset flush: every pending wait completes with `Cancelled`
    /// and the whole flow cache is invalidated. Ids stay claimed until
    /// their waiters observe the cancellation.
    pub fn reset_flush(&self) {
        self.inner.write().running = false;
        let cancelled = self.correlator.cancel_all();
        let flows = self.flow_table.invalidate_all();
        log::warn!("reset flush: {cancelled} waits cancelled, {flows} flows invalidated");
    }

    /// Periodic maintenance: retry buffer mappings that failed earlier and
    /// apply any TX reclaim a busy poller left behind.
    pub fn watchdog_tick(&self) {
        for que in self.que.iter() {
            if let Some(mut rx) = que.rx.try_lock() {
                rx.refill();
            }
        }
        reap_tx(&self.tx, &self.tx_reclaim_pending);
    }

    pub fn active_flows(&self) -> usize {
        self.flow_table.len()
    }

    pub fn stats(&self) -> DeviceStats {
        let queues = self
            .que
            .iter()
            .map(|q| {
                let rx = q.rx.lock();
                QueueStats {
                    rx: rx.stats,
                    pool: rx.pool.stats(),
                    status_ring: rx.status_ring.stats(),
                    buf_ring: rx.buf_ring.stats(),
                }
            })
            .collect();

        DeviceStats {
            queues,
            tx: self.tx.lock().stats,
            active_flows: self.flow_table.len(),
            outstanding_requests: self.correlator.outstanding(),
        }
    }
}
