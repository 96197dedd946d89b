//! Completion dispatch for the accelerated submit path.
//!
//! Host completions may arrive from an interrupt-equivalent context. The
//! sink entry ([`DispatchShared::complete`]) is non-blocking and
//! allocation-free: it writes into a pre-sized lock-free queue and nudges
//! the deferred worker. The worker finalizes calls — copying write-back
//! data, recycling buffers, and running the corrective-retry sub-path for
//! undersized write-back buffers — and is the only place allowed to block.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use hostlink_core::{
    Call, CallHeader, CallOutcome, CallToken, CompletionSink, CompletionStatus, HostPort, OpCode,
    PortError, StatusCode, SubmitCtrl, SubmitDesc, SubmitQueue,
};
use hostlink_shm::{Heap, RegionBuf, SharedRegion};

use crate::cache::BufferCache;
use crate::stats::ConnStats;

// =============================================================================
// Pre-sized lock-free completion queue
// =============================================================================

struct QueueSlot {
    seq: AtomicUsize,
    value: UnsafeCell<(CallToken, CompletionStatus)>,
}

/// Bounded MPMC queue carrying completions out of the interrupt-equivalent
/// context. Push never blocks and never allocates.
pub(crate) struct CompletionQueue {
    slots: Box<[QueueSlot]>,
    mask: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

// SAFETY: slot values are only touched by the thread that won the slot's
// sequence handshake below.
unsafe impl Sync for CompletionQueue {}
unsafe impl Send for CompletionQueue {}

impl CompletionQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two() && capacity >= 2);
        let slots = (0..capacity)
            .map(|i| QueueSlot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new((0, CompletionStatus::Done { len: 0 })),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, token: CallToken, status: CompletionStatus) -> Result<(), ()> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the sequence handshake gives this thread
                        // exclusive access to the slot value.
                        unsafe { *slot.value.get() = (token, status) };
                        slot.seq.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return Err(()); // full
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    pub fn pop(&self) -> Option<(CallToken, CompletionStatus)> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as isize - (pos + 1) as isize;
            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the sequence handshake gives this thread
                        // exclusive access to the slot value.
                        let value = unsafe { *slot.value.get() };
                        slot.seq.store(pos + self.mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }
}

// =============================================================================
// In-flight table
// =============================================================================

/// One registered submission awaiting its completion.
pub(crate) struct Inflight {
    pub call: Arc<Call>,
    pub client: u32,
    /// Write-back buffer, owned by this call while in flight.
    pub writeback: Option<RegionBuf>,
    /// Staging buffers (control + payload) to return to the submit pool.
    pub staging: Vec<RegionBuf>,
}

#[derive(Default)]
pub(crate) struct DispatchTable {
    next_token: AtomicU64,
    inner: Mutex<HashMap<CallToken, Inflight>>,
}

impl DispatchTable {
    pub fn alloc_token(&self) -> CallToken {
        self.next_token.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn insert(&self, token: CallToken, entry: Inflight) {
        self.inner.lock().insert(token, entry);
    }

    pub fn remove(&self, token: CallToken) -> Option<Inflight> {
        self.inner.lock().remove(&token)
    }
}

// =============================================================================
// Sink + worker
// =============================================================================

/// State shared between the interrupt-context sink and the worker.
pub(crate) struct DispatchShared {
    queue: CompletionQueue,
    wake: Mutex<()>,
    wake_cv: Condvar,
    shutdown: AtomicBool,
    dropped: AtomicU64,
}

impl DispatchShared {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue: CompletionQueue::new(queue_depth),
            wake: Mutex::new(()),
            wake_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake_cv.notify_all();
    }
}

impl CompletionSink for DispatchShared {
    fn complete(&self, token: CallToken, status: CompletionStatus) {
        if self.queue.push(token, status).is_err() {
            // The queue is sized to the configured submission depth; an
            // overflow means the platform completed more than it accepted.
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::error!(token, "completion queue overflow; completion dropped");
            return;
        }
        // No lock taken here: the worker waits with a bounded timeout, so a
        // lost notify costs at most one tick.
        self.wake_cv.notify_one();
    }
}

/// Everything the worker needs to finalize calls.
pub(crate) struct WorkerCtx {
    pub region: Arc<SharedRegion>,
    pub cache: Arc<BufferCache>,
    pub pool: Arc<Heap>,
    pub queue: Arc<dyn SubmitQueue>,
    pub port: Arc<dyn HostPort>,
    pub table: Arc<DispatchTable>,
    pub stats: Arc<ConnStats>,
}

pub(crate) fn run_worker(shared: Arc<DispatchShared>, ctx: WorkerCtx) {
    loop {
        while let Some((token, status)) = shared.queue.pop() {
            finalize(&ctx, token, status);
        }
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let mut guard = shared.wake.lock();
        let _ = shared
            .wake_cv
            .wait_for(&mut guard, Duration::from_millis(1));
    }
}

fn free_staging(ctx: &WorkerCtx, staging: Vec<RegionBuf>) {
    for buf in staging {
        if let Err(e) = ctx.pool.free(buf) {
            tracing::error!(error = %e, "failed to return staging buffer to pool");
        }
    }
}

fn deliver(ctx: &WorkerCtx, call: &Call, outcome: CallOutcome) {
    if call.complete(outcome) {
        ConnStats::add(&ctx.stats.completions, 1);
    }
}

fn finalize(ctx: &WorkerCtx, token: CallToken, status: CompletionStatus) {
    let Some(mut entry) = ctx.table.remove(token) else {
        tracing::warn!(token, "completion for unknown token");
        return;
    };
    free_staging(ctx, std::mem::take(&mut entry.staging));

    match status {
        CompletionStatus::Done { len } => {
            let Some(wb) = entry.writeback.take() else {
                deliver(ctx, &entry.call, CallOutcome::FailedIo(StatusCode::Io));
                return;
            };
            if len > wb.len() {
                tracing::error!(len, cap = wb.len(), "host wrote past the write-back buffer");
                ctx.cache.release(wb);
                deliver(ctx, &entry.call, CallOutcome::FailedIo(StatusCode::Io));
                return;
            }
            let mut data = vec![0u8; len as usize];
            if ctx.region.read_at(wb.offset(), &mut data).is_err() {
                ctx.cache.release(wb);
                deliver(ctx, &entry.call, CallOutcome::FailedIo(StatusCode::Io));
                return;
            }
            ctx.cache.release(wb);
            ConnStats::add(&ctx.stats.bytes_received, len as u64);
            deliver(ctx, &entry.call, CallOutcome::Completed(data));
        }
        CompletionStatus::BufferTooSmall { required } => {
            overflow_retry(ctx, token, entry, required);
        }
        CompletionStatus::Failed(code) => {
            if let Some(wb) = entry.writeback.take() {
                ctx.cache.release(wb);
            }
            deliver(ctx, &entry.call, CallOutcome::FailedIo(code));
        }
    }
}

/// Corrective sub-path: grow the write-back buffer and re-read.
///
/// The caller's callback has not fired; it fires exactly once, after the
/// corrective transaction finishes (or fails).
fn overflow_retry(ctx: &WorkerCtx, token: CallToken, mut entry: Inflight, required: u32) {
    ConnStats::add(&ctx.stats.overflow_retries, 1);

    if !entry.call.begin_corrective_retry() {
        // Second undersize report for the same call; surface the overflow.
        if let Some(wb) = entry.writeback.take() {
            ctx.cache.release(wb);
        }
        deliver(ctx, &entry.call, CallOutcome::FailedOverflow { required });
        return;
    }

    let Some(old_wb) = entry.writeback.take() else {
        deliver(ctx, &entry.call, CallOutcome::FailedIo(StatusCode::Io));
        return;
    };
    let wb = match ctx.cache.grow(old_wb, required) {
        Ok(wb) => wb,
        Err(e) => {
            tracing::warn!(required, error = %e, "cannot grow write-back buffer");
            deliver(ctx, &entry.call, CallOutcome::FailedOverflow { required });
            return;
        }
    };

    tracing::debug!(token, required, "issuing corrective read");

    // Stage the corrective control block.
    let ctrl = match ctx.pool.alloc(SubmitCtrl::WIRE_SIZE as u32) {
        Ok(buf) => buf,
        Err(_) => {
            sync_corrective_read(ctx, entry, wb);
            return;
        }
    };
    let mut ctrl_bytes = [0u8; SubmitCtrl::WIRE_SIZE];
    SubmitCtrl {
        op: OpCode::Read,
        flags: 0,
        client: entry.client,
        tag: entry.call.tag().get(),
    }
    .encode(&mut ctrl_bytes);
    if ctx.region.write_at(ctrl.offset(), &ctrl_bytes).is_err() {
        let _ = ctx.pool.free(ctrl);
        sync_corrective_read(ctx, entry, wb);
        return;
    }

    let descs = [
        SubmitDesc {
            offset: ctrl.offset(),
            len: SubmitCtrl::WIRE_SIZE as u32,
            dir: hostlink_core::Direction::ToHost,
            access: hostlink_core::AccessHint::Sequential,
        },
        SubmitDesc {
            offset: wb.offset(),
            len: wb.len(),
            dir: hostlink_core::Direction::FromHost,
            access: hostlink_core::AccessHint::Sequential,
        },
    ];

    // Register before submitting so an instant completion finds the entry.
    entry.writeback = Some(wb);
    entry.staging = vec![ctrl];
    ctx.table.insert(token, entry);

    if let Err(e) = ctx.queue.submit(token, &descs) {
        // Accelerated path failed mid-retry: finish this call on the
        // synchronous backend instead.
        tracing::debug!(token, error = %e, "corrective submit failed; using sync read");
        let Some(mut entry) = ctx.table.remove(token) else {
            return;
        };
        free_staging(ctx, std::mem::take(&mut entry.staging));
        match entry.writeback.take() {
            Some(wb) => sync_corrective_read(ctx, entry, wb),
            None => deliver(ctx, &entry.call, CallOutcome::FailedIo(StatusCode::Io)),
        }
    }
}

fn sync_corrective_read(ctx: &WorkerCtx, entry: Inflight, wb: RegionBuf) {
    let mut input = Vec::with_capacity(CallHeader::WIRE_SIZE);
    CallHeader {
        client: entry.client,
        flags: 0,
    }
    .encode(&mut input);

    let out = {
        let ptr = ctx
            .region
            .ptr_at(wb.offset(), wb.len() as usize)
            .expect("write-back buffer within region");
        // SAFETY: this call owns `wb`; nothing else aliases the range.
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), wb.len() as usize) }
    };

    match ctx.port.transact(OpCode::Read, &input, out) {
        Ok(n) => {
            let data = out[..n].to_vec();
            ctx.cache.release(wb);
            ConnStats::add(&ctx.stats.bytes_received, n as u64);
            deliver(ctx, &entry.call, CallOutcome::Completed(data));
        }
        Err(PortError::BufferTooSmall { required }) => {
            ctx.cache.release(wb);
            deliver(ctx, &entry.call, CallOutcome::FailedOverflow { required });
        }
        Err(PortError::Unavailable) => {
            ctx.cache.release(wb);
            deliver(
                ctx,
                &entry.call,
                CallOutcome::FailedIo(StatusCode::TransportUnavailable),
            );
        }
        Err(PortError::Io(code)) => {
            ctx.cache.release(wb);
            deliver(ctx, &entry.call, CallOutcome::FailedIo(code));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_push_pop_fifo() {
        let q = CompletionQueue::new(8);
        for i in 0..5u64 {
            q.push(i, CompletionStatus::Done { len: i as u32 }).unwrap();
        }
        for i in 0..5u64 {
            let (token, status) = q.pop().unwrap();
            assert_eq!(token, i);
            assert_eq!(status, CompletionStatus::Done { len: i as u32 });
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn queue_rejects_when_full() {
        let q = CompletionQueue::new(2);
        q.push(1, CompletionStatus::Done { len: 0 }).unwrap();
        q.push(2, CompletionStatus::Done { len: 0 }).unwrap();
        assert!(q.push(3, CompletionStatus::Done { len: 0 }).is_err());
        q.pop().unwrap();
        q.push(3, CompletionStatus::Done { len: 0 }).unwrap();
    }

    #[test]
    fn queue_concurrent_producers() {
        let q = Arc::new(CompletionQueue::new(256));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = q.clone();
                std::thread::spawn(move || {
                    for i in 0..32u64 {
                        q.push(t * 100 + i, CompletionStatus::Done { len: 0 })
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let mut seen = std::collections::HashSet::new();
        while let Some((token, _)) = q.pop() {
            assert!(seen.insert(token));
        }
        assert_eq!(seen.len(), 128);
    }

    #[test]
    fn table_tokens_are_unique() {
        let table = DispatchTable::default();
        let a = table.alloc_token();
        let b = table.alloc_token();
        assert_ne!(a, b);
        assert!(table.remove(a).is_none());
    }
}
