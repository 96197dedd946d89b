//! Accelerated backend: buffer-descriptor submission.
//!
//! Pre-built descriptors reference staging and write-back memory by
//! region offset, saving the synchronous path's copy-in/copy-out. Any
//! per-call failure here falls back to the synchronous backend for that
//! call only; the connection is never demoted permanently.

use std::sync::Arc;
use std::thread::JoinHandle;

use hostlink_core::{
    encode_record, AccessHint, Call, Direction, HostPort, OpCode, PortError, SubmitCtrl,
    SubmitDesc, SubmitQueue, KIND_DATA,
};
use hostlink_shm::{Heap, RegionBuf, SharedRegion};

use crate::cache::BufferCache;
use crate::dispatch::{run_worker, DispatchShared, DispatchTable, Inflight, WorkerCtx};
use crate::stats::ConnStats;

/// Why a call left the accelerated path.
#[derive(Debug)]
pub(crate) enum FallbackReason {
    PoolExhausted,
    CacheExhausted,
    Submit(PortError),
    Encode,
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PoolExhausted => write!(f, "submit pool exhausted"),
            Self::CacheExhausted => write!(f, "write-back cache exhausted"),
            Self::Submit(e) => write!(f, "submission rejected: {}", e),
            Self::Encode => write!(f, "record encoding failed"),
        }
    }
}

pub(crate) struct SubmitBackend {
    queue: Arc<dyn SubmitQueue>,
    region: Arc<SharedRegion>,
    pool: Arc<Heap>,
    cache: Arc<BufferCache>,
    table: Arc<DispatchTable>,
    shared: Arc<DispatchShared>,
    stats: Arc<ConnStats>,
    worker: Option<JoinHandle<()>>,
}

impl SubmitBackend {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        queue: Arc<dyn SubmitQueue>,
        region: Arc<SharedRegion>,
        pool: Arc<Heap>,
        cache: Arc<BufferCache>,
        port: Arc<dyn HostPort>,
        stats: Arc<ConnStats>,
        queue_depth: usize,
    ) -> Self {
        let table = Arc::new(DispatchTable::default());
        let shared = Arc::new(DispatchShared::new(queue_depth));
        queue.bind(shared.clone());

        let ctx = WorkerCtx {
            region: region.clone(),
            cache: cache.clone(),
            pool: pool.clone(),
            queue: queue.clone(),
            port,
            table: table.clone(),
            stats: stats.clone(),
        };
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("hostlink-dispatch".into())
            .spawn(move || run_worker(worker_shared, ctx))
            .expect("spawn dispatch worker");

        Self {
            queue,
            region,
            pool,
            cache,
            table,
            shared,
            stats,
            worker: Some(worker),
        }
    }

    fn stage(&self, bytes: &[u8]) -> Result<RegionBuf, FallbackReason> {
        let buf = self
            .pool
            .alloc(bytes.len() as u32)
            .map_err(|_| FallbackReason::PoolExhausted)?;
        if self.region.write_at(buf.offset(), bytes).is_err() {
            let _ = self.pool.free(buf);
            return Err(FallbackReason::PoolExhausted);
        }
        Ok(buf)
    }

    fn free_pool(&self, buf: RegionBuf) {
        if let Err(e) = self.pool.free(buf) {
            tracing::error!(error = %e, "failed to free staging buffer");
        }
    }

    /// Combined send+receive in one host round trip.
    ///
    /// On success the completion arrives at the dispatcher; the caller
    /// blocks on the call's waiter.
    pub fn write_read(
        &self,
        call: &Arc<Call>,
        client: u32,
        payload: &[u8],
        max_len: u32,
    ) -> Result<(), FallbackReason> {
        let mut record = Vec::with_capacity(hostlink_core::RECORD_HEADER_SIZE + payload.len());
        encode_record(&mut record, call.tag(), KIND_DATA, payload)
            .map_err(|_| FallbackReason::Encode)?;

        let mut ctrl_bytes = [0u8; SubmitCtrl::WIRE_SIZE];
        SubmitCtrl {
            op: OpCode::WriteRead,
            flags: 0,
            client,
            tag: call.tag().get(),
        }
        .encode(&mut ctrl_bytes);

        let ctrl = self.stage(&ctrl_bytes)?;
        let data = match self.stage(&record) {
            Ok(buf) => buf,
            Err(e) => {
                self.free_pool(ctrl);
                return Err(e);
            }
        };
        let wb = match self.cache.acquire(max_len) {
            Ok(buf) => buf,
            Err(_) => {
                self.free_pool(ctrl);
                self.free_pool(data);
                return Err(FallbackReason::CacheExhausted);
            }
        };

        let descs = [
            SubmitDesc {
                offset: ctrl.offset(),
                len: SubmitCtrl::WIRE_SIZE as u32,
                dir: Direction::ToHost,
                access: AccessHint::Sequential,
            },
            SubmitDesc {
                offset: data.offset(),
                len: record.len() as u32,
                dir: Direction::ToHost,
                access: AccessHint::Sequential,
            },
            SubmitDesc {
                offset: wb.offset(),
                len: wb.len(),
                dir: Direction::FromHost,
                access: AccessHint::Sequential,
            },
        ];

        self.dispatch(call, client, wb, vec![ctrl, data], &descs, payload.len())
    }

    /// Blocking read of pending host data.
    pub fn read(
        &self,
        call: &Arc<Call>,
        client: u32,
        max_len: u32,
    ) -> Result<(), FallbackReason> {
        let mut ctrl_bytes = [0u8; SubmitCtrl::WIRE_SIZE];
        SubmitCtrl {
            op: OpCode::Read,
            flags: 0,
            client,
            tag: call.tag().get(),
        }
        .encode(&mut ctrl_bytes);

        let ctrl = self.stage(&ctrl_bytes)?;
        let wb = match self.cache.acquire(max_len) {
            Ok(buf) => buf,
            Err(_) => {
                self.free_pool(ctrl);
                return Err(FallbackReason::CacheExhausted);
            }
        };

        let descs = [
            SubmitDesc {
                offset: ctrl.offset(),
                len: SubmitCtrl::WIRE_SIZE as u32,
                dir: Direction::ToHost,
                access: AccessHint::Sequential,
            },
            SubmitDesc {
                offset: wb.offset(),
                len: wb.len(),
                dir: Direction::FromHost,
                access: AccessHint::Sequential,
            },
        ];

        self.dispatch(call, client, wb, vec![ctrl], &descs, 0)
    }

    fn dispatch(
        &self,
        call: &Arc<Call>,
        client: u32,
        wb: RegionBuf,
        staging: Vec<RegionBuf>,
        descs: &[SubmitDesc],
        sent: usize,
    ) -> Result<(), FallbackReason> {
        let token = self.table.alloc_token();
        self.table.insert(
            token,
            Inflight {
                call: call.clone(),
                client,
                writeback: Some(wb),
                staging,
            },
        );

        match self.queue.submit(token, descs) {
            Ok(()) => {
                ConnStats::add(&self.stats.bytes_sent, sent as u64);
                Ok(())
            }
            Err(e) => {
                // Unwind the registration; the sync backend takes this call.
                if let Some(entry) = self.table.remove(token) {
                    for buf in entry.staging {
                        self.free_pool(buf);
                    }
                    if let Some(wb) = entry.writeback {
                        self.cache.release(wb);
                    }
                }
                Err(FallbackReason::Submit(e))
            }
        }
    }
}

impl Drop for SubmitBackend {
    fn drop(&mut self) {
        self.shared.shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
