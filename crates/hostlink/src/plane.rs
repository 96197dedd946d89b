//! The per-connection data plane: shared region, ring, heaps, cache and
//! (when the platform has one) the accelerated submit backend.
//!
//! Created lazily on first use, exactly once per connection, by the
//! atomic init machinery in `hostlink-shm`.

use std::sync::Arc;

use hostlink_core::{HostPort, LinkError, SubmitQueue};
use hostlink_shm::{Heap, RegionBuf, RegionError, Ring, SharedRegion};

use crate::config::ConnectorConfig;
use crate::cache::BufferCache;
use crate::stats::ConnStats;
use crate::submit_backend::SubmitBackend;

pub(crate) struct DataPlane {
    pub region: Arc<SharedRegion>,
    pub ring: Ring,
    pub heap: Arc<Heap>,
    pub cache: Arc<BufferCache>,
    pub submit: Option<SubmitBackend>,
}

impl DataPlane {
    pub fn create(
        config: &ConnectorConfig,
        port: Arc<dyn HostPort>,
        submit_queue: Option<Arc<dyn SubmitQueue>>,
        stats: Arc<ConnStats>,
    ) -> Result<Arc<Self>, LinkError> {
        let region = SharedRegion::create(config.region.clone()).map_err(region_err)?;
        let layout = *region.layout();

        let ring = Ring::new(region.clone());
        let heap = Arc::new(Heap::new(
            hostlink_core::RegionOffset::new(layout.heap as u32),
            config.region.heap_bytes,
        ));
        let cache = Arc::new(BufferCache::new(heap.clone()));

        let submit = match submit_queue {
            Some(queue) => {
                let pool = Arc::new(Heap::new(
                    hostlink_core::RegionOffset::new(layout.submit_pool as u32),
                    config.region.submit_bytes,
                ));
                Some(SubmitBackend::start(
                    queue,
                    region.clone(),
                    pool,
                    cache.clone(),
                    port,
                    stats,
                    config.completion_queue_depth,
                ))
            }
            None => None,
        };

        Ok(Arc::new(Self {
            region,
            ring,
            heap,
            cache,
            submit,
        }))
    }

    /// Mutable view of an owned write-back buffer's bytes.
    pub fn wb_slice_mut<'a>(&'a self, buf: &RegionBuf) -> &'a mut [u8] {
        let ptr = self
            .region
            .ptr_at(buf.offset(), buf.len() as usize)
            .expect("write-back buffer within region");
        // SAFETY: the caller owns `buf` (exactly one Call holds it while in
        // flight), so no other guest code aliases this range.
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), buf.len() as usize) }
    }
}

pub(crate) fn region_err(e: RegionError) -> LinkError {
    LinkError::with_source(hostlink_core::StatusCode::Io, "shared region setup failed", e)
}
