//! Write-back buffer cache.
//!
//! One reusable write-back buffer per connection, published through a
//! single packed atomic slot. This sits on every call's hot path, so the
//! slot is compare-and-swap only; the heap mutex is touched only on miss
//! or growth.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hostlink_core::RegionOffset;
use hostlink_shm::{Heap, HeapError, RegionBuf};

/// Slot sentinel: no cached buffer.
const EMPTY: u64 = u64::MAX;

fn pack(buf: &RegionBuf) -> u64 {
    ((buf.offset().get() as u64) << 32) | buf.len() as u64
}

fn unpack(packed: u64) -> RegionBuf {
    RegionBuf::new(
        RegionOffset::new((packed >> 32) as u32),
        (packed & 0xFFFF_FFFF) as u32,
    )
}

pub struct BufferCache {
    slot: AtomicU64,
    heap: Arc<Heap>,
}

impl BufferCache {
    pub fn new(heap: Arc<Heap>) -> Self {
        Self {
            slot: AtomicU64::new(EMPTY),
            heap,
        }
    }

    /// Take a write-back buffer of at least `min_size` bytes.
    ///
    /// Returns the cached buffer when it is large enough; otherwise the
    /// old entry is freed and a larger one allocated, so the cached size
    /// only ever grows.
    pub fn acquire(&self, min_size: u32) -> Result<RegionBuf, HeapError> {
        let packed = self.slot.swap(EMPTY, Ordering::AcqRel);
        if packed != EMPTY {
            let cached = unpack(packed);
            if cached.len() >= min_size {
                return Ok(cached);
            }
            self.heap.free(cached)?;
        }
        self.heap.alloc(min_size)
    }

    /// Replace an in-hand buffer with one of at least `min_size` bytes.
    ///
    /// Used by the corrective-retry path when the host reported the
    /// required response size.
    pub fn grow(&self, old: RegionBuf, min_size: u32) -> Result<RegionBuf, HeapError> {
        if old.len() >= min_size {
            return Ok(old);
        }
        self.heap.free(old)?;
        self.acquire(min_size)
    }

    /// Publish a buffer as the cached entry.
    ///
    /// If a concurrent release already published one, the loser's buffer
    /// is freed rather than double-cached.
    pub fn release(&self, buf: RegionBuf) {
        let packed = pack(&buf);
        if self
            .slot
            .compare_exchange(EMPTY, packed, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if let Err(e) = self.heap.free(buf) {
                tracing::error!(error = %e, "failed to free losing cache buffer");
            }
        }
    }

    /// Size of the cached buffer, if one is present.
    pub fn cached_len(&self) -> Option<u32> {
        let packed = self.slot.load(Ordering::Acquire);
        (packed != EMPTY).then(|| (packed & 0xFFFF_FFFF) as u32)
    }

    /// Free the cached entry, if any. Called at teardown.
    pub fn clear(&self) {
        let packed = self.slot.swap(EMPTY, Ordering::AcqRel);
        if packed != EMPTY {
            let _ = self.heap.free(unpack(packed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_shm::{RegionConfig, SharedRegion};

    fn cache() -> (Arc<SharedRegion>, BufferCache) {
        let region = SharedRegion::create(RegionConfig::default()).unwrap();
        let heap = Arc::new(Heap::new(
            RegionOffset::new(region.layout().heap as u32),
            region.config().heap_bytes,
        ));
        (region, BufferCache::new(heap))
    }

    #[test]
    fn acquire_reuses_released_buffer() {
        let (_region, cache) = cache();
        let buf = cache.acquire(100).unwrap();
        let offset = buf.offset();
        cache.release(buf);
        let again = cache.acquire(50).unwrap();
        assert_eq!(again.offset(), offset);
        cache.release(again);
    }

    #[test]
    fn growth_is_monotonic() {
        let (_region, cache) = cache();
        let big = cache.acquire(4096).unwrap();
        cache.release(big);

        // A smaller request still yields the grown buffer.
        let buf = cache.acquire(1000).unwrap();
        assert!(buf.len() >= 4096);
        cache.release(buf);
        assert!(cache.cached_len().unwrap() >= 4096);
    }

    #[test]
    fn undersized_cache_entry_is_replaced() {
        let (_region, cache) = cache();
        let small = cache.acquire(64).unwrap();
        cache.release(small);
        let big = cache.acquire(8192).unwrap();
        assert!(big.len() >= 8192);
        cache.release(big);
    }

    #[test]
    fn concurrent_release_frees_loser() {
        let (_region, cache) = cache();
        let cache = Arc::new(cache);

        let a = cache.acquire(128).unwrap();
        let b = cache.heap.alloc(128).unwrap();
        let in_use_before = cache.heap.bytes_in_use();

        let c1 = cache.clone();
        let c2 = cache.clone();
        let t1 = std::thread::spawn(move || c1.release(a));
        let t2 = std::thread::spawn(move || c2.release(b));
        t1.join().unwrap();
        t2.join().unwrap();

        // Exactly one buffer live in the slot, the other returned to the heap.
        assert!(cache.cached_len().is_some());
        assert_eq!(cache.heap.bytes_in_use(), in_use_before - 128);
        cache.clear();
        assert_eq!(cache.heap.bytes_in_use(), 0);
    }

    #[test]
    fn clear_releases_heap_bytes() {
        let (_region, cache) = cache();
        let buf = cache.acquire(256).unwrap();
        cache.release(buf);
        cache.clear();
        assert_eq!(cache.cached_len(), None);
        assert_eq!(cache.heap.bytes_in_use(), 0);
    }
}
