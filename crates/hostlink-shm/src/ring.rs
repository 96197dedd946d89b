//! Ring buffer streaming Command Records from guest to host.
//!
//! Appends are bracketed: [`Ring::begin_update`] reserves space under a
//! narrow per-ring spinlock, [`RingUpdate::write`] copies bytes (wrapping
//! at the region end), and [`RingUpdate::commit`] publishes by advancing
//! the public write offset with Release ordering. The host never observes
//! a half-written record: dropping an update without committing publishes
//! nothing.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use hostlink_core::{RecordHeader, RECORD_HEADER_SIZE};

use crate::region::SharedRegion;

/// Ring header living in the shared region (192 bytes, one cache line per
/// field to avoid false sharing).
#[repr(C)]
pub struct RingHeader {
    /// Published write offset (monotonic byte count, written by guest).
    pub write_off: AtomicU64,
    _pad1: [u8; 56],
    /// Read offset (monotonic byte count, written by host).
    pub read_off: AtomicU64,
    _pad2: [u8; 56],
    /// Data capacity in bytes (power of 2, immutable after init).
    pub capacity: u32,
    /// Sticky overflow flag: set when an append found insufficient space.
    pub overflow: AtomicU32,
    _pad3: [u8; 56],
}

const _: () = assert!(core::mem::size_of::<RingHeader>() == 192);

impl RingHeader {
    pub(crate) fn init(&mut self, capacity: u32) {
        assert!(capacity.is_power_of_two(), "capacity must be power of 2");
        self.write_off = AtomicU64::new(0);
        self._pad1 = [0; 56];
        self.read_off = AtomicU64::new(0);
        self._pad2 = [0; 56];
        self.capacity = capacity;
        self.overflow = AtomicU32::new(0);
        self._pad3 = [0; 56];
    }
}

/// Guest/host view of the record ring inside a [`SharedRegion`].
///
/// Appending is serialized by the internal spinlock; draining assumes a
/// single consumer (the host's drain context).
pub struct Ring {
    region: Arc<SharedRegion>,
    lock: AtomicBool,
}

impl Ring {
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self {
            region,
            lock: AtomicBool::new(false),
        }
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        let off = self.region.layout().ring_header;
        // SAFETY: layout places an initialized RingHeader at this offset and
        // the mapping outlives self.
        unsafe {
            let ptr = self
                .region
                .ptr_at(hostlink_core::RegionOffset::new(off as u32), 0)
                .expect("ring header inside region");
            &*(ptr.as_ptr() as *const RingHeader)
        }
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        let off = self.region.layout().ring_data;
        self.region
            .ptr_at(hostlink_core::RegionOffset::new(off as u32), 0)
            .expect("ring data inside region")
            .as_ptr()
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.header().capacity as u64
    }

    #[inline]
    fn mask(&self) -> u64 {
        self.capacity() - 1
    }

    /// Bytes currently published and not yet drained.
    pub fn len(&self) -> u64 {
        let header = self.header();
        let read = header.read_off.load(Ordering::Relaxed);
        let write = header.write_off.load(Ordering::Acquire);
        write.saturating_sub(read)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an append ever failed for lack of space.
    pub fn overflowed(&self) -> bool {
        self.header().overflow.load(Ordering::Acquire) != 0
    }

    fn lock(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }

    /// Acquire the exclusive append right for a record of `len` wire bytes.
    ///
    /// Fails transiently with `RingFull` if the ring lacks space; the
    /// sticky overflow flag is set rather than silently dropping the
    /// record.
    pub fn begin_update(&self, len: usize) -> Result<RingUpdate<'_>, RingError> {
        let header = self.header();
        if len as u64 > self.capacity() {
            return Err(RingError::RecordTooLarge {
                len,
                capacity: self.capacity(),
            });
        }

        self.lock();
        let write = header.write_off.load(Ordering::Relaxed);
        let read = header.read_off.load(Ordering::Acquire);
        let free = self.capacity() - write.wrapping_sub(read);
        if (len as u64) > free {
            header.overflow.store(1, Ordering::Release);
            self.unlock();
            tracing::warn!(len, free, "ring overflow; record not appended");
            return Err(RingError::Full);
        }

        Ok(RingUpdate {
            ring: self,
            cursor: write,
            remaining: len,
        })
    }

    /// Append one complete record in a single bracket.
    pub fn append(&self, bytes: &[u8]) -> Result<(), RingError> {
        let mut update = self.begin_update(bytes.len())?;
        update.write(bytes);
        update.commit();
        Ok(())
    }

    fn copy_in(&self, at: u64, bytes: &[u8]) {
        let cap = self.capacity();
        let idx = (at & self.mask()) as usize;
        let first = bytes.len().min((cap as usize) - idx);
        // SAFETY: idx + first <= capacity and the tail wraps to offset 0;
        // space was reserved under the append lock.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data_ptr().add(idx), first);
            if first < bytes.len() {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(first),
                    self.data_ptr(),
                    bytes.len() - first,
                );
            }
        }
    }

    fn copy_out(&self, at: u64, out: &mut [u8]) {
        let cap = self.capacity();
        let idx = (at & self.mask()) as usize;
        let first = out.len().min((cap as usize) - idx);
        // SAFETY: the bytes were published by a committed append.
        unsafe {
            std::ptr::copy_nonoverlapping(self.data_ptr().add(idx), out.as_mut_ptr(), first);
            if first < out.len() {
                std::ptr::copy_nonoverlapping(
                    self.data_ptr(),
                    out.as_mut_ptr().add(first),
                    out.len() - first,
                );
            }
        }
    }

    /// Drain one record (host side, single consumer).
    ///
    /// Returns `Ok(None)` when nothing is published.
    pub fn drain_record(&self) -> Result<Option<(RecordHeader, Vec<u8>)>, RingError> {
        let header = self.header();
        let read = header.read_off.load(Ordering::Relaxed);
        let write = header.write_off.load(Ordering::Acquire);
        let avail = write.saturating_sub(read);
        if avail == 0 {
            return Ok(None);
        }
        if avail < RECORD_HEADER_SIZE as u64 {
            return Err(RingError::Corrupt);
        }

        let mut head_bytes = [0u8; RECORD_HEADER_SIZE];
        self.copy_out(read, &mut head_bytes);
        let record = RecordHeader::parse(&head_bytes).map_err(|_| RingError::Corrupt)?;
        let wire = record.wire_size() as u64;
        if wire > avail {
            // end_update publishes whole records only
            return Err(RingError::Corrupt);
        }

        let mut payload = vec![0u8; record.length as usize];
        self.copy_out(read + RECORD_HEADER_SIZE as u64, &mut payload);
        header.read_off.store(read + wire, Ordering::Release);
        Ok(Some((record, payload)))
    }
}

/// An in-progress append holding the exclusive append right.
///
/// Dropping without [`commit`](Self::commit) publishes nothing.
pub struct RingUpdate<'a> {
    ring: &'a Ring,
    cursor: u64,
    remaining: usize,
}

impl RingUpdate<'_> {
    /// Copy bytes at the pending cursor, wrapping at the region end.
    pub fn write(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.remaining, "write exceeds reservation");
        self.ring.copy_in(self.cursor, bytes);
        self.cursor += bytes.len() as u64;
        self.remaining -= bytes.len().min(self.remaining);
    }

    /// Publish the record by advancing the public write offset.
    pub fn commit(self) {
        self.ring
            .header()
            .write_off
            .store(self.cursor, Ordering::Release);
        // Drop runs next and releases the lock.
    }
}

impl Drop for RingUpdate<'_> {
    fn drop(&mut self) {
        self.ring.unlock();
    }
}

/// Errors from ring operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Insufficient space; transient, retry after the host drains.
    Full,
    /// Record larger than the ring itself.
    RecordTooLarge { len: usize, capacity: u64 },
    /// Published bytes do not parse as records.
    Corrupt,
}

impl std::fmt::Display for RingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "ring is full"),
            Self::RecordTooLarge { len, capacity } => {
                write!(f, "record of {} bytes exceeds ring capacity {}", len, capacity)
            }
            Self::Corrupt => write!(f, "ring contents are corrupt"),
        }
    }
}

impl std::error::Error for RingError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionConfig;
    use hostlink_core::{encode_record, CallTag, RecordKind};

    fn encoded(tag: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_record(&mut buf, CallTag::new(tag), RecordKind::new(1), payload).unwrap();
        buf
    }

    fn small_ring() -> Ring {
        let region = SharedRegion::create(RegionConfig {
            ring_bytes: 256,
            heap_bytes: 4096,
            submit_bytes: 4096,
        })
        .unwrap();
        Ring::new(region)
    }

    #[test]
    fn ring_header_size() {
        assert_eq!(core::mem::size_of::<RingHeader>(), 192);
    }

    #[test]
    fn append_then_drain_roundtrip() {
        let ring = small_ring();
        ring.append(&encoded(42, b"mode-set")).unwrap();

        let (header, payload) = ring.drain_record().unwrap().unwrap();
        assert_eq!(header.caller_tag, 42);
        assert_eq!(payload, b"mode-set");
        assert!(ring.is_empty());
    }

    #[test]
    fn uncommitted_update_is_invisible() {
        let ring = small_ring();
        let bytes = encoded(1, b"half-written");
        {
            let mut update = ring.begin_update(bytes.len()).unwrap();
            update.write(&bytes);
            // Simulated interruption: dropped without commit.
        }
        assert!(ring.is_empty());
        assert!(ring.drain_record().unwrap().is_none());

        // The ring is still usable afterwards.
        ring.append(&bytes).unwrap();
        let (header, _) = ring.drain_record().unwrap().unwrap();
        assert_eq!(header.caller_tag, 1);
    }

    #[test]
    fn fifo_across_wraparound() {
        let ring = small_ring();
        let mut next_tag = 0u64;
        let mut expect_tag = 0u64;
        // Push/pop enough volume to wrap the 256-byte ring several times.
        for _ in 0..40 {
            ring.append(&encoded(next_tag, &[0xAB; 24])).unwrap();
            next_tag += 1;
            ring.append(&encoded(next_tag, &[0xCD; 56])).unwrap();
            next_tag += 1;
            while let Some((header, _)) = ring.drain_record().unwrap() {
                assert_eq!(header.caller_tag, expect_tag);
                expect_tag += 1;
            }
        }
        assert_eq!(expect_tag, next_tag);
    }

    #[test]
    fn full_ring_sets_overflow_flag() {
        let ring = small_ring();
        assert!(!ring.overflowed());
        let bytes = encoded(0, &[0u8; 100]);
        ring.append(&bytes).unwrap();
        ring.append(&bytes).unwrap();
        assert_eq!(ring.append(&bytes), Err(RingError::Full));
        assert!(ring.overflowed());

        // Draining frees space again; the flag stays sticky.
        ring.drain_record().unwrap().unwrap();
        ring.append(&bytes).unwrap();
        assert!(ring.overflowed());
    }

    #[test]
    fn oversized_record_rejected_outright() {
        let ring = small_ring();
        assert!(matches!(
            ring.append(&vec![0u8; 512]),
            Err(RingError::RecordTooLarge { .. })
        ));
    }
}
