//! Variable-size buffer allocator over a shared-region range.
//!
//! Buffers are handed out as [`RegionBuf`] — offset plus length, never a
//! pointer — so the host can reference them across the mapping boundary.
//! The block list is guest-private; only buffer contents live in the
//! shared range.

use hostlink_core::RegionOffset;
use parking_lot::Mutex;

/// Allocation granularity in bytes.
pub const HEAP_ALIGN: u32 = 8;

/// An allocated range of a shared region.
///
/// Owned by exactly one call while in flight; returned to the cache or
/// freed exactly once. Not Clone for that reason.
#[derive(Debug, PartialEq, Eq)]
pub struct RegionBuf {
    offset: RegionOffset,
    len: u32,
}

impl RegionBuf {
    /// Rebuild a buffer handle from its offset and length.
    ///
    /// The handle is only meaningful for a range previously handed out by
    /// the owning heap; [`Heap::free`] rejects anything else.
    pub fn new(offset: RegionOffset, len: u32) -> Self {
        Self { offset, len }
    }

    /// Payload offset within the region.
    #[inline]
    pub fn offset(&self) -> RegionOffset {
        self.offset
    }

    /// Usable size in bytes.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct Block {
    off: u32,
    len: u32,
    free: bool,
}

/// First-fit heap carving buffers out of a region range.
pub struct Heap {
    base: u32,
    blocks: Mutex<Vec<Block>>,
}

impl Heap {
    /// Manage `[base, base+len)` of a region. `len` must be a multiple of
    /// [`HEAP_ALIGN`].
    pub fn new(base: RegionOffset, len: u32) -> Self {
        debug_assert_eq!(len % HEAP_ALIGN, 0);
        Self {
            base: base.get(),
            blocks: Mutex::new(vec![Block {
                off: base.get(),
                len,
                free: true,
            }]),
        }
    }

    /// Allocate at least `size` bytes.
    pub fn alloc(&self, size: u32) -> Result<RegionBuf, HeapError> {
        let want = size.max(HEAP_ALIGN).next_multiple_of(HEAP_ALIGN);
        let mut blocks = self.blocks.lock();
        for i in 0..blocks.len() {
            if !blocks[i].free || blocks[i].len < want {
                continue;
            }
            let off = blocks[i].off;
            let spare = blocks[i].len - want;
            blocks[i].len = want;
            blocks[i].free = false;
            if spare > 0 {
                blocks.insert(
                    i + 1,
                    Block {
                        off: off + want,
                        len: spare,
                        free: true,
                    },
                );
            }
            return Ok(RegionBuf::new(RegionOffset::new(off), want));
        }
        Err(HeapError::OutOfSpace { requested: size })
    }

    /// Return a buffer to the heap, coalescing free neighbors.
    pub fn free(&self, buf: RegionBuf) -> Result<(), HeapError> {
        let mut blocks = self.blocks.lock();
        let i = blocks
            .iter()
            .position(|b| b.off == buf.offset.get())
            .ok_or(HeapError::NotAllocated {
                offset: buf.offset.get(),
            })?;
        if blocks[i].free {
            return Err(HeapError::DoubleFree {
                offset: buf.offset.get(),
            });
        }
        blocks[i].free = true;
        // Coalesce with the next block, then the previous one.
        if i + 1 < blocks.len() && blocks[i + 1].free {
            blocks[i].len += blocks[i + 1].len;
            blocks.remove(i + 1);
        }
        if i > 0 && blocks[i - 1].free {
            blocks[i - 1].len += blocks[i].len;
            blocks.remove(i);
        }
        Ok(())
    }

    /// Total free bytes (may be fragmented).
    pub fn bytes_free(&self) -> u32 {
        self.blocks
            .lock()
            .iter()
            .filter(|b| b.free)
            .map(|b| b.len)
            .sum()
    }

    /// Bytes currently allocated.
    pub fn bytes_in_use(&self) -> u32 {
        self.blocks
            .lock()
            .iter()
            .filter(|b| !b.free)
            .map(|b| b.len)
            .sum()
    }

    /// Base offset of the managed range.
    pub fn base(&self) -> RegionOffset {
        RegionOffset::new(self.base)
    }
}

/// Errors from heap operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// No block large enough.
    OutOfSpace { requested: u32 },
    /// Freed offset was never allocated.
    NotAllocated { offset: u32 },
    /// Offset freed twice.
    DoubleFree { offset: u32 },
}

impl std::fmt::Display for HeapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfSpace { requested } => {
                write!(f, "heap exhausted: {} bytes requested", requested)
            }
            Self::NotAllocated { offset } => write!(f, "offset +{:#x} not allocated", offset),
            Self::DoubleFree { offset } => write!(f, "double free at +{:#x}", offset),
        }
    }
}

impl std::error::Error for HeapError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        Heap::new(RegionOffset::new(0), 1024)
    }

    #[test]
    fn alloc_rounds_up_to_align() {
        let h = heap();
        let buf = h.alloc(5).unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(h.bytes_in_use(), 8);
    }

    #[test]
    fn alloc_until_exhausted() {
        let h = heap();
        let a = h.alloc(512).unwrap();
        let _b = h.alloc(512).unwrap();
        assert!(matches!(
            h.alloc(8),
            Err(HeapError::OutOfSpace { requested: 8 })
        ));
        h.free(a).unwrap();
        assert!(h.alloc(256).is_ok());
    }

    #[test]
    fn free_coalesces_neighbors() {
        let h = heap();
        let a = h.alloc(128).unwrap();
        let b = h.alloc(128).unwrap();
        let c = h.alloc(128).unwrap();
        h.free(a).unwrap();
        h.free(c).unwrap();
        h.free(b).unwrap();
        // Everything coalesced back into one block.
        assert_eq!(h.bytes_free(), 1024);
        assert!(h.alloc(1024).is_ok());
    }

    #[test]
    fn double_free_is_detected() {
        let h = heap();
        let a = h.alloc(64).unwrap();
        let forged = RegionBuf::new(a.offset(), a.len());
        h.free(a).unwrap();
        assert!(matches!(h.free(forged), Err(HeapError::DoubleFree { .. })));
    }

    #[test]
    fn foreign_offset_rejected() {
        let h = heap();
        let forged = RegionBuf::new(RegionOffset::new(4096), 8);
        assert!(matches!(
            h.free(forged),
            Err(HeapError::NotAllocated { .. })
        ));
    }

    #[test]
    fn distinct_allocations_do_not_overlap() {
        let h = heap();
        let a = h.alloc(100).unwrap();
        let b = h.alloc(100).unwrap();
        let a_end = a.offset().get() + a.len();
        assert!(b.offset().get() >= a_end);
    }
}
