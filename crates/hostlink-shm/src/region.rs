//! Shared region: the memory both sides can see.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  Region Header (64 bytes: magic, version, heartbeats)      │
//! ├────────────────────────────────────────────────────────────┤
//! │  Ring Header (192 bytes: write/read offsets, overflow)     │
//! ├────────────────────────────────────────────────────────────┤
//! │  Ring Data (ring_bytes, power of 2)                        │
//! ├────────────────────────────────────────────────────────────┤
//! │  Heap Area (heap_bytes)                                    │
//! ├────────────────────────────────────────────────────────────┤
//! │  Submit Pool (submit_bytes)                                │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything that crosses the boundary is a [`RegionOffset`]; the two
//! sides may map the region at different base addresses.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use hostlink_core::{pack_version, version_major, RegionOffset};

use crate::ring::RingHeader;

/// Magic bytes identifying a hostlink region.
pub const REGION_MAGIC: [u8; 8] = *b"HSTLINK\0";

/// Region layout version (major.minor packed into u32).
pub const REGION_VERSION: u32 = pack_version(1, 0);

/// Default ring data size (64KB).
pub const DEFAULT_RING_BYTES: u32 = 64 * 1024;

/// Default heap area size (1MB).
pub const DEFAULT_HEAP_BYTES: u32 = 1024 * 1024;

/// Default submit staging pool size (256KB).
pub const DEFAULT_SUBMIT_BYTES: u32 = 256 * 1024;

const DEFAULT_MAX_REGION_BYTES: usize = 256 * 1024 * 1024; // 256MB

fn max_region_bytes() -> usize {
    std::env::var("HOSTLINK_REGION_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_REGION_BYTES)
}

/// Which side of the link a caller is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Guest,
    Host,
}

/// Region header at offset 0 (64 bytes).
#[repr(C, align(64))]
pub struct RegionHeader {
    /// Magic bytes: "HSTLINK\0".
    pub magic: [u8; 8],
    /// Region layout version (major.minor packed).
    pub version: u32,
    /// Region flags (currently unused; ring overflow lives in the ring header).
    pub flags: AtomicU32,
    /// Incremented by the guest periodically.
    pub guest_epoch: AtomicU64,
    /// Incremented by the host periodically.
    pub host_epoch: AtomicU64,
    /// Nanos-since-epoch of the guest's last heartbeat.
    pub guest_last_seen: AtomicU64,
    /// Nanos-since-epoch of the host's last heartbeat.
    pub host_last_seen: AtomicU64,
}

const _: () = assert!(core::mem::size_of::<RegionHeader>() == 64);

impl RegionHeader {
    fn init(&mut self) {
        self.magic = REGION_MAGIC;
        self.version = REGION_VERSION;
        self.flags = AtomicU32::new(0);
        self.guest_epoch = AtomicU64::new(0);
        self.host_epoch = AtomicU64::new(0);
        self.guest_last_seen = AtomicU64::new(0);
        self.host_last_seen = AtomicU64::new(0);
    }

    /// Validate magic and version major.
    pub fn validate(&self) -> Result<(), RegionError> {
        if self.magic != REGION_MAGIC {
            return Err(RegionError::InvalidMagic);
        }
        if version_major(self.version) != version_major(REGION_VERSION) {
            return Err(RegionError::IncompatibleVersion {
                expected: REGION_VERSION,
                found: self.version,
            });
        }
        Ok(())
    }
}

/// Configuration for creating a shared region.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Ring data size in bytes (must be a power of 2).
    pub ring_bytes: u32,
    /// Heap area size in bytes (must be a multiple of 8).
    pub heap_bytes: u32,
    /// Submit staging pool size in bytes (must be a multiple of 8).
    ///
    /// A pool distinct from the heap, used by the accelerated submit
    /// backend for command-header and payload staging.
    pub submit_bytes: u32,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            ring_bytes: DEFAULT_RING_BYTES,
            heap_bytes: DEFAULT_HEAP_BYTES,
            submit_bytes: DEFAULT_SUBMIT_BYTES,
        }
    }
}

impl RegionConfig {
    fn validate(&self) -> Result<(), RegionError> {
        if !self.ring_bytes.is_power_of_two() {
            return Err(RegionError::InvalidConfig("ring_bytes must be power of 2"));
        }
        if self.heap_bytes == 0 || self.heap_bytes % 8 != 0 {
            return Err(RegionError::InvalidConfig(
                "heap_bytes must be a nonzero multiple of 8",
            ));
        }
        if self.submit_bytes == 0 || self.submit_bytes % 8 != 0 {
            return Err(RegionError::InvalidConfig(
                "submit_bytes must be a nonzero multiple of 8",
            ));
        }
        Ok(())
    }
}

/// Byte offsets of each part of the region.
#[derive(Debug, Clone, Copy)]
pub struct RegionLayout {
    pub header: usize,
    pub ring_header: usize,
    pub ring_data: usize,
    pub heap: usize,
    pub submit_pool: usize,
    pub total: usize,
}

impl RegionLayout {
    pub fn calculate(config: &RegionConfig) -> Result<Self, RegionError> {
        let header = 0usize;
        let ring_header = core::mem::size_of::<RegionHeader>();
        let ring_data = ring_header + core::mem::size_of::<RingHeader>();
        let heap = ring_data
            .checked_add(config.ring_bytes as usize)
            .ok_or(RegionError::InvalidConfig("region size overflow"))?;
        let submit_pool = heap
            .checked_add(config.heap_bytes as usize)
            .ok_or(RegionError::InvalidConfig("region size overflow"))?;
        let total = submit_pool
            .checked_add(config.submit_bytes as usize)
            .ok_or(RegionError::InvalidConfig("region size overflow"))?;
        Ok(Self {
            header,
            ring_header,
            ring_data,
            heap,
            submit_pool,
            total,
        })
    }
}

struct Mapping {
    base_addr: usize,
    size: usize,
}

impl Mapping {
    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        self.base_addr as *mut u8
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/size came from a successful mmap and are unmapped once.
        let rc = unsafe { libc::munmap(self.base_ptr() as *mut libc::c_void, self.size) };
        if rc != 0 {
            let e = std::io::Error::last_os_error();
            tracing::error!(error = %e, size = self.size, "munmap failed for shared region");
        } else {
            tracing::debug!(size = self.size, "unmapped shared region");
        }
    }
}

/// An anonymous shared mapping holding one region.
///
/// Ephemeral per guest session: nothing in it survives a reset.
pub struct SharedRegion {
    mapping: Arc<Mapping>,
    layout: RegionLayout,
    config: RegionConfig,
}

// SAFETY: all cross-thread state inside the mapping is reached through
// atomics; plain data ranges are handed out under ownership rules enforced
// by the heap and ring.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create and initialize a new region.
    #[tracing::instrument(
        level = "debug",
        skip(config),
        fields(ring_bytes = config.ring_bytes, heap_bytes = config.heap_bytes)
    )]
    pub fn create(config: RegionConfig) -> Result<Arc<Self>, RegionError> {
        config.validate()?;
        let layout = RegionLayout::calculate(&config)?;

        let max = max_region_bytes();
        if layout.total > max {
            tracing::warn!(
                total_bytes = layout.total,
                max_bytes = max,
                "region size exceeds configured maximum"
            );
            return Err(RegionError::InvalidConfig(
                "region size exceeds HOSTLINK_REGION_MAX_BYTES",
            ));
        }

        let mapping = create_anonymous_mapping(layout.total)?;
        tracing::info!(size = layout.total, "created shared region");

        let region = Self {
            mapping,
            layout,
            config,
        };
        // SAFETY: freshly mapped zeroed memory, exclusive at this point.
        unsafe {
            let header = &mut *(region.mapping.base_ptr() as *mut RegionHeader);
            header.init();
            let ring = &mut *(region
                .mapping
                .base_ptr()
                .add(layout.ring_header) as *mut RingHeader);
            ring.init(region.config.ring_bytes);
        }
        Ok(Arc::new(region))
    }

    #[inline]
    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    #[inline]
    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.mapping.size
    }

    /// The region header.
    #[inline]
    pub fn header(&self) -> &RegionHeader {
        // SAFETY: header is at offset 0 of a live mapping and was initialized
        // in create().
        unsafe { &*(self.mapping.base_ptr() as *const RegionHeader) }
    }

    /// Raw pointer for a validated offset range.
    ///
    /// The returned pointer is only meaningful in this mapping; it must
    /// never be stored in any structure the host can see.
    pub fn ptr_at(&self, offset: RegionOffset, len: usize) -> Result<NonNull<u8>, RegionError> {
        let off = offset.get() as usize;
        let end = off.checked_add(len).ok_or(RegionError::OutOfRange {
            offset: offset.get(),
            len,
        })?;
        if end > self.mapping.size {
            return Err(RegionError::OutOfRange {
                offset: offset.get(),
                len,
            });
        }
        // SAFETY: bounds checked above; mapping outlives the call.
        let ptr = unsafe { self.mapping.base_ptr().add(off) };
        NonNull::new(ptr).ok_or(RegionError::OutOfRange {
            offset: offset.get(),
            len,
        })
    }

    /// Translate a pointer inside this mapping back to an offset.
    pub fn offset_of(&self, ptr: *const u8) -> Option<RegionOffset> {
        let addr = ptr as usize;
        let base = self.mapping.base_addr;
        if addr < base || addr >= base + self.mapping.size {
            return None;
        }
        Some(RegionOffset::new((addr - base) as u32))
    }

    /// Copy `data` into the region at `offset`.
    pub fn write_at(&self, offset: RegionOffset, data: &[u8]) -> Result<(), RegionError> {
        let dst = self.ptr_at(offset, data.len())?;
        // SAFETY: ptr_at validated the range; caller owns the range per the
        // heap/ring ownership rules.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len());
        }
        Ok(())
    }

    /// Copy bytes out of the region at `offset`.
    pub fn read_at(&self, offset: RegionOffset, out: &mut [u8]) -> Result<(), RegionError> {
        let src = self.ptr_at(offset, out.len())?;
        // SAFETY: ptr_at validated the range.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Update one side's heartbeat in the region header.
    pub fn heartbeat(&self, side: Side) {
        let header = self.header();
        let now = now_nanos();
        match side {
            Side::Guest => {
                header.guest_last_seen.store(now, Ordering::Release);
                header.guest_epoch.fetch_add(1, Ordering::Relaxed);
            }
            Side::Host => {
                header.host_last_seen.store(now, Ordering::Release);
                header.host_epoch.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Whether `side`'s heartbeat is younger than `timeout_nanos`.
    ///
    /// A side that has never heartbeat (last_seen == 0) is considered alive
    /// to avoid false positives during startup.
    pub fn is_alive(&self, side: Side, timeout_nanos: u64) -> bool {
        let header = self.header();
        let last_seen = match side {
            Side::Guest => header.guest_last_seen.load(Ordering::Acquire),
            Side::Host => header.host_last_seen.load(Ordering::Acquire),
        };
        if last_seen == 0 {
            return true;
        }
        now_nanos().saturating_sub(last_seen) < timeout_nanos
    }
}

fn now_nanos() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn create_anonymous_mapping(size: usize) -> Result<Arc<Mapping>, RegionError> {
    use libc::{mmap, MAP_ANONYMOUS, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};

    tracing::debug!(size, "creating anonymous shared mapping");
    // SAFETY: plain anonymous mapping request; result checked below.
    let ptr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_SHARED | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        return Err(RegionError::System(std::io::Error::last_os_error()));
    }
    Ok(Arc::new(Mapping {
        base_addr: ptr as usize,
        size,
    }))
}

/// Errors from region operations.
#[derive(Debug)]
pub enum RegionError {
    /// Invalid configuration.
    InvalidConfig(&'static str),
    /// Header magic did not match.
    InvalidMagic,
    /// Header version major did not match.
    IncompatibleVersion { expected: u32, found: u32 },
    /// Offset range outside the mapping.
    OutOfRange { offset: u32, len: usize },
    /// System error (mmap failed, etc.).
    System(std::io::Error),
}

impl std::fmt::Display for RegionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            Self::InvalidMagic => write!(f, "invalid region magic"),
            Self::IncompatibleVersion { expected, found } => write!(
                f,
                "incompatible region version: expected {}.{}, found {}.{}",
                expected >> 16,
                expected & 0xFFFF,
                found >> 16,
                found & 0xFFFF
            ),
            Self::OutOfRange { offset, len } => {
                write!(f, "offset range out of region: +{:#x}..+{}", offset, len)
            }
            Self::System(e) => write!(f, "system error: {}", e),
        }
    }
}

impl std::error::Error for RegionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::System(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_one_cache_line() {
        assert_eq!(core::mem::size_of::<RegionHeader>(), 64);
    }

    #[test]
    fn create_validates_header() {
        let region = SharedRegion::create(RegionConfig::default()).unwrap();
        assert!(region.header().validate().is_ok());
    }

    #[test]
    fn ring_bytes_must_be_power_of_two() {
        let err = SharedRegion::create(RegionConfig {
            ring_bytes: 1000,
            heap_bytes: 4096,
            submit_bytes: 4096,
        });
        assert!(matches!(err, Err(RegionError::InvalidConfig(_))));
    }

    #[test]
    fn write_read_roundtrip_at_offset() {
        let region = SharedRegion::create(RegionConfig::default()).unwrap();
        let off = RegionOffset::new(region.layout().heap as u32);
        region.write_at(off, b"payload").unwrap();
        let mut out = [0u8; 7];
        region.read_at(off, &mut out).unwrap();
        assert_eq!(&out, b"payload");
    }

    #[test]
    fn out_of_range_is_rejected() {
        let region = SharedRegion::create(RegionConfig::default()).unwrap();
        let off = RegionOffset::new(region.size() as u32 - 4);
        assert!(matches!(
            region.write_at(off, &[0u8; 8]),
            Err(RegionError::OutOfRange { .. })
        ));
    }

    #[test]
    fn offset_of_inverts_ptr_at() {
        let region = SharedRegion::create(RegionConfig::default()).unwrap();
        let off = RegionOffset::new(128);
        let ptr = region.ptr_at(off, 16).unwrap();
        assert_eq!(region.offset_of(ptr.as_ptr()), Some(off));
        assert_eq!(region.offset_of(0x10 as *const u8), None);
    }

    #[test]
    fn heartbeat_marks_side_alive() {
        let region = SharedRegion::create(RegionConfig::default()).unwrap();
        // Never heartbeat: alive by convention.
        assert!(region.is_alive(Side::Host, 1));
        region.heartbeat(Side::Host);
        assert!(region.is_alive(Side::Host, 5_000_000_000));
        assert_eq!(region.header().host_epoch.load(Ordering::Relaxed), 1);
    }
}
