//! Host capability flags.

use bitflags::bitflags;

bitflags! {
    /// Capability bitmask reported by the host at connect time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostCaps: u64 {
        /// Accelerated buffer-descriptor submission is available.
        const SUBMIT = 1 << 0;
        /// Cross-session command injection is accepted.
        const INJECT = 1 << 1;
        /// Chunked oversized writes are accepted.
        const CHUNKED_WRITE = 1 << 2;
        /// Host updates its liveness heartbeat in the region header.
        const LIVENESS = 1 << 3;
    }
}

/// Capability bitmask plus the host extension version, cached per
/// connection after the first query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    pub caps: HostCaps,
    pub extension_version: u32,
}

impl HostInfo {
    /// Wire size of the QueryCaps reply.
    pub const WIRE_SIZE: usize = 12;

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        let bits = u64::from_le_bytes(buf[0..8].try_into().ok()?);
        let extension_version = u32::from_le_bytes(buf[8..12].try_into().ok()?);
        Some(Self {
            caps: HostCaps::from_bits_truncate(bits),
            extension_version,
        })
    }

    pub fn encode(&self, out: &mut [u8]) -> usize {
        out[0..8].copy_from_slice(&self.caps.bits().to_le_bytes());
        out[8..12].copy_from_slice(&self.extension_version.to_le_bytes());
        Self::WIRE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_roundtrip() {
        let info = HostInfo {
            caps: HostCaps::SUBMIT | HostCaps::INJECT,
            extension_version: 9,
        };
        let mut buf = [0u8; HostInfo::WIRE_SIZE];
        assert_eq!(info.encode(&mut buf), HostInfo::WIRE_SIZE);
        assert_eq!(HostInfo::parse(&buf), Some(info));
    }

    #[test]
    fn unknown_bits_are_dropped() {
        let mut buf = [0u8; HostInfo::WIRE_SIZE];
        buf[0..8].copy_from_slice(&u64::MAX.to_le_bytes());
        let info = HostInfo::parse(&buf).unwrap();
        assert_eq!(info.caps, HostCaps::all());
    }
}
