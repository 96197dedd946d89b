//! Host-side traits: the synchronous entry point and the accelerated
//! submit queue, plus the small wire structs both share with the host.

use crate::{RegionOffset, StatusCode};

/// Opcodes accepted by the synchronous entry point.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Connect = 1,
    Disconnect = 2,
    SetIdentity = 3,
    QueryCaps = 4,
    Write = 5,
    Read = 6,
    WriteRead = 7,
    WriteChunk = 8,
    Inject = 9,
    /// Nudge the host to drain the shared ring.
    Flush = 10,
}

/// Default single-transaction payload cap for the synchronous entry point.
pub const DEFAULT_MAX_TRANSACT_BYTES: usize = 64 * 1024;

/// Errors from the synchronous entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    /// Host response exceeds the provided output buffer. The request was
    /// consumed; recover with a plain Read into a buffer of at least
    /// `required` bytes.
    BufferTooSmall { required: u32 },
    /// The entry point (or this opcode) is absent on this platform.
    Unavailable,
    /// Host rejected or failed the transaction.
    Io(StatusCode),
}

impl std::fmt::Display for PortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BufferTooSmall { required } => {
                write!(f, "buffer too small, required={}", required)
            }
            Self::Unavailable => write!(f, "entry point unavailable"),
            Self::Io(code) => write!(f, "host transaction failed: {}", code),
        }
    }
}

impl std::error::Error for PortError {}

/// The narrow synchronous entry point (ioctl-like): copy the request in,
/// block the calling thread, copy the response out.
///
/// Implementations must be safe to call from multiple threads; the
/// connector serializes data-plane calls per connection on its side.
pub trait HostPort: Send + Sync {
    /// Execute one transaction. Returns the number of bytes written into
    /// `output`.
    fn transact(&self, op: OpCode, input: &[u8], output: &mut [u8]) -> Result<usize, PortError>;

    /// Largest single-transaction payload this platform accepts; larger
    /// requests are chunked by the connector.
    fn max_transact_bytes(&self) -> usize {
        DEFAULT_MAX_TRANSACT_BYTES
    }
}

/// Prefix on every data-plane transaction input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHeader {
    /// Session the call targets (the connector's own, except for Inject).
    pub client: u32,
    pub flags: u32,
}

impl CallHeader {
    pub const WIRE_SIZE: usize = 8;

    /// The request body was delivered beforehand via WriteChunk; the host
    /// uses the assembled buffer instead of the inline input.
    pub const FLAG_ASSEMBLED: u32 = 1 << 0;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.client.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
    }

    pub fn parse(buf: &[u8]) -> Option<(Self, &[u8])> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        let client = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        let flags = u32::from_le_bytes(buf[4..8].try_into().ok()?);
        Some((Self { client, flags }, &buf[Self::WIRE_SIZE..]))
    }
}

/// Prefix on every WriteChunk transaction input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub client: u32,
    /// Explicit sequence number, starting at 0 per assembled request. The
    /// host rejects gaps and out-of-order delivery with `ChunkGap`.
    pub seq: u32,
}

impl ChunkHeader {
    pub const WIRE_SIZE: usize = 8;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.client.to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
    }

    pub fn parse(buf: &[u8]) -> Option<(Self, &[u8])> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        let client = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        let seq = u32::from_le_bytes(buf[4..8].try_into().ok()?);
        Some((Self { client, seq }, &buf[Self::WIRE_SIZE..]))
    }
}

// =============================================================================
// Accelerated submit path
// =============================================================================

/// Transfer direction of one submitted buffer, from the guest's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToHost,
    FromHost,
}

/// Access-pattern hint the host may use to pick a mapping strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessHint {
    Sequential,
    Random,
}

/// One entry of a submit descriptor list. References submit-pool memory by
/// region-relative offset only.
#[derive(Debug, Clone, Copy)]
pub struct SubmitDesc {
    pub offset: RegionOffset,
    pub len: u32,
    pub dir: Direction,
    pub access: AccessHint,
}

/// Maximum descriptors per submission: command header, payload, write-back.
pub const MAX_SUBMIT_DESCS: usize = 3;

/// Control block carried in the first descriptor of every submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitCtrl {
    pub op: OpCode,
    pub flags: u32,
    pub client: u32,
    pub tag: u64,
}

impl SubmitCtrl {
    pub const WIRE_SIZE: usize = 24;

    pub fn encode(&self, out: &mut [u8]) -> usize {
        out[0..4].copy_from_slice(&(self.op as u32).to_le_bytes());
        out[4..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..12].copy_from_slice(&self.client.to_le_bytes());
        out[12..16].copy_from_slice(&0u32.to_le_bytes());
        out[16..24].copy_from_slice(&self.tag.to_le_bytes());
        Self::WIRE_SIZE
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        let op = match u32::from_le_bytes(buf[0..4].try_into().ok()?) {
            6 => OpCode::Read,
            7 => OpCode::WriteRead,
            5 => OpCode::Write,
            _ => return None,
        };
        let flags = u32::from_le_bytes(buf[4..8].try_into().ok()?);
        let client = u32::from_le_bytes(buf[8..12].try_into().ok()?);
        let tag = u64::from_le_bytes(buf[16..24].try_into().ok()?);
        Some(Self {
            op,
            flags,
            client,
            tag,
        })
    }
}

/// Token correlating a submission with its completion.
pub type CallToken = u64;

/// Completion report delivered from the host's dispatch context.
///
/// Fixed-size and Copy: it crosses the interrupt-equivalent boundary and
/// must not allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// `len` bytes were written into the write-back descriptor.
    Done { len: u32 },
    /// Response did not fit the write-back descriptor.
    BufferTooSmall { required: u32 },
    /// Host failed the submission.
    Failed(StatusCode),
}

/// Guest-side sink for submit completions.
///
/// `complete` may be invoked from an interrupt-equivalent context: it must
/// not block and must not allocate.
pub trait CompletionSink: Send + Sync {
    fn complete(&self, token: CallToken, status: CompletionStatus);
}

/// The accelerated buffer-descriptor submission primitive.
///
/// Absent or failing platforms are handled per call by falling back to the
/// synchronous entry point; a failed submission never demotes the
/// connection permanently.
pub trait SubmitQueue: Send + Sync {
    /// Bind the completion sink. Called once when the connection wires up
    /// the accelerated path.
    fn bind(&self, sink: std::sync::Arc<dyn CompletionSink>);

    /// Submit a descriptor list (at most [`MAX_SUBMIT_DESCS`] entries) for
    /// one host round trip. Non-blocking; the result arrives at the bound
    /// sink.
    fn submit(&self, token: CallToken, descs: &[SubmitDesc]) -> Result<(), PortError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_header_roundtrip() {
        let hdr = CallHeader {
            client: 3,
            flags: CallHeader::FLAG_ASSEMBLED,
        };
        let mut buf = Vec::new();
        hdr.encode(&mut buf);
        buf.extend_from_slice(b"rest");
        let (parsed, rest) = CallHeader::parse(&buf).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(rest, b"rest");
    }

    #[test]
    fn submit_ctrl_roundtrip() {
        let ctrl = SubmitCtrl {
            op: OpCode::WriteRead,
            flags: 0,
            client: 12,
            tag: 0xfeed,
        };
        let mut buf = [0u8; SubmitCtrl::WIRE_SIZE];
        ctrl.encode(&mut buf);
        assert_eq!(SubmitCtrl::parse(&buf), Some(ctrl));
    }

    #[test]
    fn submit_ctrl_rejects_control_opcodes() {
        let mut buf = [0u8; SubmitCtrl::WIRE_SIZE];
        buf[0..4].copy_from_slice(&(OpCode::Connect as u32).to_le_bytes());
        assert_eq!(SubmitCtrl::parse(&buf), None);
    }
}
