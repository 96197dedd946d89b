//! Command Record wire codec.
//!
//! A record is `{u64 caller_tag, u32 length, u32 kind}` followed by
//! `length` payload bytes, with the total size padded to a multiple of
//! 8 bytes. `length` is the unpadded payload length.

use bytes::BufMut;

use crate::{CallTag, RecordKind};

/// Size of the record header on the wire.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Records are padded to this alignment on the wire.
pub const RECORD_ALIGN: usize = 8;

/// Kind of an ordinary data-plane command record.
pub const KIND_DATA: crate::RecordKind = crate::RecordKind::new(1);

const _: () = assert!(RECORD_HEADER_SIZE % RECORD_ALIGN == 0);

/// Round `n` up to the next multiple of `align` (a power of 2).
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Parsed Command Record header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    /// Opaque caller tag, echoed back by the host in completions.
    pub caller_tag: u64,
    /// Unpadded payload length in bytes.
    pub length: u32,
    /// Kind discriminator.
    pub kind: u32,
}

impl RecordHeader {
    pub fn new(tag: CallTag, kind: RecordKind, length: u32) -> Self {
        Self {
            caller_tag: tag.get(),
            length,
            kind: kind.get(),
        }
    }

    /// Total on-wire size of the record this header describes.
    pub fn wire_size(&self) -> usize {
        align_up(RECORD_HEADER_SIZE + self.length as usize, RECORD_ALIGN)
    }

    /// Parse a header from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, RecordError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(RecordError::Truncated {
                need: RECORD_HEADER_SIZE,
                have: buf.len(),
            });
        }
        let caller_tag = u64::from_le_bytes(buf[0..8].try_into().expect("8-byte slice"));
        let length = u32::from_le_bytes(buf[8..12].try_into().expect("4-byte slice"));
        let kind = u32::from_le_bytes(buf[12..16].try_into().expect("4-byte slice"));
        Ok(Self {
            caller_tag,
            length,
            kind,
        })
    }

    /// Append the header bytes to `out`.
    pub fn put(&self, out: &mut impl BufMut) {
        out.put_u64_le(self.caller_tag);
        out.put_u32_le(self.length);
        out.put_u32_le(self.kind);
    }
}

/// Append a full record (header + payload + padding) to `out`.
///
/// Returns the number of bytes appended (always a multiple of 8).
pub fn encode_record(
    out: &mut impl BufMut,
    tag: CallTag,
    kind: RecordKind,
    payload: &[u8],
) -> Result<usize, RecordError> {
    let length = u32::try_from(payload.len()).map_err(|_| RecordError::PayloadTooLarge {
        len: payload.len(),
    })?;
    let header = RecordHeader::new(tag, kind, length);
    let wire = header.wire_size();
    header.put(out);
    out.put_slice(payload);
    for _ in 0..(wire - RECORD_HEADER_SIZE - payload.len()) {
        out.put_u8(0);
    }
    Ok(wire)
}

/// Split one record off the front of `buf`.
///
/// Returns the header, the payload slice, and the number of wire bytes
/// consumed (including padding).
pub fn decode_record(buf: &[u8]) -> Result<(RecordHeader, &[u8], usize), RecordError> {
    let header = RecordHeader::parse(buf)?;
    let wire = header.wire_size();
    if buf.len() < wire {
        return Err(RecordError::Truncated {
            need: wire,
            have: buf.len(),
        });
    }
    let payload = &buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + header.length as usize];
    Ok((header, payload, wire))
}

/// Errors from record encoding/decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordError {
    /// Buffer too short to hold the claimed record.
    Truncated { need: usize, have: usize },
    /// Payload length does not fit the u32 wire field.
    PayloadTooLarge { len: usize },
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { need, have } => {
                write!(f, "truncated record: need {} bytes, have {}", need, have)
            }
            Self::PayloadTooLarge { len } => {
                write!(f, "record payload too large: {} bytes", len)
            }
        }
    }
}

impl std::error::Error for RecordError {}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn wire_size_is_multiple_of_eight() {
        for len in 0..64u32 {
            let h = RecordHeader::new(CallTag::new(1), RecordKind::new(2), len);
            assert_eq!(h.wire_size() % RECORD_ALIGN, 0, "len={}", len);
            assert!(h.wire_size() >= RECORD_HEADER_SIZE + len as usize);
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        let wrote = encode_record(
            &mut buf,
            CallTag::new(0xdead_beef),
            RecordKind::new(7),
            b"hello",
        )
        .unwrap();
        assert_eq!(wrote, buf.len());
        assert_eq!(wrote % RECORD_ALIGN, 0);

        let (header, payload, consumed) = decode_record(&buf).unwrap();
        assert_eq!(header.caller_tag, 0xdead_beef);
        assert_eq!(header.kind, 7);
        assert_eq!(payload, b"hello");
        assert_eq!(consumed, wrote);
    }

    #[test]
    fn empty_payload_is_header_only() {
        let mut buf = BytesMut::new();
        let wrote =
            encode_record(&mut buf, CallTag::new(0), RecordKind::new(0), &[]).unwrap();
        assert_eq!(wrote, RECORD_HEADER_SIZE);
    }

    #[test]
    fn decode_truncated_fails() {
        let mut buf = BytesMut::new();
        encode_record(&mut buf, CallTag::new(1), RecordKind::new(1), b"0123456789").unwrap();
        let short = &buf[..buf.len() - 1];
        assert!(matches!(
            decode_record(short),
            Err(RecordError::Truncated { .. })
        ));
    }

    #[test]
    fn two_records_back_to_back() {
        let mut buf = BytesMut::new();
        encode_record(&mut buf, CallTag::new(1), RecordKind::new(1), b"abc").unwrap();
        encode_record(&mut buf, CallTag::new(2), RecordKind::new(2), b"defgh").unwrap();

        let (h1, p1, n1) = decode_record(&buf).unwrap();
        assert_eq!((h1.caller_tag, p1), (1, b"abc".as_slice()));
        let (h2, p2, _) = decode_record(&buf[n1..]).unwrap();
        assert_eq!((h2.caller_tag, p2), (2, b"defgh".as_slice()));
    }
}
