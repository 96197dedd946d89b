//! Status codes and the error type surfaced to callers.

use std::fmt;

/// The closed set of status codes a caller can observe.
///
/// Callers see a result or one of these codes; they never learn which
/// backend serviced the call.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Success (not an error)
    Ok = 0,
    /// Underlying host call failed; not retried
    Io = 1,
    /// Host rejected the connection version at Connect
    VersionMismatch = 2,
    /// Host response exceeded the write-back buffer
    BufferTooSmall = 3,
    /// The requested transport is absent on this platform
    TransportUnavailable = 4,
    /// Shared-region heap exhausted
    OutOfSpace = 5,
    /// Ring buffer had insufficient space for the record
    RingFull = 6,
    /// In-flight calls did not drain within the disconnect timeout
    DrainTimeout = 7,
    /// Malformed request or argument
    InvalidArgument = 8,
    /// Chunked write arrived with a sequence gap
    ChunkGap = 9,
    /// Operation requires a connected session
    NotConnected = 10,
    /// Connect on an already-connected session
    AlreadyConnected = 11,
}

impl StatusCode {
    /// Convert from a u32 wire value.
    /// Returns None if the value doesn't match a known code.
    pub fn from_u32(val: u32) -> Option<Self> {
        Some(match val {
            0 => StatusCode::Ok,
            1 => StatusCode::Io,
            2 => StatusCode::VersionMismatch,
            3 => StatusCode::BufferTooSmall,
            4 => StatusCode::TransportUnavailable,
            5 => StatusCode::OutOfSpace,
            6 => StatusCode::RingFull,
            7 => StatusCode::DrainTimeout,
            8 => StatusCode::InvalidArgument,
            9 => StatusCode::ChunkGap,
            10 => StatusCode::NotConnected,
            11 => StatusCode::AlreadyConnected,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Codes the connector recovers from locally (fallback or corrective
    /// retry); everything else surfaces to the caller.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            StatusCode::BufferTooSmall | StatusCode::TransportUnavailable | StatusCode::RingFull
        )
    }

    /// Codes fatal for the connection attempt or teardown.
    pub fn is_fatal(self) -> bool {
        matches!(self, StatusCode::VersionMismatch | StatusCode::DrainTimeout)
    }

    pub fn description(self) -> &'static str {
        match self {
            StatusCode::Ok => "success",
            StatusCode::Io => "host call failed",
            StatusCode::VersionMismatch => "protocol version mismatch",
            StatusCode::BufferTooSmall => "write-back buffer too small",
            StatusCode::TransportUnavailable => "transport unavailable",
            StatusCode::OutOfSpace => "shared heap exhausted",
            StatusCode::RingFull => "ring buffer full",
            StatusCode::DrainTimeout => "in-flight calls did not drain",
            StatusCode::InvalidArgument => "invalid argument",
            StatusCode::ChunkGap => "chunk sequence gap",
            StatusCode::NotConnected => "not connected",
            StatusCode::AlreadyConnected => "already connected",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.as_u32())
    }
}

/// A hostlink error with code, message, and optional source.
#[derive(Debug)]
pub struct LinkError {
    code: StatusCode,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl LinkError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        LinkError {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        code: StatusCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        LinkError {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

// Convenience constructors for the common codes.

impl LinkError {
    pub fn io(message: impl Into<String>) -> Self {
        LinkError::new(StatusCode::Io, message)
    }

    pub fn version_mismatch(message: impl Into<String>) -> Self {
        LinkError::new(StatusCode::VersionMismatch, message)
    }

    pub fn buffer_too_small(required: u32) -> Self {
        LinkError::new(
            StatusCode::BufferTooSmall,
            format!("write-back buffer too small, required={}", required),
        )
    }

    pub fn transport_unavailable(message: impl Into<String>) -> Self {
        LinkError::new(StatusCode::TransportUnavailable, message)
    }

    pub fn out_of_space(message: impl Into<String>) -> Self {
        LinkError::new(StatusCode::OutOfSpace, message)
    }

    pub fn drain_timeout(message: impl Into<String>) -> Self {
        LinkError::new(StatusCode::DrainTimeout, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        LinkError::new(StatusCode::InvalidArgument, message)
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        LinkError::new(StatusCode::NotConnected, message)
    }
}

/// Result alias for hostlink operations.
pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_roundtrip() {
        for val in 0..=11u32 {
            let code = StatusCode::from_u32(val).unwrap();
            assert_eq!(code.as_u32(), val);
        }
        assert!(StatusCode::from_u32(999).is_none());
    }

    #[test]
    fn recoverable_and_fatal_are_disjoint() {
        for val in 0..=11u32 {
            let code = StatusCode::from_u32(val).unwrap();
            assert!(!(code.is_recoverable() && code.is_fatal()), "{:?}", code);
        }
    }

    #[test]
    fn link_error_display_carries_code_and_message() {
        let err = LinkError::buffer_too_small(4096);
        let s = format!("{}", err);
        assert!(s.contains("4096"));
        assert!(s.contains("too small"));
        assert_eq!(err.code(), StatusCode::BufferTooSmall);
    }

    #[test]
    fn link_error_source_chain() {
        use std::error::Error;
        let source = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = LinkError::with_source(StatusCode::Io, "transact failed", source);
        assert!(err.source().is_some());
    }
}
