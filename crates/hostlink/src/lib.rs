//! hostlink: guest connector for a guest/host command transport.
//!
//! Forwards serialized command streams to a privileged host counterpart
//! and returns host-produced results, over two competing backends:
//!
//! - a synchronous entry point (copy-in, block, copy-out), streaming
//!   fire-and-forget records through a shared ring buffer, and
//! - an accelerated buffer-descriptor submission path with completions
//!   delivered from an independent dispatch context, falling back to the
//!   synchronous backend per call.
//!
//! Callers never learn which backend serviced a call.
//!
//! ```ignore
//! let conn = Connection::new(port, ConnectorConfig::default())?;
//! let client = conn.connect(PROTOCOL_MAJOR, PROTOCOL_MINOR)?;
//! let reply = conn.write_read(&command_bytes, 4096)?;
//! conn.disconnect()?;
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]

mod cache;
mod config;
mod connection;
mod dispatch;
mod plane;
mod stats;
mod submit_backend;
mod sync_backend;

pub use cache::BufferCache;
pub use config::ConnectorConfig;
pub use connection::Connection;
pub use stats::{ConnStats, StatsSnapshot};

// Re-export the vocabulary callers and host implementations need.
pub use hostlink_core::{
    AccessHint, Call, CallOutcome, CallTag, CallToken, ClientId, CompletionSink,
    CompletionStatus, Direction, HostCaps, HostInfo, HostPort, LinkError, OpCode, PortError,
    RecordKind, RegionOffset, Result, StatusCode, SubmitDesc, SubmitQueue, PROTOCOL_MAJOR,
    PROTOCOL_MINOR,
};
pub use hostlink_shm::{Heap, HeapError, RegionBuf, RegionConfig, SharedRegion, Side};
