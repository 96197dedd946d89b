//! Synchronous backend: blocking call/response through the narrow host
//! entry point, plus the ring-streamed fire-and-forget write path.
//!
//! This is the default transport and the per-call fallback for the
//! accelerated path. Calls are strictly ordered per connection: one sync
//! transaction in flight at a time.

use std::sync::Arc;

use parking_lot::Mutex;

use hostlink_core::{
    encode_record, Call, CallHeader, CallOutcome, CallTag, ChunkHeader, HostPort, LinkError,
    OpCode, PortError, StatusCode, KIND_DATA,
};
use hostlink_shm::{RegionBuf, RingError};

use crate::plane::DataPlane;
use crate::stats::ConnStats;

pub(crate) fn port_err(e: PortError) -> LinkError {
    match e {
        PortError::BufferTooSmall { required } => LinkError::buffer_too_small(required),
        PortError::Unavailable => LinkError::transport_unavailable("entry point unavailable"),
        PortError::Io(code) => LinkError::new(code, "host transaction failed"),
    }
}

pub(crate) struct SyncBackend {
    port: Arc<dyn HostPort>,
    /// Strict per-connection ordering: one sync call in flight at a time.
    order: Mutex<()>,
}

impl SyncBackend {
    pub fn new(port: Arc<dyn HostPort>) -> Self {
        Self {
            port,
            order: Mutex::new(()),
        }
    }

    fn deliver(&self, call: &Call, outcome: CallOutcome, stats: &ConnStats) {
        if call.complete(outcome) {
            ConnStats::add(&stats.completions, 1);
        }
    }

    /// Fire-and-forget write: stream the record through the ring and nudge
    /// the host, falling back to a direct transact when the ring is full.
    pub fn write(
        &self,
        plane: &DataPlane,
        client: u32,
        tag: CallTag,
        payload: &[u8],
        stats: &ConnStats,
    ) -> Result<(), LinkError> {
        let mut record = Vec::with_capacity(hostlink_core::RECORD_HEADER_SIZE + payload.len());
        encode_record(&mut record, tag, KIND_DATA, payload)
            .map_err(|e| LinkError::with_source(StatusCode::InvalidArgument, "bad record", e))?;

        let _order = self.order.lock();
        match plane.ring.append(&record) {
            Ok(()) => {
                ConnStats::add(&stats.records_streamed, 1);
                self.transact_control(OpCode::Flush, client)?;
            }
            Err(RingError::Full) => {
                ConnStats::add(&stats.ring_overflows, 1);
                tracing::debug!(len = record.len(), "ring full; writing record directly");
                self.direct_write(client, &record)?;
                // Nudge the host to work off the backlog.
                self.transact_control(OpCode::Flush, client)?;
            }
            Err(RingError::RecordTooLarge { .. }) => {
                self.direct_write(client, &record)?;
            }
            Err(RingError::Corrupt) => {
                return Err(LinkError::io("ring corrupt"));
            }
        }
        ConnStats::add(&stats.bytes_sent, payload.len() as u64);
        Ok(())
    }

    fn transact_control(&self, op: OpCode, client: u32) -> Result<(), LinkError> {
        let mut input = Vec::with_capacity(CallHeader::WIRE_SIZE);
        CallHeader { client, flags: 0 }.encode(&mut input);
        self.port
            .transact(op, &input, &mut [])
            .map(|_| ())
            .map_err(port_err)
    }

    fn direct_write(&self, client: u32, record: &[u8]) -> Result<(), LinkError> {
        if CallHeader::WIRE_SIZE + record.len() <= self.port.max_transact_bytes() {
            let mut input = Vec::with_capacity(CallHeader::WIRE_SIZE + record.len());
            CallHeader { client, flags: 0 }.encode(&mut input);
            input.extend_from_slice(record);
            self.port
                .transact(OpCode::Write, &input, &mut [])
                .map(|_| ())
                .map_err(port_err)
        } else {
            self.chunked(client, record, OpCode::Write, &mut [])
                .map(|_| ())
                .map_err(port_err)
        }
    }

    /// Split an oversized request into numbered chunks, then issue the
    /// combined call referencing the assembled buffer.
    fn chunked(
        &self,
        client: u32,
        record: &[u8],
        final_op: OpCode,
        out: &mut [u8],
    ) -> Result<usize, PortError> {
        let chunk_max = self
            .port
            .max_transact_bytes()
            .saturating_sub(ChunkHeader::WIRE_SIZE)
            .max(1);
        for (seq, chunk) in record.chunks(chunk_max).enumerate() {
            let mut input = Vec::with_capacity(ChunkHeader::WIRE_SIZE + chunk.len());
            ChunkHeader {
                client,
                seq: seq as u32,
            }
            .encode(&mut input);
            input.extend_from_slice(chunk);
            self.port.transact(OpCode::WriteChunk, &input, &mut [])?;
        }

        let mut input = Vec::with_capacity(CallHeader::WIRE_SIZE);
        CallHeader {
            client,
            flags: CallHeader::FLAG_ASSEMBLED,
        }
        .encode(&mut input);
        self.port.transact(final_op, &input, out)
    }

    /// Combined send+receive: the primary hot path.
    pub fn write_read(
        &self,
        plane: &DataPlane,
        call: &Call,
        client: u32,
        payload: &[u8],
        max_len: u32,
        stats: &ConnStats,
    ) {
        let mut record = Vec::with_capacity(hostlink_core::RECORD_HEADER_SIZE + payload.len());
        if encode_record(&mut record, call.tag(), KIND_DATA, payload).is_err() {
            self.deliver(call, CallOutcome::FailedIo(StatusCode::InvalidArgument), stats);
            return;
        }

        let _order = self.order.lock();
        let wb = match plane.cache.acquire(max_len) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::warn!(error = %e, "no write-back buffer for write_read");
                self.deliver(call, CallOutcome::FailedIo(StatusCode::OutOfSpace), stats);
                return;
            }
        };

        let first = if CallHeader::WIRE_SIZE + record.len() <= self.port.max_transact_bytes() {
            let mut input = Vec::with_capacity(CallHeader::WIRE_SIZE + record.len());
            CallHeader { client, flags: 0 }.encode(&mut input);
            input.extend_from_slice(&record);
            self.port
                .transact(OpCode::WriteRead, &input, plane.wb_slice_mut(&wb))
        } else {
            self.chunked(client, &record, OpCode::WriteRead, plane.wb_slice_mut(&wb))
        };
        ConnStats::add(&stats.bytes_sent, payload.len() as u64);
        self.finish_with_retry(plane, call, client, wb, first, stats);
    }

    /// Blocking read of pending host data.
    pub fn read(
        &self,
        plane: &DataPlane,
        call: &Call,
        client: u32,
        max_len: u32,
        stats: &ConnStats,
    ) {
        let _order = self.order.lock();
        let wb = match plane.cache.acquire(max_len) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::warn!(error = %e, "no write-back buffer for read");
                self.deliver(call, CallOutcome::FailedIo(StatusCode::OutOfSpace), stats);
                return;
            }
        };

        let mut input = Vec::with_capacity(CallHeader::WIRE_SIZE);
        CallHeader { client, flags: 0 }.encode(&mut input);
        let first = self
            .port
            .transact(OpCode::Read, &input, plane.wb_slice_mut(&wb));
        self.finish_with_retry(plane, call, client, wb, first, stats);
    }

    /// Shared completion tail: deliver on success, run the corrective
    /// retry on an undersized write-back buffer.
    fn finish_with_retry(
        &self,
        plane: &DataPlane,
        call: &Call,
        client: u32,
        wb: RegionBuf,
        first: Result<usize, PortError>,
        stats: &ConnStats,
    ) {
        match first {
            Ok(n) => self.complete_ok(plane, call, wb, n, stats),
            Err(PortError::BufferTooSmall { required }) => {
                ConnStats::add(&stats.overflow_retries, 1);
                if !call.begin_corrective_retry() {
                    plane.cache.release(wb);
                    self.deliver(call, CallOutcome::FailedOverflow { required }, stats);
                    return;
                }
                let wb = match plane.cache.grow(wb, required) {
                    Ok(buf) => buf,
                    Err(e) => {
                        tracing::warn!(required, error = %e, "cannot grow write-back buffer");
                        self.deliver(call, CallOutcome::FailedOverflow { required }, stats);
                        return;
                    }
                };
                tracing::debug!(required, "retrying with plain read");
                // The original request was already consumed by the host:
                // recover with a plain Read, never a second WriteRead.
                let mut input = Vec::with_capacity(CallHeader::WIRE_SIZE);
                CallHeader { client, flags: 0 }.encode(&mut input);
                match self
                    .port
                    .transact(OpCode::Read, &input, plane.wb_slice_mut(&wb))
                {
                    Ok(n) => self.complete_ok(plane, call, wb, n, stats),
                    Err(PortError::BufferTooSmall { required }) => {
                        plane.cache.release(wb);
                        self.deliver(call, CallOutcome::FailedOverflow { required }, stats);
                    }
                    Err(PortError::Unavailable) => {
                        plane.cache.release(wb);
                        self.deliver(
                            call,
                            CallOutcome::FailedIo(StatusCode::TransportUnavailable),
                            stats,
                        );
                    }
                    Err(PortError::Io(code)) => {
                        plane.cache.release(wb);
                        self.deliver(call, CallOutcome::FailedIo(code), stats);
                    }
                }
            }
            Err(PortError::Unavailable) => {
                plane.cache.release(wb);
                self.deliver(
                    call,
                    CallOutcome::FailedIo(StatusCode::TransportUnavailable),
                    stats,
                );
            }
            Err(PortError::Io(code)) => {
                plane.cache.release(wb);
                self.deliver(call, CallOutcome::FailedIo(code), stats);
            }
        }
    }

    fn complete_ok(
        &self,
        plane: &DataPlane,
        call: &Call,
        wb: RegionBuf,
        n: usize,
        stats: &ConnStats,
    ) {
        if n > wb.len() as usize {
            tracing::error!(n, cap = wb.len(), "host wrote past the write-back buffer");
            plane.cache.release(wb);
            self.deliver(call, CallOutcome::FailedIo(StatusCode::Io), stats);
            return;
        }
        let mut data = vec![0u8; n];
        let read = plane.region.read_at(wb.offset(), &mut data);
        plane.cache.release(wb);
        match read {
            Ok(()) => {
                ConnStats::add(&stats.bytes_received, n as u64);
                self.deliver(call, CallOutcome::Completed(data), stats);
            }
            Err(_) => self.deliver(call, CallOutcome::FailedIo(StatusCode::Io), stats),
        }
    }

    /// Cross-session command injection: targets a session other than the
    /// connector's own, through the dedicated opcode.
    pub fn inject(
        &self,
        target: u32,
        tag: CallTag,
        payload: &[u8],
        stats: &ConnStats,
    ) -> Result<(), LinkError> {
        let mut record = Vec::with_capacity(hostlink_core::RECORD_HEADER_SIZE + payload.len());
        encode_record(&mut record, tag, KIND_DATA, payload)
            .map_err(|e| LinkError::with_source(StatusCode::InvalidArgument, "bad record", e))?;

        let _order = self.order.lock();
        if CallHeader::WIRE_SIZE + record.len() <= self.port.max_transact_bytes() {
            let mut input = Vec::with_capacity(CallHeader::WIRE_SIZE + record.len());
            CallHeader {
                client: target,
                flags: 0,
            }
            .encode(&mut input);
            input.extend_from_slice(&record);
            self.port
                .transact(OpCode::Inject, &input, &mut [])
                .map_err(port_err)?;
        } else {
            self.chunked(target, &record, OpCode::Inject, &mut [])
                .map_err(port_err)?;
        }
        ConnStats::add(&stats.bytes_sent, payload.len() as u64);
        Ok(())
    }
}
