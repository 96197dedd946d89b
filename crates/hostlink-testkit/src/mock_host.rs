//! The mock host.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use hostlink_core::{
    decode_record, version_major, CallHeader, CallToken, ChunkHeader, CompletionSink,
    CompletionStatus, HostCaps, HostInfo, HostPort, OpCode, PortError, StatusCode, SubmitCtrl,
    SubmitDesc, SubmitQueue, DEFAULT_MAX_TRANSACT_BYTES,
};
use hostlink_shm::{Ring, SharedRegion, Side};

/// Request payload -> response bytes.
pub type Responder = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Tunable host behavior.
pub struct HostBehavior {
    pub version_major: u16,
    pub version_minor: u16,
    pub caps: HostCaps,
    pub extension_version: u32,
    pub max_transact_bytes: usize,
    /// Added latency before answering a data-plane request, on either path.
    pub response_delay: Duration,
    pub responder: Responder,
}

impl Default for HostBehavior {
    fn default() -> Self {
        Self {
            version_major: hostlink_core::PROTOCOL_MAJOR,
            version_minor: hostlink_core::PROTOCOL_MINOR,
            caps: HostCaps::SUBMIT | HostCaps::INJECT | HostCaps::CHUNKED_WRITE,
            extension_version: 1,
            max_transact_bytes: DEFAULT_MAX_TRANSACT_BYTES,
            response_delay: Duration::ZERO,
            responder: Box::new(|payload| payload.to_vec()),
        }
    }
}

#[derive(Default)]
struct ClientState {
    pid: Option<u32>,
    /// Responses the guest has not read back yet (also where an oversized
    /// WriteRead response waits for its corrective Read).
    pending: VecDeque<Vec<u8>>,
    /// Commands received: direct writes, drained ring records, injections.
    commands: Vec<(u64, Vec<u8>)>,
    chunks: Vec<u8>,
    chunk_seq: u32,
}

#[derive(Default)]
struct HostInner {
    next_client: u32,
    clients: HashMap<u32, ClientState>,
}

struct HostShared {
    behavior: Mutex<HostBehavior>,
    inner: Mutex<HostInner>,
    region: Mutex<Option<Arc<SharedRegion>>>,
    ring: Mutex<Option<Ring>>,
    sink: Mutex<Option<Arc<dyn CompletionSink>>>,
    reject_submissions: AtomicBool,
    fail_completions: AtomicBool,
    drain_on_flush: AtomicBool,
}

struct SubmitJob {
    token: CallToken,
    ctrl: SubmitCtrl,
    descs: Vec<SubmitDesc>,
}

/// In-process host counterpart implementing [`HostPort`] and
/// [`SubmitQueue`].
pub struct MockHost {
    shared: Arc<HostShared>,
    submit_tx: Mutex<Option<Sender<SubmitJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Self::with_behavior(HostBehavior::default())
    }

    pub fn with_behavior(behavior: HostBehavior) -> Arc<Self> {
        let shared = Arc::new(HostShared {
            behavior: Mutex::new(behavior),
            inner: Mutex::new(HostInner::default()),
            region: Mutex::new(None),
            ring: Mutex::new(None),
            sink: Mutex::new(None),
            reject_submissions: AtomicBool::new(false),
            fail_completions: AtomicBool::new(false),
            drain_on_flush: AtomicBool::new(true),
        });

        let (tx, rx) = channel::<SubmitJob>();
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("mock-host-submit".into())
            .spawn(move || {
                // The host's independent dispatch context: completions are
                // delivered from here, concurrent with guest threads.
                while let Ok(job) = rx.recv() {
                    process_submit(&worker_shared, job);
                }
            })
            .expect("spawn mock host worker");

        Arc::new(Self {
            shared,
            submit_tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Map the guest's shared region (the platform would do this when the
    /// session is established).
    pub fn map_region(&self, region: Arc<SharedRegion>) {
        region.heartbeat(Side::Host);
        *self.shared.ring.lock() = Some(Ring::new(region.clone()));
        *self.shared.region.lock() = Some(region);
    }

    // ---- behavior knobs -------------------------------------------------

    pub fn set_version(&self, major: u16, minor: u16) {
        let mut behavior = self.shared.behavior.lock();
        behavior.version_major = major;
        behavior.version_minor = minor;
    }

    pub fn set_caps(&self, caps: HostCaps) {
        self.shared.behavior.lock().caps = caps;
    }

    pub fn set_max_transact_bytes(&self, max: usize) {
        self.shared.behavior.lock().max_transact_bytes = max;
    }

    pub fn set_response_delay(&self, delay: Duration) {
        self.shared.behavior.lock().response_delay = delay;
    }

    pub fn set_responder(&self, responder: Responder) {
        self.shared.behavior.lock().responder = responder;
    }

    /// Respond to every request with the same bytes.
    pub fn set_fixed_response(&self, response: Vec<u8>) {
        self.set_responder(Box::new(move |_| response.clone()));
    }

    /// Make `SubmitQueue::submit` reject synchronously.
    pub fn reject_submissions(&self, reject: bool) {
        self.shared
            .reject_submissions
            .store(reject, Ordering::Release);
    }

    /// Make accepted submissions complete with an IO failure.
    pub fn fail_completions(&self, fail: bool) {
        self.shared.fail_completions.store(fail, Ordering::Release);
    }

    /// Stop draining the ring on Flush, letting it back up.
    pub fn set_drain_on_flush(&self, drain: bool) {
        self.shared.drain_on_flush.store(drain, Ordering::Release);
    }

    // ---- assertions -----------------------------------------------------

    pub fn connected_clients(&self) -> usize {
        self.shared.inner.lock().clients.len()
    }

    pub fn pid_of(&self, client: u32) -> Option<u32> {
        self.shared
            .inner
            .lock()
            .clients
            .get(&client)
            .and_then(|c| c.pid)
    }

    /// Commands received for a client: `(caller_tag, payload)`.
    pub fn commands(&self, client: u32) -> Vec<(u64, Vec<u8>)> {
        self.shared
            .inner
            .lock()
            .clients
            .get(&client)
            .map(|c| c.commands.clone())
            .unwrap_or_default()
    }

    pub fn pending_responses(&self, client: u32) -> usize {
        self.shared
            .inner
            .lock()
            .clients
            .get(&client)
            .map(|c| c.pending.len())
            .unwrap_or(0)
    }
}

impl Drop for MockHost {
    fn drop(&mut self) {
        self.submit_tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn respond(shared: &HostShared, payload: &[u8]) -> Vec<u8> {
    let behavior = shared.behavior.lock();
    let delay = behavior.response_delay;
    let response = (behavior.responder)(payload);
    drop(behavior);
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
    response
}

/// Pull the request body: inline input, or the assembled chunk buffer.
fn request_body(
    inner: &mut HostInner,
    header: CallHeader,
    rest: &[u8],
) -> Result<Vec<u8>, PortError> {
    let client = inner
        .clients
        .get_mut(&header.client)
        .ok_or(PortError::Io(StatusCode::InvalidArgument))?;
    if header.flags & CallHeader::FLAG_ASSEMBLED != 0 {
        client.chunk_seq = 0;
        Ok(std::mem::take(&mut client.chunks))
    } else {
        Ok(rest.to_vec())
    }
}

impl HostPort for MockHost {
    fn transact(&self, op: OpCode, input: &[u8], output: &mut [u8]) -> Result<usize, PortError> {
        let shared = &self.shared;
        if let Some(region) = shared.region.lock().as_ref() {
            region.heartbeat(Side::Host);
        }

        match op {
            OpCode::Connect => {
                if input.len() < 4 {
                    return Err(PortError::Io(StatusCode::InvalidArgument));
                }
                let wanted = u32::from_le_bytes(input[0..4].try_into().unwrap());
                let behavior = shared.behavior.lock();
                if version_major(wanted) != behavior.version_major {
                    tracing::debug!(
                        guest = version_major(wanted),
                        host = behavior.version_major,
                        "rejecting connect: version mismatch"
                    );
                    return Err(PortError::Io(StatusCode::VersionMismatch));
                }
                drop(behavior);
                if output.len() < 4 {
                    return Err(PortError::BufferTooSmall { required: 4 });
                }
                let mut inner = shared.inner.lock();
                inner.next_client += 1;
                let id = inner.next_client;
                inner.clients.insert(id, ClientState::default());
                output[0..4].copy_from_slice(&id.to_le_bytes());
                Ok(4)
            }

            OpCode::Disconnect => {
                if input.len() < 4 {
                    return Err(PortError::Io(StatusCode::InvalidArgument));
                }
                let id = u32::from_le_bytes(input[0..4].try_into().unwrap());
                let removed = shared.inner.lock().clients.remove(&id);
                if removed.is_none() {
                    return Err(PortError::Io(StatusCode::InvalidArgument));
                }
                Ok(0)
            }

            OpCode::SetIdentity => {
                if input.len() < 8 {
                    return Err(PortError::Io(StatusCode::InvalidArgument));
                }
                let id = u32::from_le_bytes(input[0..4].try_into().unwrap());
                let pid = u32::from_le_bytes(input[4..8].try_into().unwrap());
                let mut inner = shared.inner.lock();
                let client = inner
                    .clients
                    .get_mut(&id)
                    .ok_or(PortError::Io(StatusCode::InvalidArgument))?;
                client.pid = Some(pid);
                Ok(0)
            }

            OpCode::QueryCaps => {
                let (header, _) =
                    CallHeader::parse(input).ok_or(PortError::Io(StatusCode::InvalidArgument))?;
                if !shared.inner.lock().clients.contains_key(&header.client) {
                    return Err(PortError::Io(StatusCode::InvalidArgument));
                }
                if output.len() < HostInfo::WIRE_SIZE {
                    return Err(PortError::BufferTooSmall {
                        required: HostInfo::WIRE_SIZE as u32,
                    });
                }
                let behavior = shared.behavior.lock();
                let info = HostInfo {
                    caps: behavior.caps,
                    extension_version: behavior.extension_version,
                };
                Ok(info.encode(output))
            }

            OpCode::Write => {
                let (header, rest) =
                    CallHeader::parse(input).ok_or(PortError::Io(StatusCode::InvalidArgument))?;
                let mut inner = shared.inner.lock();
                let body = request_body(&mut inner, header, rest)?;
                let (record, payload, _) =
                    decode_record(&body).map_err(|_| PortError::Io(StatusCode::InvalidArgument))?;
                let client = inner.clients.get_mut(&header.client).expect("checked");
                client.commands.push((record.caller_tag, payload.to_vec()));
                Ok(0)
            }

            OpCode::WriteRead => {
                let (header, rest) =
                    CallHeader::parse(input).ok_or(PortError::Io(StatusCode::InvalidArgument))?;
                let body = {
                    let mut inner = shared.inner.lock();
                    request_body(&mut inner, header, rest)?
                };
                let (record, payload, _) =
                    decode_record(&body).map_err(|_| PortError::Io(StatusCode::InvalidArgument))?;
                let response = respond(shared, payload);

                let mut inner = shared.inner.lock();
                let client = inner
                    .clients
                    .get_mut(&header.client)
                    .ok_or(PortError::Io(StatusCode::InvalidArgument))?;
                client.commands.push((record.caller_tag, payload.to_vec()));
                if response.len() > output.len() {
                    // Request consumed; response parks until a plain Read.
                    let required = response.len() as u32;
                    client.pending.push_back(response);
                    return Err(PortError::BufferTooSmall { required });
                }
                let n = response.len();
                output[..n].copy_from_slice(&response);
                Ok(n)
            }

            OpCode::Read => {
                let (header, _) =
                    CallHeader::parse(input).ok_or(PortError::Io(StatusCode::InvalidArgument))?;
                let mut inner = shared.inner.lock();
                let client = inner
                    .clients
                    .get_mut(&header.client)
                    .ok_or(PortError::Io(StatusCode::InvalidArgument))?;
                let Some(front) = client.pending.front() else {
                    return Ok(0);
                };
                if front.len() > output.len() {
                    return Err(PortError::BufferTooSmall {
                        required: front.len() as u32,
                    });
                }
                let response = client.pending.pop_front().expect("front checked");
                output[..response.len()].copy_from_slice(&response);
                Ok(response.len())
            }

            OpCode::WriteChunk => {
                let (header, rest) =
                    ChunkHeader::parse(input).ok_or(PortError::Io(StatusCode::InvalidArgument))?;
                let mut inner = shared.inner.lock();
                let client = inner
                    .clients
                    .get_mut(&header.client)
                    .ok_or(PortError::Io(StatusCode::InvalidArgument))?;
                if header.seq != client.chunk_seq {
                    tracing::debug!(
                        got = header.seq,
                        expected = client.chunk_seq,
                        "chunk sequence gap"
                    );
                    client.chunks.clear();
                    client.chunk_seq = 0;
                    return Err(PortError::Io(StatusCode::ChunkGap));
                }
                client.chunks.extend_from_slice(rest);
                client.chunk_seq += 1;
                Ok(0)
            }

            OpCode::Inject => {
                let (header, rest) =
                    CallHeader::parse(input).ok_or(PortError::Io(StatusCode::InvalidArgument))?;
                let mut inner = shared.inner.lock();
                let body = request_body(&mut inner, header, rest)?;
                let (record, payload, _) =
                    decode_record(&body).map_err(|_| PortError::Io(StatusCode::InvalidArgument))?;
                let target = inner
                    .clients
                    .get_mut(&header.client)
                    .ok_or(PortError::Io(StatusCode::InvalidArgument))?;
                target.commands.push((record.caller_tag, payload.to_vec()));
                Ok(0)
            }

            OpCode::Flush => {
                let (header, _) =
                    CallHeader::parse(input).ok_or(PortError::Io(StatusCode::InvalidArgument))?;
                if !shared.drain_on_flush.load(Ordering::Acquire) {
                    return Ok(0);
                }
                let ring = shared.ring.lock();
                let Some(ring) = ring.as_ref() else {
                    return Err(PortError::Unavailable);
                };
                let mut inner = shared.inner.lock();
                let client = inner
                    .clients
                    .get_mut(&header.client)
                    .ok_or(PortError::Io(StatusCode::InvalidArgument))?;
                loop {
                    match ring.drain_record() {
                        Ok(Some((record, payload))) => {
                            client.commands.push((record.caller_tag, payload));
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!(error = %e, "ring drain failed");
                            return Err(PortError::Io(StatusCode::Io));
                        }
                    }
                }
                Ok(0)
            }
        }
    }

    fn max_transact_bytes(&self) -> usize {
        self.shared.behavior.lock().max_transact_bytes
    }
}

impl SubmitQueue for MockHost {
    fn bind(&self, sink: Arc<dyn CompletionSink>) {
        *self.shared.sink.lock() = Some(sink);
    }

    fn submit(&self, token: CallToken, descs: &[SubmitDesc]) -> Result<(), PortError> {
        if self.shared.reject_submissions.load(Ordering::Acquire) {
            return Err(PortError::Io(StatusCode::TransportUnavailable));
        }
        let region = self.shared.region.lock();
        let Some(region) = region.as_ref() else {
            return Err(PortError::Unavailable);
        };
        if descs.is_empty() || descs.len() > hostlink_core::MAX_SUBMIT_DESCS {
            return Err(PortError::Io(StatusCode::InvalidArgument));
        }

        // First descriptor carries the control block.
        let mut ctrl_bytes = vec![0u8; descs[0].len as usize];
        region
            .read_at(descs[0].offset, &mut ctrl_bytes)
            .map_err(|_| PortError::Io(StatusCode::InvalidArgument))?;
        let ctrl =
            SubmitCtrl::parse(&ctrl_bytes).ok_or(PortError::Io(StatusCode::InvalidArgument))?;

        let job = SubmitJob {
            token,
            ctrl,
            descs: descs.to_vec(),
        };
        self.submit_tx
            .lock()
            .as_ref()
            .ok_or(PortError::Unavailable)?
            .send(job)
            .map_err(|_| PortError::Unavailable)
    }
}

/// Host-side handling of one accepted submission, on the host worker
/// thread.
fn process_submit(shared: &HostShared, job: SubmitJob) {
    let Some(sink) = shared.sink.lock().clone() else {
        tracing::error!("submission accepted with no bound sink");
        return;
    };
    if shared.fail_completions.load(Ordering::Acquire) {
        sink.complete(job.token, CompletionStatus::Failed(StatusCode::Io));
        return;
    }
    let region = shared.region.lock().clone();
    let Some(region) = region else {
        sink.complete(job.token, CompletionStatus::Failed(StatusCode::Io));
        return;
    };
    region.heartbeat(Side::Host);

    let status = match job.ctrl.op {
        OpCode::WriteRead => {
            // [ctrl, payload, writeback]
            if job.descs.len() != 3 {
                CompletionStatus::Failed(StatusCode::InvalidArgument)
            } else {
                let mut body = vec![0u8; job.descs[1].len as usize];
                if region.read_at(job.descs[1].offset, &mut body).is_err() {
                    CompletionStatus::Failed(StatusCode::InvalidArgument)
                } else {
                    match decode_record(&body) {
                        Ok((record, payload, _)) => {
                            let response = respond(shared, payload);
                            let mut inner = shared.inner.lock();
                            match inner.clients.get_mut(&job.ctrl.client) {
                                Some(client) => {
                                    client.commands.push((record.caller_tag, payload.to_vec()));
                                    finish_writeback(&region, &job, client, response)
                                }
                                None => CompletionStatus::Failed(StatusCode::InvalidArgument),
                            }
                        }
                        Err(_) => CompletionStatus::Failed(StatusCode::InvalidArgument),
                    }
                }
            }
        }
        OpCode::Read => {
            // [ctrl, writeback]
            if job.descs.len() != 2 {
                CompletionStatus::Failed(StatusCode::InvalidArgument)
            } else {
                let mut inner = shared.inner.lock();
                match inner.clients.get_mut(&job.ctrl.client) {
                    Some(client) => {
                        let response = client.pending.pop_front().unwrap_or_default();
                        finish_writeback(&region, &job, client, response)
                    }
                    None => CompletionStatus::Failed(StatusCode::InvalidArgument),
                }
            }
        }
        _ => CompletionStatus::Failed(StatusCode::InvalidArgument),
    };

    sink.complete(job.token, status);
}

/// Write the response into the last (write-back) descriptor, or park it
/// and report the required size.
fn finish_writeback(
    region: &SharedRegion,
    job: &SubmitJob,
    client: &mut ClientState,
    response: Vec<u8>,
) -> CompletionStatus {
    let wb = job.descs.last().expect("descriptor list checked");
    if response.len() > wb.len as usize {
        let required = response.len() as u32;
        client.pending.push_back(response);
        return CompletionStatus::BufferTooSmall { required };
    }
    let len = response.len() as u32;
    if region.write_at(wb.offset, &response).is_err() {
        return CompletionStatus::Failed(StatusCode::Io);
    }
    CompletionStatus::Done { len }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn connect(host: &MockHost) -> u32 {
        let input = hostlink_core::pack_version(
            hostlink_core::PROTOCOL_MAJOR,
            hostlink_core::PROTOCOL_MINOR,
        )
        .to_le_bytes();
        let mut out = [0u8; 4];
        host.transact(OpCode::Connect, &input, &mut out).unwrap();
        u32::from_le_bytes(out)
    }

    #[test]
    fn connect_allocates_ids() {
        init_tracing();
        let host = MockHost::new();
        assert_eq!(connect(&host), 1);
        assert_eq!(connect(&host), 2);
        assert_eq!(host.connected_clients(), 2);
    }

    #[test]
    fn version_gate_rejects_mismatch() {
        let host = MockHost::new();
        host.set_version(2, 0);
        let input = hostlink_core::pack_version(3, 0).to_le_bytes();
        let mut out = [0u8; 4];
        let err = host.transact(OpCode::Connect, &input, &mut out);
        assert!(matches!(
            err,
            Err(PortError::Io(StatusCode::VersionMismatch))
        ));
        assert_eq!(host.connected_clients(), 0);
    }

    #[test]
    fn chunk_gap_is_rejected() {
        let host = MockHost::new();
        let client = connect(&host);

        let mut input = Vec::new();
        ChunkHeader { client, seq: 0 }.encode(&mut input);
        input.extend_from_slice(b"part0");
        host.transact(OpCode::WriteChunk, &input, &mut []).unwrap();

        // Deliver seq 2 out of order.
        let mut input = Vec::new();
        ChunkHeader { client, seq: 2 }.encode(&mut input);
        input.extend_from_slice(b"part2");
        let err = host.transact(OpCode::WriteChunk, &input, &mut []);
        assert!(matches!(err, Err(PortError::Io(StatusCode::ChunkGap))));
    }
}
