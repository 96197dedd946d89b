//! Connection: session lifecycle and the public data-plane surface.
//!
//! A connection negotiates a client id with the host, owns the lazily
//! initialized data plane (region, ring, heaps, cache, backends), and
//! tears down only after draining its in-flight calls. Data-plane entry
//! points never take the connection-wide state lock; they read the client
//! id atomically.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use hostlink_core::{
    Call, CallHeader, CallTag, ClientId, HostCaps, HostInfo, HostPort, LinkError, OpCode,
    Result, SubmitQueue, pack_version,
};
use hostlink_shm::{LazyInit, SharedRegion, Side};

use crate::config::ConnectorConfig;
use crate::plane::DataPlane;
use crate::stats::{ConnStats, StatsSnapshot};
use crate::submit_backend::SubmitBackend;
use crate::sync_backend::{port_err, SyncBackend};

/// Sentinel for "capabilities not yet queried".
const CAPS_UNKNOWN: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Connected(ClientId),
}

/// A negotiated session between one guest consumer and the host
/// counterpart.
pub struct Connection {
    config: ConnectorConfig,
    port: Arc<dyn HostPort>,
    submit_queue: Option<Arc<dyn SubmitQueue>>,
    sync: SyncBackend,

    plane: LazyInit<Arc<DataPlane>>,

    /// Non-hot-path lock: connect/disconnect/capability query only.
    state: Mutex<ConnState>,
    /// Client id mirror for the hot path (0 = not connected).
    client: AtomicU32,

    /// Cached capability bits; CAPS_UNKNOWN until queried.
    caps_bits: AtomicU64,
    caps_ext: AtomicU32,

    next_tag: AtomicU64,

    inflight: AtomicUsize,
    drain_lock: Mutex<()>,
    drain_cv: Condvar,

    stats: Arc<ConnStats>,
}

impl Connection {
    /// Create a connection using only the synchronous entry point.
    pub fn new(port: Arc<dyn HostPort>, config: ConnectorConfig) -> Result<Self> {
        Self::build(port, None, config)
    }

    /// Create a connection that also has the accelerated submit primitive.
    pub fn with_submit(
        port: Arc<dyn HostPort>,
        queue: Arc<dyn SubmitQueue>,
        config: ConnectorConfig,
    ) -> Result<Self> {
        Self::build(port, Some(queue), config)
    }

    fn build(
        port: Arc<dyn HostPort>,
        submit_queue: Option<Arc<dyn SubmitQueue>>,
        config: ConnectorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sync: SyncBackend::new(port.clone()),
            port,
            submit_queue,
            config,
            plane: LazyInit::new(),
            state: Mutex::new(ConnState::Disconnected),
            client: AtomicU32::new(0),
            caps_bits: AtomicU64::new(CAPS_UNKNOWN),
            caps_ext: AtomicU32::new(0),
            next_tag: AtomicU64::new(0),
            inflight: AtomicUsize::new(0),
            drain_lock: Mutex::new(()),
            drain_cv: Condvar::new(),
            stats: Arc::new(ConnStats::default()),
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Negotiate a session. The host may reject the version; no client id
    /// is allocated on failure.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn connect(&self, major: u16, minor: u16) -> Result<ClientId> {
        let mut state = self.state.lock();
        if let ConnState::Connected(_) = *state {
            return Err(LinkError::new(
                hostlink_core::StatusCode::AlreadyConnected,
                "session already negotiated",
            ));
        }
        *state = ConnState::Connecting;

        let input = pack_version(major, minor).to_le_bytes();
        let mut output = [0u8; 4];
        let id = match self.port.transact(OpCode::Connect, &input, &mut output) {
            Ok(n) if n >= 4 => {
                let raw = u32::from_le_bytes(output);
                match ClientId::new(raw) {
                    Some(id) => id,
                    None => {
                        *state = ConnState::Disconnected;
                        return Err(LinkError::io("host returned a null client id"));
                    }
                }
            }
            Ok(_) => {
                *state = ConnState::Disconnected;
                return Err(LinkError::io("short connect reply"));
            }
            Err(e) => {
                *state = ConnState::Disconnected;
                return Err(port_err(e));
            }
        };

        // First use of the shared plumbing; created exactly once even if
        // concurrent connects race here.
        if let Err(e) = self.plane.get_or_try_init(|| {
            DataPlane::create(
                &self.config,
                self.port.clone(),
                self.submit_queue.clone(),
                self.stats.clone(),
            )
        }) {
            *state = ConnState::Disconnected;
            return Err(e);
        }

        *state = ConnState::Connected(id);
        self.client.store(id.get(), Ordering::Release);
        drop(state);

        // Capability query is part of session setup; cached until the next
        // reconnect. A host that cannot answer just disables the
        // accelerated path.
        match self.query_caps(id.get()) {
            Ok(info) => {
                self.caps_bits.store(info.caps.bits(), Ordering::Release);
                self.caps_ext
                    .store(info.extension_version, Ordering::Release);
            }
            Err(e) => {
                tracing::warn!(error = %e, "capability query failed; accelerated path disabled");
            }
        }

        if let Some(plane) = self.plane.get() {
            plane.region.heartbeat(Side::Guest);
        }
        tracing::info!(client = %id, "session connected");
        Ok(id)
    }

    /// Bind the connection to a consumer process for accounting and
    /// injection targeting.
    pub fn set_process_identity(&self, pid: u32) -> Result<()> {
        let client = self.require_client()?;
        let mut input = Vec::with_capacity(8);
        input.extend_from_slice(&client.to_le_bytes());
        input.extend_from_slice(&pid.to_le_bytes());
        self.port
            .transact(OpCode::SetIdentity, &input, &mut [])
            .map(|_| ())
            .map_err(port_err)
    }

    /// Host capability bitmask and extension version, cached per
    /// connection; re-queried only on reconnect.
    pub fn host_capabilities(&self) -> Result<HostInfo> {
        let bits = self.caps_bits.load(Ordering::Acquire);
        if bits != CAPS_UNKNOWN {
            return Ok(HostInfo {
                caps: HostCaps::from_bits_truncate(bits),
                extension_version: self.caps_ext.load(Ordering::Acquire),
            });
        }
        let client = self.require_client()?;
        let info = self.query_caps(client)?;
        self.caps_bits.store(info.caps.bits(), Ordering::Release);
        self.caps_ext
            .store(info.extension_version, Ordering::Release);
        Ok(info)
    }

    fn query_caps(&self, client: u32) -> Result<HostInfo> {
        let mut input = Vec::with_capacity(CallHeader::WIRE_SIZE);
        CallHeader { client, flags: 0 }.encode(&mut input);
        let mut output = [0u8; HostInfo::WIRE_SIZE];
        let n = self
            .port
            .transact(OpCode::QueryCaps, &input, &mut output)
            .map_err(port_err)?;
        HostInfo::parse(&output[..n]).ok_or_else(|| LinkError::io("malformed capability reply"))
    }

    /// Tear the session down after draining in-flight calls.
    ///
    /// Exceeding the bounded drain timeout is a hard failure: the shared
    /// mappings are intentionally leaked (a host operation may still be
    /// writing into them) and the leak is logged.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock();
        let id = match *state {
            ConnState::Connected(id) => id,
            _ => return Err(LinkError::not_connected("disconnect without a session")),
        };

        // Reject new data-plane calls while draining.
        self.client.store(0, Ordering::Release);

        if !self.drain(self.config.drain_timeout) {
            let leaked = self.plane.get().map(|p| p.region.size()).unwrap_or(0);
            if let Some(plane) = self.plane.get() {
                std::mem::forget(plane.clone());
            }
            *state = ConnState::Disconnected;
            self.caps_bits.store(CAPS_UNKNOWN, Ordering::Release);
            tracing::error!(
                client = %id,
                leaked_bytes = leaked,
                "in-flight calls did not drain; shared region leaked"
            );
            return Err(LinkError::drain_timeout(format!(
                "disconnect abandoned {} in-flight call(s)",
                self.inflight.load(Ordering::Acquire)
            )));
        }

        let input = id.get().to_le_bytes();
        let result = self
            .port
            .transact(OpCode::Disconnect, &input, &mut [])
            .map(|_| ())
            .map_err(port_err);

        if let Some(plane) = self.plane.get() {
            plane.cache.clear();
        }
        self.caps_bits.store(CAPS_UNKNOWN, Ordering::Release);
        *state = ConnState::Disconnected;
        tracing::info!(client = %id, "session disconnected");
        result
    }

    /// Wait for the in-flight count to reach zero. Returns false on
    /// timeout with calls still outstanding.
    fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.drain_lock.lock();
        while self.inflight.load(Ordering::Acquire) > 0 {
            if self.drain_cv.wait_until(&mut guard, deadline).timed_out()
                && self.inflight.load(Ordering::Acquire) > 0
            {
                return false;
            }
        }
        true
    }

    // ========================================================================
    // Data plane
    // ========================================================================

    /// Fire-and-forget command stream.
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        let client = self.require_client()?;
        let plane = self.plane_ref()?;
        let _guard = self.begin_call();
        let tag = CallTag::new(self.next_tag());
        self.sync.write(plane, client, tag, payload, &self.stats)
    }

    /// Blocking read of pending host data. `max_len` sizes the initial
    /// write-back buffer; the buffer grows if the host reports a larger
    /// pending response.
    pub fn read(&self, max_len: u32) -> Result<Vec<u8>> {
        let client = self.require_client()?;
        let plane = self.plane_ref()?;
        let _guard = self.begin_call();
        ConnStats::add(&self.stats.calls, 1);
        let call = Arc::new(Call::new(CallTag::new(self.next_tag())));

        match self.use_submit(plane) {
            Some(sb) => {
                if let Err(reason) = sb.read(&call, client, max_len) {
                    ConnStats::add(&self.stats.fallbacks, 1);
                    tracing::debug!(%reason, "accelerated read fell back to sync");
                    self.sync.read(plane, &call, client, max_len, &self.stats);
                }
            }
            None => self.sync.read(plane, &call, client, max_len, &self.stats),
        }
        call.wait().into_result()
    }

    /// Combined send+receive: one host round trip on either backend.
    pub fn write_read(&self, payload: &[u8], max_len: u32) -> Result<Vec<u8>> {
        let client = self.require_client()?;
        let plane = self.plane_ref()?;
        let _guard = self.begin_call();
        ConnStats::add(&self.stats.calls, 1);
        let call = Arc::new(Call::new(CallTag::new(self.next_tag())));

        match self.use_submit(plane) {
            Some(sb) => {
                if let Err(reason) = sb.write_read(&call, client, payload, max_len) {
                    ConnStats::add(&self.stats.fallbacks, 1);
                    tracing::debug!(%reason, "accelerated write_read fell back to sync");
                    self.sync
                        .write_read(plane, &call, client, payload, max_len, &self.stats);
                }
            }
            None => self
                .sync
                .write_read(plane, &call, client, payload, max_len, &self.stats),
        }
        call.wait().into_result()
    }

    /// Inject a command into another session.
    pub fn inject(&self, target: ClientId, payload: &[u8]) -> Result<()> {
        self.require_client()?;
        let _guard = self.begin_call();
        let tag = CallTag::new(self.next_tag());
        self.sync.inject(target.get(), tag, payload, &self.stats)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn client_id(&self) -> Option<ClientId> {
        ClientId::new(self.client.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The shared region, once the data plane exists. The host-side
    /// counterpart maps this to drain the ring and serve submissions.
    pub fn region(&self) -> Option<Arc<SharedRegion>> {
        self.plane.get().map(|p| p.region.clone())
    }

    /// Whether the host's heartbeat is younger than `timeout`.
    pub fn host_alive(&self, timeout: Duration) -> bool {
        match self.plane.get() {
            Some(plane) => plane.region.is_alive(Side::Host, timeout.as_nanos() as u64),
            None => false,
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn require_client(&self) -> Result<u32> {
        let id = self.client.load(Ordering::Acquire);
        if id == 0 {
            return Err(LinkError::not_connected("no negotiated session"));
        }
        Ok(id)
    }

    fn plane_ref(&self) -> Result<&Arc<DataPlane>> {
        self.plane
            .get()
            .ok_or_else(|| LinkError::not_connected("data plane not initialized"))
    }

    fn use_submit<'a>(&self, plane: &'a DataPlane) -> Option<&'a SubmitBackend> {
        let backend = plane.submit.as_ref()?;
        let bits = self.caps_bits.load(Ordering::Acquire);
        if bits == CAPS_UNKNOWN {
            return None;
        }
        HostCaps::from_bits_truncate(bits)
            .contains(HostCaps::SUBMIT)
            .then_some(backend)
    }

    fn next_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn begin_call(&self) -> CallGuard<'_> {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        CallGuard(self)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.client.load(Ordering::Acquire) != 0 {
            if let Err(e) = self.disconnect() {
                tracing::warn!(error = %e, "disconnect on drop failed");
            }
        }
    }
}

struct CallGuard<'a>(&'a Connection);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let _guard = self.0.drain_lock.lock();
        if self.0.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drain_cv.notify_all();
        }
    }
}
