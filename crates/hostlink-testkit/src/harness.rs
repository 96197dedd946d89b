//! Connected guest/host pairs for integration tests.

use std::sync::Arc;

use hostlink::{Connection, ConnectorConfig};
use hostlink_core::{ClientId, LinkError, SubmitQueue, PROTOCOL_MAJOR, PROTOCOL_MINOR};

use crate::mock_host::MockHost;

/// A connected guest/host pair.
pub struct TestLink {
    pub host: Arc<MockHost>,
    pub conn: Connection,
    pub client: ClientId,
}

impl TestLink {
    /// Synchronous-backend-only pair.
    pub fn connect_sync() -> Result<Self, LinkError> {
        Self::connect_sync_with(MockHost::new(), ConnectorConfig::default())
    }

    pub fn connect_sync_with(
        host: Arc<MockHost>,
        config: ConnectorConfig,
    ) -> Result<Self, LinkError> {
        let conn = Connection::new(host.clone(), config)?;
        let client = conn.connect(PROTOCOL_MAJOR, PROTOCOL_MINOR)?;
        host.map_region(conn.region().expect("region after connect"));
        Ok(Self { host, conn, client })
    }

    /// Pair with the accelerated submit path available.
    pub fn connect_accel() -> Result<Self, LinkError> {
        Self::connect_accel_with(MockHost::new(), ConnectorConfig::default())
    }

    pub fn connect_accel_with(
        host: Arc<MockHost>,
        config: ConnectorConfig,
    ) -> Result<Self, LinkError> {
        let queue: Arc<dyn SubmitQueue> = host.clone();
        let conn = Connection::with_submit(host.clone(), queue, config)?;
        let client = conn.connect(PROTOCOL_MAJOR, PROTOCOL_MINOR)?;
        host.map_region(conn.region().expect("region after connect"));
        Ok(Self { host, conn, client })
    }
}
