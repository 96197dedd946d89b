//! Connector configuration.
//!
//! Backend selection and sizing are explicit configuration captured when
//! the connection is constructed; nothing is process-global.

use std::time::Duration;

use hostlink_core::LinkError;
use hostlink_shm::RegionConfig;

/// Configuration for a [`Connection`](crate::Connection).
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Shared-region sizing.
    pub region: RegionConfig,
    /// How long disconnect waits for in-flight calls before hard-failing.
    pub drain_timeout: Duration,
    /// Depth of the completion handoff queue (power of 2).
    ///
    /// Bounds how many submit completions can be pending between the
    /// interrupt-context entry and the deferred worker.
    pub completion_queue_depth: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            region: RegionConfig::default(),
            drain_timeout: Duration::from_secs(2),
            completion_queue_depth: 256,
        }
    }
}

impl ConnectorConfig {
    pub(crate) fn validate(&self) -> Result<(), LinkError> {
        if !self.completion_queue_depth.is_power_of_two() || self.completion_queue_depth < 2 {
            return Err(LinkError::invalid_argument(
                "completion_queue_depth must be a power of 2 >= 2",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ConnectorConfig::default().validate().is_ok());
    }

    #[test]
    fn queue_depth_must_be_power_of_two() {
        let config = ConnectorConfig {
            completion_queue_depth: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
