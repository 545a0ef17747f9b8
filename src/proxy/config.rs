//! Proxy instance configuration.

use crate::error::{ProxyError, Result};
use crate::ingress::DEFAULT_RING_CAPACITY;
use crate::storage::{InstanceId, DEFAULT_CONNECT_TIMEOUT};
use std::time::Duration;

/// Default depth of the command and bulk queues.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Default time teardown waits for workers and listeners before aborting them.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Configuration for one proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Identity of the instance; part of every socket key it owns
    pub instance_id: InstanceId,

    /// Bulk ring size in bytes (must be a power of two)
    pub ring_capacity: usize,

    /// Capacity of the command queue
    pub command_queue_depth: usize,

    /// Capacity of the bulk queue
    pub bulk_queue_depth: usize,

    /// Upper bound on a single CONNECT
    pub connect_timeout: Duration,

    /// Grace period for workers and listeners at teardown
    pub shutdown_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            instance_id: InstanceId::new(0),
            ring_capacity: DEFAULT_RING_CAPACITY,
            command_queue_depth: DEFAULT_QUEUE_DEPTH,
            bulk_queue_depth: DEFAULT_QUEUE_DEPTH,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl ProxyConfig {
    /// Default configuration for the given instance.
    pub fn for_instance(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.ring_capacity.is_power_of_two() {
            return Err(ProxyError::InvalidConfig(format!(
                "ring capacity must be a power of two, got {}",
                self.ring_capacity
            )));
        }
        if self.command_queue_depth == 0 || self.bulk_queue_depth == 0 {
            return Err(ProxyError::InvalidConfig(
                "queue depths must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ProxyError::InvalidConfig(
                "connect timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
