//! Engine-level rate limit settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::store::Keyspace;

/// What the engine answers when the shared store cannot open a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request and fall back to a local-only window.
    #[default]
    Open,
    /// Reject the request until the store is reachable again.
    Closed,
}

/// Settings shared by the admission engine, scheduler and propagator.
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Namespace for every store key and channel
    pub partition_key: String,
    /// Requests allowed per window
    pub quota: u64,
    /// Length of a window
    pub window: Duration,
    /// Interval between flushes of the pending queue
    pub flush_interval: Duration,
    /// Capacity of each local cache
    pub local_cache_capacity: u64,
    pub failure_policy: FailurePolicy,
}

impl LimiterSettings {
    pub fn keyspace(&self) -> Keyspace {
        Keyspace::new(&self.partition_key)
    }
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            partition_key: "glider".to_string(),
            quota: 1000,
            window: Duration::from_secs(3600),
            flush_interval: Duration::from_millis(2000),
            local_cache_capacity: 500,
            failure_policy: FailurePolicy::Open,
        }
    }
}
