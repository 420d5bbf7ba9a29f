//! Bus configuration types.
//!
//! `BusConfig` is the top level of `relaybus.toml`; circuit breaker settings
//! live under `[health]`. Every field has a default so an empty file is a
//! valid configuration. Durations are stored as integer
//! milliseconds (or microseconds) and exposed as `Duration` via accessors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for a message bus instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusConfig {
    /// Default time-to-live for pending correlations.
    #[serde(default = "default_correlation_ttl_ms")]
    pub correlation_ttl_ms: u64,

    /// How often the sweeper removes expired correlations.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Capacity of each pub/sub subscriber channel.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,

    /// Capacity of each endpoint's delivery queue.
    #[serde(default = "default_endpoint_queue_capacity")]
    pub endpoint_queue_capacity: usize,

    /// Maximum serialized payload size accepted by `route()`.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Routing calls slower than this are logged at warn level.
    #[serde(default = "default_routing_latency_warn_us")]
    pub routing_latency_warn_us: u64,

    /// Circuit breaker and probe settings.
    #[serde(default)]
    pub health: HealthConfig,
}

fn default_correlation_ttl_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_subscriber_capacity() -> usize {
    1_000
}

fn default_endpoint_queue_capacity() -> usize {
    256
}

fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_routing_latency_warn_us() -> u64 {
    100
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            correlation_ttl_ms: default_correlation_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            subscriber_capacity: default_subscriber_capacity(),
            endpoint_queue_capacity: default_endpoint_queue_capacity(),
            max_message_size: default_max_message_size(),
            routing_latency_warn_us: default_routing_latency_warn_us(),
            health: HealthConfig::default(),
        }
    }
}

impl BusConfig {
    pub fn correlation_ttl(&self) -> Duration {
        Duration::from_millis(self.correlation_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn routing_latency_warn(&self) -> Duration {
        Duration::from_micros(self.routing_latency_warn_us)
    }
}

/// Circuit breaker thresholds and probe timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures that move a Healthy endpoint to Degraded.
    pub failure_threshold: u32,
    /// Further consecutive failures that move Degraded to Unhealthy.
    pub circuit_open_threshold: u32,
    /// Interval between probe rounds.
    pub probe_interval_ms: u64,
    /// Upper bound on a single probe.
    pub probe_timeout_ms: u64,
    /// Minimum time an open circuit waits before it is probed.
    pub cooldown_ms: u64,
    /// Upper bound on a single endpoint delivery.
    pub delivery_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            circuit_open_threshold: 2,
            probe_interval_ms: 5_000,
            probe_timeout_ms: 1_000,
            cooldown_ms: 30_000,
            delivery_timeout_ms: 5_000,
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}
