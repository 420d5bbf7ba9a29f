//! Endpoint health and bus observability types.
//!
//! These are point-in-time snapshots handed to telemetry consumers; the live
//! state lives inside `relaybus-core`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Circuit breaker state of an endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Normal operation.
    Healthy,
    /// Failing intermittently; still receives traffic.
    Degraded,
    /// Circuit open; deliveries short-circuit until a probe succeeds.
    Unhealthy,
}

impl HealthState {
    /// Whether deliveries may be attempted in this state.
    pub fn accepts_traffic(&self) -> bool {
        !matches!(self, HealthState::Unhealthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health snapshot for a single endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointHealth {
    pub endpoint_id: String,
    pub state: HealthState,
    /// Delivery and probe failures since the last success or state change.
    pub consecutive_failures: u32,
    /// When the endpoint was last probed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe: Option<DateTime<Utc>>,
    /// Most recent delivery or probe error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub total_deliveries: u64,
    pub total_failures: u64,
}

/// Routing counters accumulated since the bus was created.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusStats {
    pub requests: u64,
    pub responses: u64,
    pub notifications: u64,
    pub events: u64,
    /// `route()` calls that returned an error.
    pub routing_failures: u64,
    pub correlations_resolved: u64,
    pub correlations_expired: u64,
    /// Pub/sub messages rejected by full subscriber channels.
    pub subscriber_drops: u64,
}

/// Point-in-time view of the whole bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusSnapshot {
    pub taken_at: DateTime<Utc>,
    pub route_count: usize,
    pub pending_correlations: usize,
    pub subscriptions: usize,
    pub endpoints: Vec<EndpointHealth>,
    pub stats: BusStats,
}
