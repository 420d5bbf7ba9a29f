//! Route domain type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mapping from a routing pattern to a destination endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    /// Exact routing key or glob pattern (`*`, `?`, `[...]`).
    pub pattern: String,
    /// Destination endpoint.
    pub endpoint_id: String,
    /// Higher values win among pattern routes.
    pub priority: i32,
    /// When the route was registered.
    pub registered_at: DateTime<Utc>,
    /// Registration order, used to break priority ties.
    pub sequence: u64,
}
