use thiserror::Error;

/// Errors returned by message bus operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("no route found for routing key '{0}'")]
    NoRouteFound(String),

    #[error("endpoint '{0}' not found")]
    EndpointNotFound(String),

    /// The endpoint's circuit is open; no delivery was attempted.
    #[error("endpoint '{0}' unavailable (circuit open)")]
    EndpointUnavailable(String),

    #[error("endpoint '{0}' is already registered")]
    EndpointAlreadyRegistered(String),

    #[error("correlation '{0}' is already pending")]
    DuplicateCorrelation(String),

    #[error("correlation '{0}' not found")]
    CorrelationNotFound(String),

    #[error("request timed out for correlation '{0}'")]
    RequestTimeout(String),

    #[error("response envelope carries no correlation id")]
    MissingCorrelationId,

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("route already exists: {0}")]
    RouteAlreadyExists(String),

    #[error("route not found: {0}")]
    RouteNotFound(String),

    #[error("subscription {0} not found")]
    SubscriptionNotFound(u64),

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    /// A bounded queue or subscriber channel is at capacity.
    #[error("channel full: {0}")]
    ChannelFull(String),

    #[error("message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge { size: usize, max: usize },

    #[error("message bus is shutting down")]
    ShuttingDown,

    /// Delivery workers need a Tokio runtime to run on.
    #[error("no Tokio runtime available for endpoint '{0}'")]
    NoRuntime(String),
}

impl BusError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::EndpointUnavailable(_)
                | BusError::DeliveryFailed(_)
                | BusError::ChannelFull(_)
                | BusError::RequestTimeout(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::RequestTimeout(_))
    }
}

/// Errors reported by endpoint implementations.
///
/// The bus maps these to [`BusError::DeliveryFailed`] and feeds them into
/// the endpoint's failure counter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("endpoint rejected message: {0}")]
    Rejected(String),

    #[error("endpoint channel closed")]
    Closed,

    #[error("endpoint did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

impl From<EndpointError> for BusError {
    fn from(e: EndpointError) -> Self {
        BusError::DeliveryFailed(e.to_string())
    }
}
