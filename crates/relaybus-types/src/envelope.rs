//! Envelope domain types.
//!
//! An `Envelope` is the unit of transmission through the bus. Its `kind`
//! decides how the bus dispatches it: requests go to a single route,
//! responses back to the original caller, notifications to every matching
//! route, and events to pub/sub topic subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation identifier linking a request to its response.
pub type CorrelationId = String;

/// How the bus dispatches an envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Routed to exactly one endpoint; may expect a response.
    Request,
    /// Resolves a pending correlation and travels back to the caller.
    Response,
    /// Routed to every endpoint whose route matches.
    Notification,
    /// Published to topic subscribers.
    Event,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Notification => "notification",
            MessageKind::Event => "event",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message travelling through the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// UUIDv7 envelope ID.
    pub id: Uuid,
    /// Dispatch classification.
    pub kind: MessageKind,
    /// Routing key for requests and notifications, topic for events.
    pub routing_key: String,
    /// Correlation ID for request/response pairing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Endpoint that should receive the response to a request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Flexible JSON payload.
    pub payload: serde_json::Value,
    /// When the envelope was created.
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Build an envelope of the given kind.
    pub fn new(
        kind: MessageKind,
        routing_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            routing_key: routing_key.into(),
            correlation_id: None,
            reply_to: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn request(routing_key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(MessageKind::Request, routing_key, payload)
    }

    pub fn notification(routing_key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(MessageKind::Notification, routing_key, payload)
    }

    pub fn event(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(MessageKind::Event, topic, payload)
    }

    /// Build a response to `request`, carrying over its routing key and
    /// correlation ID.
    pub fn response_to(request: &Envelope, payload: serde_json::Value) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            ..Self::new(MessageKind::Response, request.routing_key.clone(), payload)
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Serialized payload size in bytes, used for size limits.
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(&self.payload).map_or(0, |bytes| bytes.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
