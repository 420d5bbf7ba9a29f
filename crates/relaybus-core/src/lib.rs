//! In-process message bus engine.
//!
//! - `router` -- `PatternRouter` with exact and glob routes, priorities and a resolution cache
//! - `correlation` -- `CorrelationManager` for request/response pairing with expiry
//! - `pubsub` -- `PubSubManager` topic fan-out over bounded subscriber channels
//! - `endpoint` -- `Endpoint` trait, `BoxEndpoint` and the in-memory `ChannelEndpoint`
//! - `health` -- `EndpointRegistry`, delivery workers, circuit breaker and `HealthMonitor`
//! - `bus` -- `MessageBus` facade tying the above together
//! - `config` -- loading `BusConfig` from TOML

pub mod bus;
pub mod config;
pub mod correlation;
pub mod endpoint;
pub mod health;
pub mod pattern;
pub mod pubsub;
pub mod router;

pub use bus::{FanoutReport, MessageBus, RouteOutcome, TargetFailure};
pub use correlation::CorrelationManager;
pub use endpoint::{BoxEndpoint, ChannelEndpoint, Endpoint};
pub use health::{EndpointRegistry, HealthMonitor, HealthTracker};
pub use pubsub::{PubSubManager, PublishReport, Subscription, SubscriptionId};
pub use router::PatternRouter;
