//! The `MessageBus` facade: classify an envelope by kind and dispatch it.
//!
//! - **Request:** one route via [`PatternRouter::find_route`], optional
//!   correlation, queued to the endpoint's delivery worker.
//! - **Response:** resolves its correlation, then wakes the in-process caller
//!   or queues the envelope to the reply-to endpoint.
//! - **Notification:** every distinct endpoint from
//!   [`PatternRouter::find_all_routes`]; per-target failures are collected.
//! - **Event:** topic fan-out through [`PubSubManager`].
//!
//! `route` never waits on endpoint I/O. Only
//! [`send_request_with_response`](MessageBus::send_request_with_response)
//! suspends its caller.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use relaybus_types::config::BusConfig;
use relaybus_types::envelope::{Envelope, MessageKind};
use relaybus_types::error::BusError;
use relaybus_types::health::{BusSnapshot, BusStats, EndpointHealth, HealthState};
use relaybus_types::route::Route;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::correlation::CorrelationManager;
use crate::endpoint::{BoxEndpoint, ChannelEndpoint, Endpoint};
use crate::health::{EndpointRegistry, HealthMonitor};
use crate::pubsub::{PubSubManager, PublishReport, Subscription, SubscriptionId};
use crate::router::PatternRouter;

/// A notification target that could not be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFailure {
    pub endpoint_id: String,
    pub error: BusError,
}

/// Outcome of a notification fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Endpoints whose delivery worker accepted the notification.
    pub delivered: Vec<String>,
    pub failures: Vec<TargetFailure>,
}

/// What `route` did with an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Request queued for `endpoint_id`.
    Dispatched { endpoint_id: String },
    /// Response handed to its waiting caller or queued for `reply_to`.
    Replied { reply_to: String },
    /// Notification fan-out result.
    Fanout(FanoutReport),
    /// Event publish result.
    Published(PublishReport),
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    responses: AtomicU64,
    notifications: AtomicU64,
    events: AtomicU64,
    routing_failures: AtomicU64,
}

impl Counters {
    fn count_kind(&self, kind: MessageKind) {
        let counter = match kind {
            MessageKind::Request => &self.requests,
            MessageKind::Response => &self.responses,
            MessageKind::Notification => &self.notifications,
            MessageKind::Event => &self.events,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// In-process message bus owning the router, correlation table, pub/sub
/// tables and endpoint registry.
pub struct MessageBus {
    config: BusConfig,
    router: PatternRouter,
    correlations: Arc<CorrelationManager>,
    pubsub: PubSubManager,
    endpoints: Arc<EndpointRegistry>,
    counters: Counters,
    started: AtomicBool,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageBus {
    /// Create a bus. No background work runs until [`start`](Self::start).
    pub fn new(config: BusConfig) -> Self {
        Self {
            router: PatternRouter::new(),
            correlations: Arc::new(CorrelationManager::new()),
            pubsub: PubSubManager::with_capacity(config.subscriber_capacity),
            endpoints: Arc::new(EndpointRegistry::new(
                config.health.clone(),
                config.endpoint_queue_capacity,
            )),
            counters: Counters::default(),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn router(&self) -> &PatternRouter {
        &self.router
    }

    pub fn correlations(&self) -> &CorrelationManager {
        &self.correlations
    }

    pub fn pubsub(&self) -> &PubSubManager {
        &self.pubsub
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn the correlation sweeper and the health probe loop.
    ///
    /// Calling it again, or after shutdown, does nothing.
    pub fn start(&self) {
        if self.shutting_down.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let sweeper = self
            .correlations
            .spawn_sweeper(self.config.sweep_interval(), self.cancel.child_token());
        let monitor = HealthMonitor::new(Arc::clone(&self.endpoints), &self.config.health)
            .spawn(self.cancel.child_token());
        self.tasks.lock().extend([sweeper, monitor]);

        info!(
            sweep_interval = ?self.config.sweep_interval(),
            probe_interval = ?self.config.health.probe_interval(),
            "message bus started"
        );
    }

    /// Reject new traffic, stop background work and wait for it to finish.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task panicked");
            }
        }
        self.endpoints.shutdown().await;

        info!(
            pending_correlations = self.correlations.pending_count(),
            "message bus stopped"
        );
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Route an envelope according to its kind.
    pub fn route(&self, envelope: Envelope) -> Result<RouteOutcome, BusError> {
        let started = std::time::Instant::now();
        let kind = envelope.kind;
        let routing_key = envelope.routing_key.clone();

        let result = self.admit(&envelope).and_then(|()| {
            self.counters.count_kind(kind);
            match kind {
                MessageKind::Request => self.route_request(envelope),
                MessageKind::Response => self.route_response(envelope),
                MessageKind::Notification => self.route_notification(envelope),
                MessageKind::Event => Ok(self.route_event(envelope)),
            }
        });

        if let Err(e) = &result {
            self.counters.routing_failures.fetch_add(1, Ordering::Relaxed);
            debug!(%kind, %routing_key, error = %e, "routing failed");
        }

        let elapsed = started.elapsed();
        if elapsed > self.config.routing_latency_warn() {
            warn!(%kind, %routing_key, ?elapsed, "slow routing");
        }
        result
    }

    /// Send a request and wait up to `ttl` for its response.
    ///
    /// A fresh correlation ID is assigned. When the envelope has no reply-to
    /// address the response is only handed to this caller. The envelope is
    /// sent as a request whatever its kind.
    pub async fn send_request_with_response(
        &self,
        envelope: Envelope,
        ttl: Duration,
    ) -> Result<Envelope, BusError> {
        self.admit(&envelope)?;
        self.counters.count_kind(MessageKind::Request);

        let result = self.request_and_wait(envelope, ttl).await;
        if result.is_err() {
            self.counters.routing_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn request_and_wait(&self, envelope: Envelope, ttl: Duration) -> Result<Envelope, BusError> {
        let correlation_id = Uuid::now_v7().to_string();
        let reply_to = envelope
            .reply_to
            .clone()
            .unwrap_or_else(|| format!("waiter:{correlation_id}"));
        let mut envelope = envelope
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(reply_to.clone());
        envelope.kind = MessageKind::Request;

        let endpoint_id = self.resolve_endpoint(&envelope.routing_key)?;
        let mut response = self
            .correlations
            .register_waiter(correlation_id.clone(), reply_to, ttl)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        if let Err(e) = self.endpoints.enqueue(&endpoint_id, envelope, Some(ack_tx)) {
            self.correlations.cancel(&correlation_id);
            return Err(e);
        }
        debug!(%correlation_id, %endpoint_id, ?ttl, "request dispatched, awaiting response");

        let waited = tokio::time::timeout(ttl, async {
            match ack_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(BusError::ShuttingDown),
            }
            // The sender is dropped only when the sweeper reclaims the entry.
            (&mut response)
                .await
                .map_err(|_| BusError::RequestTimeout(correlation_id.clone()))
        })
        .await;

        match waited {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                self.correlations.cancel(&correlation_id);
                Err(e)
            }
            Err(_) => {
                if self.correlations.cancel(&correlation_id) {
                    debug!(%correlation_id, "request timed out");
                    return Err(BusError::RequestTimeout(correlation_id));
                }
                // A response claimed the correlation first and is about to
                // fulfil the slot.
                response
                    .await
                    .map_err(|_| BusError::RequestTimeout(correlation_id))
            }
        }
    }

    fn admit(&self, envelope: &Envelope) -> Result<(), BusError> {
        if self.is_shutting_down() {
            return Err(BusError::ShuttingDown);
        }
        let size = envelope.payload_size();
        if size > self.config.max_message_size {
            return Err(BusError::MessageTooLarge {
                size,
                max: self.config.max_message_size,
            });
        }
        Ok(())
    }

    fn resolve_endpoint(&self, routing_key: &str) -> Result<String, BusError> {
        self.router
            .find_route(routing_key)
            .map(|route| route.endpoint_id)
            .ok_or_else(|| BusError::NoRouteFound(routing_key.to_string()))
    }

    fn route_request(&self, envelope: Envelope) -> Result<RouteOutcome, BusError> {
        let endpoint_id = self.resolve_endpoint(&envelope.routing_key)?;

        // Without a reply-to there is nowhere to send a response.
        let correlation_id = match (&envelope.correlation_id, &envelope.reply_to) {
            (Some(id), Some(reply_to)) => {
                self.correlations.register_request(
                    id.clone(),
                    reply_to.clone(),
                    self.config.correlation_ttl(),
                )?;
                Some(id.clone())
            }
            _ => None,
        };

        if let Err(e) = self.deliver_to_endpoint(&endpoint_id, envelope) {
            if let Some(id) = &correlation_id {
                self.correlations.cancel(id);
            }
            return Err(e);
        }

        debug!(%endpoint_id, ?correlation_id, "request dispatched");
        Ok(RouteOutcome::Dispatched { endpoint_id })
    }

    fn route_response(&self, envelope: Envelope) -> Result<RouteOutcome, BusError> {
        let correlation_id = envelope
            .correlation_id
            .clone()
            .ok_or(BusError::MissingCorrelationId)?;
        let pending = self.correlations.take(&correlation_id)?;
        let reply_to = pending.reply_to().to_string();

        if pending.has_waiter() {
            pending
                .fulfil(envelope)
                .map_err(|_| BusError::CorrelationNotFound(correlation_id.clone()))?;
        } else {
            self.deliver_to_endpoint(&reply_to, envelope)?;
        }

        debug!(%correlation_id, %reply_to, "response routed");
        Ok(RouteOutcome::Replied { reply_to })
    }

    fn route_notification(&self, envelope: Envelope) -> Result<RouteOutcome, BusError> {
        let routes = self.router.find_all_routes(&envelope.routing_key);
        if routes.is_empty() {
            return Err(BusError::NoRouteFound(envelope.routing_key));
        }

        let mut report = FanoutReport::default();
        let mut seen = HashSet::new();
        for route in routes {
            if !seen.insert(route.endpoint_id.clone()) {
                continue;
            }
            match self.deliver_to_endpoint(&route.endpoint_id, envelope.clone()) {
                Ok(()) => report.delivered.push(route.endpoint_id),
                Err(error) => report.failures.push(TargetFailure {
                    endpoint_id: route.endpoint_id,
                    error,
                }),
            }
        }

        debug!(
            routing_key = %envelope.routing_key,
            delivered = report.delivered.len(),
            failed = report.failures.len(),
            "notification fanned out"
        );
        Ok(RouteOutcome::Fanout(report))
    }

    fn route_event(&self, envelope: Envelope) -> RouteOutcome {
        RouteOutcome::Published(self.pubsub.publish(&envelope.routing_key, &envelope))
    }

    /// Queue an envelope for one endpoint, checking its circuit first.
    fn deliver_to_endpoint(&self, endpoint_id: &str, envelope: Envelope) -> Result<(), BusError> {
        self.endpoints.enqueue(endpoint_id, envelope, None)
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    pub fn register_route(
        &self,
        pattern: &str,
        endpoint_id: &str,
        priority: i32,
    ) -> Result<Route, BusError> {
        self.router.register_route(pattern, endpoint_id, priority)
    }

    pub fn deregister_route(&self, pattern: &str) -> Result<usize, BusError> {
        self.router.deregister_route(pattern)
    }

    pub fn subscribe(&self, topic_or_pattern: &str) -> Result<Subscription, BusError> {
        self.pubsub.subscribe(topic_or_pattern)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        self.pubsub.unsubscribe(id)
    }

    /// Register a delivery target. Fails with [`BusError::NoRuntime`]
    /// outside a Tokio runtime.
    pub fn register_endpoint<E: Endpoint + 'static>(
        &self,
        endpoint_id: &str,
        endpoint: E,
    ) -> Result<(), BusError> {
        self.endpoints.register(endpoint_id, BoxEndpoint::new(endpoint))
    }

    /// Register an in-memory endpoint and return the receiver it feeds.
    pub fn register_channel_endpoint(
        &self,
        endpoint_id: &str,
    ) -> Result<mpsc::Receiver<Envelope>, BusError> {
        let (endpoint, receiver) = ChannelEndpoint::new(self.config.endpoint_queue_capacity);
        self.register_endpoint(endpoint_id, endpoint)?;
        Ok(receiver)
    }

    pub fn deregister_endpoint(&self, endpoint_id: &str) -> Result<(), BusError> {
        self.endpoints.deregister(endpoint_id)
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    pub fn get_endpoint_health(&self, endpoint_id: &str) -> Result<EndpointHealth, BusError> {
        self.endpoints.health(endpoint_id)
    }

    pub fn all_endpoint_health(&self) -> Vec<EndpointHealth> {
        self.endpoints.all_health()
    }

    /// Probe one endpoint immediately, ignoring any cooldown.
    pub async fn probe_endpoint(&self, endpoint_id: &str) -> Result<HealthState, BusError> {
        self.endpoints.probe_endpoint(endpoint_id).await
    }

    pub fn stats(&self) -> BusStats {
        let correlations = self.correlations.stats();
        BusStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            responses: self.counters.responses.load(Ordering::Relaxed),
            notifications: self.counters.notifications.load(Ordering::Relaxed),
            events: self.counters.events.load(Ordering::Relaxed),
            routing_failures: self.counters.routing_failures.load(Ordering::Relaxed),
            correlations_resolved: correlations.resolved,
            correlations_expired: correlations.expired,
            subscriber_drops: self.pubsub.dropped_count(),
        }
    }

    pub fn snapshot(&self) -> BusSnapshot {
        BusSnapshot {
            taken_at: Utc::now(),
            route_count: self.router.route_count(),
            pending_correlations: self.correlations.pending_count(),
            subscriptions: self.pubsub.total_subscriptions(),
            endpoints: self.endpoints.all_health(),
            stats: self.stats(),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("routes", &self.router.route_count())
            .field("endpoints", &self.endpoints.len())
            .field("subscriptions", &self.pubsub.total_subscriptions())
            .field("pending_correlations", &self.correlations.pending_count())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use relaybus_types::config::HealthConfig;
    use relaybus_types::error::EndpointError;
    use serde_json::json;

    fn fast_config() -> BusConfig {
        BusConfig {
            correlation_ttl_ms: 1_000,
            sweep_interval_ms: 10,
            health: HealthConfig {
                failure_threshold: 3,
                circuit_open_threshold: 2,
                probe_interval_ms: 20,
                probe_timeout_ms: 20,
                cooldown_ms: 60,
                delivery_timeout_ms: 50,
            },
            ..BusConfig::default()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    /// Fails every delivery and probe while `down` is set.
    #[derive(Clone, Default)]
    struct Flaky {
        down: Arc<AtomicBool>,
        deliveries: Arc<AtomicUsize>,
    }

    impl Endpoint for Flaky {
        async fn deliver(&self, _envelope: Envelope) -> Result<(), EndpointError> {
            self.deliveries.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                Err(EndpointError::Rejected("unavailable".to_string()))
            } else {
                Ok(())
            }
        }

        async fn probe(&self) -> Result<(), EndpointError> {
            if self.down.load(Ordering::SeqCst) {
                Err(EndpointError::Closed)
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn request_reaches_best_route() {
        let bus = MessageBus::new(fast_config());
        let mut auth = bus.register_channel_endpoint("auth").unwrap();
        let _fallback = bus.register_channel_endpoint("fallback").unwrap();
        bus.register_route("svc.auth", "auth", 0).unwrap();
        bus.register_route("svc.*", "fallback", 10).unwrap();

        let outcome = bus
            .route(Envelope::request("svc.auth", json!({ "user": "ada" })))
            .unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Dispatched {
                endpoint_id: "auth".to_string()
            }
        );
        assert_eq!(auth.recv().await.unwrap().payload["user"], "ada");
    }

    #[tokio::test]
    async fn request_without_route_fails() {
        let bus = MessageBus::new(fast_config());
        assert_eq!(
            bus.route(Envelope::request("nowhere", json!(null))),
            Err(BusError::NoRouteFound("nowhere".to_string()))
        );
        assert_eq!(bus.stats().routing_failures, 1);
        assert_eq!(bus.stats().requests, 1);
    }

    #[tokio::test]
    async fn correlated_request_and_response_round_trip() {
        let bus = MessageBus::new(fast_config());
        let mut server = bus.register_channel_endpoint("server").unwrap();
        let mut client = bus.register_channel_endpoint("client").unwrap();
        bus.register_route("rpc.echo", "server", 0).unwrap();

        let request = Envelope::request("rpc.echo", json!({ "say": "hi" }))
            .with_correlation_id("c-1")
            .with_reply_to("client");
        bus.route(request).unwrap();
        assert!(bus.correlations().has_correlation("c-1"));

        let received = server.recv().await.unwrap();
        let reply = Envelope::response_to(&received, json!({ "said": "hi" }));
        assert_eq!(
            bus.route(reply.clone()).unwrap(),
            RouteOutcome::Replied {
                reply_to: "client".to_string()
            }
        );
        assert_eq!(client.recv().await.unwrap(), reply);
        assert_eq!(bus.correlations().pending_count(), 0);

        // A second response finds nothing.
        assert_eq!(
            bus.route(reply),
            Err(BusError::CorrelationNotFound("c-1".to_string()))
        );
    }

    #[tokio::test]
    async fn response_without_correlation_id_rejected() {
        let bus = MessageBus::new(fast_config());
        let orphan = Envelope::new(MessageKind::Response, "rpc.echo", json!(null));
        assert_eq!(bus.route(orphan), Err(BusError::MissingCorrelationId));
    }

    #[tokio::test]
    async fn request_with_correlation_but_no_reply_to_is_not_tracked() {
        let bus = MessageBus::new(fast_config());
        let _server = bus.register_channel_endpoint("server").unwrap();
        bus.register_route("rpc.fire", "server", 0).unwrap();

        bus.route(Envelope::request("rpc.fire", json!(null)).with_correlation_id("c-2"))
            .unwrap();
        assert_eq!(bus.correlations().pending_count(), 0);
    }

    #[tokio::test]
    async fn failed_dispatch_withdraws_correlation() {
        let bus = MessageBus::new(fast_config());
        bus.register_route("rpc.lost", "missing-endpoint", 0).unwrap();

        let request = Envelope::request("rpc.lost", json!(null))
            .with_correlation_id("c-3")
            .with_reply_to("client");
        assert_eq!(
            bus.route(request),
            Err(BusError::EndpointNotFound("missing-endpoint".to_string()))
        );
        assert!(!bus.correlations().has_correlation("c-3"));
    }

    #[tokio::test]
    async fn send_request_with_response_resolves() {
        let bus = Arc::new(MessageBus::new(fast_config()));
        let mut server = bus.register_channel_endpoint("server").unwrap();
        bus.register_route("rpc.*", "server", 0).unwrap();

        let responder = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                let request = server.recv().await.unwrap();
                assert!(request.reply_to.as_deref().unwrap().starts_with("waiter:"));
                let n = request.payload["n"].as_i64().unwrap();
                bus.route(Envelope::response_to(&request, json!({ "n": n * 2 })))
                    .unwrap();
            })
        };

        let reply = bus
            .send_request_with_response(
                Envelope::request("rpc.double", json!({ "n": 21 })),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(reply.payload["n"], 42);
        responder.await.unwrap();

        assert_eq!(bus.correlations().pending_count(), 0);
        assert_eq!(bus.stats().correlations_resolved, 1);
    }

    #[tokio::test]
    async fn unbounded_wait_still_resolves() {
        let bus = Arc::new(MessageBus::new(fast_config()));
        let mut server = bus.register_channel_endpoint("server").unwrap();
        bus.register_route("rpc.echo", "server", 0).unwrap();

        let responder = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                let request = server.recv().await.unwrap();
                bus.route(Envelope::response_to(&request, json!("pong")))
                    .unwrap();
            })
        };

        let reply = bus
            .send_request_with_response(Envelope::request("rpc.echo", json!("ping")), Duration::MAX)
            .await
            .unwrap();
        assert_eq!(reply.payload, json!("pong"));
        responder.await.unwrap();
        assert_eq!(bus.correlations().pending_count(), 0);
    }

    #[test]
    fn register_endpoint_outside_runtime_is_an_error() {
        let bus = MessageBus::new(fast_config());
        let (endpoint, _rx) = ChannelEndpoint::new(1);
        assert_eq!(
            bus.register_endpoint("server", endpoint),
            Err(BusError::NoRuntime("server".to_string()))
        );
    }

    #[tokio::test]
    async fn send_request_with_response_times_out() {
        let bus = MessageBus::new(fast_config());
        let mut server = bus.register_channel_endpoint("server").unwrap();
        bus.register_route("rpc.silent", "server", 0).unwrap();

        let err = bus
            .send_request_with_response(
                Envelope::request("rpc.silent", json!(null)),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(bus.correlations().pending_count(), 0);

        // The late response finds no correlation.
        let request = server.recv().await.unwrap();
        let late = bus.route(Envelope::response_to(&request, json!(null)));
        assert!(matches!(late, Err(BusError::CorrelationNotFound(_))));
    }

    #[tokio::test]
    async fn send_request_with_response_surfaces_delivery_failure() {
        let bus = MessageBus::new(fast_config());
        let endpoint = Flaky::default();
        endpoint.down.store(true, Ordering::SeqCst);
        bus.register_endpoint("flaky", endpoint).unwrap();
        bus.register_route("rpc.flaky", "flaky", 0).unwrap();

        let err = bus
            .send_request_with_response(
                Envelope::request("rpc.flaky", json!(null)),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::DeliveryFailed(_)));
        assert_eq!(bus.correlations().pending_count(), 0);
    }

    #[tokio::test]
    async fn notification_fans_out_to_distinct_endpoints() {
        let bus = MessageBus::new(fast_config());
        let mut audit = bus.register_channel_endpoint("audit").unwrap();
        let mut billing = bus.register_channel_endpoint("billing").unwrap();
        bus.register_route("orders.created", "billing", 0).unwrap();
        bus.register_route("orders.*", "audit", 0).unwrap();
        bus.register_route("orders.?reated", "audit", 5).unwrap();
        bus.register_route("orders.[a-z]*", "ghost", 0).unwrap();

        let outcome = bus
            .route(Envelope::notification("orders.created", json!({ "id": 7 })))
            .unwrap();
        let report = match outcome {
            RouteOutcome::Fanout(report) => report,
            other => panic!("expected fan-out, got {other:?}"),
        };
        assert_eq!(report.delivered, vec!["audit".to_string(), "billing".to_string()]);
        assert_eq!(
            report.failures,
            vec![TargetFailure {
                endpoint_id: "ghost".to_string(),
                error: BusError::EndpointNotFound("ghost".to_string()),
            }]
        );

        assert!(audit.recv().await.is_some());
        assert!(billing.recv().await.is_some());
        assert!(audit.try_recv().is_err());
    }

    #[tokio::test]
    async fn notification_without_routes_fails() {
        let bus = MessageBus::new(fast_config());
        assert_eq!(
            bus.route(Envelope::notification("quiet", json!(null))),
            Err(BusError::NoRouteFound("quiet".to_string()))
        );
    }

    #[tokio::test]
    async fn event_reaches_exact_and_pattern_subscribers() {
        let bus = MessageBus::new(fast_config());
        let mut pattern = bus.subscribe("orders.*").unwrap();
        let mut exact = bus.subscribe("orders.created").unwrap();

        let outcome = bus
            .route(Envelope::event("orders.created", json!({ "id": 1 })))
            .unwrap();
        let report = match outcome {
            RouteOutcome::Published(report) => report,
            other => panic!("expected publish, got {other:?}"),
        };
        assert_eq!(report.delivered, 2);
        assert!(pattern.recv().await.is_some());
        assert!(exact.recv().await.is_some());

        bus.unsubscribe(exact.id()).unwrap();
        assert_eq!(bus.snapshot().subscriptions, 1);
    }

    #[tokio::test]
    async fn circuit_opens_after_repeated_failures() {
        let bus = MessageBus::new(fast_config());
        let endpoint = Flaky::default();
        endpoint.down.store(true, Ordering::SeqCst);
        bus.register_endpoint("flaky", endpoint.clone()).unwrap();
        bus.register_route("jobs.run", "flaky", 0).unwrap();

        // N + M = 5 consecutive failures open the circuit.
        for attempt in 1..=5u64 {
            bus.route(Envelope::request("jobs.run", json!(null))).unwrap();
            wait_until(|| bus.get_endpoint_health("flaky").unwrap().total_failures == attempt).await;
            let expected = if attempt < 3 {
                HealthState::Healthy
            } else if attempt < 5 {
                HealthState::Degraded
            } else {
                HealthState::Unhealthy
            };
            assert_eq!(bus.get_endpoint_health("flaky").unwrap().state, expected);
        }

        assert_eq!(
            bus.route(Envelope::request("jobs.run", json!(null))),
            Err(BusError::EndpointUnavailable("flaky".to_string()))
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(endpoint.deliveries.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn probe_loop_recovers_endpoint_after_cooldown() {
        let bus = MessageBus::new(fast_config());
        let endpoint = Flaky::default();
        endpoint.down.store(true, Ordering::SeqCst);
        bus.register_endpoint("flaky", endpoint.clone()).unwrap();
        bus.register_route("jobs.run", "flaky", 0).unwrap();

        for attempt in 1..=5u64 {
            bus.route(Envelope::request("jobs.run", json!(null))).unwrap();
            wait_until(|| bus.get_endpoint_health("flaky").unwrap().total_failures == attempt).await;
        }
        assert_eq!(bus.get_endpoint_health("flaky").unwrap().state, HealthState::Unhealthy);

        endpoint.down.store(false, Ordering::SeqCst);
        bus.start();
        wait_until(|| bus.get_endpoint_health("flaky").unwrap().state == HealthState::Healthy).await;

        bus.route(Envelope::request("jobs.run", json!(null))).unwrap();
        wait_until(|| bus.get_endpoint_health("flaky").unwrap().total_deliveries == 1).await;
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_payload_rejected() {
        let config = BusConfig {
            max_message_size: 16,
            ..fast_config()
        };
        let bus = MessageBus::new(config);
        let big = Envelope::event("t", json!({ "blob": "x".repeat(64) }));
        assert!(matches!(
            bus.route(big),
            Err(BusError::MessageTooLarge { max: 16, .. })
        ));
    }

    #[tokio::test]
    async fn sweeper_runs_after_start() {
        let bus = MessageBus::new(fast_config());
        bus.correlations()
            .register_request("abandoned", "client", Duration::from_millis(5))
            .unwrap();
        bus.start();
        wait_until(|| bus.correlations().pending_count() == 0).await;
        assert_eq!(bus.stats().correlations_expired, 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_rejects_traffic_and_is_idempotent() {
        let bus = MessageBus::new(fast_config());
        let _rx = bus.register_channel_endpoint("svc").unwrap();
        bus.register_route("svc", "svc", 0).unwrap();
        bus.start();

        bus.shutdown().await;
        bus.shutdown().await;
        assert!(bus.is_shutting_down());
        assert_eq!(
            bus.route(Envelope::request("svc", json!(null))),
            Err(BusError::ShuttingDown)
        );
        assert_eq!(
            bus.send_request_with_response(Envelope::request("svc", json!(null)), Duration::from_millis(10))
                .await,
            Err(BusError::ShuttingDown)
        );
        assert!(bus.register_channel_endpoint("late").is_err());
    }

    #[tokio::test]
    async fn snapshot_reports_tables_and_counters() {
        let bus = MessageBus::new(fast_config());
        let _rx = bus.register_channel_endpoint("svc").unwrap();
        bus.register_route("svc.*", "svc", 0).unwrap();
        let _sub = bus.subscribe("news").unwrap();

        bus.route(Envelope::notification("svc.ping", json!(null))).unwrap();
        bus.route(Envelope::event("news", json!(null))).unwrap();
        let _ = bus.route(Envelope::request("unknown", json!(null)));

        let snapshot = bus.snapshot();
        assert_eq!(snapshot.route_count, 1);
        assert_eq!(snapshot.subscriptions, 1);
        assert_eq!(snapshot.endpoints.len(), 1);
        assert_eq!(snapshot.stats.notifications, 1);
        assert_eq!(snapshot.stats.events, 1);
        assert_eq!(snapshot.stats.requests, 1);
        assert_eq!(snapshot.stats.routing_failures, 1);
    }
}
