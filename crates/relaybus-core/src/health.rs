//! Endpoint registry, delivery workers and circuit breaking.
//!
//! Every registered endpoint gets a bounded job queue drained by its own
//! worker task, so routing never waits on endpoint I/O. The worker records
//! each outcome in the endpoint's [`HealthTracker`]:
//!
//! ```text
//! Healthy --N failures--> Degraded --M failures--> Unhealthy
//!    ^                       |                        |
//!    +------- success -------+---- probe success -----+
//! ```
//!
//! The failure counter restarts on every transition. Unhealthy endpoints
//! are skipped without I/O until the [`HealthMonitor`] probes them after the
//! cooldown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::join_all;
use parking_lot::Mutex;
use relaybus_types::config::HealthConfig;
use relaybus_types::envelope::Envelope;
use relaybus_types::error::{BusError, EndpointError};
use relaybus_types::health::{EndpointHealth, HealthState};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::correlation::deadline;
use crate::endpoint::BoxEndpoint;

/// A state change reported by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
}

/// Circuit breaker state for a single endpoint.
#[derive(Debug)]
pub struct HealthTracker {
    endpoint_id: String,
    state: HealthState,
    consecutive_failures: u32,
    /// When the circuit last opened or a probe last failed while open.
    opened_at: Option<Instant>,
    last_probe: Option<DateTime<Utc>>,
    last_error: Option<String>,
    total_deliveries: u64,
    total_failures: u64,
    failure_threshold: u32,
    circuit_open_threshold: u32,
    cooldown: Duration,
}

impl HealthTracker {
    pub fn new(endpoint_id: impl Into<String>, config: &HealthConfig) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            state: HealthState::Healthy,
            consecutive_failures: 0,
            opened_at: None,
            last_probe: None,
            last_error: None,
            total_deliveries: 0,
            total_failures: 0,
            failure_threshold: config.failure_threshold.max(1),
            circuit_open_threshold: config.circuit_open_threshold.max(1),
            cooldown: config.cooldown(),
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn accepts_traffic(&self) -> bool {
        self.state.accepts_traffic()
    }

    /// Whether the monitor should probe this endpoint at `now`.
    ///
    /// Open circuits wait out the cooldown; everything else is probed on
    /// every round.
    pub fn probe_due(&self, now: Instant) -> bool {
        match (self.state, self.opened_at) {
            (HealthState::Unhealthy, Some(opened_at)) => now >= deadline(opened_at, self.cooldown),
            _ => true,
        }
    }

    pub fn record_delivery(&mut self, outcome: &Result<(), EndpointError>) -> Option<Transition> {
        match outcome {
            Ok(()) => {
                self.total_deliveries += 1;
                self.record_success()
            }
            Err(e) => self.record_failure(e.to_string()),
        }
    }

    pub fn record_probe(&mut self, outcome: &Result<(), EndpointError>) -> Option<Transition> {
        self.last_probe = Some(Utc::now());
        match outcome {
            Ok(()) => self.record_success(),
            Err(e) => self.record_failure(e.to_string()),
        }
    }

    fn record_success(&mut self) -> Option<Transition> {
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.transition_to(HealthState::Healthy)
    }

    fn record_failure(&mut self, error: String) -> Option<Transition> {
        self.total_failures += 1;
        self.last_error = Some(error);
        self.consecutive_failures += 1;

        match self.state {
            HealthState::Healthy if self.consecutive_failures >= self.failure_threshold => {
                self.transition_to(HealthState::Degraded)
            }
            HealthState::Degraded if self.consecutive_failures >= self.circuit_open_threshold => {
                self.opened_at = Some(Instant::now());
                self.transition_to(HealthState::Unhealthy)
            }
            HealthState::Unhealthy => {
                // Failed probe: wait a full cooldown again.
                self.opened_at = Some(Instant::now());
                None
            }
            _ => None,
        }
    }

    fn transition_to(&mut self, to: HealthState) -> Option<Transition> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        self.consecutive_failures = 0;
        Some(Transition { from, to })
    }

    pub fn snapshot(&self) -> EndpointHealth {
        EndpointHealth {
            endpoint_id: self.endpoint_id.clone(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_probe: self.last_probe,
            last_error: self.last_error.clone(),
            total_deliveries: self.total_deliveries,
            total_failures: self.total_failures,
        }
    }
}

fn log_transition(endpoint_id: &str, transition: Option<Transition>) {
    let Some(Transition { from, to }) = transition else {
        return;
    };
    match to {
        HealthState::Healthy => info!(endpoint_id, %from, %to, "endpoint recovered"),
        HealthState::Degraded => warn!(endpoint_id, %from, %to, "endpoint degraded"),
        HealthState::Unhealthy => warn!(endpoint_id, %from, %to, "endpoint circuit opened"),
    }
}

// ---------------------------------------------------------------------------
// Delivery workers
// ---------------------------------------------------------------------------

/// One unit of work for an endpoint's delivery worker.
#[derive(Debug)]
pub struct DeliveryJob {
    pub envelope: Envelope,
    /// Receives the delivery outcome, when the caller wants it.
    pub ack: Option<oneshot::Sender<Result<(), BusError>>>,
}

struct EndpointEntry {
    endpoint: Arc<BoxEndpoint>,
    health: Arc<Mutex<HealthTracker>>,
    queue: mpsc::Sender<DeliveryJob>,
}

async fn run_delivery_worker(
    endpoint_id: String,
    endpoint: Arc<BoxEndpoint>,
    health: Arc<Mutex<HealthTracker>>,
    mut jobs: mpsc::Receiver<DeliveryJob>,
    delivery_timeout: Duration,
    cancel: CancellationToken,
) {
    debug!(%endpoint_id, "delivery worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let result = deliver_one(&endpoint_id, &endpoint, &health, job.envelope, delivery_timeout).await;
        if let Err(e) = &result {
            debug!(%endpoint_id, error = %e, "delivery failed");
        }
        if let Some(ack) = job.ack {
            let _ = ack.send(result);
        }
    }
    debug!(%endpoint_id, "delivery worker stopped");
}

async fn deliver_one(
    endpoint_id: &str,
    endpoint: &BoxEndpoint,
    health: &Mutex<HealthTracker>,
    envelope: Envelope,
    delivery_timeout: Duration,
) -> Result<(), BusError> {
    // The circuit may have opened while this job was queued.
    if !health.lock().accepts_traffic() {
        return Err(BusError::EndpointUnavailable(endpoint_id.to_string()));
    }

    let outcome = match tokio::time::timeout(delivery_timeout, endpoint.deliver(envelope)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(EndpointError::Timeout(delivery_timeout)),
    };

    let transition = health.lock().record_delivery(&outcome);
    log_transition(endpoint_id, transition);
    outcome.map_err(BusError::from)
}

// ---------------------------------------------------------------------------
// EndpointRegistry
// ---------------------------------------------------------------------------

/// Registered endpoints with their health trackers and delivery workers.
pub struct EndpointRegistry {
    endpoints: DashMap<String, EndpointEntry>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    config: HealthConfig,
    queue_capacity: usize,
    cancel: CancellationToken,
}

impl EndpointRegistry {
    pub fn new(config: HealthConfig, queue_capacity: usize) -> Self {
        Self {
            endpoints: DashMap::new(),
            workers: Mutex::new(Vec::new()),
            config,
            queue_capacity: queue_capacity.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Register an endpoint and spawn its delivery worker.
    ///
    /// Fails with [`BusError::NoRuntime`] outside a Tokio runtime.
    pub fn register(&self, endpoint_id: &str, endpoint: BoxEndpoint) -> Result<(), BusError> {
        if self.cancel.is_cancelled() {
            return Err(BusError::ShuttingDown);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| BusError::NoRuntime(endpoint_id.to_string()))?;

        match self.endpoints.entry(endpoint_id.to_string()) {
            Entry::Occupied(_) => Err(BusError::EndpointAlreadyRegistered(endpoint_id.to_string())),
            Entry::Vacant(slot) => {
                let endpoint = Arc::new(endpoint);
                let health = Arc::new(Mutex::new(HealthTracker::new(endpoint_id, &self.config)));
                let (queue, jobs) = mpsc::channel(self.queue_capacity);

                let worker = runtime.spawn(run_delivery_worker(
                    endpoint_id.to_string(),
                    Arc::clone(&endpoint),
                    Arc::clone(&health),
                    jobs,
                    self.config.delivery_timeout(),
                    self.cancel.child_token(),
                ));
                let mut workers = self.workers.lock();
                workers.retain(|w| !w.is_finished());
                workers.push(worker);
                drop(workers);

                slot.insert(EndpointEntry {
                    endpoint,
                    health,
                    queue,
                });
                info!(%endpoint_id, "endpoint registered");
                Ok(())
            }
        }
    }

    /// Remove an endpoint. Its worker finishes queued jobs and exits.
    pub fn deregister(&self, endpoint_id: &str) -> Result<(), BusError> {
        if self.endpoints.remove(endpoint_id).is_none() {
            return Err(BusError::EndpointNotFound(endpoint_id.to_string()));
        }
        info!(%endpoint_id, "endpoint deregistered");
        Ok(())
    }

    pub fn contains(&self, endpoint_id: &str) -> bool {
        self.endpoints.contains_key(endpoint_id)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Queue `envelope` for delivery to `endpoint_id`.
    ///
    /// Never waits: an open circuit fails with `EndpointUnavailable` and a
    /// full queue with `ChannelFull`, which also counts as a failure.
    pub fn enqueue(
        &self,
        endpoint_id: &str,
        envelope: Envelope,
        ack: Option<oneshot::Sender<Result<(), BusError>>>,
    ) -> Result<(), BusError> {
        let entry = self
            .endpoints
            .get(endpoint_id)
            .ok_or_else(|| BusError::EndpointNotFound(endpoint_id.to_string()))?;

        if !entry.health.lock().accepts_traffic() {
            return Err(BusError::EndpointUnavailable(endpoint_id.to_string()));
        }

        match entry.queue.try_send(DeliveryJob { envelope, ack }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let error = BusError::ChannelFull(format!("endpoint '{endpoint_id}' delivery queue"));
                let transition = entry
                    .health
                    .lock()
                    .record_delivery(&Err(EndpointError::Rejected(error.to_string())));
                log_transition(endpoint_id, transition);
                warn!(%endpoint_id, "delivery queue full");
                Err(error)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BusError::ShuttingDown),
        }
    }

    pub fn health(&self, endpoint_id: &str) -> Result<EndpointHealth, BusError> {
        self.endpoints
            .get(endpoint_id)
            .map(|entry| entry.health.lock().snapshot())
            .ok_or_else(|| BusError::EndpointNotFound(endpoint_id.to_string()))
    }

    /// Health of every endpoint, ordered by id.
    pub fn all_health(&self) -> Vec<EndpointHealth> {
        let mut all: Vec<EndpointHealth> = self
            .endpoints
            .iter()
            .map(|entry| entry.health.lock().snapshot())
            .collect();
        all.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        all
    }

    /// Probe one endpoint now, regardless of cooldown.
    pub async fn probe_endpoint(&self, endpoint_id: &str) -> Result<HealthState, BusError> {
        let (endpoint, health) = self
            .endpoints
            .get(endpoint_id)
            .map(|entry| (Arc::clone(&entry.endpoint), Arc::clone(&entry.health)))
            .ok_or_else(|| BusError::EndpointNotFound(endpoint_id.to_string()))?;

        Ok(probe_one(endpoint_id, &endpoint, &health, self.config.probe_timeout()).await)
    }

    /// Probe every endpoint whose probe is due, concurrently.
    ///
    /// Returns the number of endpoints probed.
    pub async fn probe_due(&self) -> usize {
        let now = Instant::now();
        let due: Vec<(String, Arc<BoxEndpoint>, Arc<Mutex<HealthTracker>>)> = self
            .endpoints
            .iter()
            .filter(|entry| entry.health.lock().probe_due(now))
            .map(|entry| {
                (
                    entry.key().clone(),
                    Arc::clone(&entry.endpoint),
                    Arc::clone(&entry.health),
                )
            })
            .collect();

        let probe_timeout = self.config.probe_timeout();
        let probes = due
            .iter()
            .map(|(id, endpoint, health)| probe_one(id, endpoint, health, probe_timeout));
        join_all(probes).await.len()
    }

    /// Stop every delivery worker and wait for them to exit.
    ///
    /// Jobs still queued are dropped; their acks observe a closed channel.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.endpoints.clear();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "delivery worker panicked");
            }
        }
    }
}

async fn probe_one(
    endpoint_id: &str,
    endpoint: &BoxEndpoint,
    health: &Mutex<HealthTracker>,
    probe_timeout: Duration,
) -> HealthState {
    let outcome = match tokio::time::timeout(probe_timeout, endpoint.probe()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(EndpointError::Timeout(probe_timeout)),
    };
    if let Err(e) = &outcome {
        debug!(%endpoint_id, error = %e, "probe failed");
    }

    let mut tracker = health.lock();
    let transition = tracker.record_probe(&outcome);
    let state = tracker.state();
    drop(tracker);

    log_transition(endpoint_id, transition);
    state
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("endpoints", &self.endpoints.len())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HealthMonitor
// ---------------------------------------------------------------------------

/// Periodic probe loop over an [`EndpointRegistry`].
#[derive(Debug)]
pub struct HealthMonitor {
    registry: Arc<EndpointRegistry>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<EndpointRegistry>, config: &HealthConfig) -> Self {
        Self {
            registry,
            interval: config.probe_interval(),
        }
    }

    /// Run one probe round.
    pub async fn probe_round(&self) -> usize {
        self.registry.probe_due().await
    }

    /// Spawn the probe loop; it exits when `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so fresh
            // endpoints are not probed at startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let probed = self.probe_round().await;
                        debug!(probed, "health probe round finished");
                    }
                }
            }
            debug!("health monitor stopped");
        })
    }
}
