//! Request/response correlation tracking with timeout-based expiry.
//!
//! Every pending correlation lives in a single `DashMap`. Removal from that
//! map is the only way an entry ends, whether by resolution, by the expiry
//! sweep, or by a caller giving up. Because `DashMap::remove` and
//! `DashMap::retain` both take the shard write lock, exactly one of those
//! paths observes any given entry; the others see `CorrelationNotFound`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use relaybus_types::envelope::{CorrelationId, Envelope};
use relaybus_types::error::BusError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound for deadlines, matching the cap tokio applies to timers.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + after`, capped so huge durations never overflow `Instant`.
pub(crate) fn deadline(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after.min(FAR_FUTURE))
        .unwrap_or(start)
}

/// An outstanding request awaiting its response.
#[derive(Debug)]
pub struct PendingCorrelation {
    reply_to: String,
    created_at: Instant,
    expires_at: Instant,
    /// Completion slot for an in-process caller suspended in
    /// `send_request_with_response`.
    waiter: Option<oneshot::Sender<Envelope>>,
}

impl PendingCorrelation {
    /// Where the response should be delivered.
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// How long the correlation was pending.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn has_waiter(&self) -> bool {
        self.waiter.is_some()
    }

    fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Hand the response to the suspended caller.
    ///
    /// Gives the envelope back if there is no waiter or the caller stopped
    /// waiting.
    pub fn fulfil(mut self, response: Envelope) -> Result<(), Envelope> {
        match self.waiter.take() {
            Some(tx) => tx.send(response),
            None => Err(response),
        }
    }
}

/// Counters for correlation outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationStats {
    pub registered: u64,
    pub resolved: u64,
    pub expired: u64,
}

/// Tracks outstanding request/response pairs by correlation ID.
pub struct CorrelationManager {
    pending: DashMap<CorrelationId, PendingCorrelation>,
    registered: AtomicU64,
    resolved: AtomicU64,
    expired: AtomicU64,
}

impl CorrelationManager {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            registered: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Record a pending request whose response goes to `reply_to`.
    ///
    /// Fails with `DuplicateCorrelation` if the ID is already pending. An
    /// entry that has expired but not yet been swept is reclaimed instead.
    pub fn register_request(
        &self,
        correlation_id: impl Into<CorrelationId>,
        reply_to: impl Into<String>,
        ttl: Duration,
    ) -> Result<(), BusError> {
        self.insert(correlation_id.into(), reply_to.into(), ttl, None)
    }

    /// Like [`register_request`](Self::register_request), but also installs
    /// a one-shot completion slot that receives the response envelope.
    pub fn register_waiter(
        &self,
        correlation_id: impl Into<CorrelationId>,
        reply_to: impl Into<String>,
        ttl: Duration,
    ) -> Result<oneshot::Receiver<Envelope>, BusError> {
        let (tx, rx) = oneshot::channel();
        self.insert(correlation_id.into(), reply_to.into(), ttl, Some(tx))?;
        Ok(rx)
    }

    fn insert(
        &self,
        correlation_id: CorrelationId,
        reply_to: String,
        ttl: Duration,
        waiter: Option<oneshot::Sender<Envelope>>,
    ) -> Result<(), BusError> {
        let now = Instant::now();
        let pending = PendingCorrelation {
            reply_to,
            created_at: now,
            expires_at: deadline(now, ttl),
            waiter,
        };

        match self.pending.entry(correlation_id) {
            Entry::Occupied(mut slot) => {
                if !slot.get().is_expired_at(now) {
                    return Err(BusError::DuplicateCorrelation(slot.key().clone()));
                }
                debug!(correlation_id = %slot.key(), "reclaimed expired correlation");
                slot.insert(pending);
                self.expired.fetch_add(1, Ordering::Relaxed);
            }
            Entry::Vacant(slot) => {
                debug!(correlation_id = %slot.key(), ?ttl, "registered correlation");
                slot.insert(pending);
            }
        }

        self.registered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove and return the pending entry for `correlation_id`.
    ///
    /// Fails with `CorrelationNotFound` if it is absent (already resolved or
    /// swept) and `RequestTimeout` if it was found past its expiry. Either
    /// way the entry is gone afterwards.
    pub fn take(&self, correlation_id: &str) -> Result<PendingCorrelation, BusError> {
        let (id, pending) = self
            .pending
            .remove(correlation_id)
            .ok_or_else(|| BusError::CorrelationNotFound(correlation_id.to_string()))?;

        if pending.is_expired_at(Instant::now()) {
            self.expired.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %id, "correlation expired before resolution");
            return Err(BusError::RequestTimeout(id));
        }

        self.resolved.fetch_add(1, Ordering::Relaxed);
        Ok(pending)
    }

    /// Atomically remove a pending correlation and return its reply-to address.
    pub fn resolve_correlation(&self, correlation_id: &str) -> Result<String, BusError> {
        self.take(correlation_id).map(|pending| pending.reply_to)
    }

    /// Withdraw a pending correlation without resolving it.
    ///
    /// Returns `true` if this call removed the entry.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        let removed = self.pending.remove(correlation_id).is_some();
        if removed {
            self.expired.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Whether `correlation_id` is pending and not yet expired.
    pub fn has_correlation(&self, correlation_id: &str) -> bool {
        self.pending
            .get(correlation_id)
            .is_some_and(|p| !p.is_expired_at(Instant::now()))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Remove every entry past its expiry, returning how many were removed.
    ///
    /// Dropping an entry's completion slot wakes its suspended caller.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut swept = 0usize;
        self.pending.retain(|id, pending| {
            if pending.is_expired_at(now) {
                debug!(correlation_id = %id, "sweeping expired correlation");
                swept += 1;
                false
            } else {
                true
            }
        });
        self.expired.fetch_add(swept as u64, Ordering::Relaxed);
        swept
    }

    pub fn stats(&self) -> CorrelationStats {
        CorrelationStats {
            registered: self.registered.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }

    /// Spawn the periodic expiry sweep.
    ///
    /// The task runs until `shutdown` is cancelled; await the returned handle
    /// to make sure no sweep runs after teardown.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = manager.sweep_expired();
                        if swept > 0 {
                            debug!(swept, "swept expired correlations");
                        }
                    }
                }
            }

            debug!("correlation sweeper stopped");
        })
    }
}

impl Default for CorrelationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CorrelationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationManager")
            .field("pending", &self.pending.len())
            .field("stats", &self.stats())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
