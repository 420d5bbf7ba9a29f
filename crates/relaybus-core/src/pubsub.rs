//! Topic-based publish/subscribe fan-out.
//!
//! Every subscription owns a bounded `mpsc` channel, so delivery can be
//! accounted per subscriber. Exact-topic subscriptions are grouped per topic;
//! pattern subscriptions are matched against the topic at publish time.
//!
//! Drop policy is **reject-newest**: when a subscriber's channel is full the
//! message being published is not enqueued for that subscriber, is reported
//! as a `ChannelFull` failure, and is not counted as delivered. Messages
//! already queued are never displaced, so each subscriber sees the messages
//! it accepted in publish order.
//!
//! Subscriber tables are copy-on-write `Arc<Vec<_>>`. A publish clones the
//! `Arc` and iterates that snapshot without holding any lock, so concurrent
//! subscribe/unsubscribe calls never mutate a list mid-iteration.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use relaybus_types::envelope::Envelope;
use relaybus_types::error::BusError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::pattern::GlobPattern;

/// Identifier handed out by [`PubSubManager::subscribe`].
pub type SubscriptionId = u64;

/// Default capacity of a subscriber channel.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1_000;

#[derive(Debug, Clone)]
struct TopicSlot {
    id: SubscriptionId,
    sender: mpsc::Sender<Envelope>,
}

#[derive(Debug, Clone)]
struct PatternSlot {
    id: SubscriptionId,
    pattern: GlobPattern,
    sender: mpsc::Sender<Envelope>,
}

/// Where a subscription lives, for removal.
#[derive(Debug, Clone)]
enum SlotKey {
    Topic(String),
    Pattern,
}

/// Receiving side of a subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    filter: String,
    receiver: mpsc::Receiver<Envelope>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The topic or pattern this subscription was created with.
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once the subscription has been removed and its queue
    /// is drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    /// Take the next queued message without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.receiver.try_recv().ok()
    }
}

/// A subscriber that did not receive a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberFailure {
    pub subscription_id: SubscriptionId,
    pub error: BusError,
}

/// Outcome of a single publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers whose filter matched the topic.
    pub matched: usize,
    /// Subscribers that accepted the message.
    pub delivered: usize,
    /// Subscribers whose channel rejected the message.
    pub failures: Vec<SubscriberFailure>,
}

/// Topic fan-out to exact and pattern subscribers.
pub struct PubSubManager {
    topics: DashMap<String, Arc<Vec<TopicSlot>>>,
    patterns: RwLock<Arc<Vec<PatternSlot>>>,
    index: DashMap<SubscriptionId, SlotKey>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    capacity: usize,
}

impl PubSubManager {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create a manager whose subscriber channels hold `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            patterns: RwLock::new(Arc::new(Vec::new())),
            index: DashMap::new(),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to an exact topic or a glob pattern.
    pub fn subscribe(&self, topic_or_pattern: &str) -> Result<Subscription, BusError> {
        if topic_or_pattern.is_empty() {
            return Err(BusError::InvalidPattern {
                pattern: String::new(),
                reason: "topic cannot be empty".to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.capacity);

        if GlobPattern::is_glob(topic_or_pattern) {
            let pattern = GlobPattern::compile(topic_or_pattern)?;
            let mut guard = self.patterns.write();
            let mut slots: Vec<PatternSlot> = guard.iter().cloned().collect();
            slots.push(PatternSlot {
                id,
                pattern,
                sender,
            });
            *guard = Arc::new(slots);
            self.index.insert(id, SlotKey::Pattern);
        } else {
            let slot = TopicSlot { id, sender };
            match self.topics.entry(topic_or_pattern.to_string()) {
                Entry::Occupied(mut group) => {
                    let mut slots: Vec<TopicSlot> = group.get().iter().cloned().collect();
                    slots.push(slot);
                    group.insert(Arc::new(slots));
                }
                Entry::Vacant(group) => {
                    group.insert(Arc::new(vec![slot]));
                }
            }
            self.index
                .insert(id, SlotKey::Topic(topic_or_pattern.to_string()));
        }

        debug!(subscription_id = id, filter = %topic_or_pattern, "subscribed");
        Ok(Subscription {
            id,
            filter: topic_or_pattern.to_string(),
            receiver,
        })
    }

    /// Remove a subscription.
    ///
    /// Publishes already iterating a snapshot that includes it are unaffected.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        let (_, key) = self
            .index
            .remove(&id)
            .ok_or(BusError::SubscriptionNotFound(id))?;

        match key {
            SlotKey::Topic(topic) => {
                if let Some(mut group) = self.topics.get_mut(&topic) {
                    let remaining: Vec<TopicSlot> =
                        group.iter().filter(|s| s.id != id).cloned().collect();
                    *group = Arc::new(remaining);
                }
                self.topics.remove_if(&topic, |_, slots| slots.is_empty());
            }
            SlotKey::Pattern => {
                let mut guard = self.patterns.write();
                let remaining: Vec<PatternSlot> =
                    guard.iter().filter(|s| s.id != id).cloned().collect();
                *guard = Arc::new(remaining);
            }
        }

        debug!(subscription_id = id, "unsubscribed");
        Ok(())
    }

    /// Deliver `envelope` to every subscriber of `topic`.
    ///
    /// Never blocks. See the module docs for the drop policy.
    pub fn publish(&self, topic: &str, envelope: &Envelope) -> PublishReport {
        let topic_slots = self.topics.get(topic).map(|group| Arc::clone(group.value()));
        let pattern_slots: Arc<Vec<PatternSlot>> = Arc::clone(&*self.patterns.read());

        let mut report = PublishReport::default();
        let mut closed = Vec::new();

        let targets = topic_slots
            .iter()
            .flat_map(|slots| slots.iter().map(|s| (s.id, &s.sender)))
            .chain(
                pattern_slots
                    .iter()
                    .filter(|s| s.pattern.is_match(topic))
                    .map(|s| (s.id, &s.sender)),
            );

        for (id, sender) in targets {
            report.matched += 1;
            match sender.try_send(envelope.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(subscription_id = id, %topic, "subscriber channel full, message dropped");
                    report.failures.push(SubscriberFailure {
                        subscription_id: id,
                        error: BusError::ChannelFull(format!("subscription {id}")),
                    });
                }
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }

        // Receivers that were dropped end their subscription.
        for id in closed {
            if self.unsubscribe(id).is_ok() {
                debug!(subscription_id = id, "pruned closed subscription");
            }
        }

        debug!(%topic, matched = report.matched, delivered = report.delivered, "published");
        report
    }

    /// Number of live subscriptions that would receive a publish to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let exact = self.topics.get(topic).map_or(0, |group| group.len());
        let patterns = self
            .patterns
            .read()
            .iter()
            .filter(|s| s.pattern.is_match(topic))
            .count();
        exact + patterns
    }

    pub fn total_subscriptions(&self) -> usize {
        self.index.len()
    }

    /// Messages rejected by full subscriber channels so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for PubSubManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PubSubManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubManager")
            .field("topics", &self.topics.len())
            .field("patterns", &self.patterns.read().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(topic: &str, n: i64) -> Envelope {
        Envelope::event(topic, json!({ "n": n }))
    }

    #[tokio::test]
    async fn exact_and_pattern_subscribers_both_receive() {
        let pubsub = PubSubManager::new();
        let mut pattern = pubsub.subscribe("orders.*").unwrap();
        let mut exact = pubsub.subscribe("orders.created").unwrap();

        let env = event("orders.created", 1);
        let report = pubsub.publish("orders.created", &env);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.matched, 2);
        assert!(report.failures.is_empty());

        assert_eq!(pattern.recv().await.unwrap(), env);
        assert_eq!(exact.recv().await.unwrap(), env);
    }

    #[tokio::test]
    async fn only_matching_subscribers_receive() {
        let pubsub = PubSubManager::new();
        let mut orders = pubsub.subscribe("orders.*").unwrap();
        let mut created = pubsub.subscribe("orders.created").unwrap();
        let mut users = pubsub.subscribe("users.*").unwrap();

        let report = pubsub.publish("orders.shipped", &event("orders.shipped", 1));
        assert_eq!(report.delivered, 1);

        assert!(orders.try_recv().is_some());
        assert!(created.try_recv().is_none());
        assert!(users.try_recv().is_none());
    }

    #[tokio::test]
    async fn several_subscribers_share_an_exact_topic() {
        let pubsub = PubSubManager::new();
        let mut a = pubsub.subscribe("news").unwrap();
        let mut b = pubsub.subscribe("news").unwrap();
        assert_eq!(pubsub.subscriber_count("news"), 2);

        let report = pubsub.publish("news", &event("news", 1));
        assert_eq!(report.delivered, 2);
        assert!(a.try_recv().is_some());
        assert!(b.try_recv().is_some());
    }

    #[tokio::test]
    async fn publish_without_subscribers_delivers_nothing() {
        let pubsub = PubSubManager::new();
        let report = pubsub.publish("empty", &event("empty", 1));
        assert_eq!(report, PublishReport::default());
    }

    #[tokio::test]
    async fn full_channel_rejects_newest_and_is_not_counted() {
        let pubsub = PubSubManager::with_capacity(2);
        let mut slow = pubsub.subscribe("ticks").unwrap();
        let mut fast = pubsub.subscribe("tick?").unwrap();

        for n in 0..2 {
            assert_eq!(pubsub.publish("ticks", &event("ticks", n)).delivered, 2);
        }
        // Drain the fast subscriber only.
        assert!(fast.try_recv().is_some());
        assert!(fast.try_recv().is_some());

        let report = pubsub.publish("ticks", &event("ticks", 2));
        assert_eq!(report.matched, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].subscription_id, slow.id());
        assert!(matches!(report.failures[0].error, BusError::ChannelFull(_)));
        assert_eq!(pubsub.dropped_count(), 1);

        // The oldest messages survive; the rejected one never arrives.
        assert_eq!(slow.try_recv().unwrap().payload["n"], 0);
        assert_eq!(slow.try_recv().unwrap().payload["n"], 1);
        assert!(slow.try_recv().is_none());
        assert_eq!(fast.try_recv().unwrap().payload["n"], 2);
    }

    #[tokio::test]
    async fn subscriber_sees_publish_order() {
        let pubsub = PubSubManager::new();
        let mut sub = pubsub.subscribe("seq.*").unwrap();
        for n in 0..50 {
            pubsub.publish("seq.x", &event("seq.x", n));
        }
        for n in 0..50 {
            assert_eq!(sub.recv().await.unwrap().payload["n"], n);
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let pubsub = PubSubManager::new();
        let exact = pubsub.subscribe("orders.created").unwrap();
        let pattern = pubsub.subscribe("orders.*").unwrap();
        assert_eq!(pubsub.total_subscriptions(), 2);

        pubsub.unsubscribe(exact.id()).unwrap();
        pubsub.unsubscribe(pattern.id()).unwrap();
        assert_eq!(pubsub.total_subscriptions(), 0);
        assert_eq!(pubsub.subscriber_count("orders.created"), 0);

        let report = pubsub.publish("orders.created", &event("orders.created", 1));
        assert_eq!(report.delivered, 0);

        assert!(matches!(
            pubsub.unsubscribe(exact.id()),
            Err(BusError::SubscriptionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn removed_subscription_drains_then_ends() {
        let pubsub = PubSubManager::new();
        let mut sub = pubsub.subscribe("t").unwrap();
        pubsub.publish("t", &event("t", 1));
        pubsub.unsubscribe(sub.id()).unwrap();

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned() {
        let pubsub = PubSubManager::new();
        let sub = pubsub.subscribe("t.*").unwrap();
        let keep = pubsub.subscribe("t.a").unwrap();
        drop(sub);

        let report = pubsub.publish("t.a", &event("t.a", 1));
        assert_eq!(report.delivered, 1);
        assert!(report.failures.is_empty());
        assert_eq!(pubsub.total_subscriptions(), 1);
        assert_eq!(keep.filter(), "t.a");
    }

    #[tokio::test]
    async fn invalid_filters_rejected() {
        let pubsub = PubSubManager::new();
        assert!(matches!(
            pubsub.subscribe("orders.[x"),
            Err(BusError::InvalidPattern { .. })
        ));
        assert!(matches!(
            pubsub.subscribe(""),
            Err(BusError::InvalidPattern { .. })
        ));
        assert_eq!(pubsub.total_subscriptions(), 0);
    }

    #[tokio::test]
    async fn snapshot_taken_before_unsubscribe_still_delivers() {
        let pubsub = PubSubManager::new();
        let mut sub = pubsub.subscribe("t").unwrap();

        // A publish that already holds the snapshot...
        let snapshot = pubsub.topics.get("t").map(|g| Arc::clone(g.value())).unwrap();
        pubsub.unsubscribe(sub.id()).unwrap();

        // ...still reaches the subscriber it enumerated.
        for slot in snapshot.iter() {
            slot.sender.try_send(event("t", 9)).unwrap();
        }
        assert_eq!(sub.recv().await.unwrap().payload["n"], 9);
        assert!(pubsub.topics.get("t").is_none());
    }
}
