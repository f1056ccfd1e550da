//! In-process publish/subscribe bus with bounded per-subscriber queues.
//!
//! Every subscriber owns a bounded flume queue. Publishing never blocks: when a
//! queue is full its oldest envelope is evicted to admit the new one, so slow
//! consumers see the most recent data and a gap rather than stalling the
//! producer. Closing the bus pushes a `BusItem::Closed` marker into every queue so
//! pending `recv()` calls finish promptly.

use bytes::Bytes;
use dashmap::DashMap;
use flume::{Receiver, Sender, TrySendError};
use futures_util::Stream;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, trace};

use crate::clock::TimeSource;
use crate::error::BusError;

/// Published message plus its topic and publish time (clock monotonic seconds).
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub timestamp: f64,
    pub payload: Bytes,
}

/// What travels through a subscriber queue.
#[derive(Debug, Clone)]
enum BusItem {
    Envelope(Envelope),
    Closed,
}

/// Snapshot of one topic's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TopicStats {
    /// Longest backlog across the topic's subscribers.
    pub queue_len: usize,
    pub drops: u64,
    pub publishes: u64,
    pub deliveries: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusMetrics {
    pub topics: BTreeMap<String, TopicStats>,
}

struct SubscriberQueue {
    id: u64,
    tx: Sender<BusItem>,
    // Held so the publisher can evict the oldest entry of a full queue.
    rx: Receiver<BusItem>,
}

struct Delivery {
    delivered: bool,
    evicted: u64,
}

impl SubscriberQueue {
    /// Enqueue with drop-oldest admission: evict the head of a full queue, then
    /// retry once more if a racing producer refilled it in between.
    fn push_drop_oldest(&self, item: BusItem) -> Delivery {
        let mut evicted = 0;
        if self.tx.is_full() && self.rx.try_recv().is_ok() {
            evicted += 1;
        }
        match self.tx.try_send(item) {
            Ok(()) => Delivery {
                delivered: true,
                evicted,
            },
            Err(TrySendError::Full(item)) => {
                if self.rx.try_recv().is_ok() {
                    evicted += 1;
                }
                Delivery {
                    delivered: self.tx.try_send(item).is_ok(),
                    evicted,
                }
            }
            Err(TrySendError::Disconnected(_)) => Delivery {
                delivered: false,
                evicted,
            },
        }
    }

    /// Push the termination marker, making room by evicting one pending
    /// envelope if the queue is full.
    fn push_closed(&self) {
        if let Err(TrySendError::Full(item)) = self.tx.try_send(BusItem::Closed) {
            let _ = self.rx.try_recv();
            let _ = self.tx.try_send(item);
        }
    }
}

struct TopicState {
    capacity: usize,
    subscribers: Vec<SubscriberQueue>,
    publishes: u64,
    deliveries: u64,
    drops: u64,
}

impl TopicState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Vec::new(),
            publishes: 0,
            deliveries: 0,
            drops: 0,
        }
    }

    fn stats(&self) -> TopicStats {
        TopicStats {
            queue_len: self
                .subscribers
                .iter()
                .map(|s| s.rx.len())
                .max()
                .unwrap_or(0),
            drops: self.drops,
            publishes: self.publishes,
            deliveries: self.deliveries,
        }
    }
}

struct BusInner {
    topics: DashMap<String, TopicState>,
    closed: AtomicBool,
    default_capacity: usize,
    clock: Arc<dyn TimeSource>,
    next_subscriber_id: AtomicU64,
}

impl BusInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn unregister(&self, topic: &str, id: u64) {
        if let Some(mut state) = self.topics.get_mut(topic) {
            state.subscribers.retain(|s| s.id != id);
        }
    }
}

/// Topic-based event bus. Cheap to clone; clones share the same topics.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.inner.topics.len())
            .field("closed", &self.inner.is_closed())
            .field("default_capacity", &self.inner.default_capacity)
            .finish()
    }
}

impl EventBus {
    /// Create a bus whose topics default to `default_capacity` slots per
    /// subscriber (minimum 1). Envelopes are stamped with `clock.monotonic()`.
    pub fn new(clock: Arc<dyn TimeSource>, default_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: DashMap::new(),
                closed: AtomicBool::new(false),
                default_capacity: default_capacity.max(1),
                clock,
                next_subscriber_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Register a new bounded queue under `topic`.
    ///
    /// Only envelopes published after this call are delivered to it.
    pub fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        if self.inner.is_closed() {
            return Err(BusError::Closed);
        }
        let mut state = self
            .inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(self.inner.default_capacity));
        // close() flips the flag before walking the topics, so checking again
        // under the shard lock guarantees this queue also gets the marker.
        if self.inner.is_closed() {
            return Err(BusError::Closed);
        }

        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = flume::bounded(state.capacity);
        state.subscribers.push(SubscriberQueue {
            id,
            tx,
            rx: rx.clone(),
        });
        debug!(
            topic,
            subscriber = id,
            capacity = state.capacity,
            "Subscribed"
        );

        Ok(Subscription {
            bus: self.inner.clone(),
            topic: topic.to_string(),
            id,
            rx,
            finished: false,
        })
    }

    /// Fan `payload` out to every current subscriber of `topic`.
    ///
    /// Never blocks. A full queue loses its oldest envelope (counted as a drop).
    /// If a queue is still full after one eviction and one retry, the envelope
    /// is skipped for that subscriber without touching any counter.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<(), BusError> {
        if self.inner.is_closed() {
            return Err(BusError::Closed);
        }
        let envelope = Envelope {
            topic: topic.to_string(),
            timestamp: self.inner.clock.monotonic(),
            payload: payload.into(),
        };

        let mut state = self
            .inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(self.inner.default_capacity));
        if self.inner.is_closed() {
            return Err(BusError::Closed);
        }

        state.publishes += 1;
        metrics::counter!("bus.publishes_total", "topic" => topic.to_string()).increment(1);

        let mut delivered = 0;
        let mut dropped = 0;
        for subscriber in &state.subscribers {
            let outcome = subscriber.push_drop_oldest(BusItem::Envelope(envelope.clone()));
            dropped += outcome.evicted;
            if outcome.delivered {
                delivered += 1;
            } else {
                debug!(
                    topic,
                    subscriber = subscriber.id,
                    "Queue stayed full after retry, envelope not delivered"
                );
            }
            if outcome.evicted > 0 {
                trace!(
                    topic,
                    subscriber = subscriber.id,
                    evicted = outcome.evicted,
                    "Dropped oldest envelope"
                );
            }
        }
        state.deliveries += delivered;
        state.drops += dropped;

        if delivered > 0 {
            metrics::counter!("bus.deliveries_total", "topic" => topic.to_string())
                .increment(delivered);
        }
        if dropped > 0 {
            metrics::counter!("bus.drops_total", "topic" => topic.to_string()).increment(dropped);
        }
        Ok(())
    }

    /// Close the bus. Idempotent.
    ///
    /// Every registered queue receives a termination marker so blocked
    /// subscribers wake up; a full queue gives up one pending envelope for it.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut queues = 0;
        for state in self.inner.topics.iter() {
            for subscriber in &state.subscribers {
                subscriber.push_closed();
                queues += 1;
            }
        }
        info!(queues, "Event bus closed");
    }

    /// Declare `topic`, optionally overriding its per-subscriber capacity.
    ///
    /// Existing subscriptions keep the capacity they were created with.
    pub fn ensure_topic(&self, topic: &str, capacity: Option<usize>) -> Result<(), BusError> {
        if self.inner.is_closed() {
            return Err(BusError::Closed);
        }
        let mut state = self
            .inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(self.inner.default_capacity));
        if let Some(capacity) = capacity {
            state.capacity = capacity.max(1);
        }
        Ok(())
    }

    /// Topic name to number of registered subscribers.
    pub fn list_topics(&self) -> BTreeMap<String, usize> {
        self.inner
            .topics
            .iter()
            .map(|entry| (entry.key().clone(), entry.subscribers.len()))
            .collect()
    }

    /// Best-effort per-topic counters.
    pub fn metrics(&self) -> BusMetrics {
        BusMetrics {
            topics: self
                .inner
                .topics
                .iter()
                .map(|entry| (entry.key().clone(), entry.stats()))
                .collect(),
        }
    }
}

/// Handle to one subscriber queue. Dropping it unregisters the queue.
pub struct Subscription {
    bus: Arc<BusInner>,
    topic: String,
    id: u64,
    rx: Receiver<BusItem>,
    finished: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("pending", &self.rx.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Envelopes waiting in this subscriber's queue.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Next envelope, or `None` once the bus or this subscription is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        if self.finished {
            return None;
        }
        match self.rx.recv_async().await {
            Ok(BusItem::Envelope(envelope)) => Some(envelope),
            Ok(BusItem::Closed) | Err(_) => {
                self.finished = true;
                None
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Envelope> {
        if self.finished {
            return None;
        }
        match self.rx.try_recv() {
            Ok(BusItem::Envelope(envelope)) => Some(envelope),
            Ok(BusItem::Closed) | Err(flume::TryRecvError::Disconnected) => {
                self.finished = true;
                None
            }
            Err(flume::TryRecvError::Empty) => None,
        }
    }

    /// Stop receiving and unregister from the topic. Idempotent.
    pub fn close(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.bus.unregister(&self.topic, self.id);
        debug!(topic = %self.topic, subscriber = self.id, "Subscription closed");
    }

    /// Adapt into a [`Stream`] that ends when the bus is closed.
    pub fn into_stream(self) -> impl Stream<Item = Envelope> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|envelope| (envelope, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unregister(&self.topic, self.id);
    }
}
