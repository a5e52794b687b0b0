//! Publish/subscribe side channel.
//!
//! Tiers publish decisions (reservations, strategy selections, branch
//! lifecycle) as events so that analyzers can be attached without changing
//! the tiers. Nothing in the engine reads these events back.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// A published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
}

/// Subscriber callback.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Publish/subscribe interface.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: Value) -> Result<()>;

    /// Subscribe to topics matching `pattern` (exact, `*`, or `prefix.*`).
    fn subscribe(&self, pattern: &str, handler: EventHandler) -> SubscriptionId;

    /// Remove a subscription. Returns false if it was not registered.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// Shared event bus handle.
pub type SharedEventBus = Arc<dyn EventBus>;

/// Whether `topic` matches a subscription pattern.
///
/// `*` matches everything; a trailing `*` matches any topic with the
/// preceding prefix (`run.branch.*` matches `run.branch.started`).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}

struct Subscriber {
    id: SubscriptionId,
    pattern: String,
    handler: EventHandler,
}

/// Default number of events kept for inspection.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// In-process event bus.
///
/// Handlers are invoked after the subscriber lock is released, so a handler
/// may publish or subscribe itself. The most recent events are kept in a
/// bounded history for inspection.
pub struct InMemoryEventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    history: Mutex<VecDeque<Event>>,
    history_limit: usize,
    next_id: AtomicU64,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit,
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a shared bus.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Recent events whose topic matches `pattern`, oldest first.
    pub fn recent(&self, pattern: &str) -> Vec<Event> {
        self.history
            .lock()
            .iter()
            .filter(|e| topic_matches(pattern, &e.topic))
            .cloned()
            .collect()
    }

    /// Number of recent events matching `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.history
            .lock()
            .iter()
            .filter(|e| topic_matches(pattern, &e.topic))
            .count()
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn record(&self, event: &Event) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(event.clone());
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("subscribers", &self.subscriber_count())
            .field("history_limit", &self.history_limit)
            .finish()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        let event = Event {
            topic: topic.to_string(),
            payload,
            published_at: Utc::now(),
        };
        self.record(&event);

        let handlers: Vec<EventHandler> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| topic_matches(&s.pattern, topic))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        tracing::trace!(topic, subscribers = handlers.len(), "Publishing event");
        for handler in handlers {
            handler(&event);
        }
        Ok(())
    }

    fn subscribe(&self, pattern: &str, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Subscriber {
            id,
            pattern: pattern.to_string(),
            handler,
        });
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("*", "anything"));
        assert!(topic_matches("run.branch.*", "run.branch.started"));
        assert!(!topic_matches("run.branch.*", "run.context.updated"));
        assert!(topic_matches("resource.reserved", "resource.reserved"));
        assert!(!topic_matches("resource.reserved", "resource.reserved.extra"));
        assert!(topic_matches("recovery/*", "recovery/outcome"));
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let bus = InMemoryEventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bus.subscribe(
            "resource.*",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish("resource.reserved", json!({})).await.unwrap();
        bus.publish("recovery/outcome", json!({})).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.count("*"), 2);
        assert_eq!(bus.recent("resource.*")[0].topic, "resource.reserved");
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = InMemoryEventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = bus.subscribe(
            "*",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.publish("run.checkpoint.created", json!({})).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let bus = InMemoryEventBus::with_history_limit(2);
        for i in 0..5 {
            bus.publish("t", json!(i)).await.unwrap();
        }
        let recent = bus.recent("t");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].payload, json!(3));
        assert_eq!(recent[1].payload, json!(4));
    }
}
