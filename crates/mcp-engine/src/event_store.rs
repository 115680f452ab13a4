//! Append-only per-session event log backing SSE resumability.
//!
//! Every outbound SSE frame is recorded here before it leaves, so a client
//! reconnecting with `Last-Event-ID` can be caught up from the retained
//! tail. Event ids are monotonically increasing per session; the store
//! itself never creates gaps — pruning may.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub session_id: String,
    pub event_id: u64,
    /// Serialized JSON-RPC message, stored as written to the wire.
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// The resumability log. Append and prune only; replay reads are ordered
/// ascending by event id.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a payload under the session's next event id and return that
    /// id. If the log then exceeds `max_events`, the oldest entries are
    /// evicted so exactly the most recent `max_events` remain.
    async fn store(&self, session_id: &str, payload: String, max_events: usize) -> u64;

    /// All retained events with `event_id > after_id`, ascending.
    async fn replay(&self, session_id: &str, after_id: u64) -> Vec<SseEvent>;

    /// Age-based cleanup, independent of count eviction: drop events with
    /// `created_at < older_than`. Returns how many were removed.
    async fn cleanup(&self, session_id: &str, older_than: DateTime<Utc>) -> usize;

    /// Forget a session's log entirely (session closed).
    async fn remove_session(&self, session_id: &str);
}

#[derive(Debug, Default)]
struct SessionLog {
    next_event_id: u64,
    events: VecDeque<SseEvent>,
}

#[derive(Default)]
pub struct InMemoryEventStore {
    logs: tokio::sync::RwLock<HashMap<String, SessionLog>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store(&self, session_id: &str, payload: String, max_events: usize) -> u64 {
        let mut logs = self.logs.write().await;
        let log = logs.entry(session_id.to_string()).or_default();
        log.next_event_id += 1;
        let event_id = log.next_event_id;
        log.events.push_back(SseEvent {
            session_id: session_id.to_string(),
            event_id,
            payload,
            created_at: Utc::now(),
        });
        while log.events.len() > max_events {
            log.events.pop_front();
        }
        event_id
    }

    async fn replay(&self, session_id: &str, after_id: u64) -> Vec<SseEvent> {
        let logs = self.logs.read().await;
        let Some(log) = logs.get(session_id) else {
            return Vec::new();
        };
        log.events
            .iter()
            .filter(|event| event.event_id > after_id)
            .cloned()
            .collect()
    }

    async fn cleanup(&self, session_id: &str, older_than: DateTime<Utc>) -> usize {
        let mut logs = self.logs.write().await;
        let Some(log) = logs.get_mut(session_id) else {
            return 0;
        };
        let before = log.events.len();
        // The log is appended in time order, so expired entries form a
        // prefix.
        while log
            .events
            .front()
            .is_some_and(|event| event.created_at < older_than)
        {
            log.events.pop_front();
        }
        before - log.events.len()
    }

    async fn remove_session(&self, session_id: &str) {
        self.logs.write().await.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[tokio::test]
    async fn test_ids_are_monotonic_per_session() {
        let store = InMemoryEventStore::new();
        for expected in 1..=5 {
            let id = store.store("s1", format!("payload-{expected}"), 100).await;
            assert_eq!(id, expected);
        }
        // A second session counts independently.
        assert_eq!(store.store("s2", "other".to_string(), 100).await, 1);
    }

    #[tokio::test]
    async fn test_eviction_keeps_most_recent_cap() {
        let store = InMemoryEventStore::new();
        let cap = 3;
        for n in 1..=10u64 {
            store.store("s1", format!("e{n}"), cap).await;
        }
        let retained: Vec<u64> = store
            .replay("s1", 0)
            .await
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(retained, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn test_eviction_does_not_reset_the_counter() {
        let store = InMemoryEventStore::new();
        for n in 1..=4u64 {
            store.store("s1", format!("e{n}"), 2).await;
        }
        assert_eq!(store.store("s1", "e5".to_string(), 2).await, 5);
    }

    #[tokio::test]
    async fn test_replay_after_id_is_ordered_and_exclusive() {
        let store = InMemoryEventStore::new();
        for n in 1..=5u64 {
            store.store("s1", format!("e{n}"), 10).await;
        }
        let events = store.replay("s1", 2).await;
        let ids: Vec<u64> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(events[0].payload, "e3");
    }

    #[tokio::test]
    async fn test_replay_unknown_session_is_empty() {
        let store = InMemoryEventStore::new();
        assert!(store.replay("nope", 0).await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_aged_events() {
        let store = InMemoryEventStore::new();
        store.store("s1", "old".to_string(), 10).await;
        store.store("s1", "new".to_string(), 10).await;
        {
            // Backdate the first event to two hours ago.
            let mut logs = store.logs.write().await;
            let log = logs.get_mut("s1").unwrap();
            log.events[0].created_at = Utc::now() - Duration::hours(2);
            log.events[1].created_at = Utc::now() - Duration::minutes(30);
        }
        let removed = store.cleanup("s1", Utc::now() - Duration::hours(1)).await;
        assert_eq!(removed, 1);
        let remaining = store.replay("s1", 0).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].payload, "new");
    }

    #[tokio::test]
    async fn test_remove_session_forgets_log() {
        let store = InMemoryEventStore::new();
        store.store("s1", "e1".to_string(), 10).await;
        store.remove_session("s1").await;
        assert!(store.replay("s1", 0).await.is_empty());
    }
}
