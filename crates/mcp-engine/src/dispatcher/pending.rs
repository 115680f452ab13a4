//! In-flight outbound request tracking.
//!
//! Cancellation here is cooperative and advisory: marking an entry
//! cancelled never interrupts whoever is computing the response, it only
//! ensures a late answer is dropped as a no-op instead of treated as an
//! error.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::model::{ErrorData, RequestId};

#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub method: String,
    pub acknowledged: bool,
    pub cancelled: bool,
}

struct PendingEntry {
    request: PendingRequest,
    responder: Option<oneshot::Sender<Result<Value, ErrorData>>>,
}

/// What happened to an inbound response when matched against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Delivered to the waiter.
    Delivered,
    /// The entry was cancelled or already acknowledged; the response is
    /// dropped silently.
    Ignored,
    /// No entry for this id. Late or stray; callers log at debug and move
    /// on.
    Unknown,
}

#[derive(Debug, thiserror::Error)]
#[error("duplicated request id: {0}")]
pub struct DuplicatedRequestId(pub RequestId);

/// Table of requests sent but not yet answered. Ids are never reused: a
/// resolved entry is removed, and registering an id that is still in
/// flight is refused.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<RequestId, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly sent request. The returned receiver resolves when
    /// the matching response or error arrives.
    pub fn register(
        &self,
        id: RequestId,
        method: impl Into<String>,
    ) -> Result<oneshot::Receiver<Result<Value, ErrorData>>, DuplicatedRequestId> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&id) {
            return Err(DuplicatedRequestId(id));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(
            id.clone(),
            PendingEntry {
                request: PendingRequest {
                    id,
                    method: method.into(),
                    acknowledged: false,
                    cancelled: false,
                },
                responder: Some(tx),
            },
        );
        Ok(rx)
    }

    /// Match an inbound response against the table.
    pub fn resolve(&self, id: &RequestId, result: Result<Value, ErrorData>) -> ResolveOutcome {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.get_mut(id) else {
            return ResolveOutcome::Unknown;
        };
        if entry.request.cancelled || entry.request.acknowledged {
            entries.remove(id);
            return ResolveOutcome::Ignored;
        }
        entry.request.acknowledged = true;
        let responder = entry.responder.take();
        entries.remove(id);
        match responder {
            Some(tx) => {
                if tx.send(result).is_ok() {
                    ResolveOutcome::Delivered
                } else {
                    ResolveOutcome::Ignored
                }
            }
            None => ResolveOutcome::Ignored,
        }
    }

    /// Advisory cancellation from `notifications/cancelled`. The entry
    /// stays in the table so a late response still resolves as a no-op.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(id) {
            Some(entry) => {
                entry.request.cancelled = true;
                entry.responder = None;
                true
            }
            None => false,
        }
    }

    /// Timeout path: the waiter gave up. Mark the entry acknowledged so a
    /// late answer is ignored rather than surfaced.
    pub fn acknowledge_ignored(&self, id: &RequestId) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(id) {
            entry.request.acknowledged = true;
            entry.responder = None;
        }
    }

    pub fn get(&self, id: &RequestId) -> Option<PendingRequest> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(id).map(|entry| entry.request.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
