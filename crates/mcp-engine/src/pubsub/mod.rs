//! Delivery bridge between message producers and whichever worker holds a
//! session's live connection.
//!
//! Producers publish serialized messages to a channel keyed by session id;
//! the worker that owns the connection subscribes and forwards. Two
//! adapters ship: an in-process synchronous fan-out for a single worker,
//! and a polling adapter over a shared store for horizontal scaling.

mod in_process;
mod listener;
mod polling;

use std::sync::Arc;

use async_trait::async_trait;

pub use in_process::InProcessAdapter;
pub use listener::{MessageSink, SessionListener};
pub use polling::{InMemorySharedStore, PollingAdapter, PollingConfig, SharedMessageStore};

/// Invoked with each payload delivered on a subscribed channel.
pub type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Invoked once the subscription is confirmed active. Publishes before
/// this fires may be lost; the [`SessionListener`] start path waits on it.
pub type SubscribedCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("subscription not confirmed within {0:?}")]
    SubscriptionTimeout(std::time::Duration),
    #[error("channel already subscribed: {0}")]
    AlreadySubscribed(String),
    #[error("adapter is shut down")]
    ShutDown,
}

/// Adapter contract every delivery backend implements.
#[async_trait]
pub trait PubSubAdapter: Send + Sync {
    async fn subscribe(
        &self,
        channel: &str,
        on_message: MessageCallback,
        on_subscribed: Option<SubscribedCallback>,
    ) -> Result<(), PubSubError>;

    async fn publish(&self, channel: &str, payload: String) -> Result<(), PubSubError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), PubSubError>;

    async fn shutdown(&self) -> Result<(), PubSubError>;
}

/// Channel name for a session's outbound messages.
pub fn session_channel(session_id: &str) -> String {
    format!("session:{session_id}")
}
