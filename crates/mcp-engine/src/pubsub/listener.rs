//! Session-bound listener: ties a session's channel to a message sink.
//!
//! `start` does not return until the adapter has confirmed the
//! subscription (bounded poll), closing the race where a publish lands
//! between connection setup and subscription activation and silently
//! disappears.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{PubSubAdapter, PubSubError, session_channel};
use crate::model::JsonRpcMessage;

/// Receives each successfully parsed message from the channel.
pub type MessageSink = Arc<dyn Fn(JsonRpcMessage) + Send + Sync>;

const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct SessionListener {
    adapter: Arc<dyn PubSubAdapter>,
    channel: String,
    started: AtomicBool,
}

impl SessionListener {
    pub fn new(adapter: Arc<dyn PubSubAdapter>, session_id: &str) -> Self {
        Self {
            adapter,
            channel: session_channel(session_id),
            started: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Subscribe and block until the adapter confirms, up to `timeout`.
    /// Payloads that fail to parse as JSON-RPC are logged and skipped; the
    /// subscription survives them.
    pub async fn start(&self, sink: MessageSink, timeout: Duration) -> Result<(), PubSubError> {
        let confirmed = Arc::new(AtomicBool::new(false));
        let confirm_flag = confirmed.clone();
        let channel = self.channel.clone();
        let on_message: super::MessageCallback = Arc::new(move |payload: String| {
            match crate::model::parse(&payload) {
                Ok(message) => sink(message),
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "dropping unparsable payload");
                }
            }
        });
        self.adapter
            .subscribe(
                &self.channel,
                on_message,
                Some(Arc::new(move || {
                    confirm_flag.store(true, Ordering::SeqCst);
                })),
            )
            .await?;

        let deadline = tokio::time::Instant::now() + timeout;
        while !confirmed.load(Ordering::SeqCst) {
            if tokio::time::Instant::now() >= deadline {
                // Leave nothing half-wired behind.
                let _ = self.adapter.unsubscribe(&self.channel).await;
                return Err(PubSubError::SubscriptionTimeout(timeout));
            }
            tokio::time::sleep(CONFIRM_POLL_INTERVAL).await;
        }
        self.started.store(true, Ordering::SeqCst);
        tracing::debug!(channel = %self.channel, "listener started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), PubSubError> {
        self.started.store(false, Ordering::SeqCst);
        self.adapter.unsubscribe(&self.channel).await
    }
}
