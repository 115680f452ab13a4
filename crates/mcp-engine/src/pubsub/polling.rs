//! Multi-process adapter: publishes append to a shared store and every
//! worker polls its subscribed channels at a configurable interval. The
//! store is the scaling seam — the in-memory form is for tests, a real
//! deployment points the same trait at a database or cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{MessageCallback, PubSubAdapter, PubSubError, SubscribedCallback};

/// Append-log store shared between worker processes. Sequence numbers are
/// per channel, strictly increasing.
#[async_trait]
pub trait SharedMessageStore: Send + Sync {
    /// Append a payload and return its sequence number.
    async fn append(&self, channel: &str, payload: String) -> u64;

    /// All payloads with sequence greater than `after`, ascending.
    async fn read_after(&self, channel: &str, after: u64) -> Vec<(u64, String)>;

    /// The newest sequence number on the channel, 0 if empty.
    async fn head(&self, channel: &str) -> u64;
}

#[derive(Default)]
pub struct InMemorySharedStore {
    channels: tokio::sync::RwLock<HashMap<String, Vec<(u64, String)>>>,
}

impl InMemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedMessageStore for InMemorySharedStore {
    async fn append(&self, channel: &str, payload: String) -> u64 {
        let mut channels = self.channels.write().await;
        let log = channels.entry(channel.to_string()).or_default();
        let seq = log.last().map(|(seq, _)| seq + 1).unwrap_or(1);
        log.push((seq, payload));
        seq
    }

    async fn read_after(&self, channel: &str, after: u64) -> Vec<(u64, String)> {
        let channels = self.channels.read().await;
        channels
            .get(channel)
            .map(|log| {
                log.iter()
                    .filter(|(seq, _)| *seq > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn head(&self, channel: &str) -> u64 {
        let channels = self.channels.read().await;
        channels
            .get(channel)
            .and_then(|log| log.last().map(|(seq, _)| *seq))
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub poll_interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

struct ChannelPoller {
    ct: CancellationToken,
}

pub struct PollingAdapter {
    store: Arc<dyn SharedMessageStore>,
    config: PollingConfig,
    pollers: tokio::sync::Mutex<HashMap<String, ChannelPoller>>,
    shut_down: AtomicBool,
}

impl PollingAdapter {
    pub fn new(store: Arc<dyn SharedMessageStore>, config: PollingConfig) -> Self {
        Self {
            store,
            config,
            pollers: tokio::sync::Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), PubSubError> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(PubSubError::ShutDown)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PubSubAdapter for PollingAdapter {
    async fn subscribe(
        &self,
        channel: &str,
        on_message: MessageCallback,
        on_subscribed: Option<SubscribedCallback>,
    ) -> Result<(), PubSubError> {
        self.check_open()?;
        let mut pollers = self.pollers.lock().await;
        if pollers.contains_key(channel) {
            return Err(PubSubError::AlreadySubscribed(channel.to_string()));
        }
        // The cursor starts at the current head before the subscription is
        // confirmed, so nothing published after the confirmation can slip
        // under it.
        let mut cursor = self.store.head(channel).await;
        let ct = CancellationToken::new();
        let task_ct = ct.clone();
        let store = self.store.clone();
        let poll_interval = self.config.poll_interval;
        let channel_name = channel.to_string();
        tokio::spawn(async move {
            if let Some(on_subscribed) = on_subscribed {
                on_subscribed();
            }
            loop {
                tokio::select! {
                    _ = task_ct.cancelled() => {
                        tracing::debug!(channel = %channel_name, "poller stopped");
                        break;
                    }
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                let batch = store.read_after(&channel_name, cursor).await;
                for (seq, payload) in batch {
                    cursor = seq;
                    on_message(payload);
                }
            }
        });
        pollers.insert(channel.to_string(), ChannelPoller { ct });
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), PubSubError> {
        self.check_open()?;
        let seq = self.store.append(channel, payload).await;
        tracing::trace!(channel, seq, "published");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), PubSubError> {
        if let Some(poller) = self.pollers.lock().await.remove(channel) {
            poller.ct.cancel();
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PubSubError> {
        self.shut_down.store(true, Ordering::SeqCst);
        let mut pollers = self.pollers.lock().await;
        for (_, poller) in pollers.drain() {
            poller.ct.cancel();
        }
        Ok(())
    }
}
