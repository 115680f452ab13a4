//! Single-worker adapter: subscribers live in this process and publishes
//! fan out inline on the publishing task. The backend for development and
//! tests, and the reference behavior for the other adapters.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{MessageCallback, PubSubAdapter, PubSubError, SubscribedCallback};

#[derive(Default)]
pub struct InProcessAdapter {
    subscriptions: Mutex<HashMap<String, Vec<MessageCallback>>>,
    shut_down: AtomicBool,
}

impl InProcessAdapter {
    pub fn new() -> Self {
        Self::default()
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
impl PubSubAdapter for InProcessAdapter {
    async fn subscribe(
        &self,
        channel: &str,
        on_message: MessageCallback,
        on_subscribed: Option<SubscribedCallback>,
    ) -> Result<(), PubSubError> {
        self.check_open()?;
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(channel.to_string())
            .or_default()
            .push(on_message);
        // Fan-out is inline, so the subscription is active the moment the
        // map write lands.
        if let Some(on_subscribed) = on_subscribed {
            on_subscribed();
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), PubSubError> {
        self.check_open()?;
        let callbacks: Vec<MessageCallback> = {
            let subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subscriptions.get(channel).cloned().unwrap_or_default()
        };
        if callbacks.is_empty() {
            tracing::trace!(channel, "publish with no subscribers");
        }
        for callback in callbacks {
            callback(payload.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), PubSubError> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(channel);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PubSubError> {
        self.shut_down.store(true, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let adapter = InProcessAdapter::new();
        let received = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = received.clone();
        adapter
            .subscribe(
                "session:abc",
                Arc::new(move |payload| sink.lock().unwrap().push(payload)),
                None,
            )
            .await
            .unwrap();
        adapter
            .publish("session:abc", "{\"x\":1}".to_string())
            .await
            .unwrap();
        assert_eq!(received.lock().unwrap().as_slice(), ["{\"x\":1}"]);
    }

    #[tokio::test]
    async fn test_on_subscribed_fires_immediately() {
        let adapter = InProcessAdapter::new();
        let confirmed = Arc::new(AtomicBool::new(false));
        let flag = confirmed.clone();
        adapter
            .subscribe(
                "session:abc",
                Arc::new(|_| {}),
                Some(Arc::new(move || flag.store(true, Ordering::SeqCst))),
            )
            .await
            .unwrap();
        assert!(confirmed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let adapter = InProcessAdapter::new();
        let received = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = received.clone();
        adapter
            .subscribe(
                "session:abc",
                Arc::new(move |payload| sink.lock().unwrap().push(payload)),
                None,
            )
            .await
            .unwrap();
        adapter.unsubscribe("session:abc").await.unwrap();
        adapter
            .publish("session:abc", "dropped".to_string())
            .await
            .unwrap();
        assert!(received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_further_traffic() {
        let adapter = InProcessAdapter::new();
        adapter.shutdown().await.unwrap();
        assert!(matches!(
            adapter.publish("session:abc", "x".to_string()).await,
            Err(PubSubError::ShutDown)
        ));
        assert!(matches!(
            adapter
                .subscribe("session:abc", Arc::new(|_| {}), None)
                .await,
            Err(PubSubError::ShutDown)
        ));
    }
}
