use std::sync::{Arc, Mutex};
use std::time::Duration;

use mcp_engine::model::JsonRpcMessage;
use mcp_engine::pubsub::{
    InMemorySharedStore, PollingAdapter, PollingConfig, PubSubAdapter, SessionListener,
    session_channel,
};

fn worker(store: &Arc<InMemorySharedStore>) -> Arc<PollingAdapter> {
    Arc::new(PollingAdapter::new(
        store.clone(),
        PollingConfig {
            poll_interval: Duration::from_millis(5),
        },
    ))
}

/// Two adapters over one shared store stand in for two worker processes:
/// the worker that accepts the POST is not the worker that holds the
/// session's connection.
#[tokio::test]
async fn test_publish_on_one_worker_reaches_listener_on_another() {
    let store = Arc::new(InMemorySharedStore::new());
    let post_worker = worker(&store);
    let connection_worker = worker(&store);

    let listener = SessionListener::new(connection_worker.clone(), "s-1");
    let received = Arc::new(Mutex::new(Vec::<JsonRpcMessage>::new()));
    let sink = received.clone();
    listener
        .start(
            Arc::new(move |message| sink.lock().unwrap().push(message)),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    post_worker
        .publish(
            &session_channel("s-1"),
            r#"{"jsonrpc":"2.0","id":9,"method":"tools/list"}"#.to_string(),
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("message never crossed the bridge");

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    let JsonRpcMessage::Request(request) = &received[0] else {
        panic!("expected request, got {:?}", received[0]);
    };
    assert_eq!(request.method, "tools/list");
}

/// A publish issued after `start` returns must never be lost, which is
/// the whole point of the bounded subscription-confirmation wait.
#[tokio::test]
async fn test_no_loss_between_subscribe_and_first_publish() {
    let store = Arc::new(InMemorySharedStore::new());
    let adapter = worker(&store);

    for round in 0..10 {
        let channel_session = format!("race-{round}");
        let listener = SessionListener::new(adapter.clone(), &channel_session);
        let received = Arc::new(Mutex::new(0usize));
        let sink = received.clone();
        listener
            .start(
                Arc::new(move |_| *sink.lock().unwrap() += 1),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        // Immediately publish; the listener must already be live.
        adapter
            .publish(
                &session_channel(&channel_session),
                r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#.to_string(),
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while *received.lock().unwrap() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("round {round}: publish lost after confirmed subscribe"));

        listener.stop().await.unwrap();
    }
}
