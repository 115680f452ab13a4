use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use futures::StreamExt;
use http_body_util::BodyExt;
use mcp_engine::transport::{StreamableHttpServerConfig, StreamableHttpService};
use mcp_engine::{Dispatcher, Engine, Role};
use serde_json::{Value, json};
use tower::ServiceExt;

const SESSION_HEADER: &str = "Mcp-Session-Id";
const VERSION_HEADER: &str = "MCP-Protocol-Version";

fn test_router() -> (Arc<Engine>, Router) {
    let tools = mcp_engine::registry::StaticRegistry::new().with_entry(
        "echo",
        json!({"name": "echo", "inputSchema": {"type": "object"}}),
        Arc::new(|args| {
            Ok(json!({
                "content": [{"type": "text", "text": args.unwrap_or(Value::Null).to_string()}]
            }))
        }),
    );
    let engine = Engine::builder()
        .dispatcher(
            Dispatcher::builder(Role::Server)
                .tools(Arc::new(tools))
                .build(),
        )
        .build();
    let service = StreamableHttpService::new(
        engine.clone(),
        StreamableHttpServerConfig {
            sse_keep_alive: None,
            channel_capacity: 16,
        },
    );
    let router = service.router();
    (engine, router)
}

fn post(body: Value, session_id: Option<&str>, version: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(session_id) = session_id {
        builder = builder.header(SESSION_HEADER, session_id);
    }
    if let Some(version) = version {
        builder = builder.header(VERSION_HEADER, version);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn initialize_body() -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": {"name": "inspector", "version": "0.4.1"}
        }
    })
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Run the full handshake and hand back the session id.
async fn handshake(router: &Router) -> String {
    let response = router
        .clone()
        .oneshot(post(initialize_body(), None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = response
        .headers()
        .get(SESSION_HEADER)
        .expect("initialize response must carry the session header")
        .to_str()
        .unwrap()
        .to_string();
    let body = json_body(response).await;
    assert_eq!(body["result"]["protocolVersion"], "2025-06-18");

    let response = router
        .clone()
        .oneshot(post(
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            Some(&session_id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    session_id
}

#[tokio::test]
async fn test_initialize_creates_session_and_negotiates() {
    let (engine, router) = test_router();
    let session_id = handshake(&router).await;
    let session = engine.session(&session_id).await.unwrap();
    assert_eq!(session.protocol_version.unwrap().as_str(), "2025-06-18");
}

#[tokio::test]
async fn test_request_without_session_header_is_rejected() {
    let (_engine, router) = test_router();
    let response = router
        .clone()
        .oneshot(post(
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
            None,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let (_engine, router) = test_router();
    let response = router
        .clone()
        .oneshot(post(
            json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}),
            Some("no-such-session"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_version_header_must_match_negotiated() {
    let (_engine, router) = test_router();
    let session_id = handshake(&router).await;

    // Matching header passes.
    let response = router
        .clone()
        .oneshot(post(
            json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"}),
            Some(&session_id),
            Some("2025-06-18"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Mismatching header is refused with the negotiated version named.
    let response = router
        .clone()
        .oneshot(post(
            json!({"jsonrpc": "2.0", "id": 4, "method": "tools/list"}),
            Some(&session_id),
            Some("2025-03-26"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(
        body["message"]
            .as_str()
            .unwrap()
            .contains("does not match negotiated version")
    );

    // ping is exempt from the header gate.
    let response = router
        .clone()
        .oneshot(post(
            json!({"jsonrpc": "2.0", "id": 5, "method": "ping"}),
            Some(&session_id),
            Some("2025-03-26"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_tool_call_round_trip() {
    let (_engine, router) = test_router();
    let session_id = handshake(&router).await;
    let response = router
        .clone()
        .oneshot(post(
            json!({
                "jsonrpc": "2.0",
                "id": 6,
                "method": "tools/call",
                "params": {"name": "echo", "arguments": {"text": "hi"}}
            }),
            Some(&session_id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["id"], 6);
    assert!(body["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("hi"));
}

#[tokio::test]
async fn test_get_stream_replays_from_last_event_id() {
    let (engine, router) = test_router();
    let session_id = handshake(&router).await;

    for _ in 0..3 {
        engine.notify_tools_list_changed(&session_id).await.unwrap();
    }

    let request = Request::builder()
        .method("GET")
        .uri("/")
        .header(header::ACCEPT, "text/event-stream")
        .header(SESSION_HEADER, &session_id)
        .header("Last-Event-ID", "1")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    // The body is a live stream; read chunks until both replayed frames
    // are in hand.
    let mut stream = response.into_body().into_data_stream();
    let mut seen = String::new();
    while !(seen.contains("id: 2") && seen.contains("id: 3")) {
        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for replayed frames")
            .expect("stream ended before replay completed")
            .unwrap();
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(!seen.contains("id: 1"), "event 1 must not replay: {seen}");
    assert!(seen.contains("notifications/tools/list_changed"));
}

#[tokio::test]
async fn test_get_stream_delivers_live_notifications() {
    let (engine, router) = test_router();
    let session_id = handshake(&router).await;

    let request = Request::builder()
        .method("GET")
        .uri("/")
        .header(header::ACCEPT, "text/event-stream")
        .header(SESSION_HEADER, &session_id)
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut stream = response.into_body().into_data_stream();

    engine
        .notify_resources_list_changed(&session_id)
        .await
        .unwrap();

    let mut seen = String::new();
    while !seen.contains("notifications/resources/list_changed") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for live frame")
            .expect("stream ended unexpectedly")
            .unwrap();
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(seen.contains("id: 1"));
}

#[tokio::test]
async fn test_delete_closes_the_session() {
    let (_engine, router) = test_router();
    let session_id = handshake(&router).await;

    let request = Request::builder()
        .method("DELETE")
        .uri("/")
        .header(SESSION_HEADER, &session_id)
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = router
        .clone()
        .oneshot(post(
            json!({"jsonrpc": "2.0", "id": 7, "method": "ping"}),
            Some(&session_id),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
