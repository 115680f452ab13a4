//! Legacy two-connection SSE server service.
//!
//! GET opens the event stream: the first frame is the synthetic
//! `endpoint` event naming the POST URL, everything after is `message`
//! frames. POST accepts client messages keyed by session id and hands
//! them to the delivery bridge — the worker holding the GET connection
//! runs a [`SessionListener`] that feeds them into the dispatcher, which
//! is what lets the two connections land on different workers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{StreamExt, stream};
use tokio_stream::wrappers::ReceiverStream;

use crate::engine::{Engine, ProcessOutcome};
use crate::model::JsonRpcMessage;
use crate::pubsub::{SessionListener, session_channel};
use crate::registry::AuthRequest;

#[derive(Debug, Clone)]
pub struct SseServerConfig {
    pub sse_path: String,
    pub post_path: String,
    pub sse_keep_alive: Option<Duration>,
    /// Bound on the wait for the inbound subscription to confirm before
    /// the endpoint event is announced.
    pub listener_start_timeout: Duration,
}

impl Default for SseServerConfig {
    fn default() -> Self {
        Self {
            sse_path: "/sse".to_string(),
            post_path: "/messages".to_string(),
            sse_keep_alive: Some(Duration::from_secs(15)),
            listener_start_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
struct App {
    engine: Arc<Engine>,
    config: SseServerConfig,
}

pub struct SseServer {
    engine: Arc<Engine>,
    config: SseServerConfig,
}

impl SseServer {
    pub fn new(engine: Arc<Engine>, config: SseServerConfig) -> Self {
        Self { engine, config }
    }

    pub fn router(&self) -> Router {
        let app = App {
            engine: self.engine.clone(),
            config: self.config.clone(),
        };
        Router::new()
            .route(&self.config.sse_path, get(sse_handler))
            .route(&self.config.post_path, post(post_event_handler))
            .with_state(app)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostEventQuery {
    pub session_id: String,
}

async fn sse_handler(State(app): State<App>, headers: HeaderMap) -> Response {
    let auth = AuthRequest {
        bearer_token: bearer_token(&headers),
        session_id: None,
    };
    if let Err(e) = app.engine.authenticate(&auth).await {
        return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
    }

    let session = app.engine.create_session().await;
    let session_id = session.id.to_string();
    tracing::info!(%session_id, "sse connection");

    // Inbound path: POSTs land on the bridge, the listener feeds them to
    // this connection's dispatch task.
    let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::channel::<JsonRpcMessage>(64);
    let listener = Arc::new(SessionListener::new(
        app.engine.pubsub().clone(),
        &session_id,
    ));
    let start_result = listener
        .start(
            Arc::new(move |message| {
                if inbound_tx.try_send(message).is_err() {
                    tracing::warn!("inbound buffer full, dropping client message");
                }
            }),
            app.config.listener_start_timeout,
        )
        .await;
    if let Err(e) = start_result {
        tracing::error!(%session_id, "listener failed to start: {e}");
        let _ = app.engine.close_session(&session_id).await;
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::channel::<Event>(64);

    // Dispatch task: drains inbound messages, answers down this stream.
    let engine = app.engine.clone();
    let dispatch_session_id = session_id.clone();
    let dispatch_tx = outbound_tx.clone();
    tokio::spawn(async move {
        while let Some(message) = inbound_rx.recv().await {
            match engine.process(&dispatch_session_id, message, None).await {
                ProcessOutcome::Reply(reply) => {
                    let payload = crate::model::serialize(&reply);
                    let event_id = engine
                        .events()
                        .store(
                            &dispatch_session_id,
                            payload.clone(),
                            engine.config().event_log_cap,
                        )
                        .await;
                    let event = Event::default()
                        .event("message")
                        .id(event_id.to_string())
                        .data(payload);
                    if dispatch_tx.send(event).await.is_err() {
                        break;
                    }
                }
                ProcessOutcome::Accepted => {}
                ProcessOutcome::SessionNotFound => {
                    tracing::debug!(session_id = %dispatch_session_id, "session gone, stopping");
                    break;
                }
                ProcessOutcome::VersionMismatch(error) => {
                    tracing::warn!(session_id = %dispatch_session_id, "version mismatch: {error}");
                }
            }
        }
    });

    // Teardown once the client drops the stream. Legacy sessions are
    // connection-bound: no reconnection, so the session closes with it.
    let cleanup_engine = app.engine.clone();
    let cleanup_session_id = session_id.clone();
    let cleanup_listener = listener.clone();
    tokio::spawn(async move {
        outbound_tx.closed().await;
        let _ = cleanup_listener.stop().await;
        let _ = cleanup_engine.close_session(&cleanup_session_id).await;
        tracing::debug!(session_id = %cleanup_session_id, "sse connection closed");
    });

    let endpoint = Event::default().event("endpoint").data(format!(
        "{}?sessionId={}",
        app.config.post_path, session_id
    ));
    let stream = stream::once(async move { Ok::<Event, Infallible>(endpoint) })
        .chain(ReceiverStream::new(outbound_rx).map(Ok));

    let sse = Sse::new(stream);
    match app.config.sse_keep_alive {
        Some(interval) => sse
            .keep_alive(KeepAlive::new().interval(interval))
            .into_response(),
        None => sse.into_response(),
    }
}

async fn post_event_handler(
    State(app): State<App>,
    Query(PostEventQuery { session_id }): Query<PostEventQuery>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let auth = AuthRequest {
        bearer_token: bearer_token(&headers),
        session_id: Some(session_id.clone()),
    };
    if let Err(e) = app.engine.authenticate(&auth).await {
        return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
    }
    if app.engine.session(&session_id).await.is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let message = match crate::model::parse(&body) {
        Ok(message) => message,
        Err(error) => return (StatusCode::BAD_REQUEST, Json(error)).into_response(),
    };
    tracing::debug!(%session_id, method = ?message.method(), "client message");
    // Normalized re-serialization, so the listener always sees canonical
    // frames.
    let publish = app
        .engine
        .pubsub()
        .publish(&session_channel(&session_id), crate::model::serialize(&message))
        .await;
    match publish {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            tracing::error!(%session_id, "publish failed: {e}");
            StatusCode::GONE.into_response()
        }
    }
}
