//! Streamable HTTP server service: one endpoint, three verbs.
//!
//! POST dispatches one message and answers with JSON or 202. GET opens
//! the standalone push stream: stored events replay first when the client
//! presents `Last-Event-ID`, then live frames arrive off the delivery
//! bridge. DELETE closes the session.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::post,
};
use futures::{Stream, StreamExt, stream};
use tokio_stream::wrappers::ReceiverStream;

use super::{HEADER_LAST_EVENT_ID, HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID};
use crate::engine::{Engine, ProcessOutcome, StreamFrame, session_stream_channel};
use crate::model::{ErrorData, method};
use crate::registry::AuthRequest;

#[derive(Debug, Clone)]
pub struct StreamableHttpServerConfig {
    /// Keep-alive comment interval on open SSE streams.
    pub sse_keep_alive: Option<Duration>,
    /// Buffer between the delivery bridge and each SSE stream.
    pub channel_capacity: usize,
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            sse_keep_alive: Some(Duration::from_secs(15)),
            channel_capacity: 64,
        }
    }
}

#[derive(Clone)]
struct App {
    engine: Arc<Engine>,
    config: StreamableHttpServerConfig,
}

pub struct StreamableHttpService {
    engine: Arc<Engine>,
    config: StreamableHttpServerConfig,
}

impl StreamableHttpService {
    pub fn new(engine: Arc<Engine>, config: StreamableHttpServerConfig) -> Self {
        Self { engine, config }
    }

    /// The service as a router handling `/` for POST, GET and DELETE.
    pub fn router(&self) -> Router {
        let app = App {
            engine: self.engine.clone(),
            config: self.config.clone(),
        };
        Router::new()
            .route(
                "/",
                post(post_handler).get(get_handler).delete(delete_handler),
            )
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

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn authenticate(app: &App, headers: &HeaderMap) -> Result<(), Response> {
    let request = AuthRequest {
        bearer_token: bearer_token(headers),
        session_id: header_str(headers, HEADER_SESSION_ID).map(str::to_string),
    };
    match app.engine.authenticate(&request).await {
        Ok(identity) => {
            tracing::trace!(subject = %identity.subject, "authenticated");
            Ok(())
        }
        Err(e) => {
            tracing::debug!("authentication refused: {e}");
            Err((StatusCode::UNAUTHORIZED, e.to_string()).into_response())
        }
    }
}

async fn post_handler(State(app): State<App>, headers: HeaderMap, body: String) -> Response {
    if let Err(response) = authenticate(&app, &headers).await {
        return response;
    }
    let message = match crate::model::parse(&body) {
        Ok(message) => message,
        Err(error) => return (StatusCode::BAD_REQUEST, Json(error)).into_response(),
    };
    let protocol_header = header_str(&headers, HEADER_PROTOCOL_VERSION);

    let session_id = match header_str(&headers, HEADER_SESSION_ID) {
        Some(session_id) => session_id.to_string(),
        None => {
            // Only the initialize request may arrive session-less; it
            // creates the session whose id rides back in the header.
            if message.method() != Some(method::INITIALIZE) {
                let error = ErrorData::invalid_request(format!(
                    "missing {HEADER_SESSION_ID} header"
                ));
                return (StatusCode::BAD_REQUEST, Json(error)).into_response();
            }
            let session = app.engine.create_session().await;
            session.id.to_string()
        }
    };

    match app
        .engine
        .process(&session_id, message, protocol_header)
        .await
    {
        ProcessOutcome::Reply(reply) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE.as_str(), "application/json"),
                (HEADER_SESSION_ID, session_id.as_str()),
            ],
            crate::model::serialize(&reply),
        )
            .into_response(),
        ProcessOutcome::Accepted => (
            StatusCode::ACCEPTED,
            [(HEADER_SESSION_ID, session_id.as_str())],
        )
            .into_response(),
        ProcessOutcome::SessionNotFound => StatusCode::NOT_FOUND.into_response(),
        ProcessOutcome::VersionMismatch(error) => {
            (StatusCode::BAD_REQUEST, Json(error)).into_response()
        }
    }
}

async fn get_handler(State(app): State<App>, headers: HeaderMap) -> Response {
    if let Err(response) = authenticate(&app, &headers).await {
        return response;
    }
    let Some(session_id) = header_str(&headers, HEADER_SESSION_ID).map(str::to_string) else {
        return (
            StatusCode::BAD_REQUEST,
            format!("missing {HEADER_SESSION_ID} header"),
        )
            .into_response();
    };
    if app.engine.session(&session_id).await.is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let last_event_id = header_str(&headers, HEADER_LAST_EVENT_ID)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    match open_session_stream(&app, &session_id, last_event_id).await {
        Ok(stream) => {
            let sse = Sse::new(stream);
            match app.config.sse_keep_alive {
                Some(interval) => sse
                    .keep_alive(KeepAlive::new().interval(interval))
                    .into_response(),
                None => sse.into_response(),
            }
        }
        Err(e) => {
            tracing::error!(%session_id, "failed to open stream: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Replay the retained tail past `last_event_id`, then switch to live
/// frames from the delivery bridge.
async fn open_session_stream(
    app: &App,
    session_id: &str,
    last_event_id: u64,
) -> Result<impl Stream<Item = Result<Event, Infallible>> + Send + use<>, crate::pubsub::PubSubError>
{
    let replayed: Vec<Result<Event, Infallible>> = app
        .engine
        .events()
        .replay(session_id, last_event_id)
        .await
        .into_iter()
        .map(|event| {
            Ok(Event::default()
                .event("message")
                .id(event.event_id.to_string())
                .data(event.payload))
        })
        .collect();

    let (tx, rx) = tokio::sync::mpsc::channel::<StreamFrame>(app.config.channel_capacity);
    let channel = session_stream_channel(session_id);
    let frame_tx = tx.clone();
    app.engine
        .pubsub()
        .subscribe(
            &channel,
            Arc::new(move |payload: String| match serde_json::from_str(&payload) {
                Ok(frame) => {
                    if frame_tx.try_send(frame).is_err() {
                        // Slow or gone consumer; replay covers the gap.
                        tracing::debug!("stream buffer full, dropping live frame");
                    }
                }
                Err(e) => tracing::warn!("malformed stream frame: {e}"),
            }),
            None,
        )
        .await?;

    // Unsubscribe once the client goes away.
    let engine = app.engine.clone();
    tokio::spawn(async move {
        tx.closed().await;
        let _ = engine.pubsub().unsubscribe(&channel).await;
    });

    let live = ReceiverStream::new(rx).map(|frame| {
        Ok(Event::default()
            .event("message")
            .id(frame.event_id.to_string())
            .data(crate::model::serialize(&frame.message)))
    });
    Ok(stream::iter(replayed).chain(live))
}

async fn delete_handler(State(app): State<App>, headers: HeaderMap) -> Response {
    if let Err(response) = authenticate(&app, &headers).await {
        return response;
    }
    let Some(session_id) = header_str(&headers, HEADER_SESSION_ID) else {
        return (
            StatusCode::BAD_REQUEST,
            format!("missing {HEADER_SESSION_ID} header"),
        )
            .into_response();
    };
    match app.engine.close_session(session_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::debug!(session_id, "delete for unknown session: {e}");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
