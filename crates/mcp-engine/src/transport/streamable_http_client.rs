//! Streamable HTTP client transport: one endpoint for everything.
//!
//! Each outbound message is a POST which the server may answer with a
//! JSON body, an SSE body carrying several pushed messages, or a bare 202.
//! A parallel long-lived GET holds the standalone push stream; when it
//! drops, the client reconnects with linear backoff and asks for replay
//! via `Last-Event-ID`. A 401 anywhere clears the cached bearer token and
//! surfaces an authentication error instead of retrying.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sse_stream::SseStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    ConnectionState, HEADER_LAST_EVENT_ID, HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID, Transport,
    TransportError, TransportEventHandler,
};
use crate::model::JsonRpcMessage;

#[derive(Debug, Clone)]
pub struct StreamableHttpRetryConfig {
    /// Reconnect attempts for the standalone GET stream before giving up.
    pub max_attempts: usize,
    /// Base delay; attempt `n` waits `n * backoff` (linear).
    pub backoff: Duration,
}

impl Default for StreamableHttpRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamableHttpClientConfig {
    pub url: String,
    pub auth_token: Option<String>,
    pub retry: StreamableHttpRetryConfig,
}

impl StreamableHttpClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            retry: StreamableHttpRetryConfig::default(),
        }
    }
}

fn backoff_delay(attempt: usize, retry: &StreamableHttpRetryConfig) -> Duration {
    retry.backoff.saturating_mul(attempt as u32)
}

struct SharedState {
    url: String,
    http: reqwest::Client,
    state: Arc<ConnectionState>,
    session_id: RwLock<Option<Arc<str>>>,
    protocol_version: RwLock<Option<String>>,
    /// Cached credentials; cleared permanently on a 401.
    auth_token: RwLock<Option<String>>,
    last_event_id: Mutex<Option<String>>,
    retry: StreamableHttpRetryConfig,
}

impl SharedState {
    fn bearer(&self) -> Option<String> {
        self.auth_token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn clear_credentials(&self) {
        *self.auth_token.write().unwrap_or_else(|e| e.into_inner()) = None;
        tracing::warn!("authentication rejected, cached credentials cleared");
    }

    fn session_id(&self) -> Option<Arc<str>> {
        self.session_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn last_event_id(&self) -> Option<String> {
        self.last_event_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn record_event_id(&self, id: String) {
        *self.last_event_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }

    fn apply_common_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(session_id) = self.session_id() {
            request = request.header(HEADER_SESSION_ID, session_id.as_ref());
        }
        if let Some(version) = self
            .protocol_version
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            request = request.header(HEADER_PROTOCOL_VERSION, version);
        }
        if let Some(token) = self.bearer() {
            request = request.bearer_auth(token);
        }
        request
    }

    /// Drain one SSE body, emitting messages and recording ids.
    async fn consume_sse_body(&self, response: reqwest::Response, ct: CancellationToken) {
        let mut stream = SseStream::from_byte_stream(response.bytes_stream()).boxed();
        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                _ = ct.cancelled() => break,
            };
            let Some(event) = event else { break };
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("sse body error: {e}");
                    self.state.emit_error(TransportError::Sse(e)).await;
                    break;
                }
            };
            if let Some(data) = event.data {
                match crate::model::parse(&data) {
                    Ok(message) => self.state.emit_message(message).await,
                    Err(e) => tracing::warn!("dropping unparsable sse payload: {e}"),
                }
            }
            if let Some(id) = event.id {
                self.record_event_id(id);
            }
        }
    }

    /// Open the standalone GET stream once.
    async fn open_stream(&self) -> Result<reqwest::Response, TransportError> {
        let mut request = self
            .http
            .get(&self.url)
            .header(http::header::ACCEPT, "text/event-stream");
        request = self.apply_common_headers(request);
        if let Some(last_event_id) = self.last_event_id() {
            request = request.header(HEADER_LAST_EVENT_ID, last_event_id);
        }
        let response = request.send().await?;
        match response.status() {
            http::StatusCode::UNAUTHORIZED => {
                self.clear_credentials();
                Err(TransportError::Authentication)
            }
            http::StatusCode::METHOD_NOT_ALLOWED | http::StatusCode::NOT_FOUND => {
                Err(TransportError::UnexpectedServerResponse(
                    "server does not offer a standalone stream".into(),
                ))
            }
            status if status.is_success() => Ok(response),
            status => Err(TransportError::UnexpectedServerResponse(
                format!("GET returned {status}").into(),
            )),
        }
    }

    /// Hold the standalone stream open, reconnecting with linear backoff
    /// up to the configured attempt bound.
    async fn run_standalone_stream(self: Arc<Self>, ct: CancellationToken) {
        loop {
            let response = match self.open_stream().await {
                Ok(response) => response,
                Err(TransportError::Authentication) => {
                    self.state.emit_error(TransportError::Authentication).await;
                    return;
                }
                Err(TransportError::UnexpectedServerResponse(reason)) => {
                    tracing::debug!(%reason, "standalone stream unavailable");
                    return;
                }
                Err(e) => {
                    self.state.emit_error(e).await;
                    return;
                }
            };
            tracing::debug!("standalone stream open");
            self.consume_sse_body(response, ct.clone()).await;
            if ct.is_cancelled() {
                return;
            }

            let mut reconnected = false;
            for attempt in 1..=self.retry.max_attempts {
                let delay = backoff_delay(attempt, &self.retry);
                tracing::debug!(attempt, ?delay, "standalone stream lost, reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ct.cancelled() => return,
                }
                match self.open_stream().await {
                    Ok(response) => {
                        self.consume_sse_body(response, ct.clone()).await;
                        if ct.is_cancelled() {
                            return;
                        }
                        reconnected = true;
                        break;
                    }
                    Err(TransportError::Authentication) => {
                        self.state.emit_error(TransportError::Authentication).await;
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(attempt, "stream reconnect failed: {e}");
                    }
                }
            }
            if !reconnected {
                self.state
                    .emit_error(TransportError::UnexpectedServerResponse(
                        "standalone stream reconnect attempts exhausted".into(),
                    ))
                    .await;
                self.state.set_connected(false);
                self.state.emit_disconnect().await;
                return;
            }
        }
    }
}

pub struct StreamableHttpClientTransport {
    state: Arc<ConnectionState>,
    shared: Arc<SharedState>,
    ct: Mutex<CancellationToken>,
    stream_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StreamableHttpClientTransport {
    pub fn new(config: StreamableHttpClientConfig) -> Self {
        let state = Arc::new(ConnectionState::default());
        Self {
            state: state.clone(),
            shared: Arc::new(SharedState {
                url: config.url,
                http: reqwest::Client::new(),
                state,
                session_id: RwLock::new(None),
                protocol_version: RwLock::new(None),
                auth_token: RwLock::new(config.auth_token),
                last_event_id: Mutex::new(None),
                retry: config.retry,
            }),
            ct: Mutex::new(CancellationToken::new()),
            stream_task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> Option<Arc<str>> {
        self.shared.session_id()
    }

    /// Record the negotiated version; subsequent calls carry it in the
    /// `MCP-Protocol-Version` header.
    pub fn set_protocol_version(&self, version: impl Into<String>) {
        *self
            .shared
            .protocol_version
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(version.into());
    }

    fn connection_token(&self) -> CancellationToken {
        self.ct.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Adopt the session id from a response and open the standalone
    /// stream the first time one appears.
    async fn adopt_session_id(&self, response: &reqwest::Response) {
        let Some(session_id) = response
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let is_new = {
            let mut slot = self
                .shared
                .session_id
                .write()
                .unwrap_or_else(|e| e.into_inner());
            let is_new = slot.is_none();
            if is_new {
                *slot = Some(session_id.into());
            }
            is_new
        };
        if is_new {
            tracing::debug!(session_id, "session established");
            let shared = self.shared.clone();
            let ct = self.connection_token();
            let task = tokio::spawn(shared.run_standalone_stream(ct));
            *self.stream_task.lock().await = Some(task);
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpClientTransport {
    async fn connect(&self) -> Result<bool, TransportError> {
        if self.state.is_connected() {
            return Ok(true);
        }
        *self.ct.lock().unwrap_or_else(|e| e.into_inner()) = CancellationToken::new();
        self.state.set_connected(true);
        // The POST channel needs no handshake; the session id arrives
        // with the first response.
        self.state.set_ready();
        self.state.emit_connect().await;
        Ok(true)
    }

    async fn disconnect(&self) -> Result<bool, TransportError> {
        if !self.state.is_connected() {
            return Ok(false);
        }
        self.connection_token().cancel();
        if let Some(task) = self.stream_task.lock().await.take() {
            task.abort();
        }
        // Best-effort session teardown; servers without DELETE support
        // just expire it.
        if let Some(session_id) = self.shared.session_id() {
            let request = self
                .shared
                .http
                .delete(&self.shared.url)
                .header(HEADER_SESSION_ID, session_id.as_ref());
            let request = match self.shared.bearer() {
                Some(token) => request.bearer_auth(token),
                None => request,
            };
            match request.send().await {
                Ok(response) => {
                    tracing::debug!(status = %response.status(), "session delete");
                }
                Err(e) => tracing::debug!("session delete failed: {e}"),
            }
        }
        self.state.set_connected(false);
        self.state.emit_disconnect().await;
        Ok(true)
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<bool, TransportError> {
        if !self.state.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let mut request = self
            .shared
            .http
            .post(&self.shared.url)
            .header(http::header::ACCEPT, "application/json, text/event-stream")
            .json(&message);
        request = self.shared.apply_common_headers(request);
        let response = request.send().await?;

        match response.status() {
            http::StatusCode::UNAUTHORIZED => {
                self.shared.clear_credentials();
                return Err(TransportError::Authentication);
            }
            http::StatusCode::ACCEPTED => {
                self.adopt_session_id(&response).await;
                return Ok(true);
            }
            status if !status.is_success() => {
                return Err(TransportError::UnexpectedServerResponse(
                    format!("POST returned {status}").into(),
                ));
            }
            _ => {}
        }
        self.adopt_session_id(&response).await;

        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match content_type.as_deref() {
            Some(ct) if ct.starts_with("application/json") => {
                let body = response.text().await?;
                match crate::model::parse(&body) {
                    Ok(message) => self.state.emit_message(message).await,
                    Err(e) => {
                        return Err(TransportError::UnexpectedServerResponse(
                            format!("unparsable response body: {e}").into(),
                        ));
                    }
                }
            }
            Some(ct) if ct.starts_with("text/event-stream") => {
                // Per-request stream: pushed messages end when the server
                // closes the body.
                let shared = self.shared.clone();
                let ct_token = self.connection_token();
                tokio::spawn(async move {
                    shared.consume_sse_body(response, ct_token).await;
                });
            }
            other => {
                return Err(TransportError::UnexpectedContentType(
                    other.map(str::to_string),
                ));
            }
        }
        Ok(true)
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    fn set_handler(&self, handler: Arc<dyn TransportEventHandler>) {
        self.state.set_handler(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_linear() {
        let retry = StreamableHttpRetryConfig {
            max_attempts: 3,
            backoff: Duration::from_millis(200),
        };
        assert_eq!(backoff_delay(1, &retry), Duration::from_millis(200));
        assert_eq!(backoff_delay(2, &retry), Duration::from_millis(400));
        assert_eq!(backoff_delay(3, &retry), Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_send_requires_connect() {
        let transport = StreamableHttpClientTransport::new(StreamableHttpClientConfig::new(
            "http://localhost:1/mcp",
        ));
        let err = transport
            .send(JsonRpcMessage::request("ping", 1.into(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}
