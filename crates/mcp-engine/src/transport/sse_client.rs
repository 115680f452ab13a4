//! Legacy two-connection SSE client transport.
//!
//! One long-lived GET stream carries server events; client messages go
//! out as POSTs to an endpoint the server announces in its first event.
//! `connect` blocks (bounded) until that `endpoint` event arrives; the
//! transport is not ready before it. This transport never reconnects —
//! resumability belongs to its Streamable HTTP successor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

use super::{ConnectionState, SseParser, Transport, TransportError, TransportEventHandler};
use crate::model::JsonRpcMessage;

#[derive(Debug, Clone)]
pub struct SseClientConfig {
    /// Full URL of the SSE stream, e.g. `http://host:8080/sse`.
    pub sse_url: String,
    pub auth_token: Option<String>,
    /// Bound on the wait for the server's `endpoint` event.
    pub endpoint_wait_timeout: Duration,
}

impl SseClientConfig {
    pub fn new(sse_url: impl Into<String>) -> Self {
        Self {
            sse_url: sse_url.into(),
            auth_token: None,
            endpoint_wait_timeout: Duration::from_secs(10),
        }
    }
}

pub struct SseClientTransport {
    config: SseClientConfig,
    http: reqwest::Client,
    state: Arc<ConnectionState>,
    endpoint_tx: watch::Sender<Option<Arc<str>>>,
    reader_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Resolve the endpoint event's payload against the SSE URL. Absolute
/// paths resolve against the origin, relative ones against the stream
/// path, per ordinary URL semantics.
fn resolve_post_url(sse_url: &str, endpoint: &str) -> Result<Arc<str>, TransportError> {
    let base = Url::parse(sse_url)?;
    let joined = base.join(endpoint)?;
    Ok(joined.as_str().into())
}

impl SseClientTransport {
    pub fn new(config: SseClientConfig) -> Self {
        let (endpoint_tx, _) = watch::channel(None);
        Self {
            config,
            http: reqwest::Client::new(),
            state: Arc::new(ConnectionState::default()),
            endpoint_tx,
            reader_task: tokio::sync::Mutex::new(None),
        }
    }

    fn post_url(&self) -> Option<Arc<str>> {
        self.endpoint_tx.borrow().clone()
    }
}

#[async_trait]
impl Transport for SseClientTransport {
    async fn connect(&self) -> Result<bool, TransportError> {
        let mut reader_task = self.reader_task.lock().await;
        if reader_task.is_some() {
            return Ok(true);
        }
        let mut request = self
            .http
            .get(&self.config.sse_url)
            .header(http::header::ACCEPT, "text/event-stream");
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?.error_for_status()?;
        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if !content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("text/event-stream"))
        {
            return Err(TransportError::UnexpectedContentType(content_type));
        }

        let state = self.state.clone();
        let endpoint_tx = self.endpoint_tx.clone();
        let sse_url = self.config.sse_url.clone();
        let task = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!("sse stream error: {e}");
                        state.emit_error(TransportError::Client(e)).await;
                        break;
                    }
                };
                for event in parser.push(&String::from_utf8_lossy(&chunk)) {
                    match event.event.as_deref() {
                        Some("endpoint") => {
                            let Some(data) = event.data else {
                                tracing::warn!("endpoint event without data");
                                continue;
                            };
                            match resolve_post_url(&sse_url, &data) {
                                Ok(url) => {
                                    tracing::debug!(post_url = %url, "endpoint received");
                                    let _ = endpoint_tx.send(Some(url));
                                    if state.set_ready() {
                                        state.emit_connect().await;
                                    }
                                }
                                Err(e) => state.emit_error(e).await,
                            }
                        }
                        Some("ping") => {}
                        // "message" events and bare-JSON frames both carry
                        // protocol payloads.
                        _ => {
                            let Some(data) = event.data else { continue };
                            match crate::model::parse(&data) {
                                Ok(message) => state.emit_message(message).await,
                                Err(e) => {
                                    tracing::warn!("dropping unparsable sse payload: {e}");
                                }
                            }
                        }
                    }
                }
            }
            state.set_connected(false);
            state.emit_disconnect().await;
            tracing::debug!("sse stream terminated");
        });
        *reader_task = Some(task);
        self.state.set_connected(true);
        drop(reader_task);

        // Bounded wait for the endpoint event before reporting ready.
        let mut endpoint_rx = self.endpoint_tx.subscribe();
        let wait = async {
            loop {
                if endpoint_rx.borrow().is_some() {
                    return Ok::<(), TransportError>(());
                }
                if endpoint_rx.changed().await.is_err() {
                    return Err(TransportError::NotConnected);
                }
            }
        };
        match tokio::time::timeout(self.config.endpoint_wait_timeout, wait).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                self.disconnect().await?;
                Err(e)
            }
            Err(_) => {
                self.disconnect().await?;
                Err(TransportError::Timeout("endpoint event"))
            }
        }
    }

    async fn disconnect(&self) -> Result<bool, TransportError> {
        let Some(task) = self.reader_task.lock().await.take() else {
            return Ok(false);
        };
        task.abort();
        let _ = self.endpoint_tx.send(None);
        self.state.set_connected(false);
        self.state.emit_disconnect().await;
        Ok(true)
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<bool, TransportError> {
        if !self.state.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let Some(url) = self.post_url() else {
            return Err(TransportError::NotReady);
        };
        let mut request = self.http.post(url.as_ref()).json(&message);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if response.status() == http::StatusCode::UNAUTHORIZED {
            return Err(TransportError::Authentication);
        }
        if !response.status().is_success() {
            return Err(TransportError::UnexpectedServerResponse(
                format!("POST returned {}", response.status()).into(),
            ));
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
