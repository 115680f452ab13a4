//! Wire transports.
//!
//! Three interchangeable client transports sit behind the [`Transport`]
//! trait — stdio child process, legacy two-connection SSE, and Streamable
//! HTTP — selected by [`create_transport`] from a [`TransportKind`]-tagged
//! config. The server side of the two HTTP transports lives in
//! [`sse_server`] and [`streamable_http_server`] as axum services.

mod sse_client;
mod sse_parser;
pub mod sse_server;
mod stdio;
mod streamable_http_client;
pub mod streamable_http_server;

use std::borrow::Cow;
use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

pub use sse_client::{SseClientConfig, SseClientTransport};
pub use sse_parser::{RawSseEvent, SseParser};
pub use sse_server::{SseServer, SseServerConfig};
pub use stdio::{StdioConfig, StdioTransport};
pub use streamable_http_client::{
    StreamableHttpClientConfig, StreamableHttpClientTransport, StreamableHttpRetryConfig,
};
pub use streamable_http_server::{StreamableHttpServerConfig, StreamableHttpService};

use crate::model::JsonRpcMessage;

/// Session id header, both directions.
pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
/// Protocol version header, validated against the negotiated version.
pub const HEADER_PROTOCOL_VERSION: &str = "MCP-Protocol-Version";
/// SSE resume point header.
pub const HEADER_LAST_EVENT_ID: &str = "Last-Event-ID";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("SSE error: {0}")]
    Sse(#[from] sse_stream::Error),
    #[error("Url error: {0}")]
    Url(#[from] url::ParseError),
    #[error("Serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("authentication failed, cached credentials cleared")]
    Authentication,
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport is not ready")]
    NotReady,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("unexpected server response: {0}")]
    UnexpectedServerResponse(Cow<'static, str>),
    #[error("unexpected content type: {0:?}")]
    UnexpectedContentType(Option<String>),
}

/// The four connection-event callbacks a transport owner can observe.
/// Defaults are no-ops so owners implement only what they need.
#[async_trait]
pub trait TransportEventHandler: Send + Sync {
    async fn on_message(&self, message: JsonRpcMessage) {
        let _ = message;
    }
    async fn on_error(&self, error: TransportError) {
        let _ = error;
    }
    async fn on_connect(&self) {}
    async fn on_disconnect(&self) {}
}

/// Common contract over the three client transports. `connect` resolves
/// once the transport is usable (for SSE that includes the endpoint
/// handshake); `send` accepts one message and reports acceptance, not
/// delivery.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<bool, TransportError>;
    async fn disconnect(&self) -> Result<bool, TransportError>;
    async fn send(&self, message: JsonRpcMessage) -> Result<bool, TransportError>;
    fn is_connected(&self) -> bool;
    fn is_ready(&self) -> bool;
    fn set_handler(&self, handler: Arc<dyn TransportEventHandler>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

/// Per-kind configuration, tagged by [`TransportKind`].
#[derive(Debug, Clone)]
pub enum TransportConfig {
    Stdio(StdioConfig),
    Sse(SseClientConfig),
    StreamableHttp(StreamableHttpClientConfig),
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Stdio(_) => TransportKind::Stdio,
            TransportConfig::Sse(_) => TransportKind::Sse,
            TransportConfig::StreamableHttp(_) => TransportKind::StreamableHttp,
        }
    }
}

/// Build the concrete transport for a config.
pub fn create_transport(config: TransportConfig) -> Arc<dyn Transport> {
    match config {
        TransportConfig::Stdio(config) => Arc::new(StdioTransport::new(config)),
        TransportConfig::Sse(config) => Arc::new(SseClientTransport::new(config)),
        TransportConfig::StreamableHttp(config) => {
            Arc::new(StreamableHttpClientTransport::new(config))
        }
    }
}

/// Connected/ready flags plus the handler cell, shared by all three
/// client transports and their reader tasks.
#[derive(Default)]
pub(crate) struct ConnectionState {
    connected: AtomicBool,
    ready: AtomicBool,
    handler: RwLock<Option<Arc<dyn TransportEventHandler>>>,
}

impl ConnectionState {
    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if !connected {
            self.ready.store(false, Ordering::SeqCst);
        }
    }

    /// Returns true when this call flipped readiness on.
    pub(crate) fn set_ready(&self) -> bool {
        !self.ready.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn set_handler(&self, handler: Arc<dyn TransportEventHandler>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn TransportEventHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) async fn emit_message(&self, message: JsonRpcMessage) {
        if let Some(handler) = self.handler() {
            handler.on_message(message).await;
        }
    }

    pub(crate) async fn emit_error(&self, error: TransportError) {
        if let Some(handler) = self.handler() {
            handler.on_error(error).await;
        }
    }

    pub(crate) async fn emit_connect(&self) {
        if let Some(handler) = self.handler() {
            handler.on_connect().await;
        }
    }

    pub(crate) async fn emit_disconnect(&self) {
        if let Some(handler) = self.handler() {
            handler.on_disconnect().await;
        }
    }
}
