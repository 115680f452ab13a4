//! Client-side session: outbound requests with correlation and deadline
//! over any [`Transport`].
//!
//! Every request resolves one way or another — a matching-id response, a
//! peer error, or an explicit timeout. On timeout the entry is marked
//! acknowledged-ignored, a best-effort `notifications/cancelled` goes
//! out, and control returns to the caller; a response that shows up later
//! is dropped as a no-op.
//!
//! Inbound traffic all flows through a client-role [`Dispatcher`]:
//! responses resolve the pending table, server-initiated requests
//! (`roots/`, `sampling/`) are answered through the client router, and
//! cancellations mark pending entries.

use std::sync::{Arc, OnceLock, Weak};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::dispatcher::{Dispatcher, DuplicatedRequestId, Role};
use crate::model::{
    ClientCapabilities, ErrorData, Implementation, InitializeResult, JsonRpcMessage,
    ProtocolVersion, RequestId, method,
};
use crate::registry::SessionCapabilities;
use crate::session::{Session, SessionStatus};
use crate::transport::{Transport, TransportError, TransportEventHandler};

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request timed out: {method} (id {id})")]
    Timeout { method: String, id: RequestId },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("peer answered with error: {0}")]
    Rpc(#[from] ErrorData),
    #[error("response channel closed before a response arrived")]
    ChannelClosed,
    #[error(transparent)]
    DuplicatedRequestId(#[from] DuplicatedRequestId),
}

#[derive(Debug, Clone)]
pub struct ClientSessionConfig {
    pub client_info: Implementation,
    pub capabilities: ClientCapabilities,
    pub protocol_version: ProtocolVersion,
    pub request_timeout: Duration,
}

impl Default for ClientSessionConfig {
    fn default() -> Self {
        Self {
            client_info: Implementation::from_build_env(),
            capabilities: ClientCapabilities::default(),
            protocol_version: ProtocolVersion::LATEST,
            request_timeout: Duration::from_secs(30),
        }
    }
}

struct InboundHandler {
    dispatcher: Arc<Dispatcher>,
    session: Arc<tokio::sync::Mutex<Session>>,
    transport: OnceLock<Weak<dyn Transport>>,
}

#[async_trait]
impl TransportEventHandler for InboundHandler {
    async fn on_message(&self, message: JsonRpcMessage) {
        let reply = {
            let mut session = self.session.lock().await;
            self.dispatcher.dispatch(message, &mut session).await
        };
        let Some(reply) = reply else { return };
        let Some(transport) = self.transport.get().and_then(Weak::upgrade) else {
            return;
        };
        if let Err(e) = transport.send(reply).await {
            tracing::warn!("failed to answer peer request: {e}");
        }
    }

    async fn on_error(&self, error: TransportError) {
        tracing::warn!("transport error: {error}");
    }

    async fn on_disconnect(&self) {
        tracing::debug!("transport disconnected");
    }
}

pub struct ClientSession {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    config: ClientSessionConfig,
    next_id: AtomicI64,
}

impl ClientSession {
    /// Wire a client-role dispatcher to the transport. The dispatcher
    /// handles everything inbound; this handle owns everything outbound.
    pub fn new(
        transport: Arc<dyn Transport>,
        dispatcher: Dispatcher,
        config: ClientSessionConfig,
    ) -> Self {
        let dispatcher = Arc::new(dispatcher);
        // The local mirror of the conversation; server-initiated requests
        // are gated against it like any other session.
        let mut session = Session::new(
            config.client_info.clone(),
            Default::default(),
            SessionCapabilities::default(),
        );
        session.status = SessionStatus::Initialized;
        let handler = Arc::new(InboundHandler {
            dispatcher: dispatcher.clone(),
            session: Arc::new(tokio::sync::Mutex::new(session)),
            transport: OnceLock::new(),
        });
        let _ = handler.transport.set(Arc::downgrade(&transport));
        transport.set_handler(handler);
        Self {
            transport,
            dispatcher,
            config,
            next_id: AtomicI64::new(1),
        }
    }

    /// A client session with no client-side providers.
    pub fn with_default_dispatcher(
        transport: Arc<dyn Transport>,
        config: ClientSessionConfig,
    ) -> Self {
        Self::new(transport, Dispatcher::builder(Role::Client).build(), config)
    }

    pub async fn connect(&self) -> Result<bool, TransportError> {
        self.transport.connect().await
    }

    pub async fn close(&self) -> Result<bool, TransportError> {
        self.transport.disconnect().await
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// The initialize handshake: request, adopt the negotiated version,
    /// confirm with `notifications/initialized`.
    pub async fn initialize(&self) -> Result<InitializeResult, RequestError> {
        let result = self
            .request(
                method::INITIALIZE,
                Some(json!({
                    "protocolVersion": self.config.protocol_version,
                    "capabilities": self.config.capabilities,
                    "clientInfo": self.config.client_info,
                })),
            )
            .await?;
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| ErrorData::internal_error(format!("malformed initialize result: {e}")))
            .map_err(RequestError::Rpc)?;
        self.notify(method::NOTIFICATION_INITIALIZED, None).await?;
        Ok(result)
    }

    /// Send one request and wait for its answer, bounded by the
    /// configured deadline.
    pub async fn request(
        &self,
        method_name: &str,
        params: Option<Value>,
    ) -> Result<Value, RequestError> {
        let id = self.next_id();
        let pending = self.dispatcher.pending();
        let rx = pending.register(id.clone(), method_name)?;
        self.transport
            .send(JsonRpcMessage::request(method_name, id.clone(), params))
            .await?;

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(RequestError::Rpc(error)),
            Ok(Err(_)) => Err(RequestError::ChannelClosed),
            Err(_) => {
                // Soft failure: give up locally, tell the peer, and let a
                // late answer die in the pending table.
                pending.acknowledge_ignored(&id);
                let cancel = JsonRpcMessage::notification(
                    method::NOTIFICATION_CANCELLED,
                    Some(json!({"requestId": id, "reason": "timeout"})),
                );
                if let Err(e) = self.transport.send(cancel).await {
                    tracing::debug!("best-effort cancellation failed: {e}");
                }
                Err(RequestError::Timeout {
                    method: method_name.to_string(),
                    id,
                })
            }
        }
    }

    pub async fn notify(
        &self,
        method_name: &str,
        params: Option<Value>,
    ) -> Result<(), RequestError> {
        self.transport
            .send(JsonRpcMessage::notification(method_name, params))
            .await?;
        Ok(())
    }

    /// Liveness probe; any empty-result response counts as a pong.
    pub async fn ping(&self) -> Result<(), RequestError> {
        self.request(method::PING, None).await.map(|_| ())
    }
}
