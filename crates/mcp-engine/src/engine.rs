//! The assembled engine: session store, dispatcher, event log and
//! delivery bridge behind one handle the transport services share.
//!
//! Outbound server-initiated messages take one path only: serialize, tap
//! the event store for a resumable id, then publish to the session's
//! stream channel for whichever worker holds the connection.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{Dispatcher, Role};
use crate::error::EngineError;
use crate::event_store::{EventStore, InMemoryEventStore};
use crate::model::{
    ErrorData, Implementation, JsonRpcMessage, ProgressNotificationParam,
    ResourceUpdatedNotificationParam, ServerCapabilities, method,
};
use crate::pubsub::{InProcessAdapter, PubSubAdapter, session_channel};
use crate::registry::{
    AllowAllGateway, AuthRequest, CapabilitiesProvider, Gateway, Identity,
    StaticCapabilitiesProvider, Unauthorized,
};
use crate::session::{InMemorySessionStore, Session, SessionError, SessionStore};

/// Channel carrying a session's event-store-tapped outbound frames.
pub fn session_stream_channel(session_id: &str) -> String {
    format!("{}:events", session_channel(session_id))
}

/// Envelope published on the stream channel: the stored event id plus the
/// message, so the delivering worker can emit a resumable SSE frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamFrame {
    pub event_id: u64,
    pub message: JsonRpcMessage,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub server_info: Implementation,
    pub capabilities: ServerCapabilities,
    /// Configuration profile resolved through the capabilities provider
    /// for each new session.
    pub profile: String,
    /// Count cap for each session's resumability log.
    pub event_log_cap: usize,
    pub session_max_idle: chrono::Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_info: Implementation::from_build_env(),
            capabilities: ServerCapabilities::default(),
            profile: "default".to_string(),
            event_log_cap: 1024,
            session_max_idle: chrono::Duration::hours(1),
        }
    }
}

/// What became of one processed inbound message.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// A request was answered; send this back on the same channel.
    Reply(JsonRpcMessage),
    /// Consumed without a reply (notification or response).
    Accepted,
    /// The session is unknown, closed, or was swept mid-flight. Soft.
    SessionNotFound,
    /// The explicit protocol-version header contradicted the negotiated
    /// version; the HTTP layer answers 400 with this body.
    VersionMismatch(ErrorData),
}

pub struct EngineBuilder {
    dispatcher: Option<Dispatcher>,
    sessions: Arc<dyn SessionStore>,
    events: Arc<dyn EventStore>,
    pubsub: Arc<dyn PubSubAdapter>,
    gateway: Arc<dyn Gateway>,
    capabilities_provider: Arc<dyn CapabilitiesProvider>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventStore>) -> Self {
        self.events = events;
        self
    }

    pub fn pubsub(mut self, pubsub: Arc<dyn PubSubAdapter>) -> Self {
        self.pubsub = pubsub;
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn capabilities_provider(mut self, provider: Arc<dyn CapabilitiesProvider>) -> Self {
        self.capabilities_provider = provider;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<Engine> {
        Arc::new(Engine {
            dispatcher: self
                .dispatcher
                .unwrap_or_else(|| Dispatcher::builder(Role::Server).build()),
            sessions: self.sessions,
            events: self.events,
            pubsub: self.pubsub,
            gateway: self.gateway,
            capabilities_provider: self.capabilities_provider,
            config: self.config,
        })
    }
}

pub struct Engine {
    dispatcher: Dispatcher,
    sessions: Arc<dyn SessionStore>,
    events: Arc<dyn EventStore>,
    pubsub: Arc<dyn PubSubAdapter>,
    gateway: Arc<dyn Gateway>,
    capabilities_provider: Arc<dyn CapabilitiesProvider>,
    config: EngineConfig,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            dispatcher: None,
            sessions: Arc::new(InMemorySessionStore::new()),
            events: Arc::new(InMemoryEventStore::new()),
            pubsub: Arc::new(InProcessAdapter::new()),
            gateway: Arc::new(AllowAllGateway),
            capabilities_provider: Arc::new(StaticCapabilitiesProvider::default()),
            config: EngineConfig::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pubsub(&self) -> &Arc<dyn PubSubAdapter> {
        &self.pubsub
    }

    pub fn events(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub async fn authenticate(&self, request: &AuthRequest) -> Result<Identity, Unauthorized> {
        self.gateway.authenticate(request).await
    }

    /// Create and persist a fresh session for the configured profile.
    pub async fn create_session(&self) -> Session {
        let capabilities = self
            .capabilities_provider
            .capabilities_for(&self.config.profile);
        let session = Session::new(
            self.config.server_info.clone(),
            self.config.capabilities.clone(),
            capabilities,
        );
        tracing::debug!(session_id = %session.id, "session created");
        self.sessions.insert(session.clone()).await;
        session
    }

    pub async fn session(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).await
    }

    /// Run one inbound message through header validation and dispatch,
    /// then persist the session mutation.
    pub async fn process(
        &self,
        session_id: &str,
        message: JsonRpcMessage,
        protocol_header: Option<&str>,
    ) -> ProcessOutcome {
        let Some(mut session) = self.sessions.get(session_id).await else {
            return ProcessOutcome::SessionNotFound;
        };
        if let Some(method_name) = message.method() {
            if let Err(error) = session.validate_protocol_header(method_name, protocol_header) {
                return ProcessOutcome::VersionMismatch(error);
            }
        }
        let reply = self.dispatcher.dispatch(message, &mut session).await;
        let updated = session;
        if let Err(e) = self
            .sessions
            .modify(session_id, Box::new(move |s| *s = updated))
            .await
        {
            // Swept or closed mid-dispatch; the reply still goes out.
            tracing::debug!(session_id, "session write skipped: {e}");
        }
        match reply {
            Some(message) => ProcessOutcome::Reply(message),
            None => ProcessOutcome::Accepted,
        }
    }

    /// Server-initiated message: tap the event store, then hand it to the
    /// delivery bridge. Returns the assigned event id.
    pub async fn notify_session(
        &self,
        session_id: &str,
        message: JsonRpcMessage,
    ) -> Result<u64, EngineError> {
        if self.sessions.get(session_id).await.is_none() {
            return Err(EngineError::Session(SessionError::NotFound(
                session_id.to_string(),
            )));
        }
        let payload = crate::model::serialize(&message);
        let event_id = self
            .events
            .store(session_id, payload, self.config.event_log_cap)
            .await;
        let frame = StreamFrame { event_id, message };
        let envelope = serde_json::to_string(&frame)
            .map_err(|e| EngineError::Protocol(ErrorData::internal_error(e.to_string())))?;
        self.pubsub
            .publish(&session_stream_channel(session_id), envelope)
            .await?;
        Ok(event_id)
    }

    pub async fn notify_tools_list_changed(&self, session_id: &str) -> Result<u64, EngineError> {
        self.notify_session(
            session_id,
            JsonRpcMessage::notification(method::NOTIFICATION_TOOLS_LIST_CHANGED, None),
        )
        .await
    }

    pub async fn notify_prompts_list_changed(&self, session_id: &str) -> Result<u64, EngineError> {
        self.notify_session(
            session_id,
            JsonRpcMessage::notification(method::NOTIFICATION_PROMPTS_LIST_CHANGED, None),
        )
        .await
    }

    pub async fn notify_resources_list_changed(
        &self,
        session_id: &str,
    ) -> Result<u64, EngineError> {
        self.notify_session(
            session_id,
            JsonRpcMessage::notification(method::NOTIFICATION_RESOURCES_LIST_CHANGED, None),
        )
        .await
    }

    pub async fn notify_resource_updated(
        &self,
        session_id: &str,
        param: ResourceUpdatedNotificationParam,
    ) -> Result<u64, EngineError> {
        self.notify_session(
            session_id,
            JsonRpcMessage::notification(
                method::NOTIFICATION_RESOURCES_UPDATED,
                Some(serde_json::to_value(&param).unwrap_or_default()),
            ),
        )
        .await
    }

    pub async fn notify_progress(
        &self,
        session_id: &str,
        param: ProgressNotificationParam,
    ) -> Result<u64, EngineError> {
        self.notify_session(
            session_id,
            JsonRpcMessage::notification(
                method::NOTIFICATION_PROGRESS,
                Some(serde_json::to_value(&param).unwrap_or_default()),
            ),
        )
        .await
    }

    /// Soft-close the session and release everything keyed to it.
    pub async fn close_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.sessions.close(session_id).await?;
        self.events.remove_session(session_id).await;
        let _ = self.pubsub.unsubscribe(&session_channel(session_id)).await;
        let _ = self
            .pubsub
            .unsubscribe(&session_stream_channel(session_id))
            .await;
        tracing::debug!(session_id, "session closed");
        Ok(())
    }

    /// Background expiry sweep at `interval` until cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        ct: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = ct.cancelled() => break,
                }
                let swept = engine
                    .sessions
                    .sweep_expired(engine.config.session_max_idle)
                    .await;
                if swept > 0 {
                    tracing::info!(swept, "expired sessions closed");
                }
            }
        })
    }
}
