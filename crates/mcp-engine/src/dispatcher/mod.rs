//! Protocol dispatcher: one parsed message in, at most one message out.
//!
//! `ping`, `initialize` and the `notifications/` family share a fast path
//! common to both roles; everything else goes through the role sub-router
//! behind the middleware chain. A request is always answered — handler
//! failures of any kind come back as error responses, never silence. The
//! only inbound messages that produce nothing are notifications and
//! responses.

mod middleware;
mod pending;
mod router;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

pub use middleware::{Middleware, Next, TracingMiddleware};
pub use pending::{DuplicatedRequestId, PendingRequest, PendingRequests, ResolveOutcome};
pub use router::{ClientRouter, RootsProvider, SamplingHandler, ServerRouter};

use crate::model::{
    CancelledNotificationParam, ErrorData, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    method,
};
use crate::registry::{Registry, StaticRegistry};
use crate::session::Session;

/// Which side of the protocol this dispatcher serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Fallback for methods no router claims. Returning `Ok` answers the
/// request with the given result; returning `Err` answers it with that
/// error.
#[async_trait]
pub trait CustomMethodHandler: Send + Sync {
    async fn handle(
        &self,
        request: &JsonRpcRequest,
        session: &Session,
    ) -> Result<Value, ErrorData>;
}

pub struct DispatcherBuilder {
    role: Role,
    tools: Arc<dyn Registry>,
    prompts: Arc<dyn Registry>,
    resources: Arc<dyn Registry>,
    resource_templates: Arc<dyn Registry>,
    roots: Option<Arc<dyn RootsProvider>>,
    sampling: Option<Arc<dyn SamplingHandler>>,
    custom: Option<Arc<dyn CustomMethodHandler>>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl DispatcherBuilder {
    pub fn tools(mut self, registry: Arc<dyn Registry>) -> Self {
        self.tools = registry;
        self
    }

    pub fn prompts(mut self, registry: Arc<dyn Registry>) -> Self {
        self.prompts = registry;
        self
    }

    pub fn resources(mut self, registry: Arc<dyn Registry>) -> Self {
        self.resources = registry;
        self
    }

    pub fn resource_templates(mut self, registry: Arc<dyn Registry>) -> Self {
        self.resource_templates = registry;
        self
    }

    pub fn roots_provider(mut self, provider: Arc<dyn RootsProvider>) -> Self {
        self.roots = Some(provider);
        self
    }

    pub fn sampling_handler(mut self, handler: Arc<dyn SamplingHandler>) -> Self {
        self.sampling = Some(handler);
        self
    }

    pub fn custom_method_handler(mut self, handler: Arc<dyn CustomMethodHandler>) -> Self {
        self.custom = Some(handler);
        self
    }

    /// Append one middleware; the chain runs in registration order.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            role: self.role,
            server: ServerRouter {
                tools: self.tools,
                prompts: self.prompts,
                resources: self.resources,
                resource_templates: self.resource_templates,
            },
            client: ClientRouter {
                roots: self.roots,
                sampling: self.sampling,
            },
            custom: self.custom,
            middleware: self.middleware,
            pending: Arc::new(PendingRequests::new()),
        }
    }
}

pub struct Dispatcher {
    role: Role,
    server: ServerRouter,
    client: ClientRouter,
    custom: Option<Arc<dyn CustomMethodHandler>>,
    middleware: Vec<Arc<dyn Middleware>>,
    pending: Arc<PendingRequests>,
}

impl Dispatcher {
    pub fn builder(role: Role) -> DispatcherBuilder {
        DispatcherBuilder {
            role,
            tools: Arc::new(StaticRegistry::new()),
            prompts: Arc::new(StaticRegistry::new()),
            resources: Arc::new(StaticRegistry::new()),
            resource_templates: Arc::new(StaticRegistry::new()),
            roots: None,
            sampling: None,
            custom: None,
            middleware: Vec::new(),
        }
    }

    /// The in-flight table for requests this side has sent. Shared with
    /// whatever owns the outbound path.
    pub fn pending(&self) -> Arc<PendingRequests> {
        self.pending.clone()
    }

    /// Process one inbound message against its session. Returns the
    /// message to send back, if the input calls for one.
    pub async fn dispatch(
        &self,
        message: JsonRpcMessage,
        session: &mut Session,
    ) -> Option<JsonRpcMessage> {
        match message {
            JsonRpcMessage::Request(request) => Some(self.handle_request(request, session).await),
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(notification, session);
                None
            }
            JsonRpcMessage::Response(response) => {
                if response.is_pong() {
                    tracing::trace!(id = %response.id, "pong received");
                }
                let outcome = self.pending.resolve(&response.id, Ok(response.result));
                if outcome == ResolveOutcome::Unknown {
                    tracing::debug!(id = %response.id, "response for unknown request id");
                }
                None
            }
            JsonRpcMessage::Error(error) => {
                let outcome = self.pending.resolve(&error.id, Err(error.error));
                if outcome == ResolveOutcome::Unknown {
                    tracing::debug!(id = %error.id, "error for unknown request id");
                }
                None
            }
        }
    }

    async fn handle_request(
        &self,
        request: JsonRpcRequest,
        session: &mut Session,
    ) -> JsonRpcMessage {
        let id = request.id.clone();
        if let Err(error) = session.gate_request(&request.method) {
            return JsonRpcMessage::error(id, error);
        }
        let result = match request.method.as_str() {
            method::PING => Ok(json!({})),
            method::INITIALIZE => self.handle_initialize(&request, session),
            _ => self.route(&request, session).await,
        };
        match result {
            Ok(result) => JsonRpcMessage::response(id, result),
            Err(error) => JsonRpcMessage::error(id, error),
        }
    }

    fn handle_initialize(
        &self,
        request: &JsonRpcRequest,
        session: &mut Session,
    ) -> Result<Value, ErrorData> {
        let params = request.params.clone().unwrap_or(Value::Null);
        let params = serde_json::from_value(params)
            .map_err(|e| ErrorData::invalid_params(format!("invalid initialize params: {e}"), None))?;
        let result = session.initialize(params)?;
        serde_json::to_value(&result).map_err(|e| ErrorData::internal_error(e.to_string()))
    }

    /// Role sub-router behind the middleware chain; the custom handler is
    /// the last resort before method_not_found.
    async fn route(
        &self,
        request: &JsonRpcRequest,
        session: &Session,
    ) -> Result<Value, ErrorData> {
        let next = Next::new(&self.middleware, || {
            Box::pin(async move {
                let claimed = match self.role {
                    Role::Server => Self::is_server_method(&request.method),
                    Role::Client => Self::is_client_method(&request.method),
                };
                if claimed {
                    match self.role {
                        Role::Server => self.server.handle(request, session).await,
                        Role::Client => self.client.handle(request).await,
                    }
                } else if let Some(custom) = &self.custom {
                    custom.handle(request, session).await
                } else {
                    Err(ErrorData::method_not_found(&request.method))
                }
            })
        });
        next.run(request, session).await
    }

    fn is_server_method(name: &str) -> bool {
        name.starts_with("tools/")
            || name.starts_with("prompts/")
            || name.starts_with("resources/")
            || name == method::COMPLETION_COMPLETE
            || name == method::SET_LOGGING_LEVEL
    }

    fn is_client_method(name: &str) -> bool {
        name.starts_with("roots/") || name.starts_with("sampling/")
    }

    fn handle_notification(&self, notification: JsonRpcNotification, session: &mut Session) {
        match notification.method.as_str() {
            method::NOTIFICATION_INITIALIZED => {
                session.mark_initialized();
                tracing::debug!(session_id = %session.id, "session initialized");
            }
            method::NOTIFICATION_CANCELLED => {
                let params = notification.params.unwrap_or(Value::Null);
                match serde_json::from_value::<CancelledNotificationParam>(params) {
                    Ok(param) => {
                        let marked = self.pending.cancel(&param.request_id);
                        tracing::debug!(
                            id = %param.request_id,
                            reason = param.reason.as_deref().unwrap_or(""),
                            marked,
                            "cancellation received"
                        );
                    }
                    Err(e) => {
                        tracing::warn!("malformed cancellation notification: {e}");
                    }
                }
            }
            method::NOTIFICATION_PROGRESS => {
                tracing::trace!(session_id = %session.id, "progress notification");
            }
            other => {
                tracing::debug!(session_id = %session.id, method = other, "notification ignored");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::{
        ErrorCode, Implementation, ProtocolVersion, ServerCapabilities, parse, serialize,
    };
    use crate::registry::SessionCapabilities;

    fn test_session() -> Session {
        Session::new(
            Implementation {
                name: "test-server".to_string(),
                version: "0.0.0".to_string(),
            },
            ServerCapabilities::default(),
            SessionCapabilities {
                logging: true,
                ..Default::default()
            },
        )
    }

    fn initialized_session() -> Session {
        let mut session = test_session();
        session
            .initialize(crate::model::InitializeRequestParam {
                protocol_version: ProtocolVersion::LATEST,
                capabilities: Default::default(),
                client_info: Implementation {
                    name: "c".to_string(),
                    version: "0".to_string(),
                },
            })
            .unwrap();
        session.mark_initialized();
        session
    }

    fn server_dispatcher() -> Dispatcher {
        let tools = StaticRegistry::new().with_entry(
            "echo",
            json!({"name": "echo", "inputSchema": {"type": "object"}}),
            Arc::new(|args| {
                Ok(json!({
                    "content": [{"type": "text", "text": args.unwrap_or(Value::Null).to_string()}],
                    "isError": false
                }))
            }),
        );
        Dispatcher::builder(Role::Server)
            .tools(Arc::new(tools))
            .middleware(Arc::new(TracingMiddleware))
            .build()
    }

    #[tokio::test]
    async fn test_ping_wire_scenario() {
        let dispatcher = server_dispatcher();
        let mut session = test_session();
        let message = parse(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        let response = dispatcher.dispatch(message, &mut session).await.unwrap();
        assert_eq!(
            serialize(&response),
            r#"{"jsonrpc":"2.0","id":1,"result":{}}"#
        );
    }

    #[tokio::test]
    async fn test_response_echoes_request_id() {
        let dispatcher = server_dispatcher();
        let mut session = initialized_session();
        let message = JsonRpcMessage::request("tools/list", "corr-77".to_string().into(), None);
        let response = dispatcher.dispatch(message, &mut session).await.unwrap();
        assert_eq!(
            response.id(),
            Some(&crate::model::RequestId::String("corr-77".to_string()))
        );
        assert!(matches!(response, JsonRpcMessage::Response(_)));
    }

    #[tokio::test]
    async fn test_initialize_with_unsupported_version() {
        let dispatcher = server_dispatcher();
        let mut session = test_session();
        let message = JsonRpcMessage::request(
            "initialize",
            1.into(),
            Some(json!({
                "protocolVersion": "1.0.0",
                "capabilities": {},
                "clientInfo": {"name": "c", "version": "0"}
            })),
        );
        let response = dispatcher.dispatch(message, &mut session).await.unwrap();
        let JsonRpcMessage::Error(error) = response else {
            panic!("expected error response");
        };
        let data = error.error.data.unwrap();
        assert_eq!(data["requested"], "1.0.0");
        assert!(
            data["supported"]
                .as_array()
                .unwrap()
                .contains(&json!(ProtocolVersion::LATEST.as_str()))
        );
        assert!(session.protocol_version.is_none());
    }

    #[tokio::test]
    async fn test_unregistered_tool_is_method_not_found_with_name() {
        let dispatcher = server_dispatcher();
        let mut session = initialized_session();
        let message = JsonRpcMessage::request(
            "tools/call",
            2.into(),
            Some(json!({"name": "does-not-exist"})),
        );
        let response = dispatcher.dispatch(message, &mut session).await.unwrap();
        let JsonRpcMessage::Error(error) = response else {
            panic!("expected error response");
        };
        assert_eq!(error.error.code, ErrorCode::METHOD_NOT_FOUND);
        assert!(error.error.message.contains("does-not-exist"));
    }

    #[tokio::test]
    async fn test_registered_tool_call_round_trip() {
        let dispatcher = server_dispatcher();
        let mut session = initialized_session();
        let message = JsonRpcMessage::request(
            "tools/call",
            3.into(),
            Some(json!({"name": "echo", "arguments": {"text": "hi"}})),
        );
        let response = dispatcher.dispatch(message, &mut session).await.unwrap();
        let JsonRpcMessage::Response(response) = response else {
            panic!("expected success response");
        };
        assert_eq!(response.result["isError"], false);
    }

    #[tokio::test]
    async fn test_request_before_initialized_is_rejected() {
        let dispatcher = server_dispatcher();
        let mut session = test_session();
        let message = JsonRpcMessage::request("tools/list", 4.into(), None);
        let response = dispatcher.dispatch(message, &mut session).await.unwrap();
        let JsonRpcMessage::Error(error) = response else {
            panic!("expected error response");
        };
        assert!(error.error.message.contains("not yet initialized"));
    }

    #[tokio::test]
    async fn test_notifications_produce_no_response() {
        let dispatcher = server_dispatcher();
        let mut session = test_session();
        session
            .initialize(crate::model::InitializeRequestParam {
                protocol_version: ProtocolVersion::LATEST,
                capabilities: Default::default(),
                client_info: Implementation {
                    name: "c".to_string(),
                    version: "0".to_string(),
                },
            })
            .unwrap();
        let message = JsonRpcMessage::notification("notifications/initialized", None);
        assert!(dispatcher.dispatch(message, &mut session).await.is_none());
        assert_eq!(session.status, crate::session::SessionStatus::Initialized);
    }

    #[tokio::test]
    async fn test_cancellation_marks_pending_request() {
        let dispatcher = server_dispatcher();
        let mut session = initialized_session();
        let pending = dispatcher.pending();
        let _rx = pending.register(9.into(), "sampling/createMessage").unwrap();

        let message = JsonRpcMessage::notification(
            "notifications/cancelled",
            Some(json!({"requestId": 9, "reason": "timeout"})),
        );
        assert!(dispatcher.dispatch(message, &mut session).await.is_none());
        assert!(pending.get(&9.into()).unwrap().cancelled);
    }

    #[tokio::test]
    async fn test_pong_response_is_discarded() {
        let dispatcher = server_dispatcher();
        let mut session = initialized_session();
        let pending = dispatcher.pending();
        let rx = pending.register(5.into(), "ping").unwrap();

        let message = JsonRpcMessage::response(5.into(), json!({}));
        assert!(dispatcher.dispatch(message, &mut session).await.is_none());
        // The waiter still sees the acknowledgement; nothing goes back on
        // the wire.
        assert_eq!(rx.await.unwrap().unwrap(), json!({}));
    }

    struct FailingHandler;

    #[async_trait]
    impl CustomMethodHandler for FailingHandler {
        async fn handle(
            &self,
            _request: &JsonRpcRequest,
            _session: &Session,
        ) -> Result<Value, ErrorData> {
            Err(ErrorData::internal_error("backend exploded"))
        }
    }

    #[tokio::test]
    async fn test_custom_handler_failure_still_answers() {
        let dispatcher = Dispatcher::builder(Role::Server)
            .custom_method_handler(Arc::new(FailingHandler))
            .build();
        let mut session = initialized_session();
        let message = JsonRpcMessage::request("vendor/custom", 6.into(), None);
        let response = dispatcher.dispatch(message, &mut session).await.unwrap();
        let JsonRpcMessage::Error(error) = response else {
            panic!("expected error response");
        };
        assert_eq!(error.error.code, ErrorCode::INTERNAL_ERROR);
        assert_eq!(error.id, 6.into());
    }

    #[tokio::test]
    async fn test_unmatched_method_without_custom_handler() {
        let dispatcher = server_dispatcher();
        let mut session = initialized_session();
        let message = JsonRpcMessage::request("vendor/custom", 7.into(), None);
        let response = dispatcher.dispatch(message, &mut session).await.unwrap();
        let JsonRpcMessage::Error(error) = response else {
            panic!("expected error response");
        };
        assert_eq!(error.error.code, ErrorCode::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_client_role_routes_roots() {
        struct FixedRoots;
        #[async_trait]
        impl RootsProvider for FixedRoots {
            async fn list_roots(&self) -> Result<crate::model::ListRootsResult, ErrorData> {
                Ok(crate::model::ListRootsResult {
                    roots: vec![crate::model::Root {
                        uri: "file:///workspace".to_string(),
                        name: Some("workspace".to_string()),
                    }],
                })
            }
        }
        let dispatcher = Dispatcher::builder(Role::Client)
            .roots_provider(Arc::new(FixedRoots))
            .build();
        let mut session = initialized_session();
        let message = JsonRpcMessage::request("roots/list", 8.into(), None);
        let response = dispatcher.dispatch(message, &mut session).await.unwrap();
        let JsonRpcMessage::Response(response) = response else {
            panic!("expected success response");
        };
        assert_eq!(response.result["roots"][0]["uri"], "file:///workspace");
    }
}
