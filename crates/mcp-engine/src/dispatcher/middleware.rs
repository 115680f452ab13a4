//! Ordered middleware chain wrapping the handler call.
//!
//! Composed once at dispatcher construction; each middleware sees the
//! request on the way in and the typed result on the way out, and may
//! short-circuit by not calling [`Next::run`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::model::{ErrorData, JsonRpcRequest};
use crate::session::Session;

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(
        &self,
        request: &JsonRpcRequest,
        session: &Session,
        next: Next<'_>,
    ) -> Result<Value, ErrorData>;
}

type BoxHandler<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<Value, ErrorData>> + Send + 'a>;

/// The remainder of the chain, ending in the actual method handler.
pub struct Next<'a> {
    middleware: &'a [Arc<dyn Middleware>],
    handler: BoxHandler<'a>,
}

impl<'a> Next<'a> {
    pub fn new(
        middleware: &'a [Arc<dyn Middleware>],
        handler: impl FnOnce() -> BoxFuture<'a, Result<Value, ErrorData>> + Send + 'a,
    ) -> Self {
        Self {
            middleware,
            handler: Box::new(handler),
        }
    }

    pub async fn run(
        self,
        request: &JsonRpcRequest,
        session: &Session,
    ) -> Result<Value, ErrorData> {
        match self.middleware.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    middleware: rest,
                    handler: self.handler,
                };
                head.call(request, session, next).await
            }
            None => (self.handler)().await,
        }
    }
}

/// Logs every wrapped call at debug with its outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    async fn call(
        &self,
        request: &JsonRpcRequest,
        session: &Session,
        next: Next<'_>,
    ) -> Result<Value, ErrorData> {
        let method = request.method.clone();
        let result = next.run(request, session).await;
        match &result {
            Ok(_) => tracing::debug!(session_id = %session.id, %method, "handled"),
            Err(e) => tracing::debug!(session_id = %session.id, %method, error = %e, "failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::model::{
        Implementation, JsonRpcVersion2_0, ServerCapabilities,
    };
    use crate::registry::SessionCapabilities;

    fn test_session() -> Session {
        Session::new(
            Implementation {
                name: "s".to_string(),
                version: "0".to_string(),
            },
            ServerCapabilities::default(),
            SessionCapabilities::default(),
        )
    }

    fn test_request(method: &str) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: JsonRpcVersion2_0,
            id: 1.into(),
            method: method.to_string(),
            params: None,
        }
    }

    struct CountingMiddleware {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Middleware for CountingMiddleware {
        async fn call(
            &self,
            request: &JsonRpcRequest,
            session: &Session,
            next: Next<'_>,
        ) -> Result<Value, ErrorData> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            next.run(request, session).await
        }
    }

    struct ShortCircuitMiddleware;

    #[async_trait]
    impl Middleware for ShortCircuitMiddleware {
        async fn call(
            &self,
            _request: &JsonRpcRequest,
            _session: &Session,
            _next: Next<'_>,
        ) -> Result<Value, ErrorData> {
            Err(ErrorData::invalid_request("blocked"))
        }
    }

    #[tokio::test]
    async fn test_chain_runs_in_registration_order_then_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(CountingMiddleware {
                calls: calls.clone(),
            }),
            Arc::new(CountingMiddleware {
                calls: calls.clone(),
            }),
        ];
        let next = Next::new(&chain, || {
            Box::pin(async { Ok(json!({"handled": true})) })
        });
        let result = next
            .run(&test_request("ping"), &test_session())
            .await
            .unwrap();
        assert_eq!(result, json!({"handled": true}));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_middleware_can_short_circuit() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(ShortCircuitMiddleware)];
        let next = Next::new(&chain, || {
            Box::pin(async { panic!("handler must not run") })
        });
        let err = next
            .run(&test_request("tools/list"), &test_session())
            .await
            .unwrap_err();
        assert_eq!(err.message, "blocked");
    }
}
