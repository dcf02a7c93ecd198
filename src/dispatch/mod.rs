//! Named method → async handler table.
//!
//! Handlers take the request's `params` object and a [`CallContext`] and
//! return result data or an [`RpcError`]. The registry is populated once at
//! startup from the handler modules and frozen behind an `Arc` after that.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

use crate::auth::SessionClaims;
use crate::registry::ConnectionWriter;
use crate::rpc::{RpcError, RpcRequest, RpcResponse, METHOD_NOT_FOUND};
use crate::AppContext;

/// Per-invocation context handed to every handler.
///
/// Handlers that need the caller's identity read it from `claims`, never
/// from the payload. `claims` is `None` only while the handshake itself is
/// being dispatched.
#[derive(Clone)]
pub struct CallContext {
    pub app: Arc<AppContext>,
    pub writer: ConnectionWriter,
    pub claims: Option<SessionClaims>,
}

pub type HandlerResult = Result<Value, RpcError>;

type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

pub type Handler = Arc<dyn Fn(Value, CallContext) -> HandlerFuture + Send + Sync>;

/// Adapt a plain async fn into a boxed [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |params, cx| Box::pin(f(params, cx)))
}

/// Deserialize a params object into a handler's argument struct.
/// Shape mismatches become -32602.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(RpcError::invalid_params)
}

#[derive(Default)]
pub struct DispatchRegistry {
    handlers: HashMap<String, Handler>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`. Last registration wins.
    pub fn register(&mut self, name: &str, handler: Handler) {
        if self.handlers.insert(name.to_string(), handler).is_some() {
            debug!(method = name, "handler re-registered, last registration wins");
        } else {
            debug!(method = name, "registered RPC method");
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }

    /// Invoke the handler for `request`, producing a Response that reuses the
    /// request's id. An unknown method answers -32601; handler errors arrive
    /// already shaped as [`RpcError`]s.
    pub async fn dispatch(&self, request: &RpcRequest, cx: CallContext) -> RpcResponse {
        let id = Some(request.id.clone());
        let Some(handler) = self.lookup(&request.method) else {
            warn!(method = %request.method, "unknown method");
            return RpcResponse::err(
                id,
                RpcError::new(
                    METHOD_NOT_FOUND,
                    format!("Method '{}' not found", request.method),
                ),
            );
        };

        trace!(method = %request.method, "rpc dispatch");
        let params = request
            .params
            .clone()
            .map(Value::Object)
            .unwrap_or_else(|| Value::Object(Map::new()));

        match handler(params, cx).await {
            Ok(result) => RpcResponse::ok(id, result),
            Err(error) => {
                warn!(method = %request.method, code = error.code, "handler error");
                RpcResponse::err(id, error)
            }
        }
    }

    /// Dispatch a batch sequentially, in arrival order.
    pub async fn dispatch_all(
        &self,
        requests: &[&RpcRequest],
        cx: &CallContext,
    ) -> Vec<RpcResponse> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.dispatch(request, cx.clone()).await);
        }
        responses
    }
}
