//! Connection setup: the `connect` / `register` handshake verbs.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::dispatch::{parse_params, CallContext, HandlerResult};
use crate::registry::Connection;
use crate::rpc::RpcError;

#[derive(Deserialize)]
struct ConnectParams {
    id: String,
    authentication_token: String,
}

/// Verify the caller's session token and bind its writer in the registry.
/// The session loop decides who observes the resulting Response.
pub async fn connect(params: Value, cx: CallContext) -> HandlerResult {
    let p: ConnectParams = parse_params(params)?;

    let claims = cx
        .app
        .verifier
        .verify(&p.authentication_token)
        .map_err(|err| {
            warn!(app_id = %p.id, err = %err, "handshake token rejected");
            RpcError::internal("Authentication token is invalid or expired")
        })?;

    cx.app
        .registry
        .add(Connection {
            app_id: p.id.clone(),
            writer: cx.writer.clone(),
            claims,
        })
        .map_err(|err| RpcError::internal(err.to_string()))?;

    info!(app_id = %p.id, peer = cx.writer.peer(), "application connected");
    Ok(json!({
        "connection_id": p.id,
        "message": "Application connected successfully",
    }))
}
