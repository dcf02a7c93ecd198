//! Per-connection session state machine.
//!
//! ```text
//!   ACCEPT ─► HANDSHAKE ─► RUNNING ─► CLOSED
//!                 │
//!                 └─► CLOSED   (on handshake failure)
//! ```
//!
//! The handshake reads exactly one frame, which must be a `connect` or
//! `register` Request; anything else closes the stream without a reply.
//! RUNNING reads frames in arrival order and dispatches sequentially (no
//! pipelining), so per-recipient ordering from a single sender holds.

use std::slice;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::auth::SessionClaims;
use crate::authz;
use crate::dispatch::CallContext;
use crate::emit;
use crate::registry::ConnectionWriter;
use crate::rpc::codec::{decode_payload, DecodeError};
use crate::rpc::{
    RpcAction, RpcData, RpcError, RpcPayload, RpcRequest, RpcResponse, INVALID_REQUEST,
    PARSE_ERROR,
};
use crate::AppContext;

/// Drive one connection from handshake to teardown. On every exit path the
/// registry entry (if any) is removed and the writer is closed.
pub async fn run_session<R, W>(
    ctx: Arc<AppContext>,
    mut reader: R,
    writer_io: W,
    peer: String,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer = ConnectionWriter::new(peer.clone(), writer_io);
    debug!(peer = %peer, "session started");

    drive(&ctx, &mut reader, &writer, &mut shutdown).await;

    // CLOSED
    if let Some(connection) = ctx.registry.remove_by_writer(&writer) {
        info!(peer = %peer, app_id = %connection.app_id, "session closed");
    } else {
        debug!(peer = %peer, "session closed before registration");
    }
    if let Err(err) = writer.shutdown().await {
        debug!(peer = %peer, err = %err, "writer close failed");
    }
}

async fn drive<R>(
    ctx: &Arc<AppContext>,
    reader: &mut R,
    writer: &ConnectionWriter,
    shutdown: &mut watch::Receiver<bool>,
) where
    R: AsyncRead + Send + Unpin,
{
    // ─── HANDSHAKE ──────────────────────────────────────────────────────────

    let decoded = tokio::select! {
        biased;
        _ = shutdown.changed() => return,
        decoded = decode_payload(reader) => decoded,
    };

    let request = match decoded {
        Ok(Some(RpcPayload::Data(RpcData::Request(request))))
            if request.method == "connect" || request.method == "register" =>
        {
            request
        }
        Ok(Some(_)) => {
            warn!(peer = writer.peer(), "handshake frame is not a connect/register request");
            return;
        }
        Ok(None) => {
            debug!(peer = writer.peer(), "closed before handshake");
            return;
        }
        Err(err) => {
            warn!(peer = writer.peer(), err = %err, "handshake decode failed");
            return;
        }
    };

    let cx = CallContext {
        app: ctx.clone(),
        writer: writer.clone(),
        claims: None,
    };
    let response = ctx.dispatcher.dispatch(&request, cx).await;

    if response.error.is_some() {
        // Failed handshakes answer the handshake writer alone.
        emit::emit(&RpcPayload::response(response), slice::from_ref(writer)).await;
        return;
    }

    let Some(connection) = ctx.registry.find_by_writer(writer) else {
        error!(peer = writer.peer(), "connect handler succeeded without binding the writer");
        return;
    };

    let mut recipients =
        authz::authorized_writers(&ctx.storage, &ctx.registry, None, RpcAction::OutboundResponse)
            .await;
    emit::include(&mut recipients, writer);
    emit::emit(&RpcPayload::response(response), &recipients).await;

    // ─── RUNNING ────────────────────────────────────────────────────────────

    let app_id = connection.app_id;
    let claims = connection.claims;

    loop {
        let decoded = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            decoded = decode_payload(reader) => decoded,
        };

        match decoded {
            Ok(None) => {
                debug!(app_id = %app_id, "end of stream");
                return;
            }
            Ok(Some(payload)) => {
                handle_payload(ctx, writer, &app_id, &claims, payload).await;
            }
            Err(DecodeError::Parse(detail)) => {
                let response = RpcResponse::err(
                    None,
                    RpcError::new(PARSE_ERROR, format!("Parse error: {detail}")),
                );
                emit::emit(&RpcPayload::response(response), slice::from_ref(writer)).await;
            }
            Err(DecodeError::InvalidPayload(detail)) => {
                let response = RpcResponse::err(
                    None,
                    RpcError::new(INVALID_REQUEST, format!("Invalid Request: {detail}")),
                );
                emit::emit(&RpcPayload::response(response), slice::from_ref(writer)).await;
            }
            Err(DecodeError::InvalidBatch { raw, .. }) => {
                let response = RpcResponse::err(
                    None,
                    RpcError::internal(format!("Invalid Request(s): {raw}")),
                );
                let mut recipients = authz::authorized_writers(
                    &ctx.storage,
                    &ctx.registry,
                    Some(&app_id),
                    RpcAction::InboundResponse,
                )
                .await;
                emit::include(&mut recipients, writer);
                emit::emit(&RpcPayload::response(response), &recipients).await;
            }
            Err(err) => {
                warn!(app_id = %app_id, err = %err, "session read failed");
                return;
            }
        }
    }
}

/// Classify a decoded payload and fan it out per the permission model.
async fn handle_payload(
    ctx: &Arc<AppContext>,
    writer: &ConnectionWriter,
    app_id: &str,
    claims: &SessionClaims,
    payload: RpcPayload,
) {
    // One-element arrays flatten back to a scalar on the wire.
    let payload = match payload {
        RpcPayload::Batch(mut items) if items.len() == 1 => RpcPayload::Data(items.remove(0)),
        other => other,
    };
    let items = payload.items();

    if items.iter().all(|i| matches!(i, RpcData::Response(_))) {
        let recipients = authz::authorized_writers(
            &ctx.storage,
            &ctx.registry,
            Some(app_id),
            RpcAction::OutboundResponse,
        )
        .await;
        emit::emit(&payload, &recipients).await;
    } else if items.iter().all(|i| matches!(i, RpcData::Notification(_))) {
        let recipients = authz::authorized_writers(
            &ctx.storage,
            &ctx.registry,
            Some(app_id),
            RpcAction::OutboundNotification,
        )
        .await;
        emit::emit(&payload, &recipients).await;
    } else if items.iter().all(|i| matches!(i, RpcData::Request(_))) {
        let recipients = authz::authorized_writers(
            &ctx.storage,
            &ctx.registry,
            Some(app_id),
            RpcAction::OutboundRequest,
        )
        .await;
        emit::emit(&payload, &recipients).await;

        let requests: Vec<&RpcRequest> = items
            .into_iter()
            .filter_map(|item| match item {
                RpcData::Request(request) => Some(request),
                _ => None,
            })
            .collect();
        let cx = CallContext {
            app: ctx.clone(),
            writer: writer.clone(),
            claims: Some(claims.clone()),
        };
        let responses = ctx.dispatcher.dispatch_all(&requests, &cx).await;

        let reply = RpcPayload::from_responses(responses);
        let mut recipients = authz::authorized_writers(
            &ctx.storage,
            &ctx.registry,
            Some(app_id),
            RpcAction::InboundResponse,
        )
        .await;
        emit::include(&mut recipients, writer);
        emit::emit(&reply, &recipients).await;
    }
    // Mixed shapes never reach this point: scalars are a single shape and
    // heterogeneous batches are rejected at decode.
}
