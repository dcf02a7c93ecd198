//! Concurrent, best-effort fan-out.
//!
//! The payload is encoded once; each write-and-drain runs concurrently so a
//! slow consumer cannot stall a fast one. Writer failures are logged and
//! swallowed; teardown belongs to the session loop that owns the writer,
//! never to the emitter.

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::registry::ConnectionWriter;
use crate::rpc::{codec, RpcPayload};

/// Emit `payload` to every writer, continuing past individual failures.
pub async fn emit(payload: &RpcPayload, writers: &[ConnectionWriter]) {
    if writers.is_empty() {
        return;
    }

    let encoded = codec::encode_payload(payload);
    let sends = writers.iter().map(|writer| {
        let encoded = &encoded;
        async move {
            match writer.send(encoded).await {
                Ok(()) => debug!(peer = writer.peer(), "payload emitted"),
                Err(err) => {
                    warn!(peer = writer.peer(), err = %err, "emit failed, skipping writer");
                }
            }
        }
    });
    join_all(sends).await;
}

/// Add `writer` to a recipient list unless it is already present.
pub fn include(writers: &mut Vec<ConnectionWriter>, writer: &ConnectionWriter) {
    if !writers.contains(writer) {
        writers.push(writer.clone());
    }
}
