//! Length-prefixed frame codec.
//!
//! Wire format: `[4-byte big-endian unsigned length N][N bytes UTF-8 JSON]`.
//! A stream that ends cleanly before the length header is a normal end of
//! session; a stream that ends anywhere after it is a protocol violation.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{parse_payload, PayloadError, RpcPayload};

/// Frames above this size abort the session: the length header cannot be
/// trusted and the framing cannot resynchronize.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024; // 16 MiB

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The stream ended mid-frame (after at least one header byte).
    #[error("connection closed mid-frame")]
    Truncated,
    #[error("frame length {0} exceeds the {MAX_FRAME_LEN}-byte ceiling")]
    FrameTooLarge(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Malformed JSON; answered with -32700 and the session continues.
    #[error("parse error: {0}")]
    Parse(String),
    /// A scalar that violates the payload model; answered with -32600.
    #[error("invalid request: {0}")]
    InvalidPayload(String),
    /// An array that violates the batch rules. Carries the raw JSON so the
    /// session loop can build the synthetic "Invalid Request(s)" Response.
    #[error("invalid batch: {detail}")]
    InvalidBatch { detail: String, raw: Value },
}

impl DecodeError {
    /// Whether the session can keep reading frames after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::InvalidPayload(_) | Self::InvalidBatch { .. }
        )
    }
}

/// Serialize a payload and prepend the length header. Batches become arrays,
/// scalars become objects; absent optional fields are omitted entirely.
pub fn encode_payload(payload: &RpcPayload) -> Vec<u8> {
    let body = serde_json::to_vec(payload).unwrap_or_default();
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Read one frame from the stream.
///
/// Returns `Ok(None)` on a clean end of stream (no header bytes read).
pub async fn decode_payload<R>(reader: &mut R) -> Result<Option<RpcPayload>, DecodeError>
where
    R: AsyncRead + Unpin,
{
    // Header bytes are read one chunk at a time so a clean EOF before the
    // first byte can be told apart from a truncated header.
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(DecodeError::Truncated);
        }
        filled += n;
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_LEN {
        return Err(DecodeError::FrameTooLarge(length));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DecodeError::Truncated
        } else {
            DecodeError::Io(e)
        }
    })?;

    let value: Value =
        serde_json::from_slice(&body).map_err(|e| DecodeError::Parse(e.to_string()))?;

    match parse_payload(&value) {
        Ok(payload) => Ok(Some(payload)),
        Err(PayloadError::InvalidPayload(detail)) => Err(DecodeError::InvalidPayload(detail)),
        Err(PayloadError::InvalidBatch(detail)) => {
            Err(DecodeError::InvalidBatch { detail, raw: value })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcData, RpcError, RpcNotification, RpcRequest, RpcResponse};
    use serde_json::json;

    async fn decode_bytes(bytes: &[u8]) -> Result<Option<RpcPayload>, DecodeError> {
        let mut reader = std::io::Cursor::new(bytes.to_vec());
        decode_payload(&mut reader).await
    }

    fn frame(json: &str) -> Vec<u8> {
        let mut out = (json.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(json.as_bytes());
        out
    }

    #[tokio::test]
    async fn round_trips_all_shapes() {
        let request = RpcRequest::new(
            "check_has_permission",
            Some(json!({ "owner_id": "a1" }).as_object().cloned().unwrap()),
        );
        let payloads = [
            RpcPayload::Data(RpcData::Request(request.clone())),
            RpcPayload::Data(RpcData::Notification(RpcNotification {
                jsonrpc: "2.0".into(),
                method: "poke".into(),
                params: None,
            })),
            RpcPayload::response(RpcResponse::ok(Some(request.id.clone()), json!({ "x": 1 }))),
            RpcPayload::response(RpcResponse::err(None, RpcError::new(-32601, "nope"))),
            RpcPayload::Batch(vec![
                RpcData::Request(request.clone()),
                RpcData::Request(RpcRequest::new("other", None)),
            ]),
        ];

        for payload in payloads {
            let encoded = encode_payload(&payload);
            let decoded = decode_bytes(&encoded).await.unwrap().unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[tokio::test]
    async fn absent_optional_fields_are_stripped() {
        let payload = RpcPayload::response(RpcResponse::ok(None, json!(null)));
        let encoded = encode_payload(&payload);
        let text = std::str::from_utf8(&encoded[4..]).unwrap();
        assert!(text.contains("\"result\""));
        assert!(!text.contains("\"error\""));

        let payload = RpcPayload::Data(RpcData::Request(RpcRequest::new("m", None)));
        let text = encode_payload(&payload);
        assert!(!std::str::from_utf8(&text[4..]).unwrap().contains("params"));
    }

    #[tokio::test]
    async fn clean_eof_ends_the_session() {
        assert!(decode_bytes(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_header_is_fatal() {
        let result = decode_bytes(&[0, 0]).await;
        assert!(matches!(result, Err(DecodeError::Truncated)));
    }

    #[tokio::test]
    async fn truncated_body_is_fatal() {
        let mut bytes = frame("{\"jsonrpc\":\"2.0\",\"method\":\"x\"}");
        bytes.truncate(bytes.len() - 5);
        let result = decode_bytes(&bytes).await;
        assert!(matches!(result, Err(DecodeError::Truncated)));
    }

    #[tokio::test]
    async fn malformed_json_is_recoverable() {
        let result = decode_bytes(&frame("{not json")).await;
        match result {
            Err(e @ DecodeError::Parse(_)) => assert!(e.is_recoverable()),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mixed_batch_surfaces_raw_payload() {
        let raw = "[{\"jsonrpc\":\"2.0\",\"method\":\"x\"},{\"jsonrpc\":\"2.0\",\"id\":null,\"result\":42}]";
        let result = decode_bytes(&frame(raw)).await;
        match result {
            Err(DecodeError::InvalidBatch { raw, .. }) => {
                assert!(raw.is_array());
            }
            other => panic!("expected invalid batch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_fatal() {
        let mut bytes = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(b"ignored");
        let result = decode_bytes(&bytes).await;
        assert!(matches!(result, Err(DecodeError::FrameTooLarge(_))));
    }
}
