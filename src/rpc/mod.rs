//! JSON-RPC 2.0 payload taxonomy.
//!
//! Payloads arrive as a single object or a batch array. Objects classify by
//! field presence, checked in this order:
//!
//!   1. `method` + `id`        → Request
//!   2. `method` (no `id`)     → Notification
//!   3. `result` or `error`    → Response
//!
//! A batch is a non-empty array that is homogeneous: all Requests or all
//! Responses. Notifications never batch.

pub mod codec;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const JSONRPC_VERSION: &str = "2.0";

// ─── Error codes ──────────────────────────────────────────────────────────────
//
// JSON-RPC 2.0 reserved codes plus the hub's own band inside the server-error
// range [-32099, -32000]. Handlers must not produce codes outside this set.

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
/// Application creation failed (bad URL, encryption failure, storage error).
pub const APPLICATION_CREATE_FAILED: i32 = -32000;
/// No application with the requested id.
pub const APPLICATION_NOT_FOUND: i32 = -32001;
/// Application update failed.
pub const APPLICATION_UPDATE_FAILED: i32 = -32002;
/// Application deletion failed.
pub const APPLICATION_DELETE_FAILED: i32 = -32003;
/// The action string is not a member of the action enumeration.
pub const INVALID_ACTION: i32 = -32004;
/// Permission grant rejected (self-grant, reverse edge, unknown endpoint, duplicate).
pub const PERMISSION_GRANT_FAILED: i32 = -32005;
/// No permission row matched the revocation.
pub const PERMISSION_REVOKE_FAILED: i32 = -32006;

/// Whether `code` lies in the JSON-RPC 2.0 reserved set: the five protocol
/// codes or the server-error band.
pub fn valid_error_code(code: i32) -> bool {
    code == PARSE_ERROR || (-32603..=-32600).contains(&code) || (-32099..=-32000).contains(&code)
}

// ─── Actions ──────────────────────────────────────────────────────────────────

/// Fan-out actions, from the hub's perspective. `Outbound*` gates what the hub
/// may forward *to* a recipient; `Inbound*` gates what the hub may emit *on
/// behalf of* a sender. The two `*Dispatch` values are reserved and wired to
/// no emission site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcAction {
    InboundDispatch,
    InboundRequest,
    InboundResponse,
    InboundNotification,
    OutboundDispatch,
    OutboundRequest,
    OutboundResponse,
    OutboundNotification,
}

impl RpcAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InboundDispatch => "inbound_dispatch",
            Self::InboundRequest => "inbound_request",
            Self::InboundResponse => "inbound_response",
            Self::InboundNotification => "inbound_notification",
            Self::OutboundDispatch => "outbound_dispatch",
            Self::OutboundRequest => "outbound_request",
            Self::OutboundResponse => "outbound_response",
            Self::OutboundNotification => "outbound_notification",
        }
    }

    /// Parse the lowercase wire/storage form. Returns `None` for anything
    /// outside the closed enumeration.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound_dispatch" => Some(Self::InboundDispatch),
            "inbound_request" => Some(Self::InboundRequest),
            "inbound_response" => Some(Self::InboundResponse),
            "inbound_notification" => Some(Self::InboundNotification),
            "outbound_dispatch" => Some(Self::OutboundDispatch),
            "outbound_request" => Some(Self::OutboundRequest),
            "outbound_response" => Some(Self::OutboundResponse),
            "outbound_notification" => Some(Self::OutboundNotification),
            _ => None,
        }
    }
}

impl std::fmt::Display for RpcAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Payload shapes ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Map<String, Value>>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {detail}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

/// A Response carries `result` XOR `error`; `id` is null only for protocol
/// errors the hub could not attribute to a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Option<String>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<String>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// One classified JSON-RPC object.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcData {
    Request(RpcRequest),
    Notification(RpcNotification),
    Response(RpcResponse),
}

impl Serialize for RpcData {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Request(r) => r.serialize(serializer),
            Self::Notification(n) => n.serialize(serializer),
            Self::Response(r) => r.serialize(serializer),
        }
    }
}

/// A wire payload: a single object or a homogeneous batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcPayload {
    Data(RpcData),
    Batch(Vec<RpcData>),
}

impl Serialize for RpcPayload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Data(d) => d.serialize(serializer),
            Self::Batch(items) => items.serialize(serializer),
        }
    }
}

impl RpcPayload {
    pub fn response(response: RpcResponse) -> Self {
        Self::Data(RpcData::Response(response))
    }

    /// Wrap dispatch results for the wire: a single Response stays scalar, two
    /// or more become a batch.
    pub fn from_responses(mut responses: Vec<RpcResponse>) -> Self {
        if responses.len() == 1 {
            Self::Data(RpcData::Response(responses.remove(0)))
        } else {
            Self::Batch(responses.into_iter().map(RpcData::Response).collect())
        }
    }

    /// Batch-normalized view: a scalar payload reads as a one-element slice.
    pub fn items(&self) -> Vec<&RpcData> {
        match self {
            Self::Data(d) => vec![d],
            Self::Batch(items) => items.iter().collect(),
        }
    }
}

// ─── Classification & validation ──────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// A scalar object that violates the payload model (answered with -32600).
    #[error("{0}")]
    InvalidPayload(String),
    /// An array that violates the batch rules; the session loop answers these
    /// with a synthetic -32603 Response carrying the raw payload.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),
}

fn invalid(detail: impl Into<String>) -> PayloadError {
    PayloadError::InvalidPayload(detail.into())
}

fn check_version(obj: &Map<String, Value>) -> Result<String, PayloadError> {
    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(v) if v == JSONRPC_VERSION => Ok(v.to_string()),
        _ => Err(invalid("jsonrpc version is not supported")),
    }
}

fn check_uuid(s: &str) -> Result<(), PayloadError> {
    Uuid::parse_str(s).map(|_| ()).map_err(|_| invalid(format!("invalid UUID id: {s:?}")))
}

fn check_method(obj: &Map<String, Value>) -> Result<String, PayloadError> {
    obj.get("method")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid("method must be a string"))
}

/// Params, when present, must be a JSON object. Positional arrays are not
/// accepted.
fn check_params(obj: &Map<String, Value>) -> Result<Option<Map<String, Value>>, PayloadError> {
    match obj.get("params") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(_) => Err(invalid("params must be an object")),
    }
}

/// Classify a JSON object into one of the three payload shapes, enforcing the
/// construction rules of each.
pub fn parse_rpc_object(obj: &Map<String, Value>) -> Result<RpcData, PayloadError> {
    if obj.contains_key("method") && obj.contains_key("id") {
        let jsonrpc = check_version(obj)?;
        let id = match obj.get("id") {
            Some(Value::String(s)) => {
                check_uuid(s)?;
                s.clone()
            }
            _ => return Err(invalid("request id must be a non-null UUID string")),
        };
        Ok(RpcData::Request(RpcRequest {
            jsonrpc,
            id,
            method: check_method(obj)?,
            params: check_params(obj)?,
        }))
    } else if obj.contains_key("method") {
        Ok(RpcData::Notification(RpcNotification {
            jsonrpc: check_version(obj)?,
            method: check_method(obj)?,
            params: check_params(obj)?,
        }))
    } else if obj.contains_key("result") || obj.contains_key("error") {
        parse_response(obj).map(RpcData::Response)
    } else {
        Err(invalid("unknown RPC object shape"))
    }
}

fn parse_response(obj: &Map<String, Value>) -> Result<RpcResponse, PayloadError> {
    let jsonrpc = check_version(obj)?;

    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => {
            check_uuid(s)?;
            Some(s.clone())
        }
        Some(_) => return Err(invalid("response id must be a UUID string or null")),
    };

    let result = obj.get("result").cloned();
    let error = match obj.get("error") {
        None => None,
        Some(raw) => {
            let err: RpcError = serde_json::from_value(raw.clone())
                .map_err(|e| invalid(format!("malformed error object: {e}")))?;
            if !valid_error_code(err.code) {
                return Err(invalid(format!("invalid JSON-RPC 2.0 error code: {}", err.code)));
            }
            Some(err)
        }
    };

    if result.is_some() == error.is_some() {
        return Err(invalid("response must carry exactly one of result or error"));
    }

    Ok(RpcResponse {
        jsonrpc,
        id,
        result,
        error,
    })
}

/// Parse a decoded JSON document into a payload, applying the batch rules for
/// arrays.
pub fn parse_payload(value: &Value) -> Result<RpcPayload, PayloadError> {
    match value {
        Value::Object(obj) => parse_rpc_object(obj).map(RpcPayload::Data),
        Value::Array(elements) => {
            if elements.is_empty() {
                return Err(PayloadError::InvalidBatch("empty batch".into()));
            }

            let mut items = Vec::with_capacity(elements.len());
            for element in elements {
                let obj = element
                    .as_object()
                    .ok_or_else(|| PayloadError::InvalidBatch("batch element is not an object".into()))?;
                let item = parse_rpc_object(obj)
                    .map_err(|e| PayloadError::InvalidBatch(e.to_string()))?;
                items.push(item);
            }

            let all_requests = items.iter().all(|i| matches!(i, RpcData::Request(_)));
            let all_responses = items.iter().all(|i| matches!(i, RpcData::Response(_)));
            if !all_requests && !all_responses {
                return Err(PayloadError::InvalidBatch(
                    "batch must be all Requests or all Responses".into(),
                ));
            }

            Ok(RpcPayload::Batch(items))
        }
        _ => Err(invalid("payload must be an object or an array")),
    }
}
