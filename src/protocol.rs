//! JSON-RPC wire envelopes and the single boundary decode of inbound text.
//!
//! The broker does not interpret payloads beyond classifying each inbound
//! message as a response or a server-initiated notification; `params` and
//! `result` stay opaque [`Value`]s.

use crate::error::BrokerError;
use crate::error::Result;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Diagnostics are pushed by the server under this method.
pub const PUBLISH_DIAGNOSTICS_METHOD: &str = "textDocument/publishDiagnostics";

#[derive(Serialize)]
pub(crate) struct OutgoingRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

#[derive(Serialize)]
pub(crate) struct OutgoingNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// Error payload of a JSON-RPC response.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One inbound message, classified exactly once at the transport boundary.
#[derive(Debug, PartialEq)]
pub enum IncomingMessage {
    Response {
        id: i64,
        result: Option<Value>,
        error: Option<ResponseError>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ResponseError>,
}

/// Classify raw protocol text. A non-null `id` marks a response, a `method`
/// without one marks a notification; anything else is malformed.
pub fn decode_message(raw: &str) -> Result<IncomingMessage> {
    let message: RawMessage = serde_json::from_str(raw)
        .map_err(|err| BrokerError::MalformedMessage(err.to_string()))?;

    if let Some(id) = message.id.filter(|id| !id.is_null()) {
        let id = id
            .as_i64()
            .ok_or_else(|| BrokerError::MalformedMessage(format!("non-integer id: {id}")))?;
        return Ok(IncomingMessage::Response {
            id,
            result: message.result,
            error: message.error,
        });
    }

    if let Some(method) = message.method {
        return Ok(IncomingMessage::Notification {
            method,
            params: message.params.unwrap_or(Value::Null),
        });
    }

    Err(BrokerError::MalformedMessage(
        "neither a response nor a notification".to_string(),
    ))
}
