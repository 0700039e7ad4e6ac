//! JSON-RPC 2.0 framing for relay messages.
use super::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const VERSION: &str = "2.0";
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
struct OutgoingRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    params: &'a Value,
}

#[derive(Debug, Serialize)]
struct OutgoingError<'a> {
    jsonrpc: &'static str,
    id: &'a Value,
    error: &'a RpcError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcError> for TransportError {
    fn from(e: RpcError) -> Self {
        TransportError::Rpc { code: e.code, message: e.message }
    }
}

#[derive(Debug, Deserialize)]
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
    error: Option<RpcError>,
}

/// A message received from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response { id: u64, outcome: Result<Value, RpcError> },
    Request { id: Value, method: String, params: Value },
    Notification { method: String, params: Value },
}

pub fn encode_request(id: u64, method: &str, params: &Value) -> Result<String, TransportError> {
    encode(&OutgoingRequest { jsonrpc: VERSION, id: Some(id), method, params })
}

pub fn encode_notification(method: &str, params: &Value) -> Result<String, TransportError> {
    encode(&OutgoingRequest { jsonrpc: VERSION, id: None, method, params })
}

pub fn encode_error(id: &Value, error: &RpcError) -> Result<String, TransportError> {
    encode(&OutgoingError { jsonrpc: VERSION, id, error })
}

fn encode<T: Serialize>(message: &T) -> Result<String, TransportError> {
    serde_json::to_string(message).map_err(|e| TransportError::Decode(e.to_string()))
}

pub fn parse(text: &str) -> Result<Incoming, TransportError> {
    let raw: RawMessage =
        serde_json::from_str(text).map_err(|e| TransportError::Decode(e.to_string()))?;
    let params = raw.params.unwrap_or(Value::Null);
    match (raw.id, raw.method) {
        (Some(id), Some(method)) if !id.is_null() => Ok(Incoming::Request { id, method, params }),
        (_, Some(method)) => Ok(Incoming::Notification { method, params }),
        (Some(id), None) => {
            let id = id
                .as_u64()
                .ok_or_else(|| TransportError::Decode(format!("unexpected response id {}", id)))?;
            let outcome = match raw.error {
                Some(error) => Err(error),
                None => Ok(raw.result.unwrap_or(Value::Null)),
            };
            Ok(Incoming::Response { id, outcome })
        }
        (None, None) => Err(TransportError::Decode("message has neither id nor method".into())),
    }
}
