// src/transport/mod.rs - Duplex RPC channel to the relay process
pub mod jsonrpc;
pub mod websocket;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use websocket::{WebSocketConnector, WebSocketTransport};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("transport is not open")]
    NotOpen,
    #[error("transport closed")]
    Closed,
    #[error("call '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("failed to connect to relay: {0}")]
    Connect(String),
    #[error("failed to send message: {0}")]
    Send(String),
    #[error("relay rejected call ({code}): {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed message: {0}")]
    Decode(String),
}

/// Channel-level happenings, delivered independently of any in-flight call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Error(String),
    Closed,
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Correlated request/response channel to a relay endpoint.
///
/// Calls issued while the channel is not open are dropped, not queued, and
/// fail with [`TransportError::NotOpen`].
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError>;
    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError>;
    fn is_open(&self) -> bool;
    async fn close(&self);
}

/// Opens transports for new sessions. `open` returns immediately; readiness
/// is signalled later with [`TransportEvent::Open`].
pub trait TransportConnector: Send + Sync {
    fn open(&self, events: TransportEvents) -> Arc<dyn RpcTransport>;
}
