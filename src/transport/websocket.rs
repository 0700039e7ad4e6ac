// src/transport/websocket.rs - JSON-RPC over a WebSocket to the relay
use super::jsonrpc::{self, Incoming, RpcError};
use super::{RpcTransport, TransportConnector, TransportError, TransportEvent, TransportEvents};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>>>;

/// Relay connection: one background task owns the socket, calls are
/// correlated by id through the pending table.
pub struct WebSocketTransport {
    url: String,
    /// Frames waiting for the socket task
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingCalls,
    next_id: AtomicU64,
    open: Arc<AtomicBool>,
    call_timeout: Duration,
}

impl WebSocketTransport {
    /// Start connecting to `url`. Returns at once; `events` receives
    /// `Open` when the socket is usable and `Closed` when it is gone.
    pub fn open(url: &str, call_timeout: Duration, events: TransportEvents) -> Self {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let open = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_socket(
            url.to_string(),
            outgoing_rx,
            pending.clone(),
            open.clone(),
            events,
        ));

        Self {
            url: url.to_string(),
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            open,
            call_timeout,
        }
    }

    pub async fn pending_calls(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[async_trait]
impl RpcTransport for WebSocketTransport {
    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        if !self.is_open() {
            tracing::debug!("Dropping call '{}', relay socket not open", method);
            return Err(TransportError::NotOpen);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let text = jsonrpc::encode_request(id, method, &params)?;

        let (response_tx, response_rx) = oneshot::channel();
        {
            let mut pending_guard = self.pending.lock().await;
            pending_guard.insert(id, response_tx);
        }

        tracing::debug!("Relay <- #{} {} {}", id, method, params);
        if self.outgoing.send(Message::Text(text)).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(TransportError::Closed);
        }

        match timeout(self.call_timeout, response_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                // Timeout - clean up pending call
                self.pending.lock().await.remove(&id);
                tracing::warn!("Call #{} '{}' timed out", id, method);
                Err(TransportError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        if !self.is_open() {
            tracing::debug!("Dropping notification '{}', relay socket not open", method);
            return Err(TransportError::NotOpen);
        }
        let text = jsonrpc::encode_notification(method, &params)?;
        self.outgoing
            .send(Message::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            tracing::info!("Closing relay socket {}", self.url);
            let _ = self.outgoing.send(Message::Close(None));
        }
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.url)
            .field("open", &self.is_open())
            .finish()
    }
}

async fn run_socket(
    url: String,
    mut outgoing_rx: mpsc::UnboundedReceiver<Message>,
    pending: PendingCalls,
    open: Arc<AtomicBool>,
    events: TransportEvents,
) {
    tracing::info!("Connecting to relay at {}", url);
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            let error = TransportError::Connect(e.to_string());
            tracing::error!("{}", error);
            let _ = events.send(TransportEvent::Error(error.to_string()));
            let _ = events.send(TransportEvent::Closed);
            return;
        }
    };

    open.store(true, Ordering::SeqCst);
    tracing::info!("Relay socket open: {}", url);
    let _ = events.send(TransportEvent::Open);

    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            frame = outgoing_rx.recv() => {
                let Some(frame) = frame else {
                    // Transport handle dropped
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let closing = matches!(frame, Message::Close(_));
                if let Err(e) = sink.send(frame).await {
                    tracing::error!("Relay socket write error: {}", e);
                    let _ = events.send(TransportEvent::Error(TransportError::Send(e.to_string()).to_string()));
                    break;
                }
                if closing {
                    break;
                }
            }
            message = source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_incoming(&text, &pending).await {
                            if let Err(e) = sink.send(Message::Text(reply)).await {
                                tracing::error!("Relay socket write error: {}", e);
                                let _ = events.send(TransportEvent::Error(e.to_string()));
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("Relay closed the socket: {:?}", frame);
                        break;
                    }
                    Some(Ok(other)) => {
                        tracing::trace!("Ignoring relay frame: {:?}", other);
                    }
                    Some(Err(e)) => {
                        tracing::error!("Relay socket read error: {}", e);
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    None => {
                        tracing::info!("Relay socket stream ended");
                        break;
                    }
                }
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    let mut pending_guard = pending.lock().await;
    for (_, waiter) in pending_guard.drain() {
        let _ = waiter.send(Err(TransportError::Closed));
    }
    drop(pending_guard);
    let _ = events.send(TransportEvent::Closed);
}

/// Route one text frame. Returns a reply frame for relay-initiated requests.
async fn handle_incoming(text: &str, pending: &PendingCalls) -> Option<String> {
    let incoming = match jsonrpc::parse(text) {
        Ok(incoming) => incoming,
        Err(e) => {
            tracing::warn!("Ignoring relay message: {}", e);
            return None;
        }
    };

    match incoming {
        Incoming::Response { id, outcome } => {
            tracing::debug!("Relay -> #{} {:?}", id, outcome);
            let waiter = pending.lock().await.remove(&id);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(outcome.map_err(TransportError::from));
                }
                None => tracing::debug!("No pending call for response #{}", id),
            }
            None
        }
        Incoming::Request { id, method, .. } => {
            tracing::debug!("Relay requested unsupported method '{}'", method);
            let error = RpcError {
                code: jsonrpc::METHOD_NOT_FOUND,
                message: format!("method '{}' not found", method),
                data: None,
            };
            jsonrpc::encode_error(&id, &error).ok()
        }
        Incoming::Notification { method, params } => {
            tracing::debug!("Relay notification '{}': {}", method, params);
            None
        }
    }
}

/// Opens a fresh [`WebSocketTransport`] per session.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    call_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, call_timeout: Duration) -> Self {
        Self { url: url.into(), call_timeout }
    }

    pub fn from_config(relay: &crate::config::RelayConfig) -> Self {
        Self::new(relay.url.clone(), relay.call_timeout())
    }
}

impl TransportConnector for WebSocketConnector {
    fn open(&self, events: TransportEvents) -> Arc<dyn RpcTransport> {
        Arc::new(WebSocketTransport::open(&self.url, self.call_timeout, events))
    }
}
