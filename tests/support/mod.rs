// Shared test doubles: an in-memory relay transport and its connector
#![allow(dead_code)]

use async_trait::async_trait;
use firmata_link::events::PeripheralEvent;
use firmata_link::transport::{
    RpcTransport, TransportConnector, TransportError, TransportEvent, TransportEvents,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How the mock answers one method.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(Value),
    Err(TransportError),
    /// Never answers.
    Never,
    Delayed(Duration, Value),
}

pub struct MockTransport {
    calls: Mutex<Vec<(String, Value)>>,
    replies: Mutex<HashMap<String, Reply>>,
    open: AtomicBool,
    events: Mutex<Option<TransportEvents>>,
}

pub fn uno_board() -> Value {
    json!({
        "name": "Arduino Uno",
        "transport": {"path": "COM3", "isOpen": true},
        "pins": [
            {"supportedModes": [], "mode": 16, "value": 0},
            {"supportedModes": [0, 1, 11], "mode": 1, "value": 0},
            {"supportedModes": [0, 1, 3, 4, 11], "mode": 1, "value": 0},
            {"supportedModes": [0, 1, 3, 4, 11], "mode": 3, "value": 0},
            {"supportedModes": [0, 1, 2, 11], "mode": 2, "value": 345}
        ],
        "analogPins": [4],
        "RESOLUTION": {"ADC": 1023, "PWM": 255, "DAC": null}
    })
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let mut replies = HashMap::new();
        replies.insert(
            "scan".to_string(),
            Reply::Ok(json!({"COM3": {"name": "Arduino Uno"}, "COM7": {"name": "Arduino Mega"}})),
        );
        replies.insert("connect".to_string(), Reply::Ok(uno_board()));
        replies.insert("getBoardState".to_string(), Reply::Ok(json!({})));
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            replies: Mutex::new(replies),
            open: AtomicBool::new(false),
            events: Mutex::new(None),
        })
    }

    pub fn set_reply(&self, method: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(method.to_string(), reply);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params)
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls_to(method).len()
    }

    pub fn is_open_now(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_event(&self, event: TransportEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }

    pub fn emit_open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.send_event(TransportEvent::Open);
    }

    /// Simulate the relay dropping the socket.
    pub fn emit_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.send_event(TransportEvent::Closed);
    }

    pub fn emit_error(&self, message: &str) {
        self.send_event(TransportEvent::Error(message.to_string()));
    }

    fn attach(&self, events: TransportEvents) {
        *self.events.lock().unwrap() = Some(events);
        self.emit_open();
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        self.calls.lock().unwrap().push((method.to_string(), params));
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(method)
            .cloned()
            .unwrap_or(Reply::Ok(Value::Null));
        match reply {
            Reply::Ok(value) => Ok(value),
            Reply::Err(e) => Err(e),
            Reply::Never => std::future::pending().await,
            Reply::Delayed(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        self.call(method, params).await.map(|_| ())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.send_event(TransportEvent::Closed);
        }
    }
}

/// Opens a fresh mock per session and remembers every one it handed out.
pub struct MockConnector {
    opened: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { opened: Mutex::new(Vec::new()) })
    }

    /// Transport of the most recently spawned session.
    pub fn latest(&self) -> Arc<MockTransport> {
        self.opened
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no transport opened yet")
    }

    pub fn opened(&self) -> usize {
        self.opened.lock().unwrap().len()
    }
}

impl TransportConnector for MockConnector {
    fn open(&self, events: TransportEvents) -> Arc<dyn RpcTransport> {
        let transport = MockTransport::new();
        transport.attach(events);
        self.opened.lock().unwrap().push(transport.clone());
        transport
    }
}

/// Next event, or `None` if nothing arrives within `limit`.
pub async fn next_event(
    events: &mut mpsc::UnboundedReceiver<PeripheralEvent>,
    limit: Duration,
) -> Option<PeripheralEvent> {
    tokio::time::timeout(limit, events.recv()).await.ok().flatten()
}

/// Skip events until one matches `want`; panics after `limit`.
pub async fn expect_event<F>(
    events: &mut mpsc::UnboundedReceiver<PeripheralEvent>,
    limit: Duration,
    want: F,
) -> PeripheralEvent
where
    F: Fn(&PeripheralEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match next_event(events, remaining).await {
            Some(event) if want(&event) => return event,
            Some(_) => continue,
            None => panic!("expected event did not arrive within {:?}", limit),
        }
    }
}
