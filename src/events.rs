// src/events.rs - Discovery results and the notifications a session emits
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Generic text carried by error events; relay-side detail stays in the log.
pub const LOST_CONNECTION_MESSAGE: &str = "lost connection to";

/// What the relay reports about one reachable peripheral.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeripheralDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        rename = "transportType",
        alias = "type",
        skip_serializing_if = "Option::is_none"
    )]
    pub transport_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Peripherals keyed by transport path. Ordered, so "the first peripheral"
/// is the lexicographically smallest path.
pub type PeripheralList = BTreeMap<String, PeripheralDescriptor>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralError {
    pub message: String,
    pub extension_id: String,
}

impl PeripheralError {
    pub fn lost_connection(extension_id: &str) -> Self {
        Self {
            message: LOST_CONNECTION_MESSAGE.to_string(),
            extension_id: extension_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralEvent {
    /// A scan finished; the list replaces any previous one.
    PeripheralListUpdated(PeripheralList),
    Connected,
    /// The board was released on request.
    Disconnected,
    /// The relay channel or board went away without being asked to.
    ConnectionLost(PeripheralError),
    RequestError(PeripheralError),
    ScanTimeout,
}

pub trait PeripheralListener: Send + Sync + 'static {
    fn on_event(&self, event: PeripheralEvent);
}

impl PeripheralListener for mpsc::UnboundedSender<PeripheralEvent> {
    fn on_event(&self, event: PeripheralEvent) {
        if self.send(event).is_err() {
            tracing::trace!("Peripheral event dropped, receiver gone");
        }
    }
}

/// Delivers each event to both listeners, first then second.
impl<A, B> PeripheralListener for (A, B)
where
    A: PeripheralListener,
    B: PeripheralListener,
{
    fn on_event(&self, event: PeripheralEvent) {
        self.0.on_event(event.clone());
        self.1.on_event(event);
    }
}

/// Listener that only writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogListener;

impl PeripheralListener for LogListener {
    fn on_event(&self, event: PeripheralEvent) {
        match event {
            PeripheralEvent::PeripheralListUpdated(list) => {
                tracing::info!("Peripherals available: {:?}", list.keys().collect::<Vec<_>>());
            }
            PeripheralEvent::Connected => tracing::info!("Peripheral connected"),
            PeripheralEvent::Disconnected => tracing::info!("Peripheral disconnected"),
            PeripheralEvent::ConnectionLost(e) => {
                tracing::warn!("[{}] {} peripheral", e.extension_id, e.message)
            }
            PeripheralEvent::RequestError(e) => {
                tracing::warn!("[{}] request failed: {}", e.extension_id, e.message)
            }
            PeripheralEvent::ScanTimeout => tracing::warn!("Peripheral scan timed out"),
        }
    }
}
