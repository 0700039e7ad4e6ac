//! Host-side client for Firmata boards reached through an always-on relay.
//!
//! The relay speaks JSON-RPC 2.0 over a WebSocket. A [`SessionManager`]
//! scans for peripherals, connects to one board, polls its pin table and
//! forwards pin commands; results and failures arrive as
//! [`PeripheralEvent`]s on a listener, never as returned errors.

pub mod board;
pub mod config;
pub mod events;
pub mod manager;
pub mod poller;
pub mod session;
pub mod transport;

pub use board::{Board, BoardState, DigitalLevel, InputMode, Pin, PinMode};
pub use config::{Config, ConfigError, load_config};
pub use events::{PeripheralEvent, PeripheralList, PeripheralListener};
pub use manager::SessionManager;
pub use session::{PeripheralSession, SessionHandle, SessionState};
pub use transport::{RpcTransport, TransportConnector, TransportError, TransportEvent};
