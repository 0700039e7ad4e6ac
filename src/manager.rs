// src/manager.rs - Session manager: the entry point external callers use
use crate::board::{BoardState, DigitalLevel, InputMode, PinMode};
use crate::config::Config;
use crate::events::PeripheralListener;
use crate::session::{ConnectCallback, PeripheralSession, SessionHandle, SessionState};
use crate::transport::{TransportConnector, WebSocketConnector};
use std::sync::Arc;

/// Owns at most one peripheral session and exposes typed pin operations.
///
/// Nothing here returns an error: failures reach the caller only as
/// listener events. Mutators are no-ops until a board is connected.
pub struct SessionManager {
    config: Config,
    connector: Arc<dyn TransportConnector>,
    listener: Arc<dyn PeripheralListener>,
    session: Option<SessionHandle>,
    detached: BoardState,
}

impl SessionManager {
    pub fn new(
        config: Config,
        connector: Arc<dyn TransportConnector>,
        listener: Arc<dyn PeripheralListener>,
    ) -> Self {
        Self {
            config,
            connector,
            listener,
            session: None,
            detached: BoardState::detached(),
        }
    }

    /// Manager talking to the relay named in `config.relay`.
    pub fn with_websocket(config: Config, listener: Arc<dyn PeripheralListener>) -> Self {
        let connector = Arc::new(WebSocketConnector::from_config(&config.relay));
        Self::new(config, connector, listener)
    }

    pub fn extension_id(&self) -> &str {
        &self.config.session.extension_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Drop any current session and start a fresh one; discovery runs as
    /// soon as its transport opens.
    pub fn scan(&mut self) {
        self.disconnect();
        let on_connect: ConnectCallback = Box::new(|board| {
            tracing::info!(
                "Connected to {}",
                board.name.as_deref().unwrap_or(board.port_path())
            );
        });
        self.session = Some(PeripheralSession::spawn(
            self.connector.as_ref(),
            self.config.session.clone(),
            self.listener.clone(),
            Some(on_connect),
        ));
    }

    /// Connect to peripheral `id`, or the first one discovered.
    pub fn connect(&self, id: Option<&str>) {
        if let Some(session) = &self.session {
            session.connect(id.map(str::to_string));
        }
    }

    pub fn disconnect(&self) {
        if let Some(session) = &self.session {
            session.disconnect();
        }
    }

    /// Release the board and wait until the session task has finished.
    pub async fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown().await;
        }
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.session.as_ref().map(SessionHandle::state)
    }

    pub fn board(&self) -> &BoardState {
        match &self.session {
            Some(session) => session.board(),
            None => &self.detached,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.board().is_connected()
    }

    pub fn all_pin_indices(&self) -> Vec<usize> {
        self.board().all_pin_indices()
    }

    /// Pins that support any mode, excluding analog-capable ones.
    pub fn digital_pin_indices(&self) -> Vec<usize> {
        self.board().digital_pin_indices()
    }

    pub fn pwm_pin_indices(&self) -> Vec<usize> {
        self.board().pwm_pin_indices()
    }

    pub fn servo_pin_indices(&self) -> Vec<usize> {
        self.board().servo_pin_indices()
    }

    pub fn pin_value(&self, pin: usize) -> f64 {
        self.board().pin_value(pin)
    }

    pub fn digital_pin_level(&self, pin: usize) -> DigitalLevel {
        DigitalLevel::from_pin_value(self.pin_value(pin))
    }

    /// Value of analog channel `channel` (A0 is channel 0).
    pub fn analog_pin_value(&self, channel: usize) -> f64 {
        self.board().analog_pin_value(channel)
    }

    pub fn set_pin_mode(&self, pin: usize, mode: PinMode) {
        if let Some(session) = &self.session {
            session.set_pin_mode(pin, mode);
        }
    }

    pub fn set_pin_mode_input(&self, pin: usize, mode: InputMode) {
        self.set_pin_mode(pin, mode.into());
    }

    pub fn set_pin_value_digital(&self, pin: usize, level: DigitalLevel) {
        if let Some(session) = &self.session {
            session.digital_write(pin, level);
        }
    }

    /// Switches the pin to PWM first when needed. The mode change and the
    /// write are separate relay calls, so a concurrent mode change elsewhere
    /// can interleave with them.
    pub fn set_pin_value_pwm(&self, pin: usize, value: f64) {
        let Some(session) = &self.session else { return };
        if session.board().pin_mode(pin) != Some(PinMode::Pwm) {
            session.set_pin_mode(pin, PinMode::Pwm);
        }
        session.pwm_write(pin, value);
    }

    /// Servo counterpart of [`set_pin_value_pwm`](Self::set_pin_value_pwm).
    pub fn set_pin_value_servo(&self, pin: usize, value: f64) {
        let Some(session) = &self.session else { return };
        if session.board().pin_mode(pin) != Some(PinMode::Servo) {
            session.set_pin_mode(pin, PinMode::Servo);
        }
        session.servo_write(pin, value);
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("extension_id", &self.extension_id())
            .field("session", &self.session)
            .finish()
    }
}
