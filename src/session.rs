// src/session.rs - Peripheral session: discovery, connection and pin commands
//
// One session owns one relay transport and at most one board. All session
// state lives in a single task; callers talk to it through a SessionHandle
// and every relay call runs in its own task whose completion is posted back.
use crate::board::{Board, BoardSnapshot, BoardState, DigitalLevel, PinMode};
use crate::config::SessionConfig;
use crate::events::{PeripheralError, PeripheralEvent, PeripheralList, PeripheralListener};
use crate::poller::Poller;
use crate::transport::{RpcTransport, TransportConnector, TransportError, TransportEvent};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the transport to open.
    Idle,
    Discovering,
    /// A peripheral list is available.
    Ready,
    Connecting,
    Connected,
    Disconnected,
}

/// Invoked with the board once a connect call succeeds.
pub type ConnectCallback = Box<dyn Fn(&Board) + Send + Sync>;

#[derive(Debug)]
enum Command {
    Scan,
    Connect(Option<String>),
    Disconnect,
    RefreshBoardState,
    SetPinMode { pin: usize, mode: PinMode },
    DigitalWrite { pin: usize, level: DigitalLevel },
    PwmWrite { pin: usize, value: f64 },
    ServoWrite { pin: usize, value: f64 },
    Shutdown,
}

type CallOutcome = Result<Value, TransportError>;

#[derive(Debug)]
enum Completion {
    /// Tagged with the discovery round that issued it.
    Scan { generation: u64, outcome: CallOutcome },
    Connect(CallOutcome),
    Disconnect(CallOutcome),
    BoardState(CallOutcome),
    PinMode { pin: usize, mode: PinMode, outcome: CallOutcome },
    Write { method: &'static str, outcome: CallOutcome },
}

/// Cheap handle onto a running session. Every method returns immediately;
/// results arrive through the session's listener.
#[derive(Debug)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    board: BoardState,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    fn send(&self, command: Command) {
        if let Err(e) = self.commands.send(command) {
            tracing::debug!("Session task is no longer running, dropped {:?}", e.0);
        }
    }

    /// Re-run discovery on the already open transport.
    pub fn scan(&self) {
        self.send(Command::Scan);
    }

    /// Connect to `id`, or to the first listed peripheral when `None`.
    pub fn connect(&self, id: Option<String>) {
        self.send(Command::Connect(id));
    }

    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    pub fn refresh_board_state(&self) {
        self.send(Command::RefreshBoardState);
    }

    pub fn set_pin_mode(&self, pin: usize, mode: PinMode) {
        self.send(Command::SetPinMode { pin, mode });
    }

    pub fn digital_write(&self, pin: usize, level: DigitalLevel) {
        self.send(Command::DigitalWrite { pin, level });
    }

    /// The value is clamped into `[0, RESOLUTION.PWM]` before it is sent.
    pub fn pwm_write(&self, pin: usize, value: f64) {
        self.send(Command::PwmWrite { pin, value });
    }

    pub fn servo_write(&self, pin: usize, value: f64) {
        self.send(Command::ServoWrite { pin, value });
    }

    pub fn board(&self) -> &BoardState {
        &self.board
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.board.is_connected()
    }

    /// Release the board (if any), close the transport and wait for the
    /// session task to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            tracing::error!("Session task failed: {}", e);
        }
    }
}

/// The session task's state. Created and driven by [`PeripheralSession::spawn`].
pub struct PeripheralSession {
    config: SessionConfig,
    transport: Arc<dyn RpcTransport>,
    listener: Arc<dyn PeripheralListener>,
    connect_callback: Option<ConnectCallback>,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    peripherals: PeripheralList,
    board: Option<Board>,
    board_tx: watch::Sender<Option<Board>>,
    discovery_deadline: Option<Instant>,
    scan_generation: u64,
    scan_timed_out: bool,
    disconnecting: bool,
    poller: Option<Poller>,
    ticks_tx: mpsc::UnboundedSender<()>,
    completions_tx: mpsc::UnboundedSender<Completion>,
}

impl PeripheralSession {
    /// Open a transport through `connector` and start the session task.
    /// Discovery begins by itself once the transport reports open.
    pub fn spawn(
        connector: &dyn TransportConnector,
        config: SessionConfig,
        listener: Arc<dyn PeripheralListener>,
        on_connect: Option<ConnectCallback>,
    ) -> SessionHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (board_tx, board_rx) = watch::channel(None);

        let transport = connector.open(events_tx);
        let session = PeripheralSession {
            config,
            transport,
            listener,
            connect_callback: on_connect,
            state: SessionState::Idle,
            state_tx,
            peripherals: PeripheralList::new(),
            board: None,
            board_tx,
            discovery_deadline: None,
            scan_generation: 0,
            scan_timed_out: false,
            disconnecting: false,
            poller: None,
            ticks_tx,
            completions_tx,
        };

        let task = tokio::spawn(session.run(commands_rx, events_rx, completions_rx, ticks_rx));
        SessionHandle {
            commands: commands_tx,
            board: BoardState::new(board_rx),
            state: state_rx,
            task,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut ticks: mpsc::UnboundedReceiver<()>,
    ) {
        loop {
            let deadline = self.discovery_deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = transport_events.recv() => self.handle_transport_event(event),
                Some(completion) = completions.recv() => self.handle_completion(completion),
                Some(()) = ticks.recv() => self.handle_poll_tick(),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.handle_discovery_timeout()
                }
            }
        }
        self.teardown(&mut completions).await;
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!("Session state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn publish_board(&self) {
        self.board_tx.send_replace(self.board.clone());
    }

    fn emit(&self, event: PeripheralEvent) {
        self.listener.on_event(event);
    }

    fn report_request_error(&self, detail: &dyn std::fmt::Display) {
        tracing::warn!("Relay request failed: {}", detail);
        self.emit(PeripheralEvent::RequestError(PeripheralError::lost_connection(
            &self.config.extension_id,
        )));
    }

    fn port_path(&self) -> Option<String> {
        self.board.as_ref().map(|b| b.port_path().to_string())
    }

    fn is_connected(&self) -> bool {
        self.board.as_ref().is_some_and(Board::is_open)
    }

    /// Run `method` in its own task and post its outcome back as a completion.
    fn dispatch<F>(&self, method: &'static str, params: Value, complete: F)
    where
        F: FnOnce(CallOutcome) -> Completion + Send + 'static,
    {
        let transport = Arc::clone(&self.transport);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let outcome = transport.call(method, params).await;
            let _ = completions.send(complete(outcome));
        });
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Scan => self.start_discovery(),
            Command::Connect(id) => self.connect(id),
            Command::Disconnect => self.disconnect(),
            Command::RefreshBoardState => self.refresh_board_state(),
            Command::SetPinMode { pin, mode } => {
                let Some(port_path) = self.port_path() else { return };
                self.dispatch(
                    "pinMode",
                    json!({ "portPath": port_path, "pin": pin, "mode": mode.code() }),
                    move |outcome| Completion::PinMode { pin, mode, outcome },
                );
            }
            Command::DigitalWrite { pin, level } => {
                let Some(port_path) = self.port_path() else { return };
                self.write(
                    "digitalWrite",
                    json!({ "portPath": port_path, "pin": pin, "value": level.value() }),
                );
            }
            Command::PwmWrite { pin, value } => {
                let Some(board) = &self.board else { return };
                let value = clamp_pwm(value, board.pwm_max());
                let params = json!({ "portPath": board.port_path(), "pin": pin, "value": value });
                self.write("pwmWrite", params);
            }
            Command::ServoWrite { pin, value } => {
                let Some(port_path) = self.port_path() else { return };
                self.write(
                    "servoWrite",
                    json!({ "portPath": port_path, "pin": pin, "value": servo_value(value) }),
                );
            }
            Command::Shutdown => {}
        }
    }

    fn write(&self, method: &'static str, params: Value) {
        self.dispatch(method, params, move |outcome| Completion::Write { method, outcome });
    }

    fn start_discovery(&mut self) {
        if !self.transport.is_open() {
            tracing::debug!("Transport not open, discovery deferred");
            return;
        }
        // Re-arming replaces any timer still pending from an earlier scan,
        // and that scan's reply is dropped when it arrives
        self.scan_generation += 1;
        self.peripherals.clear();
        self.scan_timed_out = false;
        self.discovery_deadline = Some(Instant::now() + self.config.discovery_timeout());
        if !matches!(self.state, SessionState::Connecting | SessionState::Connected) {
            self.set_state(SessionState::Discovering);
        }
        tracing::info!("Scanning for peripherals");
        let options = Value::Object(self.config.scan_options.clone());
        let generation = self.scan_generation;
        self.dispatch("scan", options, move |outcome| Completion::Scan { generation, outcome });
    }

    fn connect(&mut self, id: Option<String>) {
        match self.state {
            SessionState::Connecting | SessionState::Connected => {
                tracing::warn!("Connect ignored, session already {:?}", self.state);
                return;
            }
            _ => {}
        }
        if !self.transport.is_open() {
            self.report_request_error(&TransportError::NotOpen);
            return;
        }
        // Without an id the first listed peripheral is used; with several
        // peripherals that choice follows the list's key order.
        let Some(port_path) = id.or_else(|| self.peripherals.keys().next().cloned()) else {
            self.report_request_error(&"no peripheral to connect to");
            return;
        };
        tracing::info!("Connecting to peripheral {}", port_path);
        self.set_state(SessionState::Connecting);
        self.dispatch("connect", json!({ "portPath": port_path }), Completion::Connect);
    }

    fn disconnect(&mut self) {
        // Polling stops as soon as disconnect is requested
        self.stop_polling();
        if self.state != SessionState::Connected || self.disconnecting {
            return;
        }
        let Some(port_path) = self.port_path() else { return };
        tracing::info!("Disconnecting from {}", port_path);
        self.disconnecting = true;
        self.dispatch("disconnect", json!({ "portPath": port_path }), Completion::Disconnect);
    }

    fn refresh_board_state(&self) {
        if !self.is_connected() {
            return;
        }
        if let Some(port_path) = self.port_path() {
            self.dispatch("getBoardState", json!({ "portPath": port_path }), Completion::BoardState);
        }
    }

    fn start_polling(&mut self) {
        self.stop_polling();
        let ticks = self.ticks_tx.clone();
        self.poller = Some(Poller::start(self.config.poll_interval(), move || {
            ticks.send(()).is_ok()
        }));
    }

    fn stop_polling(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
    }

    fn handle_poll_tick(&self) {
        if self.poller.is_some() {
            self.refresh_board_state();
        }
    }

    /// Drop the board without a relay round-trip and report the loss.
    fn lose_connection(&mut self, reason: &str) {
        tracing::warn!("Connection lost: {}", reason);
        self.stop_polling();
        self.board = None;
        self.disconnecting = false;
        self.publish_board();
        self.set_state(SessionState::Disconnected);
        self.emit(PeripheralEvent::ConnectionLost(PeripheralError::lost_connection(
            &self.config.extension_id,
        )));
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                tracing::info!("Relay transport open");
                self.start_discovery();
            }
            TransportEvent::Error(message) => {
                if self.board.is_some() {
                    self.lose_connection(&message);
                } else {
                    self.report_request_error(&message);
                }
            }
            TransportEvent::Closed => {
                if self.state == SessionState::Disconnected {
                    tracing::debug!("Relay transport closed");
                } else {
                    self.lose_connection("relay transport closed");
                }
            }
        }
    }

    fn handle_discovery_timeout(&mut self) {
        self.discovery_deadline = None;
        self.scan_timed_out = true;
        tracing::warn!(
            "No scan response within {:?}",
            self.config.discovery_timeout()
        );
        self.emit(PeripheralEvent::ScanTimeout);
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Scan { generation, outcome } => self.on_scan(generation, outcome),
            Completion::Connect(outcome) => self.on_connect(outcome),
            Completion::Disconnect(outcome) => self.on_disconnect(outcome),
            Completion::BoardState(outcome) => self.on_board_state(outcome),
            Completion::PinMode { pin, mode, outcome } => match outcome {
                Ok(_) => {
                    if let Some(p) = self.board.as_mut().and_then(|b| b.pins.get_mut(pin)) {
                        p.mode = mode;
                        self.publish_board();
                    }
                }
                Err(e) => self.report_request_error(&e),
            },
            Completion::Write { method, outcome } => {
                if let Err(e) = outcome {
                    self.report_request_error(&format!("{}: {}", method, e));
                }
            }
        }
    }

    fn on_scan(&mut self, generation: u64, outcome: CallOutcome) {
        if generation != self.scan_generation {
            tracing::debug!(
                "Dropping reply to scan #{}, scan #{} is current",
                generation,
                self.scan_generation
            );
            return;
        }
        self.discovery_deadline = None;
        let list = outcome.and_then(|value| {
            if value.is_null() {
                return Ok(PeripheralList::new());
            }
            serde_json::from_value::<PeripheralList>(value)
                .map_err(|e| TransportError::Decode(e.to_string()))
        });
        match list {
            Ok(list) => {
                if self.scan_timed_out {
                    // Late results are still applied
                    tracing::warn!("Scan result arrived after the discovery timeout");
                }
                tracing::info!("Found {} peripheral(s)", list.len());
                self.peripherals = list.clone();
                if self.state == SessionState::Discovering {
                    self.set_state(SessionState::Ready);
                }
                self.emit(PeripheralEvent::PeripheralListUpdated(list));
            }
            Err(e) => self.report_request_error(&e),
        }
    }

    fn on_connect(&mut self, outcome: CallOutcome) {
        if self.state != SessionState::Connecting {
            tracing::warn!("Connect result ignored in state {:?}", self.state);
            return;
        }
        let board = outcome.and_then(|value| {
            serde_json::from_value::<Board>(value).map_err(|e| TransportError::Decode(e.to_string()))
        });
        match board {
            Ok(board) => {
                tracing::info!("Connected to {}", board.port_path());
                if let Some(callback) = &self.connect_callback {
                    callback(&board);
                }
                self.board = Some(board);
                self.publish_board();
                self.set_state(SessionState::Connected);
                self.emit(PeripheralEvent::Connected);
                self.start_polling();
            }
            Err(e) => {
                self.set_state(SessionState::Ready);
                self.report_request_error(&e);
            }
        }
    }

    fn on_disconnect(&mut self, outcome: CallOutcome) {
        self.disconnecting = false;
        match outcome {
            Ok(_) => {
                self.set_state(SessionState::Disconnected);
                self.stop_polling();
                self.board = None;
                self.publish_board();
                let transport = Arc::clone(&self.transport);
                tokio::spawn(async move { transport.close().await });
                self.emit(PeripheralEvent::Disconnected);
            }
            // The relay may still hold the board, so it is kept
            Err(e) => self.report_request_error(&e),
        }
    }

    fn on_board_state(&mut self, outcome: CallOutcome) {
        let snapshot = outcome.and_then(|value| {
            if value.is_null() {
                return Ok(BoardSnapshot::default());
            }
            serde_json::from_value::<BoardSnapshot>(value)
                .map_err(|e| TransportError::Decode(e.to_string()))
        });
        match snapshot {
            Ok(snapshot) => {
                let Some(board) = self.board.as_mut() else {
                    tracing::debug!("Board state arrived after the board was released");
                    return;
                };
                board.merge(snapshot);
                let still_open = board.is_open();
                self.publish_board();
                if !still_open {
                    self.lose_connection("relay reports the board transport closed");
                }
            }
            Err(e) => self.report_request_error(&e),
        }
    }

    async fn teardown(&mut self, completions: &mut mpsc::UnboundedReceiver<Completion>) {
        self.stop_polling();
        self.discovery_deadline = None;

        if let Some(port_path) = self.port_path() {
            let limit = self.config.discovery_timeout();
            if self.disconnecting {
                let _ = timeout(limit, async {
                    while let Some(completion) = completions.recv().await {
                        if matches!(completion, Completion::Disconnect(_)) {
                            break;
                        }
                    }
                })
                .await;
            } else if let Err(e) = self
                .transport
                .call("disconnect", json!({ "portPath": port_path }))
                .await
            {
                tracing::debug!("Disconnect during teardown failed: {}", e);
            }
            self.board = None;
            self.publish_board();
            self.emit(PeripheralEvent::Disconnected);
        }

        self.set_state(SessionState::Disconnected);
        self.transport.close().await;
        tracing::debug!("Session finished");
    }
}

/// `floor(value)` limited to `[0, max]`; NaN becomes 0.
pub fn clamp_pwm(value: f64, max: u32) -> u32 {
    let value = value.floor();
    if value.is_nan() || value <= 0.0 {
        0
    } else if value >= max as f64 {
        max
    } else {
        value as u32
    }
}

/// Whole-degree angles go out as integers.
fn servo_value(value: f64) -> Value {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        json!(value as i64)
    } else {
        json!(value)
    }
}
