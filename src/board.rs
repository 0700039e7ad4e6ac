// src/board.rs - Live mirror of the remote board's pins and capabilities
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tokio::sync::watch;

/// Operating role of a pin, carried on the wire as its Firmata mode code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PinMode {
    Input,
    Output,
    Analog,
    Pwm,
    Servo,
    Shift,
    I2c,
    OneWire,
    Stepper,
    Serial,
    Pullup,
    Ignore,
    PingRead,
    #[default]
    Unknown,
}

impl PinMode {
    pub const fn code(self) -> u8 {
        match self {
            PinMode::Input => 0x00,
            PinMode::Output => 0x01,
            PinMode::Analog => 0x02,
            PinMode::Pwm => 0x03,
            PinMode::Servo => 0x04,
            PinMode::Shift => 0x05,
            PinMode::I2c => 0x06,
            PinMode::OneWire => 0x07,
            PinMode::Stepper => 0x08,
            PinMode::Serial => 0x0A,
            PinMode::Pullup => 0x0B,
            PinMode::Ignore => 0x7F,
            PinMode::PingRead => 0x75,
            PinMode::Unknown => 0x10,
        }
    }

    /// Codes outside the known table map to `Unknown`.
    pub const fn from_code(code: u8) -> Self {
        match code {
            0x00 => PinMode::Input,
            0x01 => PinMode::Output,
            0x02 => PinMode::Analog,
            0x03 => PinMode::Pwm,
            0x04 => PinMode::Servo,
            0x05 => PinMode::Shift,
            0x06 => PinMode::I2c,
            0x07 => PinMode::OneWire,
            0x08 => PinMode::Stepper,
            0x0A => PinMode::Serial,
            0x0B => PinMode::Pullup,
            0x7F => PinMode::Ignore,
            0x75 => PinMode::PingRead,
            _ => PinMode::Unknown,
        }
    }
}

impl Serialize for PinMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for PinMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = Option::<u64>::deserialize(deserializer)?;
        Ok(code
            .and_then(|c| u8::try_from(c).ok())
            .map(PinMode::from_code)
            .unwrap_or_default())
    }
}

/// Logic level for digital writes and reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitalLevel {
    Low,
    High,
}

impl DigitalLevel {
    pub const fn value(self) -> u8 {
        match self {
            DigitalLevel::Low => 0,
            DigitalLevel::High => 1,
        }
    }

    /// Any non-zero pin value reads as `High`.
    pub fn from_pin_value(value: f64) -> Self {
        if value != 0.0 { DigitalLevel::High } else { DigitalLevel::Low }
    }
}

/// The two modes a pin may be switched to for reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Input,
    Pullup,
}

impl From<InputMode> for PinMode {
    fn from(mode: InputMode) -> Self {
        match mode {
            InputMode::Input => PinMode::Input,
            InputMode::Pullup => PinMode::Pullup,
        }
    }
}

fn number_or_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pin {
    #[serde(default, deserialize_with = "number_or_zero")]
    pub value: f64,
    #[serde(default)]
    pub mode: PinMode,
    #[serde(default)]
    pub supported_modes: BTreeSet<PinMode>,
}

impl Pin {
    pub fn supports(&self, mode: PinMode) -> bool {
        self.supported_modes.contains(&mode)
    }
}

/// Serial transport the relay opened for this board.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardTransport {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub is_open: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    #[serde(rename = "ADC", default)]
    pub adc: Option<u32>,
    #[serde(rename = "PWM", default = "default_pwm_resolution")]
    pub pwm: u32,
    #[serde(rename = "DAC", default)]
    pub dac: Option<u32>,
}

fn default_pwm_resolution() -> u32 { 255 }

impl Default for Resolution {
    fn default() -> Self {
        Self {
            adc: None,
            pwm: default_pwm_resolution(),
            dac: None,
        }
    }
}

/// Snapshot of the connected board as reported by the relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Board {
    #[serde(default)]
    pub transport: BoardTransport,
    #[serde(default)]
    pub pins: Vec<Pin>,
    #[serde(default, rename = "analogPins")]
    pub analog_pins: Vec<usize>,
    #[serde(default, rename = "RESOLUTION")]
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Fields the relay sends that this crate does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Partial board state returned by `getBoardState`; present fields replace
/// the board's fields wholesale.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BoardSnapshot {
    #[serde(default)]
    pub transport: Option<BoardTransport>,
    #[serde(default)]
    pub pins: Option<Vec<Pin>>,
    #[serde(default, rename = "analogPins")]
    pub analog_pins: Option<Vec<usize>>,
    #[serde(default, rename = "RESOLUTION")]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Board {
    /// Top-level overwrite; nested values are not patched.
    pub fn merge(&mut self, snapshot: BoardSnapshot) {
        if let Some(transport) = snapshot.transport {
            self.transport = transport;
        }
        if let Some(pins) = snapshot.pins {
            self.pins = pins;
        }
        if let Some(analog_pins) = snapshot.analog_pins {
            self.analog_pins = analog_pins;
        }
        if let Some(resolution) = snapshot.resolution {
            self.resolution = resolution;
        }
        if snapshot.name.is_some() {
            self.name = snapshot.name;
        }
        self.extra.extend(snapshot.extra);
    }

    pub fn port_path(&self) -> &str {
        &self.transport.path
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open
    }

    pub fn pin_value(&self, pin: usize) -> f64 {
        self.pins.get(pin).map(|p| p.value).unwrap_or(0.0)
    }

    /// Value of the Nth analog channel, resolved through `analog_pins`.
    pub fn analog_pin_value(&self, channel: usize) -> f64 {
        self.analog_pins
            .get(channel)
            .map(|&pin| self.pin_value(pin))
            .unwrap_or(0.0)
    }

    pub fn pin_mode(&self, pin: usize) -> Option<PinMode> {
        self.pins.get(pin).map(|p| p.mode)
    }

    /// Largest value `pwmWrite` may carry.
    pub fn pwm_max(&self) -> u32 {
        self.resolution.pwm
    }

    pub fn all_pin_indices(&self) -> Vec<usize> {
        (0..self.pins.len()).collect()
    }

    pub fn digital_pin_indices(&self) -> Vec<usize> {
        self.indices_where(|pin| !pin.supported_modes.is_empty())
    }

    pub fn pwm_pin_indices(&self) -> Vec<usize> {
        self.indices_where(|pin| pin.supports(PinMode::Pwm))
    }

    pub fn servo_pin_indices(&self) -> Vec<usize> {
        self.indices_where(|pin| pin.supports(PinMode::Servo))
    }

    // Analog-capable pins are always excluded, whatever else they support.
    fn indices_where(&self, keep: impl Fn(&Pin) -> bool) -> Vec<usize> {
        self.pins
            .iter()
            .enumerate()
            .filter(|(_, pin)| keep(pin) && !pin.supports(PinMode::Analog))
            .map(|(index, _)| index)
            .collect()
    }
}

/// Read-only view onto a session's current board. Every query falls back to
/// an empty or zero answer while no board is present.
#[derive(Debug, Clone)]
pub struct BoardState {
    rx: watch::Receiver<Option<Board>>,
}

impl BoardState {
    pub fn new(rx: watch::Receiver<Option<Board>>) -> Self {
        Self { rx }
    }

    /// A view that never sees a board.
    pub fn detached() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    fn with<R>(&self, default: R, query: impl FnOnce(&Board) -> R) -> R {
        match self.rx.borrow().as_ref() {
            Some(board) => query(board),
            None => default,
        }
    }

    pub fn snapshot(&self) -> Option<Board> {
        self.rx.borrow().clone()
    }

    pub fn has_board(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// True only while a board is present and its transport reports open.
    pub fn is_connected(&self) -> bool {
        self.with(false, Board::is_open)
    }

    pub fn board_name(&self) -> Option<String> {
        self.with(None, |b| b.name.clone())
    }

    pub fn pin_value(&self, pin: usize) -> f64 {
        self.with(0.0, |b| b.pin_value(pin))
    }

    pub fn analog_pin_value(&self, channel: usize) -> f64 {
        self.with(0.0, |b| b.analog_pin_value(channel))
    }

    pub fn pin_mode(&self, pin: usize) -> Option<PinMode> {
        self.with(None, |b| b.pin_mode(pin))
    }

    pub fn pins(&self) -> Vec<Pin> {
        self.with(Vec::new(), |b| b.pins.clone())
    }

    pub fn all_pin_indices(&self) -> Vec<usize> {
        self.with(Vec::new(), Board::all_pin_indices)
    }

    pub fn digital_pin_indices(&self) -> Vec<usize> {
        self.with(Vec::new(), Board::digital_pin_indices)
    }

    pub fn pwm_pin_indices(&self) -> Vec<usize> {
        self.with(Vec::new(), Board::pwm_pin_indices)
    }

    pub fn servo_pin_indices(&self) -> Vec<usize> {
        self.with(Vec::new(), Board::servo_pin_indices)
    }

    /// Resolves when the board changes; errors once the owning session is gone.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.rx.changed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pin(modes: &[PinMode]) -> Pin {
        Pin {
            value: 0.0,
            mode: PinMode::Unknown,
            supported_modes: modes.iter().copied().collect(),
        }
    }

    fn three_pin_board() -> Board {
        Board {
            transport: BoardTransport { path: "/dev/ttyACM0".into(), is_open: true },
            pins: vec![
                pin(&[PinMode::Output, PinMode::Pwm]),
                pin(&[PinMode::Analog]),
                pin(&[PinMode::Servo]),
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_board_state_changed_follows_publisher() {
        let (tx, rx) = watch::channel(None);
        let mut state = BoardState::new(rx);
        assert!(!state.has_board());

        tx.send_replace(Some(three_pin_board()));
        assert!(state.changed().await.is_ok());
        assert_eq!(state.pwm_pin_indices(), three_pin_board().pwm_pin_indices());

        drop(tx);
        assert!(state.changed().await.is_err());
    }

    #[test]
    fn test_capability_indices() {
        let board = three_pin_board();
        assert_eq!(board.pwm_pin_indices(), vec![0]);
        assert_eq!(board.servo_pin_indices(), vec![2]);
        assert_eq!(board.digital_pin_indices(), vec![0, 2]);
        assert_eq!(board.all_pin_indices(), vec![0, 1, 2]);
    }

    #[test]
    fn test_analog_capable_pins_excluded_even_with_target_mode() {
        let mut board = three_pin_board();
        board.pins.push(pin(&[PinMode::Analog, PinMode::Pwm, PinMode::Servo, PinMode::Input]));
        board.pins.push(pin(&[]));
        assert_eq!(board.pwm_pin_indices(), vec![0]);
        assert_eq!(board.servo_pin_indices(), vec![2]);
        // Pins with no supported modes are not digital either
        assert_eq!(board.digital_pin_indices(), vec![0, 2]);
    }

    #[test]
    fn test_analog_value_resolves_through_mapping() {
        let mut board = three_pin_board();
        board.pins[1].value = 512.0;
        board.pins[2].value = 7.0;
        board.analog_pins = vec![1];
        assert_eq!(board.analog_pin_value(0), 512.0);
        // Raw pin 0 is not analog channel 0
        assert_eq!(board.pin_value(0), 0.0);
        assert_eq!(board.analog_pin_value(3), 0.0);
        assert_eq!(board.pin_value(99), 0.0);
        assert_eq!(board.pin_mode(99), None);
    }

    #[test]
    fn test_board_from_relay_json() {
        let board: Board = serde_json::from_value(json!({
            "transport": {"path": "COM3", "isOpen": true},
            "pins": [
                {"supportedModes": [0, 1, 3], "mode": 1, "value": 0, "report": 1},
                {"supportedModes": [0, 1, 2], "value": null, "analogChannel": 0},
                {"supportedModes": [], "mode": 200}
            ],
            "analogPins": [1],
            "RESOLUTION": {"ADC": 1023, "PWM": 255, "DAC": null},
            "firmware": {"name": "StandardFirmata.ino"}
        }))
        .unwrap();
        assert_eq!(board.port_path(), "COM3");
        assert!(board.is_open());
        assert_eq!(board.pins[0].mode, PinMode::Output);
        assert!(board.pins[0].supports(PinMode::Pwm));
        assert_eq!(board.pins[1].mode, PinMode::Unknown);
        assert_eq!(board.pins[1].value, 0.0);
        assert_eq!(board.pins[2].mode, PinMode::Unknown);
        assert_eq!(board.resolution.adc, Some(1023));
        assert_eq!(board.pwm_max(), 255);
        assert!(board.extra.contains_key("firmware"));
    }

    #[test]
    fn test_merge_overwrites_present_fields_only() {
        let mut board = three_pin_board();
        board.analog_pins = vec![1];
        let snapshot: BoardSnapshot = serde_json::from_value(json!({
            "pins": [{"supportedModes": [2], "mode": 2, "value": 300}],
            "transport": {"path": "/dev/ttyACM0", "isOpen": false}
        }))
        .unwrap();
        board.merge(snapshot);
        assert_eq!(board.pins.len(), 1);
        assert_eq!(board.pins[0].value, 300.0);
        assert!(!board.is_open());
        assert_eq!(board.analog_pins, vec![1]);
        assert_eq!(board.resolution.pwm, 255);
    }

    #[test]
    fn test_pin_mode_codes() {
        assert_eq!(PinMode::Pwm.code(), 3);
        assert_eq!(PinMode::from_code(0x0B), PinMode::Pullup);
        assert_eq!(PinMode::from_code(0x42), PinMode::Unknown);
        assert_eq!(serde_json::to_value(PinMode::PingRead).unwrap(), json!(0x75));
        assert_eq!(PinMode::from(InputMode::Pullup), PinMode::Pullup);
    }

    #[test]
    fn test_board_state_defaults_without_board() {
        let state = BoardState::detached();
        assert!(!state.is_connected());
        assert!(!state.has_board());
        assert_eq!(state.pin_value(0), 0.0);
        assert_eq!(state.analog_pin_value(0), 0.0);
        assert_eq!(state.pin_mode(0), None);
        assert!(state.pins().is_empty());
        assert!(state.digital_pin_indices().is_empty());
    }

    #[test]
    fn test_is_connected_requires_open_transport() {
        let (tx, rx) = watch::channel(None);
        let state = BoardState::new(rx);
        assert!(!state.is_connected());

        let mut board = three_pin_board();
        board.transport.is_open = false;
        tx.send_replace(Some(board.clone()));
        assert!(!state.is_connected());

        board.transport.is_open = true;
        tx.send_replace(Some(board));
        assert!(state.is_connected());

        tx.send_replace(None);
        assert!(!state.is_connected());
    }

    #[test]
    fn test_digital_level_from_value() {
        assert_eq!(DigitalLevel::from_pin_value(1.0), DigitalLevel::High);
        assert_eq!(DigitalLevel::from_pin_value(0.0), DigitalLevel::Low);
        assert_eq!(DigitalLevel::High.value(), 1);
    }
}
