// src/main.rs - Command-line front end for the relay session client
use clap::{Parser, Subcommand, ValueEnum};
use firmata_link::config::{self, Config};
use firmata_link::events::{LogListener, PeripheralEvent, PeripheralList};
use firmata_link::{DigitalLevel, SessionManager};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Parser)]
#[command(name = "firmata-link", version, about = "Talk to a Firmata board through the relay")]
struct Cli {
    /// Configuration file (TOML). Defaults apply when the file is absent.
    #[arg(short, long, default_value = "firmata-link.toml")]
    config: String,

    /// Log at debug level regardless of the configured level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the peripherals the relay can reach
    Scan,
    /// Connect and log analog inputs whenever they change, until Ctrl-C
    Monitor {
        #[arg(long)]
        port: Option<String>,
    },
    /// Connect, perform a single pin write, disconnect
    Write {
        #[arg(long)]
        port: Option<String>,
        #[arg(long)]
        pin: usize,
        #[arg(long, value_enum)]
        kind: WriteKind,
        #[arg(long)]
        value: f64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WriteKind {
    Digital,
    Pwm,
    Servo,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let config = if Path::new(&cli.config).exists() {
        config::load_config(&cli.config).map_err(|e| {
            eprintln!("Failed to load config from '{}': {}", cli.config, e);
            Box::new(e) as BoxError
        })?
    } else {
        Config::default()
    };

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        config.logging.tracing_level()
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("Relay: {}", config.relay.url);
    tracing::info!("Extension: {}", config.session.extension_id);

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut manager =
        SessionManager::with_websocket(config.clone(), Arc::new((LogListener, events_tx)));
    let scan_limit = config.session.discovery_timeout() + Duration::from_secs(1);

    manager.scan();
    let peripherals = wait_for_peripherals(&mut events, scan_limit).await?;

    let result = match cli.command {
        Command::Scan => {
            for (id, descriptor) in &peripherals {
                println!(
                    "{}\t{}\t{}",
                    id,
                    descriptor.name.as_deref().unwrap_or("-"),
                    descriptor.transport_type.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        Command::Monitor { port } => monitor(&manager, &mut events, port.as_deref()).await,
        Command::Write { port, pin, kind, value } => {
            connect(&manager, &mut events, port.as_deref()).await?;
            match kind {
                WriteKind::Digital => {
                    let level = if value != 0.0 { DigitalLevel::High } else { DigitalLevel::Low };
                    manager.set_pin_value_digital(pin, level);
                }
                WriteKind::Pwm => manager.set_pin_value_pwm(pin, value),
                WriteKind::Servo => manager.set_pin_value_servo(pin, value),
            }
            // Give the fire-and-forget calls a moment to reach the relay
            tokio::time::sleep(Duration::from_millis(250)).await;
            report_pending_errors(&mut events);
            Ok(())
        }
    };

    manager.shutdown().await;
    result
}

async fn wait_for_peripherals(
    events: &mut mpsc::UnboundedReceiver<PeripheralEvent>,
    limit: Duration,
) -> Result<PeripheralList, BoxError> {
    let waited: Result<Result<PeripheralList, BoxError>, _> = timeout(limit, async {
        while let Some(event) = events.recv().await {
            match event {
                PeripheralEvent::PeripheralListUpdated(list) => return Ok(list),
                PeripheralEvent::ScanTimeout => return Err("scan timed out".into()),
                PeripheralEvent::ConnectionLost(e) | PeripheralEvent::RequestError(e) => {
                    return Err(format!("{} relay ({})", e.message, e.extension_id).into());
                }
                other => tracing::debug!("Ignoring {:?} while scanning", other),
            }
        }
        Err("event channel closed".into())
    })
    .await;
    waited.unwrap_or_else(|_| Err("no answer from relay".into()))
}

async fn connect(
    manager: &SessionManager,
    events: &mut mpsc::UnboundedReceiver<PeripheralEvent>,
    port: Option<&str>,
) -> Result<(), BoxError> {
    manager.connect(port);
    let limit = manager.config().relay.call_timeout() + Duration::from_secs(1);
    let waited: Result<Result<(), BoxError>, _> = timeout(limit, async {
        while let Some(event) = events.recv().await {
            match event {
                PeripheralEvent::Connected => return Ok(()),
                PeripheralEvent::ConnectionLost(e) | PeripheralEvent::RequestError(e) => {
                    return Err(format!("connect failed: {} board ({})", e.message, e.extension_id).into());
                }
                other => tracing::debug!("Ignoring {:?} while connecting", other),
            }
        }
        Err("event channel closed".into())
    })
    .await;
    waited.unwrap_or_else(|_| Err("connect timed out".into()))
}

async fn monitor(
    manager: &SessionManager,
    events: &mut mpsc::UnboundedReceiver<PeripheralEvent>,
    port: Option<&str>,
) -> Result<(), BoxError> {
    connect(manager, events, port).await?;
    let board = manager.board();
    tracing::info!(
        "Digital pins {:?}, PWM pins {:?}, servo pins {:?}",
        board.digital_pin_indices(),
        board.pwm_pin_indices(),
        board.servo_pin_indices()
    );

    let mut board = board.clone();
    let mut last: Vec<f64> = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, disconnecting");
                return Ok(());
            }
            event = events.recv() => match event {
                Some(PeripheralEvent::ConnectionLost(e)) => {
                    return Err(format!("{} board ({})", e.message, e.extension_id).into());
                }
                Some(other) => tracing::debug!("Event: {:?}", other),
                None => return Ok(()),
            },
            changed = board.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let channels = board.snapshot().map(|b| b.analog_pins.len()).unwrap_or(0);
                let values: Vec<f64> = (0..channels).map(|n| board.analog_pin_value(n)).collect();
                if values != last {
                    tracing::info!("Analog inputs: {:?}", values);
                    last = values;
                }
            }
        }
    }
}

fn report_pending_errors(events: &mut mpsc::UnboundedReceiver<PeripheralEvent>) {
    while let Ok(event) = events.try_recv() {
        if let PeripheralEvent::RequestError(e) = event {
            tracing::error!("[{}] write {} board", e.extension_id, e.message);
        }
    }
}
