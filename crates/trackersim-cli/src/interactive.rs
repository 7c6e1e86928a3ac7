//! Operator command loop.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use trackersim_core::AlertData;
use trackersim_device::TelemetryProducer;

/// Help banner printed when the simulator starts.
pub const HELP: &str = "\
  Commands:
    a - Send alert (button press)
    t - Send temperature now
    g - Send GPS location now
    c - Send test counter
    s - Print current shadow config
    i - Print route info
    q - Quit";

/// One operator keystroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Alert,
    Temperature,
    Location,
    Counter,
    ShowShadow,
    RouteInfo,
    Quit,
}

impl OperatorCommand {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "a" => Some(Self::Alert),
            "t" => Some(Self::Temperature),
            "g" => Some(Self::Location),
            "c" => Some(Self::Counter),
            "s" => Some(Self::ShowShadow),
            "i" => Some(Self::RouteInfo),
            "q" => Some(Self::Quit),
            _ => None,
        }
    }
}

/// Read stdin lines on a plain thread so a pending read never holds up
/// runtime shutdown.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send(line.clone()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

/// Translates operator commands into one-shot publishes.
pub struct InteractiveController {
    producer: Arc<TelemetryProducer>,
}

impl InteractiveController {
    pub fn new(producer: Arc<TelemetryProducer>) -> Self {
        Self { producer }
    }

    /// Run one command. Returns `false` when the operator asked to quit.
    pub async fn execute(&self, command: OperatorCommand) -> bool {
        match command {
            OperatorCommand::Alert => {
                self.producer
                    .send_alert(AlertData::new(0, 0, Some("Button pressed")))
                    .await;
            }
            OperatorCommand::Temperature => {
                self.producer.send_temperature().await;
            }
            OperatorCommand::Location => {
                self.producer.send_location().await;
            }
            OperatorCommand::Counter => {
                self.producer.send_counter().await;
            }
            OperatorCommand::ShowShadow => {
                let config = self.producer.shadow().snapshot();
                let json = serde_json::to_string_pretty(&config).unwrap_or_default();
                println!("[Config] {}", json);
            }
            OperatorCommand::RouteInfo => {
                let (index, total) = self.producer.route_position();
                println!("[Route] Position {}/{}", index, total);
                println!(
                    "[Route] Interval: {}s",
                    self.producer.shadow().location_interval_secs()
                );
            }
            OperatorCommand::Quit => {
                println!("Shutting down...");
                return false;
            }
        }
        true
    }

    /// Process lines until `q` or end of input.
    pub async fn run(&self, mut lines: mpsc::UnboundedReceiver<String>) {
        while let Some(line) = lines.recv().await {
            match OperatorCommand::parse(&line) {
                Some(command) => {
                    if !self.execute(command).await {
                        return;
                    }
                }
                None if line.trim().is_empty() => {}
                None => debug!(input = %line.trim(), "Unknown operator command"),
            }
        }
        debug!("Operator input closed");
    }
}
