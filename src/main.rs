use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use medrelay_server::{SerialConfig, ServerConfig};
use medrelay_telemetry::{LogFormat, TelemetryConfig};

/// Relay medication events from sensors to live dashboards.
#[derive(Debug, Parser)]
#[command(name = "medrelay", version, about)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "MEDRELAY_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// HTTP and websocket port.
    #[arg(long, short, env = "MEDRELAY_PORT", default_value_t = 3000)]
    port: u16,

    /// Append-only event log file.
    #[arg(long, env = "MEDRELAY_LOG_FILE", default_value = "medication_logs.txt")]
    log_file: PathBuf,

    /// Directory with the dashboard's static files.
    #[arg(long, env = "MEDRELAY_STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Serial port of the directly wired sensor (e.g. /dev/ttyACM0 or COM3).
    /// Without it the relay runs WiFi-only.
    #[arg(long, env = "MEDRELAY_SERIAL_PORT")]
    serial_port: Option<String>,

    #[arg(long, env = "MEDRELAY_BAUD_RATE", default_value_t = 9600)]
    baud_rate: u32,

    /// Per-read timeout on the serial port, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    serial_timeout_ms: u64,

    /// Outbound messages buffered per connection before it is dropped.
    #[arg(long, default_value_t = 256)]
    max_send_queue: usize,

    /// Log level when RUST_LOG is not set.
    #[arg(long, env = "MEDRELAY_LOG_LEVEL", default_value = "info")]
    log_level: tracing::Level,

    /// `pretty` or `json`.
    #[arg(long, env = "MEDRELAY_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            port: self.port,
            max_send_queue: self.max_send_queue,
            log_path: self.log_file.clone(),
            static_dir: self.static_dir.clone(),
            serial: SerialConfig {
                port_name: self.serial_port.clone(),
                baud_rate: self.baud_rate,
                read_timeout: Duration::from_millis(self.serial_timeout_ms),
                ..SerialConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    medrelay_telemetry::init_telemetry(&TelemetryConfig {
        log_level: cli.log_level,
        format: cli.log_format,
        ..TelemetryConfig::default()
    });

    let config = cli.server_config();
    let handle = medrelay_server::start(config)
        .await
        .context("failed to start medication relay")?;

    tracing::info!(port = handle.port(), "websocket endpoint ready at /ws");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await?;
    Ok(())
}
