use std::path::PathBuf;
use std::time::Duration;

/// Serial hardware settings. With no `port_name` the bridge is never started
/// and the relay runs WiFi-only.
#[derive(Clone, Debug)]
pub struct SerialConfig {
    pub port_name: Option<String>,
    pub baud_rate: u32,
    /// Upper bound on one blocking read.
    pub read_timeout: Duration,
    /// Delay between attempts to open the port, and backoff after a read error.
    pub retry_interval: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: None,
            baud_rate: 9600,
            read_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Outbound messages buffered per connection before it counts as dead.
    pub max_send_queue: usize,
    pub log_path: PathBuf,
    /// Directory served for any path that is not an API route.
    pub static_dir: Option<PathBuf>,
    pub serial: SerialConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            port: 3000,
            max_send_queue: 256,
            log_path: PathBuf::from("medication_logs.txt"),
            static_dir: None,
            serial: SerialConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}
