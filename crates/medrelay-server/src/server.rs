use std::net::SocketAddr;
use std::sync::Arc;

use medrelay_store::EventLog;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::registry::ConnectionRegistry;
use crate::relay::Relay;
use crate::routes::{self, AppState};
use crate::serial::{BridgeState, PortOpener, SerialBridge, SerialPortOpener};

/// Create and start the server, opening the configured serial port if any.
pub async fn start(config: ServerConfig) -> Result<ServerHandle, ServerError> {
    let opener = SerialPortOpener::from_config(&config.serial).map(|o| Arc::new(o) as Arc<dyn PortOpener>);
    start_with_opener(config, opener).await
}

/// Like [`start`], with the serial hardware reached through `opener`.
/// `None` runs WiFi-only.
pub async fn start_with_opener(
    config: ServerConfig,
    opener: Option<Arc<dyn PortOpener>>,
) -> Result<ServerHandle, ServerError> {
    let registry = Arc::new(ConnectionRegistry::new(config.max_send_queue));
    let log = Arc::new(EventLog::new(&config.log_path));
    let (state_tx, state_rx) = watch::channel(BridgeState::Unavailable);
    let relay = Arc::new(Relay::new(registry, log, state_rx));
    let shutdown = CancellationToken::new();

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr: addr.clone(), source })?;
    let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

    let bridge = match opener {
        Some(opener) => {
            tracing::info!(port = %opener.describe(), "starting serial bridge");
            let bridge = SerialBridge::new(opener, Arc::clone(&relay), state_tx, config.serial.retry_interval);
            Some(bridge.spawn(shutdown.child_token()))
        }
        None => {
            tracing::info!("no serial port configured, running WiFi-only");
            None
        }
    };

    let app_state = AppState {
        relay: Arc::clone(&relay),
        shutdown: shutdown.clone(),
    };
    let router = routes::build_router(app_state, config.static_dir.as_deref());

    let graceful = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .await
            .map_err(|source| ServerError::Serve {
                addr: local_addr,
                source,
            })
    });

    tracing::info!(
        addr = %local_addr,
        log_path = %config.log_path.display(),
        "medication relay started"
    );

    Ok(ServerHandle {
        local_addr,
        relay,
        shutdown,
        server,
        bridge,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive until
/// [`ServerHandle::shutdown`] is called.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
    server: JoinHandle<Result<(), ServerError>>,
    bridge: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Stop accepting connections, close open websockets and stop the serial
    /// bridge.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        self.shutdown.cancel();
        if let Some(bridge) = self.bridge {
            if let Err(e) = bridge.await {
                tracing::error!(error = %e, "serial bridge task failed");
            }
        }
        match self.server.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "server task failed");
                Ok(())
            }
        }
    }
}
