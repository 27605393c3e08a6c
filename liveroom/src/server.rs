//! Server lifecycle management
//!
//! Starts the HTTP server, waits for a shutdown signal and then drains
//! WebSocket connections before tearing down the relay.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use liveroom_api::{create_router, AppState};
use liveroom_core::Config;

/// Liveroom server - owns the HTTP listener and the shared state
pub struct LiveroomServer {
    config: Config,
    state: AppState,
}

impl LiveroomServer {
    pub const fn new(config: Config, state: AppState) -> Self {
        Self { config, state }
    }

    /// Start the HTTP server and wait for a shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let http_address = self.config.http_address();
        let listener = tokio::net::TcpListener::bind(&http_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_address}: {e}"))?;
        info!("HTTP server listening on {}", http_address);

        let router = create_router(self.state.clone(), &self.config.server.allowed_origins);
        let mut http_handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        // Stop accepting new connections
        let _ = shutdown_tx.send(true);

        self.shutdown().await;

        if !http_handle.is_finished() {
            http_handle.abort();
        }
        Ok(())
    }

    /// Gracefully shut down: close sockets, wait for them to drain, stop the relay
    async fn shutdown(&self) {
        info!("Shutting down Liveroom server...");

        // 1. Ask every connection to close, then wait for them to drain
        let drain_timeout = Duration::from_secs(self.config.server.drain_timeout_seconds);
        let drain_poll_interval = Duration::from_millis(500);
        let active = self.state.registry.stats().await.connections;
        if active > 0 {
            info!(
                "Waiting up to {}s for {} active connection(s) to drain...",
                drain_timeout.as_secs(),
                active
            );
            self.state.registry.close_all();

            let deadline = tokio::time::Instant::now() + drain_timeout;
            loop {
                let remaining = self.state.registry.stats().await.connections;
                if remaining == 0 {
                    info!("All connections drained");
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(
                        "Drain timeout reached with {} connection(s) still active, proceeding with shutdown",
                        remaining
                    );
                    break;
                }
                tokio::time::sleep(drain_poll_interval).await;
            }
        }

        // 2. Close all relay rooms
        info!("Shutting down relay manager...");
        self.state.relay.shutdown().await;

        info!("Liveroom server shut down");
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
