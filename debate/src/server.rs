//! Server lifecycle management
//!
//! Runs the HTTP/WebSocket server and tears the registry down on exit.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use debate_core::Config;
use debate_sfu::{MediaEngine, RoomRegistry};

/// Longest wait for recorders to finalise their files and reports to be
/// delivered; longer than the recorder stop grace
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Start the configured media engine
///
/// The returned token is cancelled when the engine can no longer serve rooms.
#[cfg(feature = "mediasoup")]
pub async fn start_engine(config: &Config) -> anyhow::Result<(Arc<dyn MediaEngine>, CancellationToken)> {
    use debate_sfu::{MediasoupEngine, MediasoupSettings};

    let settings = MediasoupSettings::try_from(&config.engine)?;
    let engine = MediasoupEngine::start(settings).await?;
    let fatal = engine.fatal_token();
    Ok((Arc::new(engine), fatal))
}

#[cfg(not(feature = "mediasoup"))]
pub async fn start_engine(_config: &Config) -> anyhow::Result<(Arc<dyn MediaEngine>, CancellationToken)> {
    Err(anyhow::anyhow!("built without a media engine, enable the `mediasoup` feature"))
}

/// Debate server - owns the registry and the HTTP listener
pub struct DebateServer {
    config: Config,
    registry: Arc<RoomRegistry>,
    fatal: CancellationToken,
}

impl DebateServer {
    pub const fn new(config: Config, registry: Arc<RoomRegistry>, fatal: CancellationToken) -> Self {
        Self {
            config,
            registry,
            fatal,
        }
    }

    /// Serve until a shutdown signal, then close every room
    pub async fn start(self) -> anyhow::Result<()> {
        let shutdown = CancellationToken::new();
        let http_handle = self.start_http_server(shutdown.clone()).await?;

        info!("All servers started successfully");

        let mut worker_died = false;
        tokio::select! {
            _ = http_handle => {
                error!("HTTP server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
            () = self.fatal.cancelled() => {
                worker_died = true;
                error!("Media engine failed, shutting down");
            }
        }

        shutdown.cancel();
        self.registry.shutdown();

        if worker_died {
            // give recorders and clients a moment before the process goes
            let grace = Duration::from_millis(self.config.engine.worker_death_grace_ms);
            tokio::join!(self.registry.drain(DRAIN_TIMEOUT), tokio::time::sleep(grace));
            error!("Exiting after media worker death");
            std::process::exit(1);
        }

        if !self.registry.drain(DRAIN_TIMEOUT).await {
            warn!("Some recordings did not finish before shutdown");
        }

        info!("Debate SFU shut down complete");
        Ok(())
    }

    /// Start HTTP server with graceful shutdown support
    async fn start_http_server(&self, shutdown: CancellationToken) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        let http_address = self.config.http_address();
        let http_addr: std::net::SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;
        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;

        let router = debate_api::create_router(Arc::clone(&self.registry), self.config.server.max_message_size);

        let handle = tokio::spawn(async move {
            info!("HTTP server listening on {}", http_addr);
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!("HTTP server error: {}", e);
            }
            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
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
