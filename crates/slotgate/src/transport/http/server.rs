//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::tuner::WorkerTuner;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// If true, ignore SIGTERM and stop only on SIGINT or the shutdown token.
    pub await_explicit_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5070,
            await_explicit_shutdown: false,
        }
    }
}

/// Serve the control surface for `tuner` until a signal or `shutdown` fires.
pub async fn serve(
    config: ServerConfig,
    tuner: Arc<WorkerTuner>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = routes(tuner);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Starting slotgate control server on {}", actual_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.await_explicit_shutdown, shutdown.clone()))
        .await?;

    // Let background tasks tied to the token (leak watchdog) stop too.
    shutdown.cancel();
    info!("Server shutdown complete");

    Ok(())
}

/// Wait for SIGTERM, SIGINT, or the shutdown token.
async fn shutdown_signal(await_explicit_shutdown: bool, shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await
        }
    };

    #[cfg(unix)]
    let terminate = async {
        if await_explicit_shutdown {
            tracing::info!("await_explicit_shutdown enabled, ignoring SIGTERM");
            std::future::pending::<()>().await
        } else {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await
                }
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = {
        let _ = await_explicit_shutdown;
        std::future::pending::<()>()
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown requested, stopping control server...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunerConfig;

    #[test]
    fn server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5070);
        assert!(!config.await_explicit_shutdown);
    }

    #[tokio::test]
    async fn cancelled_token_stops_server() {
        let tuner = Arc::new(WorkerTuner::from_config(TunerConfig::default()).unwrap());
        let shutdown = CancellationToken::new();
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            await_explicit_shutdown: true,
        };

        let server = tokio::spawn(serve(config, tuner, shutdown.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        shutdown.cancel();

        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bad_address_is_an_error() {
        let tuner = Arc::new(WorkerTuner::from_config(TunerConfig::default()).unwrap());
        let config = ServerConfig {
            host: "not an address".to_string(),
            port: 1,
            await_explicit_shutdown: false,
        };
        assert!(serve(config, tuner, CancellationToken::new()).await.is_err());
    }
}
