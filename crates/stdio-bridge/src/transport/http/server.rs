//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::service::RelayService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

/// Start the HTTP server with provided service.
///
/// Returns after a shutdown signal, once in-flight requests have drained and
/// the subprocess has been stopped.
pub async fn serve(config: ServerConfig, service: Arc<RelayService>) -> anyhow::Result<()> {
    let app = routes(Arc::clone(&service));

    let listener = TcpListener::bind(config.addr()?).await?;
    let actual_addr = listener.local_addr()?;

    info!(addr = %actual_addr, "Bridge listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&service)))
        .await?;

    info!("Server shutdown complete");

    service.shutdown().await;

    Ok(())
}

/// Wait for SIGTERM or SIGINT.
///
/// Pending relays are failed as soon as the signal arrives so that graceful
/// drain does not wait out their deadlines.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This only happens when the
/// tokio runtime is misconfigured, which should fail fast at startup.
async fn shutdown_signal(service: Arc<RelayService>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    service.shutdown().await;
}
