//! sandpool server entry point.
//!
//! Connects to the local Docker engine, starts the warm pool and serves
//! executions over HTTP until interrupted.

use sandpool_core::{DockerRuntime, SandboxService};
use sandpool_server::{http, AppState, ServerConfig};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("sandpool_server=info".parse()?)
                .add_directive("sandpool_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting sandpool server");

    let config = ServerConfig::from_env();
    tracing::info!(?config, "Configuration loaded");
    config.validate_warn();
    config.validate()?;

    let runtime = Arc::new(DockerRuntime::connect()?);
    let service = SandboxService::start(config.to_pool_config(), runtime)?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let state = AppState::from_service(&service);
    let http_addr = config.http_addr;
    let max_payload_bytes = config.max_payload_bytes;
    let mut http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = http::serve(state, http_addr, max_payload_bytes, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!(http_addr = %config.http_addr, "Server ready");

    // Wait for shutdown signal, or for the HTTP server to die on its own
    let http_finished = tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            tracing::info!("Received shutdown signal, cleaning up...");
            false
        }
        _ = &mut http_handle => {
            tracing::error!("HTTP server exited, shutting down");
            true
        }
    };

    if !http_finished {
        let _ = shutdown_tx.send(());
        if let Err(e) = http_handle.await {
            tracing::error!(error = %e, "HTTP task failed");
        }
    }

    service.shutdown().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}
