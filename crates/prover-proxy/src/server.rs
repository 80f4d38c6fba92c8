use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::Handle;
use prover_proxy_service::config::Config;
use prover_proxy_service::metric;
use prover_proxy_service::services::create_service;

use crate::endpoints;

/// How long in-flight requests may take to finish once a shutdown signal arrived.
///
/// Callers waiting on a proof keep their connection, the computation itself continues in the
/// background and its result lands in the store.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Starts the proof service and the HTTP server based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("prover-proxy")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    runtime.block_on(async {
        let service = create_service(&config)
            .await
            .context("failed to create proof service")?;
        let socket = config
            .bind
            .parse::<SocketAddr>()
            .context("invalid bind address")?;

        let handle = Handle::new();
        tokio::spawn(shutdown_on_signal(handle.clone()));

        tracing::info!("Starting HTTP server on {}", socket);
        axum_server::bind(socket)
            .handle(handle)
            .serve(endpoints::create_app(service.clone()).into_make_service())
            .await?;

        service.close();
        tracing::info!("System shutdown complete");
        Ok::<_, anyhow::Error>(())
    })
}

async fn shutdown_on_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "Failed to listen for SIGINT",
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to listen for SIGTERM",
                );
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping server");
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
}
