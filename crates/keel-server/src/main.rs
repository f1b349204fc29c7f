use anyhow::Result;
use keel_runtime::{FlowService, KernelBackend, RuntimeConfig};
use keel_server::demo::demo_registry;
use keel_server::{build_router, AppState};
use tracing_subscriber::EnvFilter;

const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:8080";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,keel_kernel=info,keel_runtime=info,keel_server=info")
        }))
        .init();

    let config = RuntimeConfig::from_env()?;
    let addr = std::env::var("KEEL_SERVER_ADDR").unwrap_or_else(|_| DEFAULT_SERVER_ADDR.into());

    let client = config.build_client();
    if config.kernel_backend == KernelBackend::Remote {
        if let Err(err) = client.connect().await {
            tracing::warn!(
                "kernel {} not reachable at startup, will retry per request: {}",
                config.kernel_address,
                err
            );
        }
    }
    let store = config.build_flow_store()?;
    let registry = demo_registry()?;
    tracing::info!(
        "keel_startup kernel_backend={:?} kernel_address={} flow_store={:?} capabilities={:?}",
        config.kernel_backend,
        config.kernel_address,
        config.flow_store,
        registry.ids()
    );
    let flows = FlowService::new(client.clone(), store, registry).with_quota(config.quota);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("keel server listening on http://{}", addr);
    axum::serve(listener, build_router(AppState::new(flows)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(err) = client.close().await {
        tracing::warn!("kernel connection did not close cleanly: {}", err);
    }
    tracing::info!("keel_shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("keel_shutdown signal received, draining connections");
}
