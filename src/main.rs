use podgate::config;
use podgate::metrics;
use podgate::reconciler;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const DEFAULT_METRICS_PORT: u16 = 9999;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("podgate=debug".parse().expect("valid log directive")),
        )
        .init();

    info!(name = PKG_NAME, version = VERSION, "Starting ticket proxy");

    let namespace = config::namespace();
    info!(namespace = %namespace, "Watching namespace");

    let client = kube::Client::try_default().await.map_err(|e| {
        error!(error = %e, "Failed to create Kubernetes client");
        e
    })?;

    let metrics_port: u16 = std::env::var("PODGATE_METRICS_PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(DEFAULT_METRICS_PORT);

    // a taken metrics port is a deployment error; fail loudly
    let metrics_listener = match TcpListener::bind(("0.0.0.0", metrics_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port = metrics_port, error = %e, "Failed to bind metrics port");
            std::process::exit(1);
        }
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics_handle = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::run_metrics_server(metrics_listener, shutdown_rx).await {
                error!(error = %e, "Metrics server error");
            }
        })
    };

    let controller_handle = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(reconciler::run_deployment_controller(
            client,
            namespace,
            shutdown_rx,
        ))
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and let the controller drain every application
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(30), controller_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), metrics_handle).await;

    info!("Shutdown complete");
    Ok(())
}
