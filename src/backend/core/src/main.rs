//! Fanout Node - Main entry point
//!
//! Runs a single jobs node with the built-in job types registered.

use std::sync::Arc;

use fanout_core::{
    config::Config,
    decomposer::{
        EntityFanoutDecomposer, EntityTaskProcessor, InMemoryEntityDirectory,
        LoggingEntityHandler, SyntheticDecomposer, SyntheticTaskProcessor,
    },
    node::JobsNode,
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = match std::env::var("FANOUT_CONFIG") {
        Ok(path) => Config::from_file(&path),
        Err(_) => Config::load(),
    }
    .unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    let telemetry = telemetry::init_telemetry(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        node_id = %config.node.node_id,
        "Starting Fanout node"
    );

    let directory = Arc::new(InMemoryEntityDirectory::new());
    let handler = Arc::new(LoggingEntityHandler::new());

    let node = JobsNode::builder(config.clone())
        .register(
            Arc::new(SyntheticDecomposer::new()),
            Arc::new(SyntheticTaskProcessor::new()),
        )?
        .register(
            Arc::new(EntityFanoutDecomposer::new(directory, &config.jobs)),
            Arc::new(EntityTaskProcessor::new(handler, &config.jobs)),
        )?
        .build()?;

    node.start()?;

    shutdown_signal().await;

    node.stop().await;
    telemetry.shutdown();
    tracing::info!("Node shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received");
}
