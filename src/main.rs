//! rfq-sync service binary.
//!
//! Loads configuration from the environment, connects Redis (lock + id cache
//! + stream bus) and Postgres, then consumes until Ctrl-C or SIGTERM.

use anyhow::{Context, Result};
use rfq_sync::config::LogFormat;
use rfq_sync::{
    CircuitBreaker, CircuitConfig, ConsumerOptions, OrchestratorOptions, PgRecordGateway,
    RedisStore, RedisStreamBus, RetryConfig, SyncConfig, SyncConsumer, SyncOrchestrator,
    SyncPolicy,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = SyncConfig::from_env().context("Failed to load configuration")?;
    init_logging(config.log_format);

    tracing::info!(
        service = %config.service_name,
        consumer = %config.bus.consumer_name,
        "Starting rfq-sync"
    );

    let startup = RetryConfig::startup();
    let store = Arc::new(
        RedisStore::connect(&config.store.url, &startup)
            .await
            .context("Failed to connect shared store")?,
    );

    let gateway = Arc::new(
        PgRecordGateway::connect(&config.database)
            .await
            .context("Failed to connect destination database")?,
    );
    gateway
        .ensure_schema()
        .await
        .context("Failed to prepare destination schema")?;

    let bus = Arc::new(
        RedisStreamBus::connect(&config.bus, &startup)
            .await
            .context("Failed to connect message bus")?,
    );

    let policy = SyncPolicy::new(
        Arc::new(CircuitBreaker::new("rfq_sync", CircuitConfig::from(&config.circuit))),
        RetryConfig::from(&config.retry),
    );
    let options = OrchestratorOptions {
        key_prefix: config.store.key_prefix.clone(),
        lock_ttl: config.store.lock_ttl(),
        mapping_ttl: config.store.mapping_ttl(),
        source_system: config.source_system.clone(),
    };
    let orchestrator = Arc::new(SyncOrchestrator::new(store, gateway.clone(), policy, options));

    let mut consumer = SyncConsumer::new(orchestrator, bus, ConsumerOptions::from_config(&config));
    consumer.start().await.context("Failed to start consumer")?;

    wait_for_shutdown_signal().await;

    consumer.shutdown().await;
    gateway.close().await;

    tracing::info!("Goodbye!");
    Ok(())
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rfq_sync=debug"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_line_number(true),
            )
            .init(),
    }
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
