use anyhow::{Context, Result};
use photo_lifecycle::api::{start_api_server, AppState};
use photo_lifecycle::config::{Backend, Config};
use photo_lifecycle::pipeline::{mailer, object_store, Backends, Pipeline};
use photo_lifecycle::store::{connect_pool, run_migrations};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        backend = ?config.service.backend,
        "Starting photo lifecycle service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let objects = object_store(&config)
        .await
        .context("Failed to initialize object store")?;
    let mailer = mailer(&config)
        .await
        .context("Failed to initialize mailer")?;

    let backends = match config.service.backend {
        Backend::Memory => Backends::in_memory_with(&config, objects, mailer),
        Backend::Postgres => {
            let pool = connect_pool(&config.database)
                .await
                .context("Failed to connect to database")?;

            // Run migrations if enabled
            if config.database.run_migrations {
                run_migrations(&pool)
                    .await
                    .context("Failed to run database migrations")?;
            }

            Backends::postgres(&config, pool, objects, mailer)
        }
    };

    let pipeline = Arc::new(Pipeline::new(&config, backends));
    let shutdown = CancellationToken::new();

    // Spawn pipeline consumers
    let pipeline_handle = {
        let pipeline = pipeline.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pipeline.run(shutdown).await })
    };

    // Spawn API server task
    let api_handle = if config.api.enabled {
        let api_state = AppState {
            pipeline: pipeline.clone(),
        };
        let api_config = config.api.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_api_server(api_state, &api_config, shutdown).await {
                error!(error = %e, "API server error");
            }
        }))
    } else {
        None
    };

    info!("Photo lifecycle service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down photo lifecycle service");

    // Let in-flight batches finish; unacknowledged messages are redelivered anyway
    shutdown.cancel();
    if let Err(e) = pipeline_handle.await {
        error!(error = %e, "Pipeline task failed");
    }
    if let Some(handle) = api_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "API task failed");
        }
    }

    info!("Photo lifecycle service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
