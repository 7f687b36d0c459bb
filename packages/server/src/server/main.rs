// Main entry point for the runner orchestrator

use std::sync::Arc;

use anyhow::{Context, Result};
use server_core::kernel::{schedules, Orchestrator};
use server_core::server::build_app;
use server_core::telemetry::{LogEventSink, LogMetricsSink};
use server_core::Config;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting runner orchestrator");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Wire the kernel
    let events = Arc::new(LogEventSink);
    let metrics = Arc::new(LogMetricsSink);
    let port = config.port;
    let default_image = config.runner.default_image.clone();
    let default_max_attempts = config.dispatch.max_attempts_default as i32;
    let orchestrator = Orchestrator::build(config, pool.clone(), events, metrics)
        .context("Failed to build orchestrator")?;

    // Reclaim whatever the previous process left behind
    orchestrator
        .recover()
        .await
        .context("Startup recovery failed")?;

    // Component lifecycles
    let host = orchestrator.into_host()?;
    let health = host.health();
    let shutdown = CancellationToken::new();

    let host_shutdown = shutdown.clone();
    let host_task = tokio::spawn(host.run_until(host_shutdown));

    // Cron schedules
    let mut scheduler = schedules::start_scheduler(
        pool,
        Arc::clone(&orchestrator.store),
        Arc::clone(&orchestrator.engine),
        default_image,
        default_max_attempts,
    )
    .await
    .context("Failed to start schedules")?;

    // HTTP edge (webhook intake last in the startup order)
    let app = build_app(Arc::clone(&orchestrator), health);
    let addr = format!("0.0.0.0:{port}");
    tracing::info!("Listening on {addr}");
    tracing::info!("Webhook endpoint: http://localhost:{port}/webhooks/ci");
    tracing::info!("Health check: http://localhost:{port}/health");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                }
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await
        .context("Server error")?;

    // Intake is down; drain the rest in reverse order.
    shutdown.cancel();
    let _ = scheduler.shutdown().await;
    host_task.await.context("Service host task failed")??;

    tracing::info!("Orchestrator stopped");
    Ok(())
}
