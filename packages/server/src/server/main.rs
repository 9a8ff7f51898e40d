// Main entry point for the submission core

use std::sync::Arc;

use anyhow::{Context, Result};
use classifier::{ClassifierOptions, ClassifierService};
use fraudwatch_core::domains::submissions::data::PostgresSubmissionStore;
use fraudwatch_core::kernel::{ClassifierAdapter, EventBus, LocalObjectStorage, ServerDeps};
use fraudwatch_core::server::{build_app, AppSettings, AppState, FileServing};
use fraudwatch_core::Config;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fraudwatch_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting fraudwatch submission core");

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

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.upload_dir.display()))?;

    let classifier = ClassifierService::new(ClassifierOptions {
        base_url: config.classifier_base_url.clone(),
    });
    let deps = ServerDeps::new(
        Arc::new(PostgresSubmissionStore::new(pool)),
        Arc::new(ClassifierAdapter::new(Arc::new(classifier))),
        Arc::new(
            LocalObjectStorage::new(config.upload_dir.clone(), config.public_base_url.clone())
                .with_url_secret(config.files_url_secret.as_bytes()),
        ),
        EventBus::new(config.event_bus_config()),
    );

    let (state, runner) = AppState::new(
        deps.clone(),
        AppSettings {
            webhook_secret: config.webhook_secret.clone(),
            dispatch: config.dispatch_config(),
            max_dispatch_attempts: config.dispatch_max_attempts,
            upload_max_bytes: config.upload_max_bytes,
        },
    );

    // Background tasks
    let shutdown = CancellationToken::new();
    let runner_handle = tokio::spawn(runner.run(shutdown.clone()));
    let heartbeat_handle = deps.event_bus.spawn_heartbeat(shutdown.clone());

    let recovered = state
        .dispatcher
        .recover()
        .await
        .context("Failed to recover pending submissions")?;
    tracing::info!(recovered, "Dispatch queue primed");

    let files = FileServing {
        dir: config.upload_dir.clone(),
        url_secret: Arc::from(config.files_url_secret.as_bytes()),
    };
    let app = build_app(state, &config.allowed_origins, Some(files));

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    let _ = tokio::join!(runner_handle, heartbeat_handle);
    tracing::info!("Server stopped");

    Ok(())
}
