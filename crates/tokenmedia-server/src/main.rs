//! Token Media Server - Main entry point

use anyhow::{Context, Result};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokenmedia_common::logging::{init_logging, LogConfig};
use tokio::signal;
use tracing::info;

use tokenmedia_server::{
    api::{self, AppState},
    config::Config,
    db::{self, PgRepository, TokenRepository},
    media::{transport::build_http_client, FfmpegTranscoder, Transport},
    pipeline::{PgTokenLock, TokenProcessor},
    providers::ProviderRegistry,
    storage::{artifacts::ArtifactWriter, Storage},
    tasks::TaskClient,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Environment variables take precedence over the service defaults
    let log_config = LogConfig::for_service("tokenmedia-server")
        .merge_env()
        .context("Invalid LOG_* configuration")?;
    init_logging(&log_config)?;

    info!("Starting Token Media Server");

    // Load configuration
    let config = Config::load()?;
    info!(
        environment = %config.environment,
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    // Initialize database connection pool
    let db_pool = db::create_pool(&config.database)
        .await
        .context("Failed to connect to the database")?;
    info!("Database connection pool established");

    // Run migrations
    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
    info!("Database migrations completed");

    // Shared per-process clients
    let http = build_http_client().context("Failed to build HTTP client")?;
    let storage = Storage::new(config.storage.clone()).await?;
    let transcoder = FfmpegTranscoder::from_config(&config.media)
        .context("ffmpeg and ffprobe are required for media processing")?;

    let repository: Arc<dyn TokenRepository> = Arc::new(PgRepository::new(db_pool.clone()));
    let processor = TokenProcessor::new(
        Arc::new(ProviderRegistry::from_config(http.clone(), &config.providers)),
        Arc::new(Transport::new(http.clone(), &config.media)),
        Arc::new(transcoder),
        ArtifactWriter::new(Arc::new(storage), http.clone()),
        repository.clone(),
        Arc::new(PgTokenLock::new(db_pool)),
    );

    let state = AppState {
        repository,
        processor: Arc::new(processor),
        tasks: Arc::new(TaskClient::new(http, &config.tasks)),
        webhook_secrets: Arc::new(config.webhooks.secrets.clone()),
    };

    // Build the application router
    let app = api::create_router(state);

    // Create socket address
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    // Create TCP listener
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    info!("Server shut down gracefully");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    // In-flight task deliveries are redelivered by the queue if cut short
    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
