use anyhow::{Context, Result};
use gallery_service::api::start_api_server;
use gallery_service::{
    AppState, CaptionMode, CaptionStrategy, Config, DeferredCaptioning, GeminiCaptioner,
    InlineCaptioning, KafkaUploadNotifier, PgMetadataStore, S3ObjectStore,
};
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
        mode = ?config.captioning.mode,
        "Starting Caption Gallery Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let metadata_store = Arc::new(
        PgMetadataStore::connect(&config.database)
            .await
            .context("Failed to initialize metadata store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let object_store = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize S3 object store")?,
    );

    let captions = caption_strategy(&config)?;

    let api_state = AppState::new(
        object_store,
        metadata_store,
        captions,
        config.presigned_url_expiry(),
        config.upload.max_bytes,
        config.api.presign_concurrency,
    );

    let shutdown = CancellationToken::new();

    // Spawn API server task
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        let result = start_api_server(api_state, &api_config, api_shutdown.clone()).await;
        // Any server exit stops the process
        api_shutdown.cancel();
        result
    });

    info!("Gallery service started successfully");

    tokio::select! {
        _ = shutdown_signal() => info!("Shutting down gallery service"),
        _ = shutdown.cancelled() => error!("API server exited before shutdown was requested"),
    }

    shutdown.cancel();
    api_handle.await.context("API server task panicked")??;

    info!("Gallery service stopped");

    Ok(())
}

/// Build the caption strategy selected by `captioning.mode`
fn caption_strategy(config: &Config) -> Result<Arc<dyn CaptionStrategy>> {
    match config.captioning.mode {
        CaptionMode::Inline => {
            let gemini = config
                .captioning
                .gemini
                .clone()
                .context("Inline captioning requires captioning.gemini")?;
            let generator =
                GeminiCaptioner::new(gemini).context("Failed to initialize caption model client")?;
            Ok(Arc::new(InlineCaptioning::new(Arc::new(generator))))
        }
        CaptionMode::Deferred => {
            let kafka = config
                .kafka
                .as_ref()
                .context("Deferred captioning requires a kafka section")?;
            let notifier =
                KafkaUploadNotifier::new(kafka).context("Failed to initialize Kafka notifier")?;
            Ok(Arc::new(DeferredCaptioning::new(Arc::new(notifier))))
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

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
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
