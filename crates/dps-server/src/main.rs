//! DPS Server - Main entry point

use anyhow::Result;
use dps_common::logging::{init_logging, LogConfig};
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use dps_server::{
    api::{self, AppState},
    config::{Config, SourceBackend},
    inbound::{InboundConsumer, InboundSender},
    notify::{run_event_sink, EventEmitter, WebhookForwarder},
    orchestrator::SubmissionOrchestrator,
    storage::{config::StorageConfig, ByteSource, LocalFileSource, Storage},
    store::PgStore,
    transport::{FtpTransport, ObjectStoreTransport, SwordTransport, TransportRegistry},
    updater::DepositUpdater,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with configuration from environment
    let log_config = LogConfig::builder()
        .log_file_prefix("dps-server")
        .filter_directives("dps_server=debug,tower_http=debug,sqlx=info,aws_config=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    info!("Starting DPS Server");

    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    let db_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .connect(&config.database.url)
        .await?;

    info!("Database connection pool established");

    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    info!("Database migrations completed");

    let store = Arc::new(PgStore::new(db_pool.clone()));

    let source: Arc<dyn ByteSource> = match config.source.backend {
        SourceBackend::Local => {
            info!(root = %config.source.root.display(), "Reading submission files from local disk");
            Arc::new(LocalFileSource::new(&config.source.root))
        },
        SourceBackend::S3 => {
            let storage = Storage::new(StorageConfig::from_env()?);
            info!(bucket = storage.bucket(), "Reading submission files from object storage");
            Arc::new(storage)
        },
    };

    let transport_timeout = Duration::from_secs(config.transport.timeout_secs);
    let transports = Arc::new(
        TransportRegistry::new(transport_timeout)
            .with(Arc::new(FtpTransport::new(transport_timeout)))
            .with(Arc::new(SwordTransport::new()?))
            .with(Arc::new(ObjectStoreTransport::new())),
    );

    let cancel = CancellationToken::new();

    // Status-change events
    let (events, event_rx) = EventEmitter::channel(config.notify.queue_capacity);
    let webhook = config
        .notify
        .webhook_url
        .as_deref()
        .map(WebhookForwarder::new)
        .transpose()?;
    let sink_handle = tokio::spawn(run_event_sink(event_rx, webhook, cancel.clone()));

    let updater = Arc::new(DepositUpdater::new(
        store.clone(),
        transports.clone(),
        events.clone(),
        config.updater.to_updater_config(),
    ));

    let updater_handle = if config.updater.enabled {
        info!("Deposit updater is enabled, starting loop");
        Some(updater.clone().start(cancel.clone()))
    } else {
        info!("Deposit updater is disabled (DPS_UPDATER_ENABLED=false)");
        None
    };

    let orchestrator = Arc::new(SubmissionOrchestrator::new(
        store.clone(),
        store.clone(),
        source,
        config.packaging.to_assembler_config(),
        transports,
        events,
    ));

    let inbound_config = config.inbound.to_inbound_config();
    let (inbound, inbound_rx) = InboundSender::channel(inbound_config.queue_capacity);
    let consumer = Arc::new(InboundConsumer::new(orchestrator, updater, inbound_config));
    let consumer_handle = tokio::spawn(consumer.run(inbound_rx, cancel.clone()));

    let state = AppState {
        store,
        inbound,
        db: Some(db_pool),
    };
    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    // Stop background work; none of it leaves a deposit half-written
    cancel.cancel();
    if let Some(handle) = updater_handle {
        handle.await?;
    }
    consumer_handle.await?;
    sink_handle.await?;

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
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
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

    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
