//! # Transcription Jobs - Main Application Entry Point
//!
//! HTTP front end for the transcription job engine. Audio uploads become
//! jobs that a bounded worker pool runs against a pool of loaded Whisper
//! model instances; clients poll for status and fetch the transcript.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **jobs**: job store, admission queue, worker pool, stuck-job sweep
//! - **transcription**: model sizes, backends and the model registry
//! - **upload**: audio validation and storage
//! - **state**: shared application state and request metrics
//! - **health**: health and metrics endpoints
//! - **middleware**: request logging with correlation ids, metrics
//! - **handlers**: HTTP request handlers for the `/api/v1` API
//! - **error**: HTTP error type and status mapping

mod config;
mod error;
mod handlers;
mod health;
mod jobs;
mod middleware;
mod state;
mod transcription;
mod upload;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{AppConfig, ModelBackend, StorageBackend};
use jobs::{InMemoryJobStore, JobStore, SchedulerSettings, SqliteJobStore, TranscriptionService};
use state::AppState;
use transcription::remote::RemoteWhisperBackend;
use transcription::simulated::SimulatedBackend;
use transcription::{ModelRegistry, TranscriptionBackend};

/// ## What this function does:
/// 1. Loads and validates configuration
/// 2. Builds the model registry and job store the config asks for
/// 3. Starts the job service (recovering PENDING jobs from a durable store)
/// 4. Serves HTTP until SIGINT/SIGTERM, then drains the workers
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting transcription-jobs v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        backend = ?config.models.backend,
        store = ?config.storage.backend,
        workers = config.scheduler.worker_count,
        "Configuration loaded"
    );

    let service = start_service(&config).await?;
    preload_models(&service, &config).await;

    let app_state = AppState::new(config.clone(), Arc::clone(&service));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware runs in reverse registration order for requests
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .configure(handlers::routes)
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    service.shutdown().await;
    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls verbosity; defaults to
/// `transcription_jobs=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcription_jobs=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

async fn start_service(config: &AppConfig) -> Result<Arc<TranscriptionService>> {
    let backend: Arc<dyn TranscriptionBackend> = match config.models.backend {
        ModelBackend::Simulated => Arc::new(SimulatedBackend::new(Duration::from_millis(
            config.models.simulated_delay_ms,
        ))),
        ModelBackend::Remote => Arc::new(RemoteWhisperBackend::new(config.models.remote_url.clone())?),
    };
    let models = Arc::new(ModelRegistry::new(backend, config.models.max_loaded_instances));

    let store: Arc<dyn JobStore> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(InMemoryJobStore::new()),
        StorageBackend::Sqlite => {
            info!(path = %config.storage.sqlite_path, "Opening SQLite job store");
            Arc::new(SqliteJobStore::open(&config.storage.sqlite_path)?)
        }
    };

    let service = TranscriptionService::start(store, models, SchedulerSettings::from(&config.scheduler)).await?;
    Ok(service)
}

/// Warm the configured sizes. A size that fails to load is logged and left
/// to load on first use.
async fn preload_models(service: &TranscriptionService, config: &AppConfig) {
    for size in &config.models.preload {
        match service.models().preload(*size).await {
            Ok(()) => info!(model = %size, "Preloaded model"),
            Err(e) => warn!(model = %size, error = %e, "Could not preload model"),
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Could not install signal handlers, falling back to Ctrl+C");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Could not listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
