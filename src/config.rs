//! # Configuration Management
//!
//! Loads the service configuration from layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` in the working directory
//! - Environment variables with the `APP_` prefix
//! - The bare `HOST` / `PORT` variables most deployment platforms set
//!
//! ## Environment Variable Examples:
//! Nested keys are separated by a double underscore so that multi-word
//! field names survive:
//! - `APP_SCHEDULER__WORKER_COUNT=8` → `scheduler.worker_count`
//! - `APP_MODELS__BACKEND=remote` → `models.backend`
//! - `APP_MODELS__PRELOAD=tiny,base` → `models.preload`
//! - `APP_STORAGE__SQLITE_PATH=/var/lib/jobs.db` → `storage.sqlite_path`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT`
//! 2. `APP_*` environment variables
//! 3. `config.toml`
//! 4. Defaults

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::jobs::SchedulerSettings;
use crate::transcription::ModelSize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Which engine computes transcripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelBackend {
    /// Canned transcripts after a fixed delay; no model weights needed
    Simulated,
    /// A Whisper HTTP service at `remote_url`
    Remote,
}

/// Model pool settings.
///
/// ## Fields:
/// - `default_size`: size used when an upload does not ask for one
/// - `max_loaded_instances`: hard cap on loaded instances, and therefore on
///   concurrent transcription calls
/// - `preload`: sizes to warm at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub default_size: ModelSize,
    pub max_loaded_instances: usize,
    pub preload: Vec<ModelSize>,
    pub backend: ModelBackend,
    pub remote_url: String,
    pub simulated_delay_ms: u64,
}

/// Execution pool and admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    pub max_queue_depth: usize,
    /// Deadline for model acquisition plus the transcription call
    pub job_timeout_secs: u64,
    /// PROCESSING jobs older than this are failed by the sweep
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
    pub cas_retry_limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub sqlite_path: String,
}

/// Largest accepted `upload.max_file_size_mb` (4 GiB).
pub const MAX_UPLOAD_SIZE_MB: u64 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub upload_dir: String,
    pub max_file_size_mb: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            models: ModelsConfig {
                default_size: ModelSize::Base,
                max_loaded_instances: 2,
                preload: Vec::new(),
                backend: ModelBackend::Simulated,
                remote_url: "http://127.0.0.1:8000".to_string(),
                simulated_delay_ms: 2000,
            },
            scheduler: SchedulerConfig {
                worker_count: 4,
                max_queue_depth: 100,
                job_timeout_secs: 300,
                stale_after_secs: 600,
                sweep_interval_secs: 30,
                cas_retry_limit: 5,
            },
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                sqlite_path: "data/jobs.db".to_string(),
            },
            upload: UploadConfig {
                upload_dir: "uploads".to_string(),
                max_file_size_mb: 25,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    pub fn load() -> Result<Self> {
        Self::load_with(config::File::with_name("config").required(false))
    }

    /// Same layering as `load`, with `file` standing in for `config.toml`.
    fn load_with<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("models.preload")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if self.models.max_loaded_instances == 0 {
            return Err(anyhow!("models.max_loaded_instances must be greater than 0"));
        }
        if self.models.backend == ModelBackend::Remote && self.models.remote_url.trim().is_empty() {
            return Err(anyhow!("models.remote_url is required for the remote backend"));
        }

        let scheduler = &self.scheduler;
        if scheduler.worker_count == 0 {
            return Err(anyhow!("scheduler.worker_count must be greater than 0"));
        }
        if scheduler.max_queue_depth == 0 {
            return Err(anyhow!("scheduler.max_queue_depth must be greater than 0"));
        }
        if scheduler.job_timeout_secs == 0 || scheduler.sweep_interval_secs == 0 {
            return Err(anyhow!("scheduler timeouts and intervals must be greater than 0"));
        }
        // A live worker must always give up before the sweep calls it lost.
        if scheduler.stale_after_secs <= scheduler.job_timeout_secs {
            return Err(anyhow!(
                "scheduler.stale_after_secs ({}) must exceed scheduler.job_timeout_secs ({})",
                scheduler.stale_after_secs,
                scheduler.job_timeout_secs
            ));
        }
        if scheduler.cas_retry_limit == 0 {
            return Err(anyhow!("scheduler.cas_retry_limit must be greater than 0"));
        }

        if self.storage.backend == StorageBackend::Sqlite && self.storage.sqlite_path.trim().is_empty() {
            return Err(anyhow!("storage.sqlite_path is required for the sqlite backend"));
        }

        if self.upload.max_file_size_mb == 0 {
            return Err(anyhow!("upload.max_file_size_mb must be greater than 0"));
        }
        if self.upload.max_file_size_mb > MAX_UPLOAD_SIZE_MB {
            return Err(anyhow!(
                "upload.max_file_size_mb must be at most {}",
                MAX_UPLOAD_SIZE_MB
            ));
        }

        Ok(())
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            max_queue_depth: config.max_queue_depth,
            job_timeout: Duration::from_secs(config.job_timeout_secs),
            stale_after: Duration::from_secs(config.stale_after_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            cas_retry_limit: config.cas_retry_limit,
        }
    }
}
