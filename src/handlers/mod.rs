//! # HTTP Handlers
//!
//! Route table for the `/api/v1` API. Handlers stay thin: they parse the
//! request, call `TranscriptionService` or the model registry, and let
//! `AppError` render failures.

pub mod admin;
pub mod config;
pub mod jobs;
pub mod models;

#[cfg(test)]
pub(crate) mod test_support;

use actix_web::web;

use crate::health;

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/config", web::get().to(config::get_config))
            .route("/jobs", web::post().to(jobs::submit_job))
            .route("/jobs/{id}", web::get().to(jobs::job_status))
            .route("/jobs/{id}/result", web::get().to(jobs::job_result))
            .route("/jobs/{id}/cancel", web::post().to(jobs::cancel_job))
            .route("/models", web::get().to(models::list_models))
            .route("/models/{size}/load", web::post().to(models::load_model))
            .route("/models/{size}/evict", web::post().to(models::evict_model))
            .route("/admin/purge", web::post().to(admin::purge_jobs)),
    )
    // Also provide health check at root level for convenience
    .route("/health", web::get().to(health::health_check));
}
