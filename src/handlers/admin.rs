//! Retention purge for finished jobs.

use actix_web::{web, HttpResponse};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PurgeQuery {
    pub older_than_hours: i64,
}

/// Delete COMPLETED, FAILED and CANCELLED jobs that finished more than
/// `older_than_hours` ago. Pending and running jobs are never touched.
pub async fn purge_jobs(state: web::Data<AppState>, query: web::Query<PurgeQuery>) -> AppResult<HttpResponse> {
    if query.older_than_hours < 0 {
        return Err(AppError::ValidationError("older_than_hours must not be negative".to_string()));
    }

    let cutoff = Duration::try_hours(query.older_than_hours)
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .ok_or_else(|| AppError::ValidationError("older_than_hours is out of range".to_string()))?;

    let purged = state.service.purge_terminal_before(cutoff).await?;

    Ok(HttpResponse::Ok().json(json!({
        "purged": purged,
        "cutoff": cutoff,
        "timestamp": Utc::now().to_rfc3339()
    })))
}
