//! # Model Pool Handlers
//!
//! Inspect and manage the loaded model instances.
//!
//! ## Endpoints:
//! - `GET /models`: per-size idle/leased counts and usage metrics
//! - `POST /models/{size}/load`: warm one instance ahead of traffic
//! - `POST /models/{size}/evict`: drop idle instances of a size
//!
//! Instances currently leased to a worker are never evicted; they return to
//! the pool when their job finishes.

use actix_web::{web, HttpResponse};
use serde_json::json;
use std::time::Instant;

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::transcription::ModelSize;

fn parse_size(raw: &str) -> AppResult<ModelSize> {
    raw.parse::<ModelSize>()
        .map_err(|e| AppError::ValidationError(e.to_string()))
}

pub async fn list_models(state: web::Data<AppState>) -> HttpResponse {
    let summary = state.service.models().summary();
    let usage: Vec<_> = summary
        .models
        .iter()
        .filter(|model| model.metrics.total_requests > 0)
        .map(|model| {
            json!({
                "size": model.size,
                "success_rate": model.metrics.success_rate(),
                "average_processing_time_ms": model.metrics.average_processing_time_ms()
            })
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "default_size": state.config.models.default_size,
        "registry": summary,
        "usage": usage
    }))
}

pub async fn load_model(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let size = parse_size(&path)?;
    let start_time = Instant::now();

    state.service.models().preload(size).await?;
    let load_time = start_time.elapsed();
    tracing::info!(model = %size, load_ms = load_time.as_millis() as u64, "Model warmed on request");

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("Whisper {} model is loaded", size),
        "model_size": size,
        "size_mb": size.size_mb(),
        "load_time_seconds": load_time.as_secs_f64()
    })))
}

pub async fn evict_model(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let size = parse_size(&path)?;
    let evicted = state.service.models().evict_idle(size);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("Evicted {} idle {} instance(s)", evicted, size),
        "model_size": size,
        "evicted": evicted
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::test_state;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_load_list_and_evict() {
        let (state, _dir) = test_state(8).await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(crate::handlers::routes),
        )
        .await;

        let req = test::TestRequest::post().uri("/api/v1/models/tiny/load").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let req = test::TestRequest::get().uri("/api/v1/models").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["registry"]["loaded"], 1);
        assert_eq!(body["default_size"], "base");

        let req = test::TestRequest::post().uri("/api/v1/models/tiny/evict").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["evicted"], 1);
        assert_eq!(state.service.models().summary().loaded, 0);
    }

    #[actix_web::test]
    async fn test_unknown_size_is_rejected() {
        let (state, _dir) = test_state(8).await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(crate::handlers::routes),
        )
        .await;

        let req = test::TestRequest::post().uri("/api/v1/models/huge/load").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }
}
