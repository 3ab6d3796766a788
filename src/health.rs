//! # Health and Metrics Endpoints
//!
//! - `GET /health`: liveness plus a quick view of the job engine
//! - `GET /metrics`: per-endpoint request statistics
//!
//! ## Load Levels:
//! Health reports `degraded` once the admission queue is more than 90%
//! full, since new submissions are about to be turned away.

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::jobs::SchedulerStats;
use crate::state::AppState;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics_snapshot();
    let scheduler = state.service.stats();
    let models = state.service.models().summary();
    let queue_usage = queue_usage(&scheduler);

    let status = if queue_usage > 0.9 { "degraded" } else { "healthy" };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": state.config.server.host,
            "port": state.config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate()
        },
        "jobs": {
            "queue_depth": scheduler.queue_depth,
            "max_queue_depth": scheduler.max_queue_depth,
            "queue_usage_percent": (queue_usage * 100.0).round(),
            "running": scheduler.running_jobs,
            "workers": scheduler.workers,
            "store": scheduler.store_backend
        },
        "models": {
            "backend": models.backend,
            "capacity": models.capacity,
            "loaded": models.loaded,
            "leased": models.leased
        },
        "memory": get_memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics_snapshot();
    let uptime_seconds = state.uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "scheduler": state.service.stats(),
        "memory": get_memory_info()
    }))
}

fn queue_usage(stats: &SchedulerStats) -> f64 {
    if stats.max_queue_depth > 0 {
        stats.queue_depth as f64 / stats.max_queue_depth as f64
    } else {
        0.0
    }
}

/// Resident and virtual memory of this process, where the platform exposes it.
fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
            let field_bytes = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map_or(0, |kb| kb * 1024)
            };

            return json!({
                "resident_memory_bytes": field_bytes("VmRSS:"),
                "virtual_memory_bytes": field_bytes("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}
