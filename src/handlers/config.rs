use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// The effective configuration after defaults, `config.toml` and environment
/// overrides were applied. Read-only: changes need a restart.
pub async fn get_config(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": state.config.as_ref()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_config_reports_effective_values() {
        let (state, _dir) = test_state(7).await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(crate::handlers::routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["scheduler"]["max_queue_depth"], 7);
        assert_eq!(body["config"]["storage"]["backend"], "memory");
        assert_eq!(body["config"]["models"]["backend"], "simulated");
    }
}
