use actix_web::{web, HttpResponse, Responder};

use vulnscan_core::error::CoreError;

use crate::state::AppState;

pub mod dashboard;
pub mod repository;
pub mod scan;

pub fn configure_api(cfg: &mut web::ServiceConfig) {
    cfg.service(scan_routes())
        .service(dashboard_routes())
        .service(repository_routes())
        .route("/health", web::get().to(health_check));
}

fn scan_routes() -> actix_web::Scope {
    web::scope("/scan").configure(scan::configure_scan_routes)
}

fn dashboard_routes() -> actix_web::Scope {
    web::scope("/dashboard").configure(dashboard::configure_dashboard_routes)
}

fn repository_routes() -> actix_web::Scope {
    web::scope("/repositories").configure(repository::configure_repository_routes)
}

pub async fn health_check(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "analyzer": state.orchestrator.adapter().breaker().status(),
        "staleSummaries": state.orchestrator.stale_count().await,
    }))
}

/// 将核心错误映射为 HTTP 响应
pub(crate) fn error_response(err: &CoreError) -> HttpResponse {
    let body = serde_json::json!({ "error": err.to_string() });
    match err {
        CoreError::AlreadyRunning { job_id, .. } => HttpResponse::Conflict().json(serde_json::json!({
            "error": err.to_string(),
            "jobId": job_id,
        })),
        CoreError::JobTerminal { .. } => HttpResponse::Conflict().json(body),
        CoreError::NotFound(_) => HttpResponse::NotFound().json(body),
        CoreError::Persistence(_) => {
            tracing::error!("Storage unavailable: {}", err);
            HttpResponse::ServiceUnavailable().json(body)
        }
        _ => {
            tracing::error!("Request failed: {}", err);
            HttpResponse::InternalServerError().json(body)
        }
    }
}
