use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;
use uuid::Uuid;

use super::error_response;
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub repository_id: String,
}

pub fn configure_scan_routes(cfg: &mut web::ServiceConfig) {
    cfg
        .route("", web::post().to(submit_scan))                   // POST /scan
        .route("/{job_id}", web::get().to(get_job))               // GET /scan/{jobId}
        .route("/{job_id}/cancel", web::post().to(cancel_scan));  // POST /scan/{jobId}/cancel
}

async fn submit_scan(state: web::Data<AppState>, req: web::Json<ScanRequest>) -> impl Responder {
    let repository_id = req.repository_id.trim();
    if repository_id.is_empty() {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "repositoryId is required"
        }));
    }

    match state.orchestrator.submit_scan(repository_id).await {
        Ok(job_id) => HttpResponse::Accepted().json(serde_json::json!({ "jobId": job_id })),
        Err(e) => error_response(&e),
    }
}

async fn get_job(state: web::Data<AppState>, path: web::Path<Uuid>) -> impl Responder {
    match state.orchestrator.get_job_status(path.into_inner()).await {
        Ok(job) => HttpResponse::Ok().json(job),
        Err(e) => error_response(&e),
    }
}

async fn cancel_scan(state: web::Data<AppState>, path: web::Path<Uuid>) -> impl Responder {
    match state.orchestrator.cancel_scan(path.into_inner()).await {
        Ok(job) => HttpResponse::Ok().json(job),
        Err(e) => error_response(&e),
    }
}
