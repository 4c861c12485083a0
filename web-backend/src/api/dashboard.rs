use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;

use vulnscan_core::SummaryScope;

use super::error_response;
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryQuery {
    pub repository_id: Option<String>,
}

pub fn configure_dashboard_routes(cfg: &mut web::ServiceConfig) {
    cfg
        .route("/summary", web::get().to(get_summary))
        .route("/summary/{repository_id}/recompute", web::post().to(recompute_summary));
}

/// 仪表盘严重度汇总，读取失败时返回最近一次的值
async fn get_summary(state: web::Data<AppState>, query: web::Query<SummaryQuery>) -> impl Responder {
    let scope = SummaryScope::parse(query.repository_id.as_deref());
    HttpResponse::Ok().json(state.summaries.get_summary(&scope).await)
}

async fn recompute_summary(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let repository_id = path.into_inner();
    match state.summaries.recompute(&repository_id).await {
        Ok(view) => HttpResponse::Ok().json(view),
        Err(e) => error_response(&e),
    }
}
