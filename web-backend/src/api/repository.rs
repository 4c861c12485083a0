use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;
use uuid::Uuid;

use vulnscan_core::{Repository, ScanStore};

use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRepositoryRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    /// Local path of the checkout to scan.
    pub source: String,
}

pub fn configure_repository_routes(cfg: &mut web::ServiceConfig) {
    cfg
        .route("", web::post().to(create_repository))    // POST /repositories
        .route("", web::get().to(list_repositories))     // GET /repositories
        .route("/{id}", web::get().to(get_repository));  // GET /repositories/{id}
}

async fn create_repository(
    state: web::Data<AppState>,
    req: web::Json<CreateRepositoryRequest>,
) -> impl Responder {
    let name = req.name.trim();
    let source = req.source.trim();
    if name.is_empty() || source.is_empty() {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "name and source are required"
        }));
    }

    let id = req
        .id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    match state.store.get_repository(&id).await {
        Ok(Some(_)) => {
            return HttpResponse::Conflict().json(serde_json::json!({
                "error": format!("repository {} already exists", id)
            }));
        }
        Ok(None) => {}
        Err(e) => {
            tracing::error!("Failed to look up repository: {}", e);
            return HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "error": format!("Failed to look up repository: {}", e)
            }));
        }
    }

    let repository = Repository::new(id, name, source);
    match state.store.upsert_repository(&repository).await {
        Ok(()) => {
            tracing::info!("Repository registered: {} ({})", repository.id, repository.source);
            HttpResponse::Created().json(repository)
        }
        Err(e) => {
            tracing::error!("Failed to create repository: {}", e);
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "error": format!("Failed to create repository: {}", e)
            }))
        }
    }
}

async fn list_repositories(state: web::Data<AppState>) -> impl Responder {
    match state.store.list_repositories().await {
        Ok(repositories) => HttpResponse::Ok().json(repositories),
        Err(e) => {
            tracing::error!("Failed to list repositories: {}", e);
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "error": format!("Failed to list repositories: {}", e)
            }))
        }
    }
}

async fn get_repository(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let id = path.into_inner();
    match state.store.get_repository(&id).await {
        Ok(Some(repository)) => HttpResponse::Ok().json(repository),
        Ok(None) => HttpResponse::NotFound().json(serde_json::json!({
            "error": format!("repository {} not found", id)
        })),
        Err(e) => {
            tracing::error!("Failed to fetch repository: {}", e);
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "error": format!("Failed to fetch repository: {}", e)
            }))
        }
    }
}
