use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vulnscan_web::state::AppState;
use vulnscan_web::{api, load_config, DEFAULT_BIND, DEFAULT_DATABASE_URL, DEFAULT_LOG_FILTER};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config()?;
    let database_url =
        std::env::var("VULNSCAN_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

    // 初始化状态
    let state = AppState::new(&config, &database_url).await?;

    // 后台修复写入失败的汇总
    let _reconciler = state.orchestrator.spawn_reconciler();

    // 启动服务器
    let bind_address = std::env::var("VULNSCAN_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    tracing::info!("VulnScan server listening on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(Cors::permissive())
            .wrap(TracingLogger::default())
            .configure(api::configure_api)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
