use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::sync::Arc;

use vulnscan_core::config::ScanConfig;
use vulnscan_core::{
    Analyzer, DashboardSummaryBuilder, DirectoryUnitSource, HttpAnalyzer, ScanOrchestrator,
    UnitSource,
};

use crate::store::SqliteStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub orchestrator: ScanOrchestrator,
    pub summaries: Arc<DashboardSummaryBuilder>,
}

impl AppState {
    pub async fn new(config: &ScanConfig, database_url: &str) -> anyhow::Result<Self> {
        // 初始化分析器
        let analyzer = HttpAnalyzer::from_config(&config.analyzer)?;
        tracing::info!(models = ?analyzer.models(), "analyzer configured");

        // 初始化数据库
        let db = init_db(database_url).await?;

        let source = DirectoryUnitSource::new(config.units.clone());
        Ok(Self::with_parts(config, db, Arc::new(analyzer), Arc::new(source)))
    }

    /// Wires the state around an existing pool and explicit collaborators.
    pub fn with_parts(
        config: &ScanConfig,
        db: Pool<Sqlite>,
        analyzer: Arc<dyn Analyzer>,
        source: Arc<dyn UnitSource>,
    ) -> Self {
        let store = Arc::new(SqliteStore::new(db));
        let orchestrator = ScanOrchestrator::new(config, store.clone(), source, analyzer);
        let summaries = Arc::new(DashboardSummaryBuilder::new(store.clone()));
        Self {
            store,
            orchestrator,
            summaries,
        }
    }
}

pub async fn init_db(database_url: &str) -> anyhow::Result<Pool<Sqlite>> {
    tracing::info!("Database: {}", database_url);

    // 使用 SqliteConnectOptions 来确保数据库文件可以被创建
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    // 内存数据库每个连接都是独立的库，只能保留一个长连接
    let in_memory = database_url.contains(":memory:");
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };

    let pool = pool_options
        .connect_with(options)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    // 创建表
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            source TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_scanned_at TEXT
        );

        CREATE TABLE IF NOT EXISTS scan_jobs (
            id TEXT PRIMARY KEY,
            repository_id TEXT NOT NULL,
            state TEXT NOT NULL,
            created_at TEXT NOT NULL,
            completed_at TEXT,
            snapshot TEXT NOT NULL,
            FOREIGN KEY(repository_id) REFERENCES repositories(id)
        );

        CREATE INDEX IF NOT EXISTS idx_scan_jobs_repository ON scan_jobs(repository_id);

        CREATE TABLE IF NOT EXISTS findings (
            id TEXT PRIMARY KEY,
            scan_job_id TEXT NOT NULL,
            repository_id TEXT NOT NULL,
            unit_id TEXT NOT NULL,
            severity TEXT NOT NULL,
            category TEXT NOT NULL,
            file_path TEXT NOT NULL,
            line INTEGER,
            description TEXT NOT NULL,
            raw_severity TEXT NOT NULL,
            needs_review INTEGER NOT NULL DEFAULT 0,
            cwe TEXT,
            owasp TEXT,
            recommendation TEXT,
            original_code TEXT,
            fix_code TEXT,
            compliance_impact TEXT,
            fingerprint TEXT NOT NULL,
            detected_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_findings_job ON findings(scan_job_id);

        CREATE TABLE IF NOT EXISTS severity_summaries (
            repository_id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            critical INTEGER NOT NULL DEFAULT 0,
            high INTEGER NOT NULL DEFAULT 0,
            medium INTEGER NOT NULL DEFAULT 0,
            low INTEGER NOT NULL DEFAULT 0,
            total INTEGER NOT NULL DEFAULT 0,
            computed_at TEXT NOT NULL,
            scanned_at TEXT NOT NULL
        );
        "#,
    )
    .execute(&pool)
    .await
    .map_err(|e| anyhow::anyhow!("Failed to create tables: {}", e))?;

    tracing::info!("Database initialized successfully");

    Ok(pool)
}
