// VulnScan Web Backend
// HTTP 接口、SQLite 持久化与进程启动

pub mod api;
pub mod state;
pub mod store;

use vulnscan_core::config::ScanConfig;

pub const DEFAULT_BIND: &str = "0.0.0.0:8000";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://vulnscan.db";
pub const DEFAULT_LOG_FILTER: &str = "vulnscan_web=debug,vulnscan_core=debug,actix_web=info";

/// Loads the YAML file named by `VULNSCAN_CONFIG` (defaults otherwise) and
/// applies `VULNSCAN_*` environment overrides.
pub fn load_config() -> anyhow::Result<ScanConfig> {
    let mut config = match std::env::var("VULNSCAN_CONFIG") {
        Ok(path) => {
            tracing::info!("Loading config from {}", path);
            ScanConfig::load(&path)?
        }
        Err(_) => ScanConfig::default(),
    };
    config.apply_env()?;
    Ok(config)
}
