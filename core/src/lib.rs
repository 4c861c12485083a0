// VulnScan Core Library
// 核心功能库，包含扫描编排、模型调用、漏洞归一化与严重度聚合

pub mod analyzer;
pub mod config;
pub mod finding;
pub mod job;
pub mod orchestrator;
pub mod store;
pub mod summary;
pub mod units;

// 重新导出常用类型
pub use analyzer::{
    adapter::ModelAdapter, breaker::CircuitBreaker, http::HttpAnalyzer, Analyzer, AnalyzerError,
    AnalyzerOutput, RawFinding, ScanUnit,
};
pub use config::ScanConfig;
pub use finding::{
    aggregator::{aggregate, SeveritySummary},
    normalizer::FindingNormalizer,
    Finding, Location, Severity,
};
pub use job::{JobError, JobId, JobState, ScanJob, UnitResult, UnitStatus};
pub use orchestrator::ScanOrchestrator;
pub use store::{memory::MemoryStore, Repository, RepositoryId, ScanStore, StoreError, SummaryRecord};
pub use summary::{DashboardSummaryBuilder, SummaryScope, SummaryView};
pub use units::{DirectoryUnitSource, UnitSource};

pub mod error {
    use crate::analyzer::AnalyzerError;
    use crate::job::{JobId, JobState};
    use crate::store::StoreError;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum CoreError {
        #[error("a scan is already running for repository {repository_id} (job {job_id})")]
        AlreadyRunning { repository_id: String, job_id: JobId },

        #[error("{0} not found")]
        NotFound(String),

        #[error("job {job_id} is already {state}")]
        JobTerminal { job_id: JobId, state: JobState },

        #[error("invalid job transition {from} -> {to}")]
        InvalidTransition { from: JobState, to: JobState },

        #[error("cannot decompose repository: {0}")]
        Decomposition(String),

        #[error("analyzer error: {0}")]
        Analyzer(#[from] AnalyzerError),

        #[error("persistence failure: {0}")]
        Persistence(#[from] StoreError),

        #[error("config error: {0}")]
        Config(String),

        #[error("IO error: {0}")]
        Io(#[from] std::io::Error),
    }

    pub type Result<T> = std::result::Result<T, CoreError>;
}
