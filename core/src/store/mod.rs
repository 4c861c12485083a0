// Store module - 持久化接口
// 核心只依赖 ScanStore trait，具体实现由宿主进程提供

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::finding::aggregator::SeveritySummary;
use crate::finding::Finding;
use crate::job::{JobId, ScanJob};

pub type RepositoryId = String;

/// 已注册的代码仓库
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: RepositoryId,
    pub name: String,
    /// Local path of the checkout.
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub last_scanned_at: Option<DateTime<Utc>>,
}

impl Repository {
    pub fn new(id: impl Into<String>, name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source: source.into(),
            created_at: Utc::now(),
            last_scanned_at: None,
        }
    }
}

/// Latest persisted severity summary of one repository.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRecord {
    pub job_id: JobId,
    pub summary: SeveritySummary,
    pub computed_at: DateTime<Utc>,
    /// Creation time of the job that produced it; orders competing writes.
    pub scanned_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait ScanStore: Send + Sync {
    async fn get_repository(&self, id: &str) -> Result<Option<Repository>, StoreError>;

    async fn upsert_repository(&self, repository: &Repository) -> Result<(), StoreError>;

    async fn list_repositories(&self) -> Result<Vec<Repository>, StoreError>;

    async fn touch_repository(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn save_job(&self, job: &ScanJob) -> Result<(), StoreError>;

    async fn load_job(&self, id: JobId) -> Result<Option<ScanJob>, StoreError>;

    /// Appends findings. Inserting an id that already exists is a no-op.
    async fn append_findings(&self, findings: &[Finding]) -> Result<(), StoreError>;

    async fn findings_for_job(&self, job_id: JobId) -> Result<Vec<Finding>, StoreError>;

    /// Stores `record` unless the repository already holds one with a later
    /// `scanned_at`. Returns whether the record was written.
    async fn put_summary(&self, repository_id: &str, record: &SummaryRecord) -> Result<bool, StoreError>;

    async fn get_summary(&self, repository_id: &str) -> Result<Option<SummaryRecord>, StoreError>;

    async fn list_summaries(&self) -> Result<Vec<(RepositoryId, SummaryRecord)>, StoreError>;
}
