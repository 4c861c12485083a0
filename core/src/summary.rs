// Summary module - 仪表盘严重度汇总

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::{CoreError, Result};
use crate::finding::aggregator::{aggregate, SeveritySummary};
use crate::job::JobId;
use crate::store::{ScanStore, StoreError, SummaryRecord};

const GLOBAL: &str = "global";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SummaryScope {
    Repository(String),
    Global,
}

impl SummaryScope {
    /// Missing, empty or `"global"` selects the global scope.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") => SummaryScope::Global,
            Some(v) if v.eq_ignore_ascii_case(GLOBAL) => SummaryScope::Global,
            Some(v) => SummaryScope::Repository(v.to_string()),
        }
    }
}

impl fmt::Display for SummaryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryScope::Repository(id) => f.write_str(id),
            SummaryScope::Global => f.write_str(GLOBAL),
        }
    }
}

/// What the dashboard chart reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryView {
    #[serde(flatten)]
    pub summary: SeveritySummary,
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computed_at: Option<DateTime<Utc>>,
    /// Served from cache because the store could not be read.
    pub stale: bool,
}

impl SummaryView {
    fn zero(scope: &SummaryScope) -> Self {
        Self {
            summary: SeveritySummary::zero(),
            scope: scope.to_string(),
            job_id: None,
            computed_at: None,
            stale: false,
        }
    }

    fn from_record(scope: &SummaryScope, record: &SummaryRecord) -> Self {
        Self {
            summary: record.summary,
            scope: scope.to_string(),
            job_id: Some(record.job_id),
            computed_at: Some(record.computed_at),
            stale: false,
        }
    }
}

/// 仪表盘汇总读取器，从不触发扫描
pub struct DashboardSummaryBuilder {
    store: Arc<dyn ScanStore>,
    last_good: Mutex<HashMap<SummaryScope, SummaryView>>,
}

impl DashboardSummaryBuilder {
    pub fn new(store: Arc<dyn ScanStore>) -> Self {
        Self {
            store,
            last_good: Mutex::new(HashMap::new()),
        }
    }

    /// Never fails: a store error yields the last good value for the scope
    /// (or zeros) flagged `stale`.
    pub async fn get_summary(&self, scope: &SummaryScope) -> SummaryView {
        match self.read(scope).await {
            Ok(view) => {
                self.remember(scope, &view);
                view
            }
            Err(e) => {
                tracing::warn!(scope = %scope, error = %e, "summary read failed, serving last known value");
                let mut view = self
                    .last_good
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .get(scope)
                    .cloned()
                    .unwrap_or_else(|| SummaryView::zero(scope));
                view.stale = true;
                view
            }
        }
    }

    async fn read(&self, scope: &SummaryScope) -> std::result::Result<SummaryView, StoreError> {
        match scope {
            SummaryScope::Repository(id) => Ok(match self.store.get_summary(id).await? {
                Some(record) => SummaryView::from_record(scope, &record),
                None => SummaryView::zero(scope),
            }),
            SummaryScope::Global => {
                let records = self.store.list_summaries().await?;
                let mut view = SummaryView::zero(scope);
                view.summary = records.iter().map(|(_, r)| r.summary).sum();
                view.computed_at = records.iter().map(|(_, r)| r.computed_at).max();
                Ok(view)
            }
        }
    }

    // 只缓存全局视图和有记录支撑的仓库视图，未知仓库不占缓存
    fn remember(&self, scope: &SummaryScope, view: &SummaryView) {
        if *scope != SummaryScope::Global && view.job_id.is_none() {
            return;
        }
        self.last_good
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(scope.clone(), view.clone());
    }

    /// Re-aggregates the persisted findings behind the repository's latest
    /// summary and stores the result, without running a scan.
    pub async fn recompute(&self, repository_id: &str) -> Result<SummaryView> {
        let record = self
            .store
            .get_summary(repository_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("summary for repository {}", repository_id)))?;

        let findings = self.store.findings_for_job(record.job_id).await?;
        let recomputed = SummaryRecord {
            summary: aggregate(&findings),
            computed_at: Utc::now(),
            ..record
        };
        if recomputed.summary != record.summary {
            tracing::warn!(
                repository = %repository_id,
                job = %record.job_id,
                "persisted summary drifted from findings, corrected"
            );
        }
        let current = if self.store.put_summary(repository_id, &recomputed).await? {
            recomputed
        } else {
            tracing::info!(repository = %repository_id, "newer summary landed during recompute");
            self.store
                .get_summary(repository_id)
                .await?
                .unwrap_or(recomputed)
        };

        let scope = SummaryScope::Repository(repository_id.to_string());
        let view = SummaryView::from_record(&scope, &current);
        self.remember(&scope, &view);
        Ok(view)
    }
}
