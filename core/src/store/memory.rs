use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Repository, RepositoryId, ScanStore, StoreError, SummaryRecord};
use crate::finding::Finding;
use crate::job::{JobId, ScanJob};

#[derive(Default)]
struct Arena {
    repositories: HashMap<RepositoryId, Repository>,
    jobs: HashMap<JobId, ScanJob>,
    findings: HashMap<JobId, Vec<Finding>>,
    finding_ids: HashSet<Uuid>,
    summaries: HashMap<RepositoryId, SummaryRecord>,
}

/// 内存存储，用于测试与单进程部署
#[derive(Default)]
pub struct MemoryStore {
    arena: RwLock<Arena>,
    fail_summary_writes: AtomicBool,
    fail_reads: AtomicBool,
    next_save_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `put_summary` call fail until switched off.
    pub fn fail_summary_writes(&self, fail: bool) {
        self.fail_summary_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes summary reads fail until switched off.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Holds the next `save_job` call for `delay` before it writes.
    pub fn delay_next_job_save(&self, delay: Duration) {
        *self.next_save_delay.lock().unwrap_or_else(|p| p.into_inner()) = Some(delay);
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected read failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ScanStore for MemoryStore {
    async fn get_repository(&self, id: &str) -> Result<Option<Repository>, StoreError> {
        Ok(self.arena.read().await.repositories.get(id).cloned())
    }

    async fn upsert_repository(&self, repository: &Repository) -> Result<(), StoreError> {
        self.arena
            .write()
            .await
            .repositories
            .insert(repository.id.clone(), repository.clone());
        Ok(())
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>, StoreError> {
        let arena = self.arena.read().await;
        let mut repos: Vec<Repository> = arena.repositories.values().cloned().collect();
        repos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(repos)
    }

    async fn touch_repository(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(repo) = self.arena.write().await.repositories.get_mut(id) {
            repo.last_scanned_at = Some(at);
        }
        Ok(())
    }

    async fn save_job(&self, job: &ScanJob) -> Result<(), StoreError> {
        let delay = self
            .next_save_delay
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.arena.write().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load_job(&self, id: JobId) -> Result<Option<ScanJob>, StoreError> {
        Ok(self.arena.read().await.jobs.get(&id).cloned())
    }

    async fn append_findings(&self, findings: &[Finding]) -> Result<(), StoreError> {
        let mut arena = self.arena.write().await;
        for finding in findings {
            if arena.finding_ids.insert(finding.id) {
                arena
                    .findings
                    .entry(finding.scan_job_id)
                    .or_default()
                    .push(finding.clone());
            }
        }
        Ok(())
    }

    async fn findings_for_job(&self, job_id: JobId) -> Result<Vec<Finding>, StoreError> {
        self.check_reads()?;
        Ok(self
            .arena
            .read()
            .await
            .findings
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_summary(&self, repository_id: &str, record: &SummaryRecord) -> Result<bool, StoreError> {
        if self.fail_summary_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected summary write failure".to_string()));
        }
        let mut arena = self.arena.write().await;
        if let Some(existing) = arena.summaries.get(repository_id) {
            if existing.scanned_at > record.scanned_at {
                return Ok(false);
            }
        }
        arena.summaries.insert(repository_id.to_string(), *record);
        Ok(true)
    }

    async fn get_summary(&self, repository_id: &str) -> Result<Option<SummaryRecord>, StoreError> {
        self.check_reads()?;
        Ok(self.arena.read().await.summaries.get(repository_id).copied())
    }

    async fn list_summaries(&self) -> Result<Vec<(RepositoryId, SummaryRecord)>, StoreError> {
        self.check_reads()?;
        Ok(self
            .arena
            .read()
            .await
            .summaries
            .iter()
            .map(|(id, record)| (id.clone(), *record))
            .collect())
    }
}
