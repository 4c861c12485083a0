// Orchestrator module - 扫描任务编排
// 任务准入、单元并发派发、终态收尾与汇总写入

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

use crate::analyzer::adapter::{Invocation, ModelAdapter};
use crate::analyzer::{Analyzer, ScanUnit};
use crate::config::{OrchestratorConfig, ScanConfig};
use crate::error::{CoreError, Result};
use crate::finding::aggregator::{aggregate, SeveritySummary};
use crate::finding::normalizer::FindingNormalizer;
use crate::finding::Finding;
use crate::job::{JobError, JobId, JobState, ScanJob, UnitResult, UnitStatus};
use crate::store::{Repository, RepositoryId, ScanStore, SummaryRecord};
use crate::units::UnitSource;

struct JobEntry {
    job: tokio::sync::Mutex<ScanJob>,
    cancelled: AtomicBool,
    finalized: AtomicBool,
    /// Publishes settled states only; terminal is sent after finalize.
    state_tx: watch::Sender<JobState>,
}

impl JobEntry {
    fn new(job: ScanJob) -> Self {
        let (state_tx, _) = watch::channel(job.state);
        Self {
            job: tokio::sync::Mutex::new(job),
            cancelled: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            state_tx,
        }
    }

    fn settled_state(&self) -> JobState {
        *self.state_tx.borrow()
    }
}

/// A terminal job whose repository summary could not be persisted.
struct StaleJob {
    job: ScanJob,
    findings: Vec<Finding>,
}

struct Inner {
    config: OrchestratorConfig,
    store: Arc<dyn ScanStore>,
    source: Arc<dyn UnitSource>,
    adapter: Arc<ModelAdapter>,
    normalizer: FindingNormalizer,
    global: Arc<Semaphore>,
    jobs: RwLock<HashMap<JobId, Arc<JobEntry>>>,
    active: Mutex<HashMap<RepositoryId, JobId>>,
    summary_locks: Mutex<HashMap<RepositoryId, Arc<tokio::sync::Mutex<()>>>>,
    stale: tokio::sync::Mutex<HashMap<JobId, StaleJob>>,
}

/// 扫描编排器
#[derive(Clone)]
pub struct ScanOrchestrator {
    inner: Arc<Inner>,
}

impl ScanOrchestrator {
    pub fn new(
        config: &ScanConfig,
        store: Arc<dyn ScanStore>,
        source: Arc<dyn UnitSource>,
        analyzer: Arc<dyn Analyzer>,
    ) -> Self {
        let adapter = ModelAdapter::new(analyzer, config.retry.clone(), config.breaker.clone());
        tracing::info!(
            analyzer = %adapter.analyzer_name(),
            fan_out = config.orchestrator.per_job_fan_out,
            global = config.orchestrator.global_concurrency,
            "scan orchestrator ready"
        );

        Self {
            inner: Arc::new(Inner {
                config: config.orchestrator.clone(),
                store,
                source,
                adapter: Arc::new(adapter),
                normalizer: FindingNormalizer::new(),
                global: Arc::new(Semaphore::new(config.orchestrator.global_concurrency)),
                jobs: RwLock::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                summary_locks: Mutex::new(HashMap::new()),
                stale: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn adapter(&self) -> &ModelAdapter {
        &self.inner.adapter
    }

    /// Admits a scan for `repository_id` and returns as soon as the job is queued.
    pub async fn submit_scan(&self, repository_id: &str) -> Result<JobId> {
        let repository = self
            .inner
            .store
            .get_repository(repository_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("repository {}", repository_id)))?;

        let job = ScanJob::new(repository_id);
        let job_id = job.id;
        let entry = Arc::new(JobEntry::new(job.clone()));
        self.inner.claim_slot(repository_id, &entry, job_id)?;

        if let Err(e) = self.inner.store.save_job(&job).await {
            self.inner.release_slot(repository_id, job_id);
            self.inner.forget(job_id);
            return Err(e.into());
        }

        tracing::info!(job = %job_id, repository = %repository_id, "scan submitted");
        let span = tracing::info_span!("scan_job", job = %job_id, repository = %repository_id);
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.drive(entry, repository).await }.instrument(span));

        Ok(job_id)
    }

    pub async fn get_job_status(&self, job_id: JobId) -> Result<ScanJob> {
        if let Some(entry) = self.inner.live(job_id) {
            return Ok(entry.job.lock().await.clone());
        }
        self.inner.load(job_id).await
    }

    /// Fails a non-terminal job with `Cancelled`. In-flight analyzer calls
    /// keep running; their results are discarded when they arrive.
    pub async fn cancel_scan(&self, job_id: JobId) -> Result<ScanJob> {
        let entry = match self.inner.live(job_id) {
            Some(entry) => entry,
            None => {
                let job = self.inner.load(job_id).await?;
                return Err(CoreError::JobTerminal {
                    job_id,
                    state: job.state,
                });
            }
        };

        let snapshot = {
            let mut job = entry.job.lock().await;
            if job.is_terminal() {
                return Err(CoreError::JobTerminal {
                    job_id,
                    state: job.state,
                });
            }
            entry.cancelled.store(true, Ordering::SeqCst);
            job.fail(JobError::Cancelled)?;
            job.clone()
        };

        tracing::info!(job = %job_id, repository = %snapshot.repository_id, "scan cancelled");
        self.inner.finalize(&entry, snapshot, Vec::new()).await;
        let job = entry.job.lock().await.clone();
        Ok(job)
    }

    /// Resolves once the job is terminal and its aggregation step has settled.
    pub async fn wait_for_terminal(&self, job_id: JobId) -> Result<ScanJob> {
        let Some(entry) = self.inner.live(job_id) else {
            return self.inner.load(job_id).await;
        };

        let mut rx = entry.state_tx.subscribe();
        rx.wait_for(|state| state.is_terminal())
            .await
            .map_err(|_| CoreError::NotFound(format!("job {}", job_id)))?;
        let job = entry.job.lock().await.clone();
        Ok(job)
    }

    /// Retries summary persistence for jobs marked stale. Returns how many were repaired.
    pub async fn reconcile_stale(&self) -> usize {
        self.inner.reconcile_stale().await
    }

    pub async fn stale_count(&self) -> usize {
        self.inner.stale.lock().await.len()
    }

    pub fn spawn_reconciler(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let period = inner.config.reconcile_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let repaired = inner.reconcile_stale().await;
                if repaired > 0 {
                    tracing::info!(repaired, "stale summaries reconciled");
                }
            }
        })
    }
}

impl Inner {
    fn live(&self, job_id: JobId) -> Option<Arc<JobEntry>> {
        self.jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&job_id)
            .cloned()
    }

    fn forget(&self, job_id: JobId) {
        self.jobs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&job_id);
    }

    async fn load(&self, job_id: JobId) -> Result<ScanJob> {
        self.store
            .load_job(job_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("job {}", job_id)))
    }

    fn claim_slot(&self, repository_id: &str, entry: &Arc<JobEntry>, job_id: JobId) -> Result<()> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(&existing) = active.get(repository_id) {
            // 槽位只在任务终结后释放；终态任务的残留槽位可以被替换
            let still_running = self
                .live(existing)
                .map_or(false, |e| !e.settled_state().is_terminal());
            if still_running {
                return Err(CoreError::AlreadyRunning {
                    repository_id: repository_id.to_string(),
                    job_id: existing,
                });
            }
        }
        active.insert(repository_id.to_string(), job_id);
        self.jobs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(job_id, entry.clone());
        Ok(())
    }

    fn release_slot(&self, repository_id: &str, job_id: JobId) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if active.get(repository_id) == Some(&job_id) {
            active.remove(repository_id);
        }
    }

    fn summary_lock(&self, repository_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.summary_locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(repository_id.to_string())
            .or_default()
            .clone()
    }

    async fn drive(self: Arc<Self>, entry: Arc<JobEntry>, repository: Repository) {
        let job_id = entry.job.lock().await.id;

        let units = match self.source.decompose(&repository, job_id).await {
            Ok(units) => units,
            Err(e) => {
                tracing::warn!(error = %e, "decomposition failed");
                let snapshot = {
                    let mut job = entry.job.lock().await;
                    if job.is_terminal() {
                        return;
                    }
                    if let Err(err) = job.fail(JobError::DecompositionFailed(e.to_string())) {
                        tracing::error!(error = %err, "cannot fail job");
                        return;
                    }
                    job.clone()
                };
                self.finalize(&entry, snapshot, Vec::new()).await;
                return;
            }
        };

        let running = {
            let mut job = entry.job.lock().await;
            if job.is_terminal() {
                // 拆分期间已被取消
                return;
            }
            job.progress.total_units = units.len();
            if let Err(e) = job.transition(JobState::Running) {
                tracing::error!(error = %e, "cannot start job");
                return;
            }
            job.clone()
        };
        entry.state_tx.send_replace(JobState::Running);
        if let Err(e) = self.store.save_job(&running).await {
            tracing::warn!(error = %e, "failed to persist running job");
        }
        tracing::info!(units = units.len(), "scan running");

        let findings = self.dispatch(&entry, units).await;

        let snapshot = {
            let mut job = entry.job.lock().await;
            if job.is_terminal() {
                // 取消后到达的结果只记录，不入库；持锁保存，与 finalize 的保存串行
                tracing::debug!(discarded = findings.len(), "dropping findings of cancelled job");
                if let Err(e) = self.store.save_job(&job).await {
                    tracing::debug!(error = %e, "failed to persist discarded unit results");
                }
                return;
            }
            let result = match job.outcome_state() {
                JobState::Failed => job.fail(JobError::AllUnitsFailed),
                next => job.transition(next),
            };
            if let Err(e) = result {
                tracing::error!(error = %e, "cannot finish job");
                return;
            }
            job.clone()
        };

        self.finalize(&entry, snapshot, findings).await;
    }

    /// Runs every unit through the adapter and returns the findings of the
    /// units that succeeded while the job was live.
    async fn dispatch(&self, entry: &Arc<JobEntry>, units: Vec<ScanUnit>) -> Vec<Finding> {
        let per_job = Arc::new(Semaphore::new(self.config.per_job_fan_out));
        let mut set: JoinSet<(ScanUnit, Option<Invocation>)> = JoinSet::new();

        for unit in units {
            let per_job = per_job.clone();
            let global = self.global.clone();
            let adapter = self.adapter.clone();
            let entry = entry.clone();

            set.spawn(
                async move {
                    let (Ok(_job_permit), Ok(_global_permit)) =
                        (per_job.acquire_owned().await, global.acquire_owned().await)
                    else {
                        return (unit, None);
                    };
                    if entry.cancelled.load(Ordering::SeqCst) {
                        return (unit, None);
                    }
                    let invocation = adapter.invoke(&unit).await;
                    (unit, Some(invocation))
                }
                .in_current_span(),
            );
        }

        let mut findings = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (unit, invocation) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(error = %e, "unit task aborted");
                    let mut job = entry.job.lock().await;
                    if !job.is_terminal() {
                        job.record_unit(UnitResult {
                            unit_id: "<aborted>".to_string(),
                            status: UnitStatus::Failed,
                            attempts: 0,
                            findings: 0,
                            error: Some(e.to_string()),
                        });
                    }
                    continue;
                }
            };

            let mut job = entry.job.lock().await;
            let discarded = job.is_terminal() || entry.cancelled.load(Ordering::SeqCst);
            let result = match invocation {
                Some(invocation) if !discarded => match invocation.outcome {
                    Ok(output) => {
                        let normalized = self.normalizer.normalize(&output, &unit);
                        let result = UnitResult {
                            unit_id: unit.id.clone(),
                            status: UnitStatus::Succeeded,
                            attempts: invocation.attempts,
                            findings: normalized.len(),
                            error: None,
                        };
                        findings.extend(normalized);
                        result
                    }
                    Err(err) => UnitResult {
                        unit_id: unit.id.clone(),
                        status: UnitStatus::Failed,
                        attempts: invocation.attempts,
                        findings: 0,
                        error: Some(err.to_string()),
                    },
                },
                other => UnitResult {
                    unit_id: unit.id.clone(),
                    status: UnitStatus::Discarded,
                    attempts: other.map_or(0, |i| i.attempts),
                    findings: 0,
                    error: None,
                },
            };
            tracing::debug!(unit = %result.unit_id, status = ?result.status, findings = result.findings, "unit reported");
            job.record_unit(result);
        }

        findings
    }

    /// Settles a terminal job exactly once.
    async fn finalize(&self, entry: &Arc<JobEntry>, mut job: ScanJob, findings: Vec<Finding>) {
        if entry.finalized.swap(true, Ordering::SeqCst) {
            return;
        }

        if job.state.publishes_summary() {
            job.summary = Some(aggregate(&findings));
            if let Err(e) = self.persist_results(&job, &findings).await {
                tracing::warn!(job = %job.id, error = %e, "summary persistence failed, marking stale");
                job.summary_stale = true;
                self.stale.lock().await.insert(
                    job.id,
                    StaleJob {
                        job: job.clone(),
                        findings,
                    },
                );
            }
        }

        if let Err(e) = self.store.touch_repository(&job.repository_id, Utc::now()).await {
            tracing::warn!(repository = %job.repository_id, error = %e, "failed to touch repository");
        }

        let saved = {
            let mut live = entry.job.lock().await;
            live.summary = job.summary;
            live.summary_stale = job.summary_stale;
            job = live.clone();
            match self.store.save_job(&job).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(job = %job.id, error = %e, "failed to persist terminal job");
                    false
                }
            }
        };

        tracing::info!(
            job = %job.id,
            state = %job.state,
            succeeded = job.progress.succeeded_units,
            failed = job.progress.failed_units,
            "scan finished"
        );
        entry.state_tx.send_replace(job.state);
        self.release_slot(&job.repository_id, job.id);
        if saved && !job.summary_stale {
            self.forget(job.id);
        }
    }

    async fn persist_results(&self, job: &ScanJob, findings: &[Finding]) -> Result<SeveritySummary> {
        self.store.append_findings(findings).await?;

        let lock = self.summary_lock(&job.repository_id);
        let _guard = lock.lock().await;

        let persisted = self.store.findings_for_job(job.id).await?;
        let summary = aggregate(&persisted);
        let record = SummaryRecord {
            job_id: job.id,
            summary,
            computed_at: Utc::now(),
            scanned_at: job.created_at,
        };
        if !self.store.put_summary(&job.repository_id, &record).await? {
            tracing::info!(job = %job.id, "newer summary already recorded, keeping it");
        }
        Ok(summary)
    }

    async fn reconcile_stale(&self) -> usize {
        let pending: Vec<JobId> = self.stale.lock().await.keys().copied().collect();
        let mut repaired = 0;

        for job_id in pending {
            let Some(stale) = self.stale.lock().await.remove(&job_id) else {
                continue;
            };
            match self.persist_results(&stale.job, &stale.findings).await {
                Ok(_) => {
                    let mut job = stale.job;
                    job.summary_stale = false;
                    if let Some(entry) = self.live(job_id) {
                        entry.job.lock().await.summary_stale = false;
                    }
                    match self.store.save_job(&job).await {
                        Ok(()) => self.forget(job_id),
                        Err(e) => tracing::warn!(job = %job_id, error = %e, "failed to persist reconciled job"),
                    }
                    repaired += 1;
                }
                Err(e) => {
                    tracing::debug!(job = %job_id, error = %e, "summary still stale");
                    self.stale.lock().await.insert(job_id, stale);
                }
            }
        }

        repaired
    }
}
