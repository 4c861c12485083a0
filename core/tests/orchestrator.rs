mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use common::{test_config, Harness, Reply, ScriptedAnalyzer};
use vulnscan_core::analyzer::breaker::BreakerStatus;
use vulnscan_core::error::CoreError;
use vulnscan_core::{
    AnalyzerError, DashboardSummaryBuilder, JobError, JobState, Repository, ScanStore,
    SeveritySummary, SummaryScope, UnitStatus,
};

async fn repo_summary(h: &Harness, repository_id: &str) -> SeveritySummary {
    DashboardSummaryBuilder::new(h.store.clone())
        .get_summary(&SummaryScope::Repository(repository_id.to_string()))
        .await
        .summary
}

#[tokio::test]
async fn unknown_repository_is_not_found() {
    let h = Harness::new(test_config(), ScriptedAnalyzer::new());
    let err = h.orchestrator.submit_scan("ghost").await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

#[tokio::test]
async fn same_repository_is_rejected_while_running() {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::new(test_config(), ScriptedAnalyzer::gated(gate.clone()));
    h.register("r1", &["a.py"]).await;
    h.register("r2", &["b.py"]).await;

    let first = h.orchestrator.submit_scan("r1").await.unwrap();
    let err = h.orchestrator.submit_scan("r1").await.unwrap_err();
    match err {
        CoreError::AlreadyRunning { repository_id, job_id } => {
            assert_eq!(repository_id, "r1");
            assert_eq!(job_id, first);
        }
        other => panic!("expected AlreadyRunning, got {:?}", other),
    }

    let second = h.orchestrator.submit_scan("r2").await.unwrap();
    assert_ne!(first, second);

    gate.add_permits(2);
    let done = h.orchestrator.wait_for_terminal(first).await.unwrap();
    assert_eq!(done.state, JobState::Completed);
    h.orchestrator.wait_for_terminal(second).await.unwrap();

    // 任务结束后槽位释放
    let third = h.orchestrator.submit_scan("r1").await.unwrap();
    gate.add_permits(1);
    h.orchestrator.wait_for_terminal(third).await.unwrap();
}

#[tokio::test]
async fn partial_success_counts_only_succeeded_units() {
    let h = Harness::new(test_config(), ScriptedAnalyzer::new());
    h.register("r1", &["a.py", "b.py", "c.py"]).await;
    h.analyzer.reply(
        "a.py",
        Reply::Findings(vec![("SQL Injection", "critical"), ("XSS", "high")]),
    );
    h.analyzer.reply(
        "b.py",
        Reply::Fail(AnalyzerError::InvalidResponse("prose instead of json".into())),
    );
    h.analyzer.reply("c.py", Reply::Findings(vec![("Weak Hash", "low")]));

    let job_id = h.orchestrator.submit_scan("r1").await.unwrap();
    let job = h.orchestrator.wait_for_terminal(job_id).await.unwrap();

    assert_eq!(job.state, JobState::PartiallyCompleted);
    assert_eq!(job.progress.total_units, 3);
    assert_eq!(job.progress.succeeded_units, 2);
    assert_eq!(job.progress.failed_units, 1);
    let expected = SeveritySummary::from_counts(1, 1, 0, 1);
    assert_eq!(job.summary, Some(expected));
    assert_eq!(repo_summary(&h, "r1").await, expected);
    assert_eq!(h.store.findings_for_job(job_id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn new_scan_supersedes_prior_summary() {
    let h = Harness::new(test_config(), ScriptedAnalyzer::new());
    h.register("r1", &["app.js"]).await;

    h.analyzer.reply(
        "app.js",
        Reply::Findings(vec![
            ("Command Injection", "critical"),
            ("Hardcoded Secret", "blocker"),
            ("Open Redirect", "high"),
        ]),
    );
    let first = h.orchestrator.submit_scan("r1").await.unwrap();
    h.orchestrator.wait_for_terminal(first).await.unwrap();
    assert_eq!(
        repo_summary(&h, "r1").await,
        SeveritySummary::from_counts(2, 1, 0, 0)
    );

    h.analyzer.reply(
        "app.js",
        Reply::Findings(vec![
            ("XSS", "high"),
            ("XSS", "major"),
            ("SSRF", "error"),
            ("Verbose Errors", "warning"),
        ]),
    );
    let second = h.orchestrator.submit_scan("r1").await.unwrap();
    let job = h.orchestrator.wait_for_terminal(second).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(
        repo_summary(&h, "r1").await,
        SeveritySummary::from_counts(0, 3, 1, 0)
    );

    let repo = h.store.get_repository("r1").await.unwrap().unwrap();
    assert!(repo.last_scanned_at.is_some());
}

#[tokio::test]
async fn unit_timing_out_twice_is_exhausted() {
    let mut config = test_config();
    config.retry.max_attempts = 2;
    config.retry.call_timeout_ms = 30;
    let h = Harness::new(config, ScriptedAnalyzer::new());
    h.register("r1", &["fast.py", "slow.py"]).await;
    h.analyzer.reply("fast.py", Reply::Findings(vec![("Path Traversal", "medium")]));
    h.analyzer.reply("slow.py", Reply::Sleep(Duration::from_millis(500)));

    let job_id = h.orchestrator.submit_scan("r1").await.unwrap();
    let job = h.orchestrator.wait_for_terminal(job_id).await.unwrap();

    assert_eq!(job.state, JobState::PartiallyCompleted);
    let slow = job.units.iter().find(|u| u.unit_id == "slow.py").unwrap();
    assert_eq!(slow.status, UnitStatus::Failed);
    assert_eq!(slow.attempts, 2);
    assert_eq!(slow.findings, 0);
    assert_eq!(job.summary, Some(SeveritySummary::from_counts(0, 0, 1, 0)));
}

#[tokio::test]
async fn cancellation_discards_late_results_and_keeps_prior_summary() {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::new(test_config(), ScriptedAnalyzer::gated(gate.clone()));
    h.register("r1", &["a.py"]).await;

    h.analyzer.reply(
        "a.py",
        Reply::Findings(vec![("SQL Injection", "critical"), ("XSS", "high")]),
    );
    gate.add_permits(1);
    let first = h.orchestrator.submit_scan("r1").await.unwrap();
    h.orchestrator.wait_for_terminal(first).await.unwrap();
    let prior = repo_summary(&h, "r1").await;
    assert_eq!(prior, SeveritySummary::from_counts(1, 1, 0, 0));

    h.analyzer.reply("a.py", Reply::Findings(vec![("Info Leak", "low")]));
    let second = h.orchestrator.submit_scan("r1").await.unwrap();
    h.analyzer.wait_for_calls(2).await;

    let cancelled = h.orchestrator.cancel_scan(second).await.unwrap();
    assert_eq!(cancelled.state, JobState::Failed);
    assert_eq!(cancelled.error, Some(JobError::Cancelled));

    // 在途调用返回后被丢弃
    gate.add_permits(1);
    let mut discarded = false;
    for _ in 0..200 {
        let job = h.orchestrator.get_job_status(second).await.unwrap();
        if job.units.iter().any(|u| u.status == UnitStatus::Discarded) {
            discarded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(discarded);

    assert_eq!(repo_summary(&h, "r1").await, prior);
    assert!(h.store.findings_for_job(second).await.unwrap().is_empty());

    let err = h.orchestrator.cancel_scan(second).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::JobTerminal {
            state: JobState::Failed,
            ..
        }
    ));
}

#[tokio::test]
async fn breaker_short_circuits_remaining_units() {
    let mut config = test_config();
    config.orchestrator.per_job_fan_out = 1;
    config.retry.max_attempts = 1;
    config.breaker.failure_threshold = 2;
    config.breaker.cooldown_ms = 60_000;
    let h = Harness::new(config, ScriptedAnalyzer::new());
    let units = ["a.py", "b.py", "c.py", "d.py"];
    h.register("r1", &units).await;
    for unit in units {
        h.analyzer
            .reply(unit, Reply::Fail(AnalyzerError::unavailable("HTTP 503")));
    }

    let job_id = h.orchestrator.submit_scan("r1").await.unwrap();
    let job = h.orchestrator.wait_for_terminal(job_id).await.unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error, Some(JobError::AllUnitsFailed));
    assert_eq!(h.analyzer.calls(), 2);
    let short_circuited = job
        .units
        .iter()
        .filter(|u| u.attempts == 0 && u.status == UnitStatus::Failed)
        .count();
    assert_eq!(short_circuited, 2);
    assert_eq!(
        h.orchestrator.adapter().breaker().status(),
        BreakerStatus::Open
    );
    assert_eq!(repo_summary(&h, "r1").await, SeveritySummary::zero());
}

#[tokio::test]
async fn fan_out_bounds_in_flight_calls() {
    let gate = Arc::new(Semaphore::new(0));
    let mut config = test_config();
    config.orchestrator.per_job_fan_out = 2;
    let h = Harness::new(config, ScriptedAnalyzer::gated(gate.clone()));
    h.register("r1", &["1.py", "2.py", "3.py", "4.py", "5.py"]).await;

    let job_id = h.orchestrator.submit_scan("r1").await.unwrap();
    h.analyzer.wait_for_calls(2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.analyzer.calls(), 2);

    let running = h.orchestrator.get_job_status(job_id).await.unwrap();
    assert_eq!(running.state, JobState::Running);

    gate.add_permits(5);
    let job = h.orchestrator.wait_for_terminal(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(h.analyzer.calls(), 5);
}

#[tokio::test]
async fn global_limit_is_shared_across_jobs() {
    let gate = Arc::new(Semaphore::new(0));
    let mut config = test_config();
    config.orchestrator.per_job_fan_out = 4;
    config.orchestrator.global_concurrency = 2;
    let h = Harness::new(config, ScriptedAnalyzer::gated(gate.clone()));
    h.register("r1", &["a1.py", "a2.py", "a3.py"]).await;
    h.register("r2", &["b1.py", "b2.py", "b3.py"]).await;

    let first = h.orchestrator.submit_scan("r1").await.unwrap();
    let second = h.orchestrator.submit_scan("r2").await.unwrap();
    h.analyzer.wait_for_calls(2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.analyzer.calls(), 2);

    gate.add_permits(6);
    let a = h.orchestrator.wait_for_terminal(first).await.unwrap();
    let b = h.orchestrator.wait_for_terminal(second).await.unwrap();
    assert_eq!(a.state, JobState::Completed);
    assert_eq!(b.state, JobState::Completed);
    assert_eq!(h.analyzer.calls(), 6);
}

#[tokio::test]
async fn discarded_results_survive_a_slow_terminal_save() {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::new(test_config(), ScriptedAnalyzer::gated(gate.clone()));
    h.register("r1", &["a.py"]).await;
    h.analyzer.reply("a.py", Reply::Findings(vec![("XSS", "high")]));

    let job_id = h.orchestrator.submit_scan("r1").await.unwrap();
    h.analyzer.wait_for_calls(1).await;

    // 终态快照写入变慢，期间在途结果到达
    h.store.delay_next_job_save(Duration::from_millis(200));
    let orchestrator = h.orchestrator.clone();
    let cancel = tokio::spawn(async move { orchestrator.cancel_scan(job_id).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.add_permits(1);
    cancel.await.unwrap().unwrap();

    let mut stored = None;
    for _ in 0..200 {
        let job = h.store.load_job(job_id).await.unwrap().unwrap();
        if job.units.iter().any(|u| u.status == UnitStatus::Discarded) {
            stored = Some(job);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stored = stored.expect("discarded unit result was not persisted");
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.error, Some(JobError::Cancelled));
    assert!(h.store.findings_for_job(job_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn repository_without_units_completes_with_zero_summary() {
    let h = Harness::new(test_config(), ScriptedAnalyzer::new());
    h.register("empty", &[]).await;

    let job_id = h.orchestrator.submit_scan("empty").await.unwrap();
    let job = h.orchestrator.wait_for_terminal(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.summary, Some(SeveritySummary::zero()));
    assert_eq!(repo_summary(&h, "empty").await, SeveritySummary::zero());
    assert_eq!(repo_summary(&h, "never-scanned").await, SeveritySummary::zero());
}

#[tokio::test]
async fn decomposition_failure_fails_job() {
    let h = Harness::new(test_config(), ScriptedAnalyzer::new());
    h.store
        .upsert_repository(&Repository::new("r1", "r1", "/missing"))
        .await
        .unwrap();

    let job_id = h.orchestrator.submit_scan("r1").await.unwrap();
    let job = h.orchestrator.wait_for_terminal(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(matches!(job.error, Some(JobError::DecompositionFailed(_))));
    assert!(job.started_at.is_none());
    assert_eq!(h.analyzer.calls(), 0);
}

#[tokio::test]
async fn failed_summary_write_is_reconciled() {
    let h = Harness::new(test_config(), ScriptedAnalyzer::new());
    h.register("r1", &["a.py"]).await;
    h.analyzer.reply("a.py", Reply::Findings(vec![("XXE", "high")]));
    h.store.fail_summary_writes(true);

    let job_id = h.orchestrator.submit_scan("r1").await.unwrap();
    let job = h.orchestrator.wait_for_terminal(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(job.summary_stale);
    assert_eq!(h.orchestrator.stale_count().await, 1);
    assert_eq!(repo_summary(&h, "r1").await, SeveritySummary::zero());

    assert_eq!(h.orchestrator.reconcile_stale().await, 0);

    h.store.fail_summary_writes(false);
    assert_eq!(h.orchestrator.reconcile_stale().await, 1);
    assert_eq!(h.orchestrator.stale_count().await, 0);
    assert_eq!(
        repo_summary(&h, "r1").await,
        SeveritySummary::from_counts(0, 1, 0, 0)
    );
    let job = h.orchestrator.get_job_status(job_id).await.unwrap();
    assert!(!job.summary_stale);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let h = Harness::new(test_config(), ScriptedAnalyzer::new());
    let id = uuid::Uuid::new_v4();
    assert!(matches!(
        h.orchestrator.get_job_status(id).await,
        Err(CoreError::NotFound(_))
    ));
    assert!(matches!(
        h.orchestrator.cancel_scan(id).await,
        Err(CoreError::NotFound(_))
    ));
}
