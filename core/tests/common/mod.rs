#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use vulnscan_core::config::ScanConfig;
use vulnscan_core::error::{CoreError, Result};
use vulnscan_core::{
    Analyzer, AnalyzerError, AnalyzerOutput, JobId, MemoryStore, RawFinding, Repository,
    ScanOrchestrator, ScanStore, ScanUnit, UnitSource,
};

/// How the scripted analyzer answers for one unit.
#[derive(Clone)]
pub enum Reply {
    Findings(Vec<(&'static str, &'static str)>),
    Fail(AnalyzerError),
    Sleep(Duration),
}

/// Analyzer answering from a per-unit script. Units without a script get an
/// empty result. An optional gate holds every call until permits are added.
pub struct ScriptedAnalyzer {
    replies: Mutex<HashMap<String, Reply>>,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicU32,
}

impl ScriptedAnalyzer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(HashMap::new()),
            gate: None,
            calls: AtomicU32::new(0),
        })
    }

    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(HashMap::new()),
            gate: Some(gate),
            calls: AtomicU32::new(0),
        })
    }

    pub fn reply(&self, unit_id: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .insert(unit_id.to_string(), reply);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn wait_for_calls(&self, n: u32) {
        for _ in 0..500 {
            if self.calls() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("analyzer saw {} calls, expected {}", self.calls(), n);
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    fn name(&self) -> String {
        "scripted".to_string()
    }

    async fn analyze(&self, unit: &ScanUnit) -> std::result::Result<AnalyzerOutput, AnalyzerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let reply = self.replies.lock().unwrap().get(&unit.id).cloned();
        match reply {
            None => Ok(AnalyzerOutput::default()),
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Sleep(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(AnalyzerOutput::default())
            }
            Some(Reply::Findings(items)) => Ok(AnalyzerOutput {
                vulnerabilities: items
                    .into_iter()
                    .enumerate()
                    .map(|(i, (category, severity))| RawFinding {
                        category: Some(category.to_string()),
                        severity: Some(severity.to_string()),
                        line: Some(i as u32 + 1),
                        description: Some(format!("{} in {}", category, unit.id)),
                        ..RawFinding::default()
                    })
                    .collect(),
                model: Some("scripted".to_string()),
            }),
        }
    }
}

/// Unit source handing out a fixed list of unit ids per repository.
#[derive(Default)]
pub struct StaticUnitSource {
    units: Mutex<HashMap<String, Vec<String>>>,
}

impl StaticUnitSource {
    pub fn set(&self, repository_id: &str, unit_ids: &[&str]) {
        self.units.lock().unwrap().insert(
            repository_id.to_string(),
            unit_ids.iter().map(|s| s.to_string()).collect(),
        );
    }
}

#[async_trait]
impl UnitSource for StaticUnitSource {
    async fn decompose(&self, repository: &Repository, job_id: JobId) -> Result<Vec<ScanUnit>> {
        let ids = self
            .units
            .lock()
            .unwrap()
            .get(&repository.id)
            .cloned()
            .ok_or_else(|| CoreError::Decomposition(format!("no checkout for {}", repository.id)))?;
        Ok(ids
            .into_iter()
            .map(|id| ScanUnit {
                id: id.clone(),
                job_id,
                repository_id: repository.id.clone(),
                location: id,
                language: None,
                content: String::new(),
            })
            .collect())
    }
}

pub fn test_config() -> ScanConfig {
    let mut config = ScanConfig::default();
    config.retry.base_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.retry.call_timeout_ms = 1_000;
    config
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub source: Arc<StaticUnitSource>,
    pub analyzer: Arc<ScriptedAnalyzer>,
    pub orchestrator: ScanOrchestrator,
}

impl Harness {
    pub fn new(config: ScanConfig, analyzer: Arc<ScriptedAnalyzer>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(StaticUnitSource::default());
        let orchestrator =
            ScanOrchestrator::new(&config, store.clone(), source.clone(), analyzer.clone());
        Self {
            store,
            source,
            analyzer,
            orchestrator,
        }
    }

    pub async fn register(&self, repository_id: &str, unit_ids: &[&str]) {
        self.store
            .upsert_repository(&Repository::new(repository_id, repository_id, "/checkouts"))
            .await
            .unwrap();
        self.source.set(repository_id, unit_ids);
    }
}
