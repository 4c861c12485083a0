// 扫描引擎配置
// 各段均为 serde(default)，YAML 只需写要覆盖的键；环境变量最后生效

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub orchestrator: OrchestratorConfig,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub analyzer: AnalyzerConfig,
    pub units: UnitSourceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// 单个任务的最大并发单元数
    pub per_job_fan_out: usize,
    /// 所有任务共享的全局并发上限
    pub global_concurrency: usize,
    /// Interval of the stale-summary reconciliation pass.
    pub reconcile_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            per_job_fan_out: 4,
            global_concurrency: 16,
            reconcile_interval_secs: 60,
        }
    }
}

impl OrchestratorConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per unit, first call included.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_backoff_ms: 500,
            max_backoff_ms: 8_000,
            call_timeout_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts finished attempts.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.base_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// OpenAI-compatible API root, without the `/chat/completions` suffix.
    pub api_base: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    /// 模型优先级列表，前一个不可用时依次尝试后一个
    pub models: Vec<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.groq.com/openai/v1".to_string(),
            api_key_env: "GROQ_API_KEY".to_string(),
            models: vec![
                "llama-3.1-8b-instant".to_string(),
                "llama-3.3-70b-versatile".to_string(),
            ],
            temperature: 0.3,
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitSourceConfig {
    /// Files above this size are skipped.
    pub max_file_bytes: u64,
    pub extensions: Vec<String>,
}

impl Default for UnitSourceConfig {
    fn default() -> Self {
        let extensions = [
            "js", "jsx", "ts", "tsx", "py", "java", "rs", "go", "php", "rb", "cs", "html", "htm",
            "vue", "c", "h", "cpp", "hpp", "cc",
        ];
        Self {
            max_file_bytes: 256 * 1024,
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl ScanConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&content)
    }

    /// Applies `VULNSCAN_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("VULNSCAN_FAN_OUT") {
            self.orchestrator.per_job_fan_out = parse_num("VULNSCAN_FAN_OUT", &v)?;
        }
        if let Some(v) = lookup("VULNSCAN_GLOBAL_CONCURRENCY") {
            self.orchestrator.global_concurrency = parse_num("VULNSCAN_GLOBAL_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("VULNSCAN_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_num("VULNSCAN_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("VULNSCAN_CALL_TIMEOUT_MS") {
            self.retry.call_timeout_ms = parse_num("VULNSCAN_CALL_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("VULNSCAN_API_BASE") {
            self.analyzer.api_base = v;
        }
        if let Some(v) = lookup("VULNSCAN_MODELS") {
            self.analyzer.models = v
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect();
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.per_job_fan_out == 0 || self.orchestrator.global_concurrency == 0 {
            return Err(CoreError::Config(
                "concurrency limits must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(CoreError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.analyzer.models.is_empty() {
            return Err(CoreError::Config("analyzer.models must not be empty".to_string()));
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CoreError::Config(format!("{} must be a number, got {:?}", key, value)))
}
