use std::sync::Arc;
use std::time::Duration;

use super::breaker::CircuitBreaker;
use super::{Analyzer, AnalyzerError, AnalyzerOutput, ScanUnit};
use crate::config::{BreakerConfig, RetryPolicy};

/// Result of driving one unit through the adapter, with the attempts it took.
#[derive(Debug)]
pub struct Invocation {
    pub outcome: Result<AnalyzerOutput, AnalyzerError>,
    pub attempts: u32,
}

/// Frees a claimed half-open slot if the attempt never reports an outcome.
struct AttemptGuard<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_half_open();
        }
    }
}

/// 模型调用适配器：超时、重试、退避与熔断
pub struct ModelAdapter {
    analyzer: Arc<dyn Analyzer>,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
}

impl ModelAdapter {
    pub fn new(analyzer: Arc<dyn Analyzer>, policy: RetryPolicy, breaker: BreakerConfig) -> Self {
        Self {
            analyzer,
            policy,
            breaker: CircuitBreaker::new(breaker),
        }
    }

    pub fn analyzer_name(&self) -> String {
        self.analyzer.name()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn analyze(&self, unit: &ScanUnit) -> Result<AnalyzerOutput, AnalyzerError> {
        self.invoke(unit).await.outcome
    }

    pub async fn invoke(&self, unit: &ScanUnit) -> Invocation {
        let mut attempts = 0;

        loop {
            if !self.breaker.try_acquire() {
                tracing::warn!(unit = %unit.id, "analyzer circuit open, skipping unit");
                return Invocation {
                    outcome: Err(AnalyzerError::CircuitOpen),
                    attempts,
                };
            }

            let mut guard = AttemptGuard {
                breaker: &self.breaker,
                settled: false,
            };
            attempts += 1;
            let result =
                match tokio::time::timeout(self.policy.call_timeout(), self.analyzer.analyze(unit))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(AnalyzerError::Timeout),
                };

            let err = match result {
                Ok(output) => {
                    self.breaker.record_success();
                    guard.settled = true;
                    return Invocation {
                        outcome: Ok(output),
                        attempts,
                    };
                }
                Err(err) => err,
            };

            match &err {
                // 服务有响应，只是内容无法解析
                AnalyzerError::InvalidResponse(_) => self.breaker.record_success(),
                e if e.is_retryable() => self.breaker.record_failure(),
                _ => self.breaker.release_half_open(),
            }
            guard.settled = true;

            if !err.is_retryable() || attempts >= self.policy.max_attempts {
                tracing::warn!(
                    unit = %unit.id,
                    attempts,
                    kind = err.kind(),
                    error = %err,
                    "analyzer call failed"
                );
                return Invocation {
                    outcome: Err(err),
                    attempts,
                };
            }

            let delay = self.retry_delay(attempts, &err);
            tracing::debug!(
                unit = %unit.id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying analyzer call"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn retry_delay(&self, attempts: u32, err: &AnalyzerError) -> Duration {
        let backoff = self.policy.backoff(attempts);
        let cap = Duration::from_millis(self.policy.max_backoff_ms).max(backoff);
        err.retry_after().map_or(backoff, |hint| hint.max(backoff)).min(cap)
    }
}
