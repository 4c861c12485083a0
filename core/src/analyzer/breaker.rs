use serde::Serialize;
use std::sync::Mutex;
use std::time::Instant;

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    probing: bool,
}

/// Consecutive-failure circuit breaker guarding the external analyzer.
///
/// Closed until `failure_threshold` consecutive service failures, then open for
/// `cooldown`. After the cooldown a single probe call is let through; its
/// outcome closes or re-opens the breaker. A threshold of 0 disables it.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false while the breaker is open or a half-open probe is in flight.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        match state.open_until {
            None => true,
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                if state.probing {
                    false
                } else {
                    state.probing = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.open_until.is_some() {
            tracing::info!("analyzer circuit closed after successful probe");
        }
        *state = BreakerState::default();
    }

    pub fn record_failure(&self) {
        if self.config.failure_threshold == 0 {
            return;
        }
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if state.probing {
            state.probing = false;
            state.open_until = Some(Instant::now() + self.config.cooldown());
            tracing::warn!("analyzer probe failed, circuit re-opened");
        } else if state.open_until.is_none()
            && state.consecutive_failures >= self.config.failure_threshold
        {
            state.open_until = Some(Instant::now() + self.config.cooldown());
            tracing::warn!(
                failures = state.consecutive_failures,
                cooldown_ms = self.config.cooldown_ms,
                "analyzer circuit opened"
            );
        }
    }

    /// Frees the half-open slot when its call ended without an outcome
    /// (panicked or was dropped), so the next caller gets to try.
    pub fn release_half_open(&self) {
        let mut state = self.lock();
        if state.probing {
            state.probing = false;
            tracing::debug!("half-open call abandoned, slot released");
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let state = self.lock();
        match state.open_until {
            None => BreakerStatus::Closed,
            Some(until) if Instant::now() < until => BreakerStatus::Open,
            Some(_) => BreakerStatus::HalfOpen,
        }
    }
}
