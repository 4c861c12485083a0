// Job module - 扫描任务状态机

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::finding::aggregator::SeveritySummary;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    PartiallyCompleted,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::PartiallyCompleted => "partially_completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "partially_completed" => Some(JobState::PartiallyCompleted),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::PartiallyCompleted | JobState::Failed
        )
    }

    /// Whether a job ending in this state replaces the repository summary.
    pub fn publishes_summary(&self) -> bool {
        matches!(self, JobState::Completed | JobState::PartiallyCompleted)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Running, Completed)
                | (Running, PartiallyCompleted)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务失败原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum JobError {
    Cancelled,
    DecompositionFailed(String),
    AllUnitsFailed,
    Internal(String),
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Cancelled => f.write_str("cancelled"),
            JobError::DecompositionFailed(reason) => write!(f, "decomposition failed: {}", reason),
            JobError::AllUnitsFailed => f.write_str("all scan units failed"),
            JobError::Internal(reason) => write!(f, "internal error: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Succeeded,
    Failed,
    /// Arrived after the job was cancelled, or never dispatched because of it.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitResult {
    pub unit_id: String,
    pub status: UnitStatus,
    pub attempts: u32,
    pub findings: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub total_units: usize,
    pub succeeded_units: usize,
    pub failed_units: usize,
}

impl JobProgress {
    pub fn reported(&self) -> usize {
        self.succeeded_units + self.failed_units
    }
}

/// 扫描任务快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanJob {
    pub id: JobId,
    pub repository_id: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub units: Vec<UnitResult>,
    pub progress: JobProgress,
    pub error: Option<JobError>,
    /// Summary of this job's own findings, set once it ends successfully.
    pub summary: Option<SeveritySummary>,
    /// The repository summary write failed and awaits reconciliation.
    pub summary_stale: bool,
}

impl ScanJob {
    pub fn new(repository_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            repository_id: repository_id.into(),
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            units: Vec::new(),
            progress: JobProgress::default(),
            error: None,
            summary: None,
            summary_stale: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            JobState::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        tracing::debug!(job = %self.id, from = %self.state, to = %next, "job transition");
        self.state = next;
        Ok(())
    }

    pub fn fail(&mut self, error: JobError) -> Result<()> {
        self.transition(JobState::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn record_unit(&mut self, result: UnitResult) {
        match result.status {
            UnitStatus::Succeeded => self.progress.succeeded_units += 1,
            UnitStatus::Failed => self.progress.failed_units += 1,
            UnitStatus::Discarded => {}
        }
        self.units.push(result);
    }

    /// Terminal state implied by the unit outcomes, once every unit reported.
    pub fn outcome_state(&self) -> JobState {
        let succeeded = self.progress.succeeded_units;
        if succeeded == self.progress.total_units {
            JobState::Completed
        } else if succeeded > 0 {
            JobState::PartiallyCompleted
        } else {
            JobState::Failed
        }
    }
}
