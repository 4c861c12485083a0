use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

use super::{Finding, Severity};

/// 严重度统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeveritySummary {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub total: u64,
}

impl SeveritySummary {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn from_counts(critical: u64, high: u64, medium: u64, low: u64) -> Self {
        Self {
            critical,
            high,
            medium,
            low,
            total: critical + high + medium + low,
        }
    }

    pub fn count(&self, severity: Severity) -> u64 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
        self.total += 1;
    }
}

impl Add for SeveritySummary {
    type Output = SeveritySummary;

    fn add(self, rhs: Self) -> Self::Output {
        SeveritySummary::from_counts(
            self.critical + rhs.critical,
            self.high + rhs.high,
            self.medium + rhs.medium,
            self.low + rhs.low,
        )
    }
}

impl AddAssign for SeveritySummary {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for SeveritySummary {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(SeveritySummary::zero(), Add::add)
    }
}

/// Folds findings into per-severity counts. Pure and order-independent.
pub fn aggregate<'a, I>(findings: I) -> SeveritySummary
where
    I: IntoIterator<Item = &'a Finding>,
{
    let mut summary = SeveritySummary::zero();
    for finding in findings {
        summary.record(finding.severity);
    }
    summary
}
