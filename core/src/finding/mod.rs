// Finding module - 漏洞发现记录
// 定义规范化后的漏洞记录及严重度

pub mod aggregator;
pub mod normalizer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::job::JobId;

/// 规范化严重度（四级）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    /// Parses the canonical lowercase name only. Analyzer vocabulary goes
    /// through the normalizer's mapping table instead.
    pub fn from_canonical(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.file, line),
            None => f.write_str(&self.file),
        }
    }
}

/// 漏洞发现结果（创建后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub id: Uuid,
    pub scan_job_id: JobId,
    pub repository_id: String,
    pub unit_id: String,
    pub severity: Severity,
    pub category: String,
    pub location: Location,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    /// Severity string exactly as the analyzer reported it.
    pub raw_severity: String,
    /// Set when the raw severity was not in the mapping table.
    pub needs_review: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwe: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owasp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    /// Vulnerable snippet quoted by the analyzer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_code: Option<String>,
    /// Suggested replacement for `original_code`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compliance_impact: Option<String>,
    pub fingerprint: String,
}
