use chrono::Utc;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use uuid::Uuid;

use super::{Finding, Location, Severity};
use crate::analyzer::{AnalyzerOutput, RawFinding, ScanUnit};

const UNCATEGORIZED: &str = "uncategorized";

/// 严重度词汇映射表
static SEVERITY_TABLE: &[(&str, Severity)] = &[
    ("critical", Severity::Critical),
    ("crit", Severity::Critical),
    ("blocker", Severity::Critical),
    ("fatal", Severity::Critical),
    ("p0", Severity::Critical),
    ("high", Severity::High),
    ("error", Severity::High),
    ("major", Severity::High),
    ("serious", Severity::High),
    ("important", Severity::High),
    ("p1", Severity::High),
    ("medium", Severity::Medium),
    ("moderate", Severity::Medium),
    ("warning", Severity::Medium),
    ("warn", Severity::Medium),
    ("p2", Severity::Medium),
    ("low", Severity::Low),
    ("minor", Severity::Low),
    ("info", Severity::Low),
    ("informational", Severity::Low),
    ("note", Severity::Low),
    ("trivial", Severity::Low),
    ("p3", Severity::Low),
];

/// CVSS v3 score bands, checked top-down.
static CVSS_BANDS: &[(f64, Severity)] = &[
    (9.0, Severity::Critical),
    (7.0, Severity::High),
    (4.0, Severity::Medium),
    (0.0, Severity::Low),
];

/// Maps raw analyzer output onto canonical [`Finding`] records.
#[derive(Debug, Default, Clone)]
pub struct FindingNormalizer;

impl FindingNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Returns the canonical severity and whether the raw value was recognized.
    pub fn map_severity(raw: &str) -> (Severity, bool) {
        let key = raw.trim().to_lowercase();
        let key = key.strip_suffix(" severity").unwrap_or(&key);

        if let Some((_, severity)) = SEVERITY_TABLE.iter().find(|(name, _)| *name == key) {
            return (*severity, true);
        }

        if let Ok(score) = key.parse::<f64>() {
            if (0.0..=10.0).contains(&score) {
                let severity = CVSS_BANDS
                    .iter()
                    .find(|(floor, _)| score >= *floor)
                    .map(|(_, s)| *s)
                    .unwrap_or(Severity::Low);
                return (severity, true);
            }
        }

        (Severity::Medium, false)
    }

    pub fn normalize(&self, output: &AnalyzerOutput, unit: &ScanUnit) -> Vec<Finding> {
        let mut seen = HashSet::new();
        let mut findings = Vec::with_capacity(output.vulnerabilities.len());

        for raw in &output.vulnerabilities {
            let finding = self.normalize_one(raw, unit);
            if !seen.insert(finding.fingerprint.clone()) {
                tracing::debug!(unit = %unit.id, category = %finding.category, "duplicate finding dropped");
                continue;
            }
            if finding.needs_review {
                tracing::warn!(
                    unit = %unit.id,
                    raw_severity = %finding.raw_severity,
                    "unrecognized severity, defaulting to medium"
                );
            }
            findings.push(finding);
        }

        findings
    }

    fn normalize_one(&self, raw: &RawFinding, unit: &ScanUnit) -> Finding {
        let category = non_empty(raw.category.as_deref())
            .unwrap_or(UNCATEGORIZED)
            .to_string();
        let location = Location {
            file: non_empty(raw.file.as_deref())
                .unwrap_or(&unit.location)
                .to_string(),
            line: raw.line,
        };
        let description = raw.description.as_deref().unwrap_or("").trim().to_string();
        let raw_severity = raw.severity.clone().unwrap_or_default();
        let (severity, recognized) = Self::map_severity(&raw_severity);

        Finding {
            id: Uuid::new_v4(),
            scan_job_id: unit.job_id,
            repository_id: unit.repository_id.clone(),
            unit_id: unit.id.clone(),
            severity,
            fingerprint: fingerprint(&category, &location, &description),
            category,
            location,
            description,
            detected_at: Utc::now(),
            raw_severity,
            needs_review: !recognized,
            cwe: non_empty(raw.cwe.as_deref()).map(String::from),
            owasp: non_empty(raw.owasp.as_deref())
                .filter(|o| !o.eq_ignore_ascii_case("n/a"))
                .map(String::from),
            recommendation: non_empty(raw.recommendation.as_deref()).map(String::from),
            original_code: code_snippet(raw.original_code.as_deref()),
            fix_code: code_snippet(raw.fix_code.as_deref()),
            compliance_impact: non_empty(raw.compliance_impact.as_deref())
                .filter(|c| !c.eq_ignore_ascii_case("n/a"))
                .map(String::from),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

// 保留缩进，只去掉首尾空行
fn code_snippet(value: Option<&str>) -> Option<String> {
    value
        .map(|code| code.trim_matches(|c| c == '\n' || c == '\r'))
        .filter(|code| !code.trim().is_empty())
        .map(String::from)
}

fn fingerprint(category: &str, location: &Location, description: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(category.as_bytes());
    hasher.update([0u8]);
    hasher.update(location.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(description.as_bytes());
    format!("{:x}", hasher.finalize())
}
