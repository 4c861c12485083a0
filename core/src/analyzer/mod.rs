// Analyzer module - 外部模型分析接口
// 定义分析器的核心接口、扫描单元与原始输出类型

pub mod adapter;
pub mod breaker;
pub mod http;
pub mod response;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::job::JobId;

/// 扫描单元：仓库中可独立分析的部分（通常是一个文件）
#[derive(Debug, Clone)]
pub struct ScanUnit {
    /// Path relative to the repository root, `/`-separated.
    pub id: String,
    pub job_id: JobId,
    pub repository_id: String,
    pub location: String,
    pub language: Option<String>,
    pub content: String,
}

/// One vulnerability as reported by the analyzer, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFinding {
    #[serde(default, alias = "name", alias = "type", alias = "title", alias = "vuln_type")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub severity: Option<String>,
    #[serde(default, alias = "line_number", alias = "lineNumber", deserialize_with = "line_number")]
    pub line: Option<u32>,
    #[serde(default, alias = "path", alias = "file_path")]
    pub file: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cwe: Option<String>,
    #[serde(default, alias = "owaspTop10", alias = "owasp_top10")]
    pub owasp: Option<String>,
    #[serde(default)]
    pub recommendation: Option<String>,
    #[serde(default, alias = "original_code", alias = "vulnerableCode")]
    pub original_code: Option<String>,
    #[serde(default, alias = "fix_code", alias = "fixedCode")]
    pub fix_code: Option<String>,
    #[serde(default, alias = "compliance_impact", alias = "compliance")]
    pub compliance_impact: Option<String>,
}

/// 分析器原始输出
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerOutput {
    #[serde(default, alias = "findings", alias = "violations")]
    pub vulnerabilities: Vec<RawFinding>,
    /// Model that produced the output, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalyzerError {
    #[error("analyzer call timed out")]
    Timeout,

    #[error("model unavailable: {reason}")]
    ModelUnavailable {
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("invalid analyzer response: {0}")]
    InvalidResponse(String),

    #[error("analyzer short-circuited after repeated failures")]
    CircuitOpen,
}

impl AnalyzerError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        AnalyzerError::ModelUnavailable {
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// Only transient service failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AnalyzerError::Timeout | AnalyzerError::ModelUnavailable { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AnalyzerError::ModelUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AnalyzerError::Timeout => "timeout",
            AnalyzerError::ModelUnavailable { .. } => "model_unavailable",
            AnalyzerError::InvalidResponse(_) => "invalid_response",
            AnalyzerError::CircuitOpen => "circuit_open",
        }
    }
}

/// 分析器 trait - 外部漏洞分析服务都需要实现此接口
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// 返回分析器名称
    fn name(&self) -> String;

    /// 分析单个扫描单元
    async fn analyze(&self, unit: &ScanUnit) -> Result<AnalyzerOutput, AnalyzerError>;
}

fn text_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// 模型有时会把行号写成字符串
fn line_number<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_finding_accepts_loose_field_names() {
        let raw: RawFinding = serde_json::from_str(
            r#"{"name":"XSS","severity":"HIGH","line":"12","owaspTop10":"A03","description":"reflected"}"#,
        )
        .unwrap();
        assert_eq!(raw.category.as_deref(), Some("XSS"));
        assert_eq!(raw.severity.as_deref(), Some("HIGH"));
        assert_eq!(raw.line, Some(12));
        assert_eq!(raw.owasp.as_deref(), Some("A03"));
    }

    #[test]
    fn code_snippets_and_compliance_are_read() {
        let raw: RawFinding = serde_json::from_str(
            r#"{"name":"SQLi","originalCode":"q = 'x' + id","fixCode":"q = ?","complianceImpact":"PCI-DSS"}"#,
        )
        .unwrap();
        assert_eq!(raw.original_code.as_deref(), Some("q = 'x' + id"));
        assert_eq!(raw.fix_code.as_deref(), Some("q = ?"));
        assert_eq!(raw.compliance_impact.as_deref(), Some("PCI-DSS"));
    }

    #[test]
    fn numeric_severity_is_kept_as_text() {
        let raw: RawFinding = serde_json::from_str(r#"{"severity": 9.8}"#).unwrap();
        assert_eq!(raw.severity.as_deref(), Some("9.8"));
        assert_eq!(raw.line, None);
    }

    #[test]
    fn only_service_failures_retry() {
        assert!(AnalyzerError::Timeout.is_retryable());
        assert!(AnalyzerError::unavailable("503").is_retryable());
        assert!(!AnalyzerError::InvalidResponse("garbage".into()).is_retryable());
        assert!(!AnalyzerError::CircuitOpen.is_retryable());
    }
}
