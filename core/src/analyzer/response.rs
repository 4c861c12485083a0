// 模型回复解析：去掉代码围栏、截取 JSON、修复尾随逗号

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use super::{AnalyzerError, AnalyzerOutput, RawFinding};

const PAYLOAD_KEYS: [&str; 3] = ["vulnerabilities", "findings", "violations"];

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"(?s)^```[A-Za-z0-9_-]*\s*(.*?)\s*```$").unwrap())
}

fn trailing_comma_regex() -> &'static Regex {
    static TRAILING: OnceLock<Regex> = OnceLock::new();
    TRAILING.get_or_init(|| Regex::new(r",\s*([}\]])").unwrap())
}

pub fn parse_analysis(text: &str) -> Result<AnalyzerOutput, AnalyzerError> {
    let body = strip_code_fence(text.trim());
    if body.is_empty() {
        return Err(AnalyzerError::InvalidResponse("empty response".to_string()));
    }

    if let Some(output) = try_parse(body) {
        return Ok(output);
    }

    // 提取最外层 JSON，再尝试修复尾随逗号
    if let Some(candidate) = extract_json(body) {
        if let Some(output) = try_parse(candidate) {
            return Ok(output);
        }
        let repaired = trailing_comma_regex().replace_all(candidate, "$1");
        if let Some(output) = try_parse(&repaired) {
            return Ok(output);
        }
    }

    Err(AnalyzerError::InvalidResponse(format!(
        "no usable JSON payload (preview: {})",
        preview(body)
    )))
}

fn strip_code_fence(text: &str) -> &str {
    if let Some(caps) = fence_regex().captures(text) {
        if let Some(inner) = caps.get(1) {
            return inner.as_str();
        }
    }
    text
}

fn extract_json(text: &str) -> Option<&str> {
    let start = text.find(&['{', '['][..])?;
    let closer = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(closer)?;
    (end > start).then(|| &text[start..=end])
}

fn try_parse(text: &str) -> Option<AnalyzerOutput> {
    let value: Value = serde_json::from_str(text).ok()?;
    match value {
        Value::Array(_) => {
            let vulnerabilities: Vec<RawFinding> = serde_json::from_value(value).ok()?;
            Some(AnalyzerOutput {
                vulnerabilities,
                model: None,
            })
        }
        Value::Object(ref map) if PAYLOAD_KEYS.iter().any(|k| map.contains_key(*k)) => {
            serde_json::from_value(value).ok()
        }
        _ => None,
    }
}

fn preview(text: &str) -> String {
    text.chars().take(120).collect()
}
