// HTTP 分析器 - OpenAI 兼容的 chat completions 接口（默认 Groq）
// 按配置顺序尝试模型，模型不可用时切换到下一个

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

use super::response::parse_analysis;
use super::{Analyzer, AnalyzerError, AnalyzerOutput, ScanUnit};
use crate::config::AnalyzerConfig;
use crate::error::{CoreError, Result};

const SYSTEM_PROMPT: &str = "You are an application security reviewer. \
Analyze the given source file for security vulnerabilities such as injection, \
broken access control, hardcoded secrets, weak cryptography, insecure \
deserialization and sensitive data exposure. Respond ONLY with valid JSON, no \
additional text.";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

pub struct HttpAnalyzer {
    api_key: String,
    api_base: String,
    models: Vec<String>,
    temperature: f32,
    max_tokens: u32,
    http_client: Client,
}

impl HttpAnalyzer {
    /// Reads the API key from the environment variable named in the config.
    pub fn from_config(config: &AnalyzerConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            CoreError::Config(format!(
                "{} environment variable not set",
                config.api_key_env
            ))
        })?;
        Self::with_key(config, api_key)
    }

    pub fn with_key(config: &AnalyzerConfig, api_key: String) -> Result<Self> {
        validate_api_key(&api_key)?;
        if config.models.is_empty() {
            return Err(CoreError::Config("no analyzer models configured".to_string()));
        }

        Ok(Self {
            api_key,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            models: config.models.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            http_client: Client::new(),
        })
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    async fn call_model(&self, model: &str, unit: &ScanUnit) -> std::result::Result<AnalyzerOutput, AnalyzerError> {
        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: build_user_prompt(unit),
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .http_client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalyzerError::Timeout
                } else {
                    AnalyzerError::unavailable(format!("request to {} failed: {}", model, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let header_hint = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, header_hint.or_else(|| retry_hint(&body)), &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AnalyzerError::InvalidResponse(format!("malformed completion body: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| AnalyzerError::InvalidResponse("completion has no choices".to_string()))?;

        let mut output = parse_analysis(&content)?;
        output.model = Some(parsed.model.unwrap_or_else(|| model.to_string()));
        Ok(output)
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    fn name(&self) -> String {
        format!("HttpAnalyzer({})", self.api_base)
    }

    async fn analyze(&self, unit: &ScanUnit) -> std::result::Result<AnalyzerOutput, AnalyzerError> {
        let mut last_error = AnalyzerError::unavailable("no models configured");

        for model in &self.models {
            match self.call_model(model, unit).await {
                Ok(output) => {
                    tracing::debug!(unit = %unit.id, model = %model, findings = output.vulnerabilities.len(), "unit analyzed");
                    return Ok(output);
                }
                Err(err @ AnalyzerError::ModelUnavailable { .. }) => {
                    tracing::warn!(unit = %unit.id, model = %model, error = %err, "model unavailable, trying next");
                    last_error = err;
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error)
    }
}

fn validate_api_key(key: &str) -> Result<()> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Config("API key cannot be empty".to_string()));
    }
    let lowered = trimmed.to_lowercase();
    if lowered.starts_with("your") || lowered.contains("api-key-here") {
        return Err(CoreError::Config("API key is a placeholder value".to_string()));
    }
    Ok(())
}

fn build_user_prompt(unit: &ScanUnit) -> String {
    let language = unit.language.as_deref().unwrap_or("unknown");
    format!(
        "File: {}\nLanguage: {}\n\nCode:\n```\n{}\n```\n\n\
         Report every vulnerability as JSON with this structure:\n\
         {{\"vulnerabilities\": [{{\"name\": \"Vulnerability Name\", \
         \"severity\": \"critical|high|medium|low\", \"line\": 1, \
         \"description\": \"What is wrong and how it can be exploited\", \
         \"cwe\": \"CWE-XXX\", \"owaspTop10\": \"A01..A10 or N/A\", \
         \"complianceImpact\": \"GDPR|HIPAA|PCI-DSS|SOC2|N/A\", \
         \"originalCode\": \"The vulnerable snippet from the file\", \
         \"fixCode\": \"The same snippet, fixed\", \
         \"recommendation\": \"How to fix it\"}}]}}\n\
         If nothing is found, respond with {{\"vulnerabilities\": []}}.",
        unit.location, language, unit.content
    )
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> AnalyzerError {
    let snippet: String = body.chars().take(200).collect();
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return AnalyzerError::ModelUnavailable {
            reason: format!("HTTP {}: {}", status.as_u16(), snippet),
            retry_after,
        };
    }
    match status {
        // 密钥失效或模型下线，交给下一个模型
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            AnalyzerError::unavailable(format!("HTTP {}: {}", status.as_u16(), snippet))
        }
        StatusCode::REQUEST_TIMEOUT => AnalyzerError::Timeout,
        _ => AnalyzerError::InvalidResponse(format!("HTTP {}: {}", status.as_u16(), snippet)),
    }
}

// "try again in 7.5s", "1m2.5s" 或 "580ms"；超出范围的值忽略
fn retry_hint(body: &str) -> Option<Duration> {
    static HINT: OnceLock<Regex> = OnceLock::new();
    let re = HINT.get_or_init(|| {
        Regex::new(r"(?i)try again in (?:(\d+)m\s*)?(\d+(?:\.\d+)?)\s*(ms|s)\b").unwrap()
    });
    let caps = re.captures(body)?;
    let minutes: f64 = match caps.get(1) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0.0,
    };
    let value: f64 = caps.get(2)?.as_str().parse().ok()?;
    let secs = if caps[3].eq_ignore_ascii_case("ms") {
        minutes * 60.0 + value / 1000.0
    } else {
        minutes * 60.0 + value
    };
    Duration::try_from_secs_f64(secs).ok()
}
