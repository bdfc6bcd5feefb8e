use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use diarist_config::LlmConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

/// Failure of a single model call, split by whether retrying can help.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// Timeouts, connection failures, rate limits and 5xx responses.
    #[error("transient model failure: {0}")]
    Transient(String),
    /// Rejected requests, bad credentials and unusable responses.
    #[error("permanent model failure: {0}")]
    Permanent(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A text-completion backend.  `system` carries the instructions and
/// `prompt` the material to work on.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError>;
}

/// HTTP statuses worth retrying: request timeout, conflict, too early,
/// rate limiting and any server-side failure.
pub fn should_retry_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 425 | 429) || (500..=599).contains(&status)
}

fn classify_status(provider: &str, status: reqwest::StatusCode, body: &str) -> LlmError {
    let snippet: String = body.chars().take(300).collect();
    let message = format!("{provider} returned {status}: {snippet}");
    if should_retry_status(status.as_u16()) {
        LlmError::Transient(message)
    } else {
        LlmError::Permanent(message)
    }
}

fn classify_transport(provider: &str, error: reqwest::Error) -> LlmError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        LlmError::Transient(format!("{provider} unreachable: {error}"))
    } else {
        LlmError::Permanent(format!("{provider} request failed: {error}"))
    }
}

fn build_http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()?;
    Ok(client)
}

// ── Ollama ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(config.timeout_secs)?,
            base_url: config.ollama_base_url.trim_end_matches('/').to_string(),
            model: config.ollama_model.clone(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl ChatModel for OllamaClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let endpoint = format!("{}/api/generate", self.base_url);
        let payload = json!({
            "model": self.model,
            "system": system,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": self.temperature }
        });

        let response = self
            .client
            .post(endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|err| classify_transport("ollama", err))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| classify_transport("ollama", err))?;
        if !status.is_success() {
            return Err(classify_status("ollama", status, &body));
        }

        debug!(model = %self.model, bytes = body.len(), "ollama completion received");
        parse_ollama_body(&body)
    }
}

/// Pull the generated text out of an `/api/generate` response body.
pub fn parse_ollama_body(body: &str) -> Result<String, LlmError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|err| LlmError::Permanent(format!("ollama body is not JSON: {err}")))?;
    value
        .get("response")
        .and_then(|text| text.as_str())
        .map(ToString::to_string)
        .ok_or_else(|| LlmError::Permanent("ollama response missing text".to_string()))
}

// ── OpenAI-compatible ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiCompatClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(config.timeout_secs)?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        if self.api_key.trim().is_empty() {
            return Err(LlmError::Permanent(
                "api key missing; set LLM_API_KEY or switch provider to ollama".to_string(),
            ));
        }

        let payload = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt}
            ]
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| classify_transport("openai", err))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| classify_transport("openai", err))?;
        if !status.is_success() {
            return Err(classify_status("openai", status, &body));
        }

        debug!(model = %self.model, bytes = body.len(), "chat completion received");
        parse_chat_completion_body(&body)
    }
}

/// Pull `choices[0].message.content` out of a chat-completions body.
pub fn parse_chat_completion_body(body: &str) -> Result<String, LlmError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|err| LlmError::Permanent(format!("completion body is not JSON: {err}")))?;
    value
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(ToString::to_string)
        .ok_or_else(|| LlmError::Permanent("completion response missing content".to_string()))
}

// ── Router ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ollama,
    OpenAi,
}

impl Provider {
    pub fn from_label(label: &str) -> Self {
        if label.trim().eq_ignore_ascii_case("ollama") {
            Self::Ollama
        } else {
            Self::OpenAi
        }
    }
}

/// Dispatches completions to the configured provider.
#[derive(Debug, Clone)]
pub struct LlmRouter {
    provider: Provider,
    ollama: OllamaClient,
    openai: OpenAiCompatClient,
}

impl LlmRouter {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            provider: Provider::from_label(&config.provider),
            ollama: OllamaClient::new(config)?,
            openai: OpenAiCompatClient::new(config)?,
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }
}

#[async_trait]
impl ChatModel for LlmRouter {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        match self.provider {
            Provider::Ollama => self.ollama.complete(system, prompt).await,
            Provider::OpenAi => self.openai.complete(system, prompt).await,
        }
    }
}

// ── Structured output extraction ──────────────────────────────────────────────

/// Extract the first valid JSON object from an LLM response.
///
/// Looks for ` ```json\n...\n` ``` ` delimiters first, then falls back to
/// the span between the first `{` and the last `}`.  Returns `None` when
/// neither yields valid JSON for `T`.
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    // Strategy 1: fenced ```json ... ``` blocks.
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(json_start) = after_fence.find(|c: char| !c.is_whitespace()) {
            let json_body = &after_fence[json_start..];
            if let Some(fence_end) = json_body.find("```") {
                let json_str = json_body[..fence_end].trim();
                if let Ok(val) = serde_json::from_str(json_str) {
                    return Some(val);
                }
            }
        }
    }

    // Strategy 2: bare JSON object.
    let trimmed = response.trim();
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                let candidate = &trimmed[start..=end];
                if let Ok(val) = serde_json::from_str(candidate) {
                    return Some(val);
                }
            }
        }
    }

    None
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, Default)]
    struct Draft {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        details: Vec<String>,
        #[serde(default)]
        mood: Option<String>,
    }

    // ── extract_json_output: fenced code block ─────────────────────────────

    #[test]
    fn extract_fenced_json() {
        let raw = "Sure!\n```json\n{\"title\":\"A calm day\",\"mood\":\"relaxed\"}\n```";
        let out = extract_json_output::<Draft>(raw).unwrap();
        assert_eq!(out.title.as_deref(), Some("A calm day"));
        assert_eq!(out.mood.as_deref(), Some("relaxed"));
    }

    #[test]
    fn extract_fenced_json_with_extra_text() {
        let raw = "Here is your diary:\n\n```json\n{\"title\":\"Hotpot\",\"details\":[\"晚上吃了火锅\"]}\n```\n\nEnjoy!";
        let out = extract_json_output::<Draft>(raw).unwrap();
        assert_eq!(out.title.as_deref(), Some("Hotpot"));
        assert_eq!(out.details, vec!["晚上吃了火锅".to_string()]);
    }

    #[test]
    fn extract_fenced_json_with_leading_newlines() {
        let raw = "```json\n\n  {\"title\":\"test\"}\n```";
        let out = extract_json_output::<Draft>(raw).unwrap();
        assert_eq!(out.title.as_deref(), Some("test"));
    }

    // ── extract_json_output: bare JSON ─────────────────────────────────────

    #[test]
    fn extract_bare_json_with_surrounding_text() {
        let raw = "some preamble {\"title\":\"x\"} some epilogue";
        let out = extract_json_output::<Draft>(raw).unwrap();
        assert_eq!(out.title.as_deref(), Some("x"));
    }

    #[test]
    fn extract_bare_json_nested_braces() {
        let raw = r#"{"title":"braces {}","details":["a","b"]}"#;
        let out = extract_json_output::<Draft>(raw).unwrap();
        assert_eq!(out.title.as_deref(), Some("braces {}"));
        assert_eq!(out.details.len(), 2);
    }

    // ── extract_json_output: failure cases ─────────────────────────────────

    #[test]
    fn extract_returns_none_for_plain_text() {
        let raw = "Today was good. I went for a walk.";
        assert!(extract_json_output::<Draft>(raw).is_none());
    }

    #[test]
    fn extract_returns_none_for_malformed_json_in_fence() {
        let raw = "```json\n{not valid json}\n```";
        assert!(extract_json_output::<Draft>(raw).is_none());
    }

    #[test]
    fn extract_fenced_takes_precedence_over_bare() {
        let raw = r#"Bare: {"title":"wrong"}
```json
{"title":"right"}
```
"#;
        let out = extract_json_output::<Draft>(raw).unwrap();
        assert_eq!(out.title.as_deref(), Some("right"));
    }

    /// First '{' to last '}' spans both objects and is invalid JSON.
    #[test]
    fn extract_two_bare_objects_returns_none() {
        let raw = r#"Here: {"title":"a"} and also {"title":"b"}"#;
        assert!(extract_json_output::<Draft>(raw).is_none());
    }

    // ── Response parsing ───────────────────────────────────────────────────

    #[test]
    fn chat_completion_body_yields_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hello"}}]}"#;
        assert_eq!(parse_chat_completion_body(body).unwrap(), "hello");
    }

    #[test]
    fn chat_completion_without_choices_is_permanent() {
        let err = parse_chat_completion_body(r#"{"choices":[]}"#).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn ollama_body_yields_response() {
        let body = r#"{"model":"llama3","response":"diary text","done":true}"#;
        assert_eq!(parse_ollama_body(body).unwrap(), "diary text");
    }

    #[test]
    fn non_json_body_is_permanent() {
        assert!(matches!(
            parse_ollama_body("<html>bad gateway</html>"),
            Err(LlmError::Permanent(_))
        ));
    }

    // ── Failure classification ─────────────────────────────────────────────

    #[test]
    fn retryable_statuses() {
        for status in [408, 409, 425, 429, 500, 502, 503, 504] {
            assert!(should_retry_status(status), "{status} should retry");
        }
        for status in [400, 401, 403, 404, 422] {
            assert!(!should_retry_status(status), "{status} should not retry");
        }
    }

    #[test]
    fn status_classification_truncates_body() {
        let body = "x".repeat(1_000);
        let err = classify_status("openai", reqwest::StatusCode::TOO_MANY_REQUESTS, &body);
        match err {
            LlmError::Transient(message) => assert!(message.len() < 400),
            other => panic!("expected transient, got {other:?}"),
        }
        let err = classify_status("openai", reqwest::StatusCode::UNAUTHORIZED, "nope");
        assert!(!err.is_transient());
    }

    // ── Router ─────────────────────────────────────────────────────────────

    #[test]
    fn provider_from_label() {
        assert_eq!(Provider::from_label("ollama"), Provider::Ollama);
        assert_eq!(Provider::from_label(" OLLAMA "), Provider::Ollama);
        assert_eq!(Provider::from_label("openai"), Provider::OpenAi);
        assert_eq!(Provider::from_label("anything-else"), Provider::OpenAi);
    }

    #[tokio::test]
    async fn missing_api_key_is_permanent() {
        let config = LlmConfig {
            api_key: String::new(),
            ..LlmConfig::default()
        };
        let router = LlmRouter::from_config(&config).unwrap();
        assert_eq!(router.provider(), Provider::OpenAi);
        let err = router.complete("system", "prompt").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn unreachable_ollama_is_transient() {
        let config = LlmConfig {
            provider: "ollama".to_string(),
            ollama_base_url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 2,
            ..LlmConfig::default()
        };
        let router = LlmRouter::from_config(&config).unwrap();
        let err = router.complete("system", "prompt").await.unwrap_err();
        assert!(err.is_transient(), "got {err:?}");
    }
}
