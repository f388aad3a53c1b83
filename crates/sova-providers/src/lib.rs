//! Sova Providers
//!
//! OpenAI-compatible chat client, speech clients, image URL builder
//! and the model registry that decides where each model is routed

pub mod image;
pub mod registry;
pub mod speech;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sova_storage::HistoryEntry;
use std::time::{Duration, Instant};
use tokio::time::sleep;

pub use image::ImageUrlBuilder;
pub use registry::{ModelEntry, ModelRegistry};
pub use speech::{SpeechClient, SpeechSynthesizer, Transcriber, WhisperClient};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} rejected the credential (HTTP {status})")]
    InvalidCredential { provider: String, status: u16 },

    #[error("{provider} rate limit exceeded")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("{provider} HTTP {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} response decode failed: {message}")]
    Decode { provider: String, message: String },

    #[error("{provider} transport error: {source}")]
    Transport {
        provider: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ProviderError {
    /// Map a non-success HTTP response onto the error taxonomy.
    pub fn from_status(provider: &str, status: u16, headers: &HeaderMap, body: &str) -> Self {
        match status {
            401 | 403 => ProviderError::InvalidCredential {
                provider: provider.to_string(),
                status,
            },
            429 => ProviderError::RateLimited {
                provider: provider.to_string(),
                retry_after: parse_retry_after_headers(headers),
            },
            _ => ProviderError::Http {
                provider: provider.to_string(),
                status,
                body: truncate_for_error(body, 600),
            },
        }
    }

    pub fn transport(provider: &str, source: reqwest::Error) -> Self {
        ProviderError::Transport {
            provider: provider.to_string(),
            source,
        }
    }

    pub fn decode(provider: &str, message: impl Into<String>) -> Self {
        ProviderError::Decode {
            provider: provider.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Retry budget for transient failures (5xx, timeouts, connection errors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub window_secs: u64,
    pub initial_delay_secs: u64,
    pub backoff_factor: u32,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            window_secs: 30,
            initial_delay_secs: 1,
            backoff_factor: 2,
            max_delay_secs: 8,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &sova_config::RetryPolicyConfig) -> Self {
        let defaults = Self::default();
        Self {
            window_secs: config.window_secs.unwrap_or(defaults.window_secs),
            initial_delay_secs: config
                .initial_delay_secs
                .unwrap_or(defaults.initial_delay_secs),
            backoff_factor: config.backoff_factor.unwrap_or(defaults.backoff_factor),
            max_delay_secs: config.max_delay_secs.unwrap_or(defaults.max_delay_secs),
        }
    }

    /// Delay before the next attempt, or `None` once the window is spent.
    pub fn next_delay(
        &self,
        attempt: u32,
        headers: &HeaderMap,
        elapsed: Duration,
    ) -> Option<Duration> {
        let window = Duration::from_secs(self.window_secs.max(1));
        let remaining = window.saturating_sub(elapsed);
        if remaining.is_zero() {
            return None;
        }

        let delay = parse_retry_after_headers(headers)
            .unwrap_or_else(|| self.exponential_delay(attempt))
            .min(remaining);

        if delay.is_zero() {
            Some(Duration::from_millis(1))
        } else {
            Some(delay)
        }
    }

    pub fn exponential_delay(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay_secs.max(1);
        let factor = self.backoff_factor.max(1) as u64;
        let max_delay = self.max_delay_secs.max(1);

        let exponent = attempt.saturating_sub(1).min(20);
        let multiplier = factor.saturating_pow(exponent);
        Duration::from_secs(initial.saturating_mul(multiplier).min(max_delay))
    }
}

/// A text completion backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(
        &self,
        model: &str,
        messages: &[HistoryEntry],
    ) -> Result<ChatResponse, ProviderError>;

    async fn health_check(&self) -> anyhow::Result<bool>;
}

pub struct OpenAICompatibleProvider {
    client: Client,
    name: String,
    api_key: String,
    base_url: String,
    retry_policy: RetryPolicy,
}

impl OpenAICompatibleProvider {
    pub fn new(
        name: String,
        api_key: String,
        base_url: String,
        retry_policy: RetryPolicy,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client()?,
            name,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry_policy,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request_chat(&self, body: serde_json::Value) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let start = Instant::now();
        let mut attempt: u32 = 1;

        loop {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    let headers = response.headers().clone();
                    let raw_body = response
                        .text()
                        .await
                        .map_err(|e| ProviderError::transport(&self.name, e))?;

                    if status.is_success() {
                        let parsed: serde_json::Value =
                            serde_json::from_str(&raw_body).map_err(|e| {
                                ProviderError::decode(
                                    &self.name,
                                    format!(
                                        "{} | body={}",
                                        e,
                                        truncate_for_error(&raw_body, 600)
                                    ),
                                )
                            })?;
                        return self.parse_response(parsed);
                    }

                    if is_retryable_status(status) {
                        if let Some(delay) =
                            self.retry_policy
                                .next_delay(attempt, &headers, start.elapsed())
                        {
                            tracing::warn!(
                                provider = %self.name,
                                status = %status.as_u16(),
                                attempt = attempt,
                                delay_ms = delay.as_millis(),
                                "Retrying provider request after transient HTTP error"
                            );
                            sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                    }

                    return Err(ProviderError::from_status(
                        &self.name,
                        status.as_u16(),
                        &headers,
                        &raw_body,
                    ));
                }
                Err(err) => {
                    if is_retryable_reqwest(&err) {
                        if let Some(delay) = self.retry_policy.next_delay(
                            attempt,
                            &HeaderMap::new(),
                            start.elapsed(),
                        ) {
                            tracing::warn!(
                                provider = %self.name,
                                attempt = attempt,
                                delay_ms = delay.as_millis(),
                                error = %err,
                                "Retrying provider request after transient network error"
                            );
                            sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                    }

                    return Err(ProviderError::transport(&self.name, err));
                }
            }
        }
    }

    fn parse_response(&self, response: serde_json::Value) -> Result<ChatResponse, ProviderError> {
        if let Some(error) = response.get("error") {
            return Err(ProviderError::decode(
                &self.name,
                format!("API error: {}", error),
            ));
        }

        let choice = response
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|choices| choices.first())
            .ok_or_else(|| {
                ProviderError::decode(&self.name, "missing or empty 'choices' array")
            })?;

        let message = choice
            .get("message")
            .ok_or_else(|| ProviderError::decode(&self.name, "missing 'message' object"))?;

        let content = match message.get("content") {
            Some(serde_json::Value::String(text)) => text.clone(),
            // Some gateways return content as a list of typed parts.
            Some(serde_json::Value::Array(parts)) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        };

        let finish_reason = choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let usage = response.get("usage").map(|u| Usage {
            prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            completion_tokens: u
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        });

        let model = response
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(ChatResponse {
            content,
            model,
            usage,
            finish_reason,
        })
    }
}

#[async_trait]
impl ChatProvider for OpenAICompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[HistoryEntry],
    ) -> Result<ChatResponse, ProviderError> {
        self.request_chat(serde_json::json!({
            "model": model,
            "messages": messages
        }))
        .await
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        let url = format!("{}/models", self.base_url);
        match self.client.get(&url).bearer_auth(&self.api_key).send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

pub(crate) fn build_client() -> anyhow::Result<Client> {
    Ok(Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()?)
}

pub(crate) fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 500 | 502 | 503 | 504)
}

fn is_retryable_reqwest(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn parse_retry_after_headers(headers: &HeaderMap) -> Option<Duration> {
    if let Some(v) = headers.get("retry-after-ms").and_then(|h| h.to_str().ok()) {
        if let Ok(ms) = v.trim().parse::<u64>() {
            if ms > 0 {
                return Some(Duration::from_millis(ms));
            }
        }
    }

    if let Some(v) = headers.get("retry-after").and_then(|h| h.to_str().ok()) {
        let trimmed = v.trim();
        if let Ok(secs) = trimmed.parse::<u64>() {
            if secs > 0 {
                return Some(Duration::from_secs(secs));
            }
        }

        if let Ok(http_date) = DateTime::parse_from_rfc2822(trimmed) {
            let now = Utc::now();
            let target = http_date.with_timezone(&Utc);
            if target > now {
                let millis = (target - now).num_milliseconds();
                if millis > 0 {
                    return Some(Duration::from_millis(millis as u64));
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn provider() -> OpenAICompatibleProvider {
        OpenAICompatibleProvider::new(
            "test".to_string(),
            "key".to_string(),
            "https://example.invalid/v1/".to_string(),
            RetryPolicy::default(),
        )
        .expect("client")
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        assert_eq!(provider().base_url(), "https://example.invalid/v1");
    }

    #[test]
    fn parse_response_errors_on_missing_choices() {
        let parsed = provider().parse_response(serde_json::json!({ "id": "x" }));
        assert!(matches!(parsed, Err(ProviderError::Decode { .. })));
    }

    #[test]
    fn parse_response_errors_on_api_error_object() {
        let parsed = provider().parse_response(serde_json::json!({
            "error": { "message": "boom" }
        }));
        assert!(matches!(parsed, Err(ProviderError::Decode { .. })));
    }

    #[test]
    fn parse_response_reads_content_and_model() {
        let response = serde_json::json!({
            "model": "real-model",
            "choices": [
                {
                    "message": { "role": "assistant", "content": "hello" },
                    "finish_reason": "stop"
                }
            ],
            "usage": {
                "prompt_tokens": 1,
                "completion_tokens": 2,
                "total_tokens": 3
            }
        });

        let parsed = provider()
            .parse_response(response)
            .expect("expected parse success");
        assert_eq!(parsed.content, "hello");
        assert_eq!(parsed.model, "real-model");
        assert_eq!(parsed.finish_reason.as_deref(), Some("stop"));
        assert_eq!(parsed.usage.map(|u| u.total_tokens), Some(3));
    }

    #[test]
    fn parse_response_joins_content_parts() {
        let response = serde_json::json!({
            "choices": [
                { "message": { "content": [
                    { "type": "text", "text": "Hel" },
                    { "type": "text", "text": "lo" }
                ] } }
            ]
        });
        let parsed = provider().parse_response(response).expect("parse");
        assert_eq!(parsed.content, "Hello");
    }

    #[test]
    fn status_classification() {
        let headers = HeaderMap::new();
        assert!(matches!(
            ProviderError::from_status("p", 401, &headers, ""),
            ProviderError::InvalidCredential { status: 401, .. }
        ));
        assert!(matches!(
            ProviderError::from_status("p", 403, &headers, ""),
            ProviderError::InvalidCredential { status: 403, .. }
        ));
        assert!(matches!(
            ProviderError::from_status("p", 429, &headers, ""),
            ProviderError::RateLimited { retry_after: None, .. }
        ));
        assert!(matches!(
            ProviderError::from_status("p", 500, &headers, "oops"),
            ProviderError::Http { status: 500, .. }
        ));
    }

    #[test]
    fn rate_limit_keeps_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("7"));
        match ProviderError::from_status("p", 429, &headers, "") {
            ProviderError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rate_limit_is_not_retried() {
        assert!(!is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn retry_header_precedence_prefers_retry_after_ms() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after-ms", HeaderValue::from_static("1500"));
        headers.insert("retry-after", HeaderValue::from_static("99"));

        let delay = parse_retry_after_headers(&headers).expect("expected delay");
        assert_eq!(delay, Duration::from_millis(1500));
    }

    #[test]
    fn retry_fallback_sequence_has_exponential_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.exponential_delay(1), Duration::from_secs(1));
        assert_eq!(policy.exponential_delay(2), Duration::from_secs(2));
        assert_eq!(policy.exponential_delay(4), Duration::from_secs(8));
        assert_eq!(policy.exponential_delay(9), Duration::from_secs(8));
    }

    #[test]
    fn retry_stops_after_window() {
        let policy = RetryPolicy::default();
        let headers = HeaderMap::new();
        assert!(policy
            .next_delay(1, &headers, Duration::from_secs(31))
            .is_none());
        assert_eq!(
            policy.next_delay(5, &headers, Duration::from_secs(28)),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn retry_policy_from_config_fills_defaults() {
        let config = sova_config::RetryPolicyConfig {
            window_secs: Some(10),
            ..Default::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.window_secs, 10);
        assert_eq!(policy.initial_delay_secs, 1);
        assert_eq!(policy.max_delay_secs, 8);
    }

    #[test]
    fn history_serializes_as_openai_messages() {
        let messages = vec![
            HistoryEntry::system("sys"),
            HistoryEntry::user("hi"),
            HistoryEntry::assistant("hello"),
        ];
        let body = serde_json::json!({ "model": "m", "messages": messages });
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["messages"][2]["role"], "assistant");
    }
}
