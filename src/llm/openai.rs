//! OpenAI-compatible chat completion client with automatic retry for transient errors.
//!
//! Speaks both the public OpenAI URL scheme (`{base}/chat/completions`, bearer
//! key) and the Azure OpenAI deployment scheme
//! (`{base}/openai/deployments/{model}/chat/completions?api-version=..`,
//! `api-key` header). Azure mode is selected by configuring an API version.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::error::{classify_error_body, classify_http_status, LlmError, LlmErrorKind, RetryConfig};
use super::{ChatMessage, ChatOptions, ChatResponse, LlmClient, TokenUsage};
use crate::config::LlmConfig;

/// Chat completion client with automatic retry for transient errors.
pub struct OpenAiClient {
    client: Client,
    api_base: String,
    api_key: String,
    api_version: Option<String>,
    retry_config: RetryConfig,
    timeout: Duration,
}

impl OpenAiClient {
    /// Create a new client with default retry configuration.
    pub fn new(config: &LlmConfig) -> Self {
        Self::with_retry_config(config, RetryConfig::default())
    }

    /// Create a new client with custom retry configuration.
    pub fn with_retry_config(config: &LlmConfig, retry_config: RetryConfig) -> Self {
        Self {
            client: Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_version: config.api_version.clone(),
            retry_config,
            timeout: config.timeout,
        }
    }

    fn endpoint(&self, model: &str) -> String {
        match &self.api_version {
            Some(version) => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.api_base, model, version
            ),
            None => format!("{}/chat/completions", self.api_base),
        }
    }

    /// Parse Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
    }

    /// Create an LlmError from HTTP response status and body.
    fn create_error(
        status: reqwest::StatusCode,
        body: &str,
        retry_after: Option<Duration>,
    ) -> LlmError {
        let status_code = status.as_u16();
        let kind = classify_http_status(status_code);

        if kind == LlmErrorKind::RateLimited {
            return LlmError::rate_limited(body.to_string(), retry_after);
        }
        if let Some(err) = classify_error_body(status_code, body) {
            return err;
        }
        match kind {
            LlmErrorKind::ClientError => LlmError::client_error(status_code, body.to_string()),
            LlmErrorKind::Timeout => LlmError::timeout(body.to_string()),
            _ => LlmError::server_error(status_code, body.to_string()),
        }
    }

    /// Execute a single request without retry.
    async fn execute_request(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<ChatResponse, LlmError> {
        let mut builder = self
            .client
            .post(self.endpoint(model))
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .json(request);
        builder = match self.api_version {
            Some(_) => builder.header("api-key", &self.api_key),
            None => builder.bearer_auth(&self.api_key),
        };

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(LlmError::timeout(format!("Request timeout: {}", e)));
            }
            Err(e) if e.is_connect() => {
                return Err(LlmError::network_error(format!("Connection failed: {}", e)));
            }
            Err(e) => return Err(LlmError::network_error(format!("Request failed: {}", e))),
        };

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(Self::create_error(status, &body, retry_after));
        }

        let parsed: CompletionResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::parse_error("No choices in response".to_string()))?;

        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(LlmError::content_filtered(
                "Completion was stopped by the content filter".to_string(),
            ));
        }

        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));
        if let Some(ref usage) = usage {
            tracing::info!(
                model = parsed.model.as_deref().unwrap_or(model),
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Completion received"
            );
        }

        Ok(ChatResponse {
            content: choice.message.content,
            finish_reason: choice.finish_reason,
            usage,
            model: parsed.model.or_else(|| Some(model.to_string())),
        })
    }

    /// Execute a request with automatic retry for transient errors.
    async fn execute_with_retry(
        &self,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<ChatResponse, LlmError> {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            match self.execute_request(model, request).await {
                Ok(response) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Completion succeeded after {} retries (total time: {:?})",
                            attempt,
                            start.elapsed()
                        );
                    }
                    return Ok(response);
                }
                Err(error) => {
                    let should_retry = self.retry_config.should_retry(&error)
                        && attempt < self.retry_config.max_retries;
                    if !should_retry {
                        if attempt > 0 {
                            tracing::error!(
                                "Completion failed after {} retries (total time: {:?}): {}",
                                attempt,
                                start.elapsed(),
                                error
                            );
                        } else {
                            tracing::error!("Completion failed (non-retryable): {}", error);
                        }
                        return Err(error);
                    }

                    let remaining = self
                        .retry_config
                        .max_retry_duration
                        .saturating_sub(start.elapsed());
                    let delay = error.suggested_delay(attempt).min(remaining);
                    if delay.is_zero() {
                        tracing::warn!(
                            "Retry attempt {} failed, no time remaining: {}",
                            attempt + 1,
                            error
                        );
                        return Err(error);
                    }

                    tracing::warn!(
                        "Retry attempt {} failed with {}, retrying in {:?}: {}",
                        attempt + 1,
                        error.kind,
                        delay,
                        error.message
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let request = CompletionRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            response_format: options.json_mode.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        tracing::debug!(
            "Sending completion request: model={}, json_mode={}",
            model,
            options.json_mode
        );

        self.execute_with_retry(model, &request).await
    }
}

/// Chat completion request format.
#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

/// Chat completion response format.
#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

/// Usage data (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llm_config(api_version: Option<&str>) -> LlmConfig {
        LlmConfig {
            api_base: "https://example.openai.azure.com/".to_string(),
            api_key: "key".to_string(),
            api_version: api_version.map(str::to_string),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_endpoint_schemes() {
        let openai = OpenAiClient::new(&llm_config(None));
        assert_eq!(
            openai.endpoint("gpt-4o"),
            "https://example.openai.azure.com/chat/completions"
        );

        let azure = OpenAiClient::new(&llm_config(Some("2024-02-01")));
        assert_eq!(
            azure.endpoint("planner"),
            "https://example.openai.azure.com/openai/deployments/planner/chat/completions?api-version=2024-02-01"
        );
    }

    #[test]
    fn test_json_mode_serializes_response_format() {
        let request = CompletionRequest {
            model: "m".to_string(),
            messages: vec![ChatMessage::user("hi")],
            temperature: Some(0.0),
            max_tokens: None,
            response_format: Some(ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["response_format"]["type"], "json_object");
        assert!(value.get("max_tokens").is_none());
        assert_eq!(value["messages"][0]["role"], "user");
    }

    #[test]
    fn test_create_error_content_filter() {
        let err = OpenAiClient::create_error(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error": {"code": "content_filter"}}"#,
            None,
        );
        assert_eq!(err.kind, LlmErrorKind::ContentFiltered);
    }
}
