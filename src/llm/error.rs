//! LLM error types with retry classification.
//!
//! Distinguishes between transient errors (should retry) and permanent errors (should not retry),
//! and carries the service-specific failure codes the turn boundary turns into user messages.

use std::time::Duration;

/// Error from LLM API calls.
#[derive(Debug, Clone)]
pub struct LlmError {
    /// The kind of error
    pub kind: LlmErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Service error code from the response body (e.g. `content_filter`)
    pub code: Option<String>,
    /// Error message
    pub message: String,
    /// Suggested retry delay (from Retry-After header)
    pub retry_after: Option<Duration>,
}

impl LlmError {
    fn with_kind(kind: LlmErrorKind, status_code: Option<u16>, message: String) -> Self {
        Self {
            kind,
            status_code,
            code: None,
            message,
            retry_after: None,
        }
    }

    /// Create a rate limit error.
    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::with_kind(LlmErrorKind::RateLimited, Some(429), message)
        }
    }

    /// Create a server error.
    pub fn server_error(status_code: u16, message: String) -> Self {
        Self::with_kind(LlmErrorKind::ServerError, Some(status_code), message)
    }

    /// Create a client error (bad request, auth, etc.).
    pub fn client_error(status_code: u16, message: String) -> Self {
        Self::with_kind(LlmErrorKind::ClientError, Some(status_code), message)
    }

    /// Create a network error.
    pub fn network_error(message: String) -> Self {
        Self::with_kind(LlmErrorKind::NetworkError, None, message)
    }

    /// Create a timeout error.
    pub fn timeout(message: String) -> Self {
        Self::with_kind(LlmErrorKind::Timeout, None, message)
    }

    /// Create a parse error.
    pub fn parse_error(message: String) -> Self {
        Self::with_kind(LlmErrorKind::ParseError, None, message)
    }

    /// Create a content-safety error.
    pub fn content_filtered(message: String) -> Self {
        Self {
            code: Some("content_filter".to_string()),
            ..Self::with_kind(LlmErrorKind::ContentFiltered, Some(400), message)
        }
    }

    /// Create a missing-deployment error.
    pub fn deployment_not_found(message: String) -> Self {
        Self {
            code: Some("DeploymentNotFound".to_string()),
            ..Self::with_kind(LlmErrorKind::DeploymentNotFound, Some(404), message)
        }
    }

    /// Attach the service error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Check if this error is transient and should be retried.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Get the suggested delay before retry.
    ///
    /// Returns the `retry_after` if set, otherwise exponential backoff with a
    /// deterministic jitter, capped at 60 seconds.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Some(retry_after) = self.retry_after {
            return retry_after;
        }

        let base_delay = match self.kind {
            LlmErrorKind::RateLimited => Duration::from_secs(5),
            LlmErrorKind::ServerError => Duration::from_secs(2),
            _ => Duration::from_secs(1),
        };

        let multiplier = 2u64.saturating_pow(attempt);
        let delay_secs = base_delay.as_secs().saturating_mul(multiplier);

        let jitter_range = delay_secs / 4;
        let jitter = if jitter_range > 0 {
            (attempt as u64 * 7) % jitter_range
        } else {
            0
        };

        Duration::from_secs((delay_secs + jitter).min(60))
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

/// Classification of LLM errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Rate limited (429) - transient, should retry with backoff
    RateLimited,
    /// Server error (500, 502, 503, 504) - transient, should retry
    ServerError,
    /// Client error (400, 401, 403, 404) - permanent, should not retry
    ClientError,
    /// Network error (connection failed) - transient, should retry
    NetworkError,
    /// Request exceeded its deadline - transient
    Timeout,
    /// Response parsing error - permanent
    ParseError,
    /// Blocked by the service's content-safety filter
    ContentFiltered,
    /// The requested model deployment does not exist
    DeploymentNotFound,
}

impl LlmErrorKind {
    /// Check if this error kind is transient (should retry with same model).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited
                | LlmErrorKind::ServerError
                | LlmErrorKind::NetworkError
                | LlmErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmErrorKind::RateLimited => write!(f, "Rate limited"),
            LlmErrorKind::ServerError => write!(f, "Server error"),
            LlmErrorKind::ClientError => write!(f, "Client error"),
            LlmErrorKind::NetworkError => write!(f, "Network error"),
            LlmErrorKind::Timeout => write!(f, "Timeout"),
            LlmErrorKind::ParseError => write!(f, "Parse error"),
            LlmErrorKind::ContentFiltered => write!(f, "Content filtered"),
            LlmErrorKind::DeploymentNotFound => write!(f, "Deployment not found"),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Maximum total time to spend retrying
    pub max_retry_duration: Duration,
    /// Whether to retry on rate limit errors
    pub retry_rate_limits: bool,
    /// Whether to retry on server errors
    pub retry_server_errors: bool,
    /// Whether to retry on network errors and timeouts
    pub retry_network_errors: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_retry_duration: Duration::from_secs(120),
            retry_rate_limits: true,
            retry_server_errors: true,
            retry_network_errors: true,
        }
    }
}

impl RetryConfig {
    /// Configuration that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Upper bound on one completion call: every attempt runs to `per_request`
    /// and the backoff sleeps share `max_retry_duration`.
    pub fn attempt_budget(&self, per_request: Duration) -> Duration {
        per_request
            .saturating_mul(self.max_retries.saturating_add(1))
            .saturating_add(self.max_retry_duration)
    }

    /// Check if the given error should be retried based on this config.
    pub fn should_retry(&self, error: &LlmError) -> bool {
        match error.kind {
            LlmErrorKind::RateLimited => self.retry_rate_limits,
            LlmErrorKind::ServerError => self.retry_server_errors,
            LlmErrorKind::NetworkError | LlmErrorKind::Timeout => self.retry_network_errors,
            LlmErrorKind::ClientError
            | LlmErrorKind::ParseError
            | LlmErrorKind::ContentFiltered
            | LlmErrorKind::DeploymentNotFound => false,
        }
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        408 => LlmErrorKind::Timeout,
        500 | 502 | 503 | 504 => LlmErrorKind::ServerError,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}

/// Refine an error using the service error code found in the response body.
///
/// Azure-style bodies look like `{"error": {"code": "content_filter", ...}}`.
pub fn classify_error_body(status: u16, body: &str) -> Option<LlmError> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let code = value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())?;

    match code {
        "content_filter" | "ResponsibleAIPolicyViolation" => {
            Some(LlmError::content_filtered(body.to_string()).with_code(code))
        }
        "DeploymentNotFound" => Some(LlmError::deployment_not_found(body.to_string())),
        other => {
            let kind = classify_http_status(status);
            let base = match kind {
                LlmErrorKind::ClientError => LlmError::client_error(status, body.to_string()),
                _ => LlmError::server_error(status, body.to_string()),
            };
            Some(base.with_code(other))
        }
    }
}
