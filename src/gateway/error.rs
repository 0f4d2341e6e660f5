//! Dispatch failures with a closed set of failure codes.

use std::time::Duration;

use crate::plan::StepId;

/// Failure code produced by the gateway's translation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorKind {
    /// Network failure or transient HTTP status (408, 429, 5xx)
    Transport,
    /// The attempt exceeded the agent's timeout
    Timeout,
    /// The agent answered with a permanent failure
    Rejected,
    /// HTTP 403
    Forbidden,
    /// Breaker open, no attempt was made
    CircuitOpen,
    /// The named API key secret does not exist
    SecretNotFound,
    /// The downstream completion service blocked the content
    ContentFiltered,
    /// The downstream completion service has no such deployment
    DeploymentNotFound,
    /// No agent with that name is registered
    UnknownAgent,
    /// A required payload field is missing
    MissingField,
    /// Credentials could not be obtained or were refused (401)
    Authentication,
}

impl DispatchErrorKind {
    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchErrorKind::Transport | DispatchErrorKind::Timeout)
    }
}

impl std::fmt::Display for DispatchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DispatchErrorKind::Transport => "transport",
            DispatchErrorKind::Timeout => "timeout",
            DispatchErrorKind::Rejected => "rejected",
            DispatchErrorKind::Forbidden => "forbidden",
            DispatchErrorKind::CircuitOpen => "circuit_open",
            DispatchErrorKind::SecretNotFound => "secret_not_found",
            DispatchErrorKind::ContentFiltered => "content_filtered",
            DispatchErrorKind::DeploymentNotFound => "deployment_not_found",
            DispatchErrorKind::UnknownAgent => "unknown_agent",
            DispatchErrorKind::MissingField => "missing_field",
            DispatchErrorKind::Authentication => "authentication",
        };
        write!(f, "{}", s)
    }
}

/// Error from one logical dispatch.
#[derive(Debug, Clone)]
pub struct DispatchError {
    pub agent: String,
    pub step: Option<StepId>,
    pub kind: DispatchErrorKind,
    pub message: String,
    /// HTTP status of the failed attempt, if any
    pub status: Option<u16>,
    /// Server-requested delay before retrying
    pub retry_after: Option<Duration>,
}

impl DispatchError {
    pub fn new(agent: impl Into<String>, kind: DispatchErrorKind, message: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            step: None,
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn at_step(mut self, step: StepId) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Translate a failed HTTP response into a failure code.
    ///
    /// Agents that front a completion service pass its error codes through in
    /// the body; those are recognised so the user message can be tailored.
    pub fn from_status(agent: &str, status: u16, body: &str) -> Self {
        let kind = match status {
            403 => DispatchErrorKind::Forbidden,
            401 => DispatchErrorKind::Authentication,
            408 | 429 | 500 | 502 | 503 | 504 => DispatchErrorKind::Transport,
            _ => body_failure_code(body).unwrap_or(DispatchErrorKind::Rejected),
        };
        let message = if body.trim().is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, truncate(body, 500))
        };
        Self::new(agent, kind, message).with_status(status)
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.step {
            Some(step) => write!(
                f,
                "Agent {} failed at step {}: {}: {}",
                self.agent, step, self.kind, self.message
            ),
            None => write!(f, "Agent {} failed: {}: {}", self.agent, self.kind, self.message),
        }
    }
}

impl std::error::Error for DispatchError {}

fn body_failure_code(body: &str) -> Option<DispatchErrorKind> {
    if body.contains("content_filter") || body.contains("ResponsibleAIPolicyViolation") {
        Some(DispatchErrorKind::ContentFiltered)
    } else if body.contains("DeploymentNotFound") {
        Some(DispatchErrorKind::DeploymentNotFound)
    } else if body.contains("SecretNotFound") {
        Some(DispatchErrorKind::SecretNotFound)
    } else {
        None
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
