//! Static agent registry.
//!
//! The registry document is loaded once at process start and is immutable
//! afterwards. Each entry describes how to reach one remote capability, what
//! its payload looks like, and how the gateway should retry and authenticate
//! calls to it.

mod loader;

pub use loader::{RegistryError, RegistryFormat};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Binding kind of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Remote capability reached over HTTP.
    Http,
    /// Echoes the user-facing message back and ends the turn.
    Interactive,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentKind::Http => write!(f, "http"),
            AgentKind::Interactive => write!(f, "interactive"),
        }
    }
}

/// Authentication mode for an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    None,
    /// Named secret attached to the request
    ApiKey,
    /// Token from the OAuth2 identity provider
    Bearer,
}

/// Where an API key is attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPlacement {
    #[default]
    Query,
    Header,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    #[serde(default)]
    pub mode: AuthMode,
    /// Name of the secret holding the API key
    #[serde(default)]
    pub secret_name: Option<String>,
    #[serde(default)]
    pub placement: KeyPlacement,
    /// Query parameter or header name. Defaults to `code` / `x-api-key`.
    #[serde(default)]
    pub parameter: Option<String>,
    /// OAuth2 scope requested for bearer tokens
    #[serde(default)]
    pub scope: Option<String>,
}

impl Authentication {
    /// Query parameter or header name the key is attached under.
    pub fn parameter_name(&self) -> &str {
        match (&self.parameter, self.placement) {
            (Some(name), _) => name,
            (None, KeyPlacement::Query) => "code",
            (None, KeyPlacement::Header) => "x-api-key",
        }
    }
}

/// Retry/backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_factor: f64,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: 2.0,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Circuit breaker parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_secs: 10,
        }
    }
}

impl BreakerPolicy {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Fingerprint cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Entry lifetime in seconds
    #[serde(default = "default_ttl")]
    pub ttl: u64,
}

fn default_ttl() -> u64 {
    300
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: default_ttl(),
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

/// One validated registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRegistration {
    pub name: String,
    pub kind: AgentKind,
    pub service_url: Option<String>,
    pub description: String,
    /// Object, or list of objects, shown to the planner
    pub request_template: Value,
    pub required_fields: Vec<String>,
    pub authentication: Authentication,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    /// Whether transient failures may be retried
    pub idempotent: bool,
    pub breaker: BreakerPolicy,
}

impl AgentRegistration {
    /// Minimal registration, mostly for tests and programmatic setups.
    pub fn new(name: impl Into<String>, kind: AgentKind) -> Self {
        Self {
            name: name.into(),
            kind,
            service_url: None,
            description: String::new(),
            request_template: Value::Object(Default::default()),
            required_fields: Vec::new(),
            authentication: Authentication::default(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            idempotent: true,
            breaker: BreakerPolicy::default(),
        }
    }

    pub fn with_service_url(mut self, url: impl Into<String>) -> Self {
        self.service_url = Some(url.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_template(mut self, template: Value) -> Self {
        self.request_template = template;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_required_fields(mut self, fields: &[&str]) -> Self {
        self.required_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Template fields as `(key, value)` lines; list templates are flattened.
    pub fn template_lines(&self) -> Vec<(String, String)> {
        fn push_object(lines: &mut Vec<(String, String)>, value: &Value) {
            if let Value::Object(map) = value {
                for (key, value) in map {
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    lines.push((key.clone(), rendered));
                }
            }
        }

        let mut lines = Vec::new();
        match &self.request_template {
            Value::Array(items) => items.iter().for_each(|item| push_object(&mut lines, item)),
            other => push_object(&mut lines, other),
        }
        lines
    }
}

/// The loaded registry.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentRegistration>,
    retry: RetryPolicy,
    cache: CacheSettings,
}

impl AgentRegistry {
    /// Build a registry from already-validated registrations.
    pub fn from_registrations(
        registrations: impl IntoIterator<Item = AgentRegistration>,
        cache: CacheSettings,
    ) -> Self {
        Self {
            agents: registrations
                .into_iter()
                .map(|r| (r.name.clone(), r))
                .collect(),
            retry: RetryPolicy::default(),
            cache,
        }
    }

    pub fn get(&self, name: &str) -> Option<&AgentRegistration> {
        self.agents.get(name)
    }

    /// Registrations ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = &AgentRegistration> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Names of agents that authenticate with an identity-provider token.
    pub fn bearer_agents(&self) -> Vec<&str> {
        self.agents
            .values()
            .filter(|agent| agent.authentication.mode == AuthMode::Bearer)
            .map(|agent| agent.name.as_str())
            .collect()
    }

    /// Document-level retry defaults.
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn cache(&self) -> &CacheSettings {
        &self.cache
    }
}
