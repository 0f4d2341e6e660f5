//! Registry document loading and validation.
//!
//! The document is JSON, or YAML when the file extension is `.yaml`/`.yml`:
//!
//! ```json
//! {
//!   "agents": {
//!     "FlightAvailability": {
//!       "kind": "http",
//!       "service_url": "https://flights.internal/api/availability",
//!       "description": "Checks seat availability",
//!       "request_template": {"Origin": "IATA code"},
//!       "required_fields": ["Origin"],
//!       "authentication": {"mode": "api_key", "secret_name": "flights-key"}
//!     }
//!   },
//!   "retry": {"max_retries": 3, "backoff_factor": 2},
//!   "cache": {"enabled": true, "ttl": 300}
//! }
//! ```

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::{
    AgentKind, AgentRegistration, AgentRegistry, AuthMode, Authentication, BreakerPolicy,
    CacheSettings, RetryPolicy,
};

const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry file {0} does not exist")]
    NotFound(PathBuf),

    #[error("Failed to read registry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse registry {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },

    #[error("Registry {0} is missing the 'agents' key")]
    MissingAgents(String),

    #[error("Agent '{0}' is missing its 'kind'")]
    MissingKind(String),

    #[error("Agent '{0}' is an http agent without a 'service_url'")]
    MissingServiceUrl(String),

    #[error("Agent '{agent}' has an invalid service_url: {reason}")]
    InvalidServiceUrl { agent: String, reason: String },

    #[error("Agent '{0}' uses api_key authentication without a 'secret_name'")]
    MissingSecretName(String),

    #[error("Agent '{0}' uses bearer authentication without a 'scope'")]
    MissingScope(String),

    #[error("Agent '{0}' has a request_template that is neither an object nor a list of objects")]
    InvalidTemplate(String),
}

/// Document format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryFormat {
    Json,
    Yaml,
}

impl RegistryFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                RegistryFormat::Yaml
            }
            _ => RegistryFormat::Json,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    agents: Option<BTreeMap<String, RawAgent>>,
    #[serde(default)]
    retry: Option<RawRetry>,
    #[serde(default)]
    cache: Option<CacheSettings>,
}

#[derive(Debug, Deserialize)]
struct RawAgent {
    #[serde(default)]
    kind: Option<AgentKind>,
    #[serde(default)]
    service_url: Option<String>,
    #[serde(default, alias = "AgentDescription")]
    description: Option<String>,
    #[serde(default)]
    request_template: Option<Value>,
    #[serde(default)]
    required_fields: Vec<String>,
    #[serde(default)]
    authentication: Option<Authentication>,
    #[serde(default)]
    retry: Option<RawRetry>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    idempotent: Option<bool>,
    #[serde(default)]
    breaker: Option<BreakerPolicy>,
}

/// Retry block where every field may be omitted.
#[derive(Debug, Default, Deserialize)]
struct RawRetry {
    max_retries: Option<u32>,
    backoff_factor: Option<f64>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

impl RawRetry {
    fn over(self, base: &RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            backoff_factor: self.backoff_factor.unwrap_or(base.backoff_factor),
            base_delay_ms: self.base_delay_ms.unwrap_or(base.base_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(base.max_delay_ms),
        }
    }
}

impl AgentRegistry {
    /// Load and validate the registry document at `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(RegistryError::NotFound(path.to_path_buf()));
        }
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| RegistryError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
        let registry = Self::parse(
            &contents,
            RegistryFormat::from_path(path),
            &path.display().to_string(),
        )?;
        tracing::info!(
            path = %path.display(),
            agents = registry.len(),
            cache_enabled = registry.cache().enabled,
            "Agent registry loaded"
        );
        Ok(registry)
    }

    /// Parse and validate a registry document.
    pub fn parse(
        contents: &str,
        format: RegistryFormat,
        source_name: &str,
    ) -> Result<Self, RegistryError> {
        let parse_error = |message: String| RegistryError::Parse {
            source_name: source_name.to_string(),
            message,
        };
        let raw: RawDocument = match format {
            RegistryFormat::Json => {
                serde_json::from_str(contents).map_err(|e| parse_error(e.to_string()))?
            }
            RegistryFormat::Yaml => {
                serde_yaml::from_str(contents).map_err(|e| parse_error(e.to_string()))?
            }
        };

        let agents = raw
            .agents
            .ok_or_else(|| RegistryError::MissingAgents(source_name.to_string()))?;
        let retry = raw.retry.unwrap_or_default().over(&RetryPolicy::default());
        let cache = raw.cache.unwrap_or_default();

        let mut validated = BTreeMap::new();
        for (name, agent) in agents {
            let registration = validate_agent(name, agent, &retry)?;
            validated.insert(registration.name.clone(), registration);
        }

        Ok(Self {
            agents: validated,
            retry,
            cache,
        })
    }
}

fn validate_agent(
    name: String,
    raw: RawAgent,
    default_retry: &RetryPolicy,
) -> Result<AgentRegistration, RegistryError> {
    let kind = raw
        .kind
        .ok_or_else(|| RegistryError::MissingKind(name.clone()))?;

    let service_url = raw.service_url.filter(|u| !u.trim().is_empty());
    if kind == AgentKind::Http {
        let endpoint = service_url
            .as_deref()
            .ok_or_else(|| RegistryError::MissingServiceUrl(name.clone()))?;
        url::Url::parse(endpoint).map_err(|e| RegistryError::InvalidServiceUrl {
            agent: name.clone(),
            reason: e.to_string(),
        })?;
    }

    let request_template = raw
        .request_template
        .unwrap_or_else(|| Value::Object(Default::default()));
    let template_ok = match &request_template {
        Value::Object(_) => true,
        Value::Array(items) => items.iter().all(Value::is_object),
        _ => false,
    };
    if !template_ok {
        return Err(RegistryError::InvalidTemplate(name));
    }

    let authentication = raw.authentication.unwrap_or_default();
    if authentication.mode == AuthMode::ApiKey && authentication.secret_name.is_none() {
        return Err(RegistryError::MissingSecretName(name));
    }
    let has_scope = authentication
        .scope
        .as_deref()
        .is_some_and(|scope| !scope.trim().is_empty());
    if authentication.mode == AuthMode::Bearer && !has_scope {
        return Err(RegistryError::MissingScope(name));
    }

    Ok(AgentRegistration {
        kind,
        service_url,
        description: raw.description.unwrap_or_default(),
        request_template,
        required_fields: raw.required_fields,
        authentication,
        retry: raw.retry.unwrap_or_default().over(default_retry),
        timeout: Duration::from_secs(raw.timeout_secs.unwrap_or(DEFAULT_AGENT_TIMEOUT_SECS)),
        idempotent: raw.idempotent.unwrap_or(true),
        breaker: raw.breaker.unwrap_or_default(),
        name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "agents": {
            "Flights": {
                "kind": "http",
                "service_url": "https://flights.example.com/api",
                "AgentDescription": "Checks flight availability",
                "request_template": {"Origin": "IATA code"},
                "required_fields": ["Origin"],
                "authentication": {"mode": "api_key", "secret_name": "flights-key"},
                "retry": {"max_retries": 5}
            },
            "UserProxyAgent": {"kind": "interactive", "description": "Talks to the user"}
        },
        "retry": {"max_retries": 2, "backoff_factor": 3}
    }"#;

    fn parse(contents: &str) -> Result<AgentRegistry, RegistryError> {
        AgentRegistry::parse(contents, RegistryFormat::Json, "test")
    }

    #[test]
    fn test_parse_fills_defaults() {
        let registry = parse(SAMPLE).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(!registry.cache().enabled);
        assert_eq!(registry.cache().ttl, 300);

        let flights = registry.get("Flights").unwrap();
        assert_eq!(flights.kind, AgentKind::Http);
        assert_eq!(flights.description, "Checks flight availability");
        // agent override wins, the rest comes from the document defaults
        assert_eq!(flights.retry.max_retries, 5);
        assert_eq!(flights.retry.backoff_factor, 3.0);
        assert_eq!(flights.breaker.failure_threshold, 3);
        assert!(flights.idempotent);

        let proxy = registry.get("UserProxyAgent").unwrap();
        assert_eq!(proxy.kind, AgentKind::Interactive);
        assert_eq!(proxy.retry.max_retries, 2);
    }

    #[test]
    fn test_missing_agents_key() {
        assert!(matches!(
            parse(r#"{"retry": {}}"#),
            Err(RegistryError::MissingAgents(_))
        ));
    }

    #[test]
    fn test_missing_kind_is_fatal() {
        let err = parse(r#"{"agents": {"agent1": {}}}"#).unwrap_err();
        assert!(matches!(err, RegistryError::MissingKind(ref n) if n == "agent1"));
    }

    #[test]
    fn test_http_agent_needs_url() {
        let err = parse(r#"{"agents": {"a": {"kind": "http"}}}"#).unwrap_err();
        assert!(matches!(err, RegistryError::MissingServiceUrl(_)));

        let err = parse(r#"{"agents": {"a": {"kind": "http", "service_url": "not a url"}}}"#)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidServiceUrl { .. }));
    }

    #[test]
    fn test_unknown_auth_mode_is_fatal() {
        let doc = r#"{"agents": {"a": {"kind": "interactive", "authentication": {"mode": "kerberos"}}}}"#;
        assert!(matches!(parse(doc), Err(RegistryError::Parse { .. })));
    }

    #[test]
    fn test_api_key_needs_secret_name() {
        let doc = r#"{"agents": {"a": {"kind": "http", "service_url": "https://x.example.com", "authentication": {"mode": "api_key"}}}}"#;
        assert!(matches!(parse(doc), Err(RegistryError::MissingSecretName(_))));
    }

    #[test]
    fn test_bearer_needs_scope() {
        let doc = r#"{"agents": {"a": {"kind": "http", "service_url": "https://x.example.com", "authentication": {"mode": "bearer"}}}}"#;
        assert!(matches!(parse(doc), Err(RegistryError::MissingScope(name)) if name == "a"));

        let blank = r#"{"agents": {"a": {"kind": "http", "service_url": "https://x.example.com", "authentication": {"mode": "bearer", "scope": " "}}}}"#;
        assert!(matches!(parse(blank), Err(RegistryError::MissingScope(_))));

        let scoped = r#"{"agents": {"a": {"kind": "http", "service_url": "https://x.example.com", "authentication": {"mode": "bearer", "scope": "api://payroll/.default"}}}}"#;
        let registry = parse(scoped).unwrap();
        assert_eq!(registry.bearer_agents(), vec!["a"]);
    }

    #[test]
    fn test_scalar_template_rejected() {
        let doc = r#"{"agents": {"a": {"kind": "interactive", "request_template": "text"}}}"#;
        assert!(matches!(parse(doc), Err(RegistryError::InvalidTemplate(_))));
    }

    #[tokio::test]
    async fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "agents:\n  Leave:\n    kind: http\n    service_url: https://leave.example.com/balance\n    timeout_secs: 5\ncache:\n  enabled: true\n  ttl: 60"
        )
        .unwrap();

        let registry = AgentRegistry::load(file.path()).await.unwrap();
        let leave = registry.get("Leave").unwrap();
        assert_eq!(leave.timeout, Duration::from_secs(5));
        assert!(registry.cache().enabled);
        assert_eq!(registry.cache().ttl, 60);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = AgentRegistry::load("/nonexistent/agent_config.json")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }
}
