//! Configuration management for smart-invoke.
//!
//! Configuration can be set via environment variables:
//! - `LLM_API_KEY` - Required. Completion service key.
//! - `LLM_API_BASE` - Optional. Endpoint base. Defaults to `https://api.openai.com/v1`.
//! - `LLM_API_VERSION` - Optional. When set, the Azure OpenAI URL scheme is used.
//! - `LLM_MODEL` - Optional. Model or deployment name. Defaults to `gpt-4o`.
//! - `LLM_MAX_TOKENS` - Optional. Planner max tokens. Defaults to `4096`.
//! - `LLM_TEMPERATURE` - Optional. Sampling temperature. Defaults to `0.0`.
//! - `LLM_TIMEOUT_SECS` - Optional. Per-attempt completion timeout. Defaults to `60`.
//! - `AGENT_REGISTRY_PATH` - Optional. Registry document. Defaults to `agent_config.json`.
//! - `PLANNER_PROMPT_PATH` - Optional. Planner preamble file.
//! - `EXECUTION_CONCURRENCY` - Optional. Engine concurrency bound. Defaults to `1`.
//! - `HISTORY_LIMIT` - Optional. Most-recent-N history window. Defaults to `10`.
//! - `PROCESS_COMMANDS` - Optional. Enable the command pass. Defaults to `false`.
//! - `USE_CACHE` - Optional. Administrative cache switch. Defaults to `true`.
//! - `IDENTITY_TOKEN_URL`, `IDENTITY_CLIENT_ID`, `IDENTITY_CLIENT_SECRET` - Optional.
//!   OAuth2 client-credentials provider for bearer-authenticated agents.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Completion service configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    /// Azure OpenAI API version; `None` selects the plain OpenAI scheme
    pub api_version: Option<String>,
    pub model: String,
    pub max_tokens: u64,
    pub temperature: f64,
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            api_version: None,
            model: "gpt-4o".to_string(),
            max_tokens: 4096,
            temperature: 0.0,
            timeout: Duration::from_secs(60),
        }
    }
}

/// OAuth2 client-credentials identity provider.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,

    /// Agent registry document (JSON or YAML)
    pub registry_path: PathBuf,

    /// Planner preamble override
    pub planner_prompt_path: Option<PathBuf>,

    /// Maximum number of tasks dispatched at once within one plan
    pub execution_concurrency: usize,

    /// Number of history entries handed to the planner
    pub history_limit: usize,

    /// Run the command-recognition pass before planning
    pub process_commands: bool,

    /// Administrative switch over the fingerprint cache
    pub use_cache: bool,

    pub identity: Option<IdentityConfig>,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,
}

fn env_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        _ => Ok(default),
    }
}

fn env_flag(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => parse_flag(&raw)
            .ok_or_else(|| ConfigError::InvalidValue(name.to_string(), raw.clone())),
        Err(_) => Ok(default),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `LLM_API_KEY` is not set, and
    /// `ConfigError::InvalidValue` when a numeric or boolean variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("LLM_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("LLM_API_KEY".to_string()))?;

        let defaults = LlmConfig::default();
        let llm = LlmConfig {
            api_base: std::env::var("LLM_API_BASE").unwrap_or(defaults.api_base),
            api_key,
            api_version: std::env::var("LLM_API_VERSION")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            model: std::env::var("LLM_MODEL").unwrap_or(defaults.model),
            max_tokens: env_or("LLM_MAX_TOKENS", defaults.max_tokens)?,
            temperature: env_or("LLM_TEMPERATURE", defaults.temperature)?,
            timeout: Duration::from_secs(env_or("LLM_TIMEOUT_SECS", 60u64)?),
        };

        let execution_concurrency: usize = env_or("EXECUTION_CONCURRENCY", 1)?;
        if execution_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "EXECUTION_CONCURRENCY".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let identity = match (
            std::env::var("IDENTITY_TOKEN_URL"),
            std::env::var("IDENTITY_CLIENT_ID"),
            std::env::var("IDENTITY_CLIENT_SECRET"),
        ) {
            (Ok(token_url), Ok(client_id), Ok(client_secret)) => Some(IdentityConfig {
                token_url,
                client_id,
                client_secret,
            }),
            _ => None,
        };

        Ok(Self {
            llm,
            registry_path: std::env::var("AGENT_REGISTRY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("agent_config.json")),
            planner_prompt_path: std::env::var("PLANNER_PROMPT_PATH").ok().map(PathBuf::from),
            execution_concurrency,
            history_limit: env_or("HISTORY_LIMIT", 10)?,
            process_commands: env_flag("PROCESS_COMMANDS", false)?,
            use_cache: env_flag("USE_CACHE", true)?,
            identity,
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_or("PORT", 3000)?,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, model: String, registry_path: PathBuf) -> Self {
        Self {
            llm: LlmConfig {
                api_key,
                model,
                ..LlmConfig::default()
            },
            registry_path,
            planner_prompt_path: None,
            execution_concurrency: 1,
            history_limit: 10,
            process_commands: false,
            use_cache: true,
            identity: None,
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}
