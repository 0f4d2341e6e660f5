//! Credentials for agent calls: named secrets and bearer tokens.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::IdentityConfig;

/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Source of named secrets (API keys).
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn secret(&self, name: &str) -> Option<String>;
}

/// Secrets read from environment variables.
///
/// A secret named `flights-api-key` is read from `FLIGHTS_API_KEY`.
#[derive(Debug, Clone, Default)]
pub struct EnvSecrets;

impl EnvSecrets {
    pub fn variable_name(secret: &str) -> String {
        secret
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

#[async_trait]
impl SecretSource for EnvSecrets {
    async fn secret(&self, name: &str) -> Option<String> {
        std::env::var(Self::variable_name(name))
            .ok()
            .filter(|v| !v.is_empty())
    }
}

/// Fixed set of secrets.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    secrets: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretSource for StaticSecrets {
    async fn secret(&self, name: &str) -> Option<String> {
        self.secrets.get(name).cloned()
    }
}

/// Issues bearer tokens for a scope.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self, scope: &str) -> Result<String, String>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + REFRESH_MARGIN < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// OAuth2 client-credentials token provider with a per-scope cache.
pub struct ClientCredentialsProvider {
    client: reqwest::Client,
    identity: IdentityConfig,
    tokens: Arc<RwLock<HashMap<String, CachedToken>>>,
}

impl ClientCredentialsProvider {
    pub fn new(identity: IdentityConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            identity,
            tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn fetch(&self, scope: &str) -> Result<CachedToken, String> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "client_credentials")
            .append_pair("client_id", &self.identity.client_id)
            .append_pair("client_secret", &self.identity.client_secret)
            .append_pair("scope", scope)
            .finish();

        let response = self
            .client
            .post(&self.identity.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| format!("Failed to request token: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                "Token request failed with status {}: {}",
                status,
                error_text
            );
            return Err(format!("Token request failed ({}): {}", status, error_text));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse token response: {}", e))?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        tracing::info!(scope = %scope, expires_in_secs = lifetime.as_secs(), "Access token issued");

        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsProvider {
    async fn token(&self, scope: &str) -> Result<String, String> {
        let now = Instant::now();
        if let Some(cached) = self.tokens.read().await.get(scope) {
            if cached.is_fresh(now) {
                return Ok(cached.access_token.clone());
            }
        }

        let fresh = self.fetch(scope).await?;
        let token = fresh.access_token.clone();
        self.tokens.write().await.insert(scope.to_string(), fresh);
        Ok(token)
    }
}
