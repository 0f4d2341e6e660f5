//! HTTP transport for remote agents.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use super::auth::{SecretSource, TokenProvider};
use super::error::{DispatchError, DispatchErrorKind};
use super::Agent;
use crate::registry::{AgentKind, AgentRegistration, AuthMode, KeyPlacement};

/// Render every payload value as text, the wire format agents expect.
pub fn stringify_payload(payload: &Map<String, Value>) -> Map<String, Value> {
    payload
        .iter()
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (k.clone(), Value::String(text))
        })
        .collect()
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
}

/// Agent reached with one POST per attempt.
pub struct HttpAgent {
    registration: AgentRegistration,
    client: reqwest::Client,
    secrets: Arc<dyn SecretSource>,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl HttpAgent {
    pub fn new(
        registration: AgentRegistration,
        client: reqwest::Client,
        secrets: Arc<dyn SecretSource>,
        tokens: Option<Arc<dyn TokenProvider>>,
    ) -> Self {
        Self {
            registration,
            client,
            secrets,
            tokens,
        }
    }

    fn error(&self, kind: DispatchErrorKind, message: impl Into<String>) -> DispatchError {
        DispatchError::new(&self.registration.name, kind, message)
    }

    async fn build_request(&self, body: &Map<String, Value>) -> Result<reqwest::RequestBuilder, DispatchError> {
        let endpoint = self.registration.service_url.as_deref().ok_or_else(|| {
            self.error(DispatchErrorKind::Rejected, "Agent has no service_url")
        })?;
        let mut url = url::Url::parse(endpoint)
            .map_err(|e| self.error(DispatchErrorKind::Rejected, format!("Invalid service_url: {}", e)))?;

        let auth = &self.registration.authentication;
        let mut header: Option<(String, String)> = None;
        let mut bearer: Option<String> = None;

        match auth.mode {
            AuthMode::None => {}
            AuthMode::ApiKey => {
                let secret_name = auth.secret_name.as_deref().unwrap_or_default();
                let key = self.secrets.secret(secret_name).await.ok_or_else(|| {
                    self.error(
                        DispatchErrorKind::SecretNotFound,
                        format!("Secret {} not found", secret_name),
                    )
                })?;
                match auth.placement {
                    KeyPlacement::Query => {
                        url.query_pairs_mut().append_pair(auth.parameter_name(), &key);
                    }
                    KeyPlacement::Header => {
                        header = Some((auth.parameter_name().to_string(), key));
                    }
                }
            }
            AuthMode::Bearer => {
                let provider = self.tokens.as_ref().ok_or_else(|| {
                    self.error(
                        DispatchErrorKind::Authentication,
                        "No identity provider configured for bearer authentication",
                    )
                })?;
                let scope = auth.scope.as_deref().ok_or_else(|| {
                    self.error(DispatchErrorKind::Authentication, "Bearer authentication needs a scope")
                })?;
                let token = provider
                    .token(scope)
                    .await
                    .map_err(|e| self.error(DispatchErrorKind::Authentication, e))?;
                bearer = Some(token);
            }
        }

        let mut builder = self
            .client
            .post(url)
            .timeout(self.registration.timeout)
            .json(body);
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }
}

#[async_trait]
impl Agent for HttpAgent {
    fn name(&self) -> &str {
        &self.registration.name
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Http
    }

    async fn invoke(&self, payload: &Map<String, Value>) -> Result<String, DispatchError> {
        let body = stringify_payload(payload);
        let request = self.build_request(&body).await?;

        tracing::debug!(agent = %self.registration.name, "Calling agent service");
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(self.error(DispatchErrorKind::Timeout, format!("Request timeout: {}", e)));
            }
            Err(e) => {
                return Err(self.error(DispatchErrorKind::Transport, format!("Request failed: {}", e)));
            }
        };

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response
            .text()
            .await
            .map_err(|e| self.error(DispatchErrorKind::Transport, format!("Failed to read body: {}", e)))?;

        if status.is_success() {
            Ok(text)
        } else {
            Err(DispatchError::from_status(&self.registration.name, status.as_u16(), &text)
                .with_retry_after(retry_after))
        }
    }
}
