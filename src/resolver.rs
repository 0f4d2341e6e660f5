//! Dependency resolution: pull concrete payload values out of prior results.
//!
//! Each dependency is answered by one extraction call. The task's payload is
//! only touched once every dependency has produced a value; a sentinel, an
//! empty extraction or a completion failure degrades the turn to the raw
//! upstream content instead.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::llm::{ChatMessage, ChatOptions, LlmClient};
use crate::plan::{Dependency, StepId};
use crate::prompts::{extraction_prompt, NOT_FOUND_SENTINEL};

/// Completed-task ledger: step -> raw result.
pub type Ledger = BTreeMap<StepId, String>;

/// Outcome of resolving one task's dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// `(parameter, value)` pairs, in dependency order
    Resolved(Vec<(String, String)>),
    /// The value could not be extracted; the turn answers with `content`
    Degraded {
        parameter: String,
        source_step: StepId,
        content: String,
    },
}

pub struct DependencyResolver {
    llm: Arc<dyn LlmClient>,
    model: String,
    max_tokens: u64,
    timeout: Duration,
}

/// Trim and drop matching surrounding quotes.
fn clean_value(raw: &str) -> String {
    let mut value = raw.trim();
    loop {
        let stripped = ['"', '\'', '`']
            .iter()
            .find_map(|q| value.strip_prefix(*q).and_then(|v| v.strip_suffix(*q)));
        match stripped {
            Some(inner) if !inner.is_empty() => value = inner.trim(),
            _ => break,
        }
    }
    value.to_string()
}

impl DependencyResolver {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            llm,
            model: model.into(),
            max_tokens: 2048,
            timeout,
        }
    }

    /// Resolve every dependency against the ledger.
    pub async fn resolve(&self, step: StepId, dependencies: &[Dependency], ledger: &Ledger) -> Resolution {
        let mut values = Vec::with_capacity(dependencies.len());

        for dep in dependencies {
            let Some(content) = ledger.get(&dep.step) else {
                tracing::warn!(step, source_step = dep.step, "Dependency source missing from ledger");
                continue;
            };

            let degraded = || Resolution::Degraded {
                parameter: dep.parameter.clone(),
                source_step: dep.step,
                content: content.clone(),
            };

            match self.extract(&dep.parameter, content).await {
                Ok(value) if value.is_empty() || value.eq_ignore_ascii_case(NOT_FOUND_SENTINEL) => {
                    tracing::info!(
                        step,
                        parameter = %dep.parameter,
                        source_step = dep.step,
                        "Dependency value not found"
                    );
                    return degraded();
                }
                Ok(value) => {
                    tracing::debug!(step, parameter = %dep.parameter, "Dependency resolved");
                    values.push((dep.parameter.clone(), value));
                }
                Err(e) => {
                    tracing::error!(step, parameter = %dep.parameter, "Error resolving dependency: {}", e);
                    return degraded();
                }
            }
        }

        Resolution::Resolved(values)
    }

    async fn extract(&self, parameter: &str, content: &str) -> Result<String, String> {
        let messages = [
            ChatMessage::system(extraction_prompt(parameter)),
            ChatMessage::user(content),
        ];
        let options = ChatOptions::default()
            .with_max_tokens(self.max_tokens)
            .with_temperature(0.0);

        let response = tokio::time::timeout(
            self.timeout,
            self.llm.chat_completion(&self.model, &messages, options),
        )
        .await
        .map_err(|_| format!("extraction timed out after {:?}", self.timeout))?
        .map_err(|e| e.to_string())?;

        Ok(clean_value(response.text_content()))
    }
}
