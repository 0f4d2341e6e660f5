//! Combine the results of independent steps into one answer.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::llm::{extract_json_object, ChatMessage, ChatOptions, LlmClient};
use crate::plan::StepId;
use crate::prompts::merge_prompt;

/// Answer for a plan that produced nothing.
pub const NO_DATA_FOUND: &str = "No data found";

/// One aggregation input: a completed task without dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub step: StepId,
    pub status_message: String,
    pub result: String,
}

impl Candidate {
    fn key(&self) -> String {
        format!("Step {}:{}", self.step, self.status_message)
    }
}

pub struct Aggregator {
    llm: Arc<dyn LlmClient>,
    model: String,
    max_tokens: u64,
    timeout: Duration,
}

impl Aggregator {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>, max_tokens: u64, timeout: Duration) -> Self {
        Self {
            llm,
            model: model.into(),
            max_tokens,
            timeout,
        }
    }

    /// Merge two or more candidates with a single completion.
    ///
    /// Falls back to the first candidate's raw result when the merge fails
    /// or comes back empty.
    pub async fn merge(&self, query: &str, candidates: &[Candidate]) -> String {
        let Some(first) = candidates.first() else {
            return NO_DATA_FOUND.to_string();
        };

        let content = candidates
            .iter()
            .map(|c| format!("{}: {}", c.key(), c.result))
            .collect::<Vec<_>>()
            .join("\n\n");
        let messages = [ChatMessage::system(merge_prompt(query)), ChatMessage::user(content)];
        let options = ChatOptions::default()
            .with_max_tokens(self.max_tokens)
            .with_temperature(0.0)
            .json();

        let response = tokio::time::timeout(
            self.timeout,
            self.llm.chat_completion(&self.model, &messages, options),
        )
        .await;

        let text = match response {
            Ok(Ok(response)) => response.text_content().trim().to_string(),
            Ok(Err(e)) => {
                tracing::warn!(candidates = candidates.len(), "Merge failed, using first result: {}", e);
                return first.result.clone();
            }
            Err(_) => {
                tracing::warn!(candidates = candidates.len(), "Merge timed out, using first result");
                return first.result.clone();
            }
        };

        if text.is_empty() {
            tracing::warn!("Merge returned nothing, using first result");
            return first.result.clone();
        }

        match extract_json_object(&text) {
            Some(value) => normalize(&value),
            None => text,
        }
    }
}

fn normalize(value: &Value) -> String {
    let field = |name: &str| match value.get(name) {
        Some(Value::String(s)) => Value::String(s.clone()),
        Some(Value::Null) | None => Value::String(String::new()),
        Some(other) => other.clone(),
    };
    json!({
        "TextResponse": field("TextResponse"),
        "AssociatedImageLink": field("AssociatedImageLink"),
        "AssociatedVideoLink": field("AssociatedVideoLink"),
    })
    .to_string()
}
