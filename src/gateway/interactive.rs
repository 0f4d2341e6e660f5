//! Interactive agent: hands a message straight back to the user.
//!
//! The planner uses it to ask a question or relay a final message. Its
//! dispatch never leaves the process and always ends the turn.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::error::{DispatchError, DispatchErrorKind};
use super::Agent;
use crate::registry::AgentKind;

pub struct InteractiveAgent {
    name: String,
}

impl InteractiveAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Pick the user-facing message out of a payload.
///
/// With `MessageType = json` the first key containing `json` wins; otherwise
/// `UserMessage`, falling back to the original query.
pub fn user_message(payload: &Map<String, Value>) -> Option<String> {
    let message_type = payload
        .get("MessageType")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase);

    if message_type.as_deref() == Some("json") {
        if let Some(found) = payload
            .iter()
            .find(|(k, _)| k.contains("json"))
            .and_then(|(_, v)| text_of(v))
        {
            return Some(found);
        }
    }

    payload
        .get("UserMessage")
        .and_then(text_of)
        .or_else(|| payload.get("OriginalQuery").and_then(text_of))
}

#[async_trait]
impl Agent for InteractiveAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Interactive
    }

    async fn invoke(&self, payload: &Map<String, Value>) -> Result<String, DispatchError> {
        let message = user_message(payload).ok_or_else(|| {
            DispatchError::new(&self.name, DispatchErrorKind::MissingField, "No UserMessage found in payload")
        })?;
        tracing::info!(agent = %self.name, "Interactive agent returning user message");
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_returns_user_message() {
        let agent = InteractiveAgent::new("UserProxyAgent");
        let p = payload(json!({"MessageType": "text", "UserMessage": "Which city?"}));
        assert_eq!(agent.invoke(&p).await.unwrap(), "Which city?");
    }

    #[test]
    fn test_json_message_type() {
        let p = payload(json!({"MessageType": "JSON", "card_json": {"a": 1}, "UserMessage": "x"}));
        assert_eq!(user_message(&p).as_deref(), Some(r#"{"a":1}"#));
    }

    #[test]
    fn test_falls_back_to_original_query() {
        let p = payload(json!({"UserMessage": "", "OriginalQuery": "book a flight"}));
        assert_eq!(user_message(&p).as_deref(), Some("book a flight"));
    }

    #[tokio::test]
    async fn test_missing_message_is_error() {
        let agent = InteractiveAgent::new("UserProxyAgent");
        let err = agent.invoke(&Map::new()).await.unwrap_err();
        assert_eq!(err.kind, DispatchErrorKind::MissingField);
    }
}
