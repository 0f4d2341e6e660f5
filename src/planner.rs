//! Plan generation: one completion turns the user's query into a plan or a
//! direct user-facing action.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::llm::{extract_json_object, ChatMessage, ChatOptions, LlmClient, LlmError};
use crate::plan::{Dependency, Plan, PlanError, StepId, Task};
use crate::prompts::{DEFAULT_PLANNER_PREAMBLE, PLANNER_SEPARATOR};
use crate::registry::AgentRegistry;

/// Kind of terminal user-facing action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    UserMessage,
    ClarificationNeeded,
}

/// Message returned to the user without executing anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserAction {
    pub action_type: ActionType,
    pub message: String,
}

impl UserAction {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::UserMessage,
            message: message.into(),
        }
    }

    pub fn clarification(message: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::ClarificationNeeded,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub enum PlannerOutcome {
    Plan(Plan),
    Action(UserAction),
}

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("Completion failed: {0}")]
    Completion(#[from] LlmError),

    #[error("Planner response could not be parsed: {0}")]
    Unparsable(String),

    #[error("Plan step {index} is malformed: {reason}")]
    MalformedStep { index: usize, reason: String },

    #[error("Generated plan is invalid: {0}")]
    InvalidPlan(#[from] PlanError),

    #[error("Failed to read planner prompt {path}: {message}")]
    PromptFile { path: String, message: String },
}

/// Everything the planner knows about the requesting turn.
#[derive(Debug, Clone)]
pub struct PlanningRequest<'a> {
    pub user_id: &'a str,
    pub user_email: &'a str,
    pub query: &'a str,
    pub request_id: Option<&'a str>,
    /// Rendered recent history, may be empty
    pub history: &'a str,
    pub now: DateTime<Local>,
}

pub struct PlanGenerator {
    llm: Arc<dyn LlmClient>,
    registry: Arc<AgentRegistry>,
    preamble: String,
    model: String,
    max_tokens: u64,
    temperature: f64,
    /// Bounds the whole completion call, client retries included
    timeout: Duration,
}

impl PlanGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<AgentRegistry>, model: impl Into<String>) -> Self {
        Self {
            llm,
            registry,
            preamble: DEFAULT_PLANNER_PREAMBLE.to_string(),
            model: model.into(),
            max_tokens: 4096,
            temperature: 0.0,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = preamble.into();
        self
    }

    pub fn with_limits(mut self, max_tokens: u64, temperature: f64, timeout: Duration) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self.timeout = timeout;
        self
    }

    /// Load the preamble from `path`.
    pub async fn load_preamble(path: &Path) -> Result<String, PlannerError> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PlannerError::PromptFile {
                path: path.display().to_string(),
                message: e.to_string(),
            })
    }

    /// Assemble the system prompt.
    pub fn build_prompt(&self, request: &PlanningRequest<'_>) -> String {
        let mut prompt = format!(
            "{}\n\n{sep}\nCurrent date is {}\nuser Id is {}\n\n{sep}\n",
            self.preamble,
            request.now.format("%d %B %Y"),
            request.user_id,
            sep = PLANNER_SEPARATOR
        );

        for agent in self.registry.iter() {
            prompt.push_str(&format!("{}: {}\n", agent.name, agent.description));
            for (key, value) in agent.template_lines() {
                prompt.push_str(&format!("\t\t{}: {}\n", key, value));
            }
            prompt.push('\n');
        }

        if !request.history.trim().is_empty() {
            prompt.push_str(&format!(
                "\nAlso below is the recent chat history for the user:\n{}\n",
                request.history
            ));
        }
        prompt
    }

    async fn complete(&self, messages: &[ChatMessage], json_mode: bool) -> Result<String, PlannerError> {
        let mut options = ChatOptions::default()
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature);
        if json_mode {
            options = options.json();
        }
        let response = tokio::time::timeout(
            self.timeout,
            self.llm.chat_completion(&self.model, messages, options),
        )
        .await
        .map_err(|_| LlmError::timeout(format!("Planner completion exceeded {:?}", self.timeout)))??;
        Ok(response.text_content().to_string())
    }

    /// Generate a plan, or a terminal action, for the request.
    pub async fn generate(&self, request: &PlanningRequest<'_>) -> Result<PlannerOutcome, PlannerError> {
        let messages = [
            ChatMessage::system(self.build_prompt(request)),
            ChatMessage::user(request.query),
        ];

        let raw = self.complete(&messages, false).await?;
        tracing::debug!(response = %raw, "Planner response");

        let (value, raw) = match extract_json_object(&raw) {
            Some(value) => (value, raw),
            None if !raw.contains("ActionType") => {
                return Ok(PlannerOutcome::Action(UserAction::clarification(raw)));
            }
            None => {
                tracing::info!("Retrying planner with JSON mode due to unparsable response");
                let retried = self.complete(&messages, true).await?;
                match extract_json_object(&retried) {
                    Some(value) => (value, retried),
                    None => return Err(PlannerError::Unparsable(retried)),
                }
            }
        };

        self.interpret(value, raw, request)
    }

    fn interpret(
        &self,
        value: Value,
        raw: String,
        request: &PlanningRequest<'_>,
    ) -> Result<PlannerOutcome, PlannerError> {
        let action = value
            .get("ActionType")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_ascii_lowercase());
        let message = || {
            value
                .get("Message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| raw.clone())
        };

        match action.as_deref() {
            Some("execute") => {
                let steps = value
                    .get("ExecutePlan")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let tasks = steps
                    .iter()
                    .enumerate()
                    .map(|(index, item)| parse_step(index, item, request))
                    .collect::<Result<Vec<_>, _>>()?;
                let plan = Plan::new(tasks)?;
                tracing::info!(steps = plan.len(), agents = %plan.agents_summary(), "Generated plan");
                Ok(PlannerOutcome::Plan(plan))
            }
            Some("usermessage") => Ok(PlannerOutcome::Action(UserAction::message(message()))),
            Some("clarificationneeded") => Ok(PlannerOutcome::Action(UserAction::clarification(message()))),
            _ => Ok(PlannerOutcome::Action(UserAction::clarification(raw.clone()))),
        }
    }
}

fn as_step(value: &Value) -> Option<StepId> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| StepId::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_step(index: usize, item: &Value, request: &PlanningRequest<'_>) -> Result<Task, PlannerError> {
    let malformed = |reason: &str| PlannerError::MalformedStep {
        index,
        reason: reason.to_string(),
    };

    let step = item
        .get("Step")
        .and_then(as_step)
        .ok_or_else(|| malformed("missing or invalid 'Step'"))?;
    let agent = item
        .get("Agent name")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| malformed("missing 'Agent name'"))?;
    let mut payload: Map<String, Value> = match item.get("Agent payload") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(malformed("'Agent payload' is not an object")),
    };
    let status_message = item
        .get("Status Message")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let dependencies = match item.get("dependency") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(deps)) => deps
            .iter()
            .map(|dep| {
                let parameter = dep
                    .get("dependency_parameter")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed("dependency without 'dependency_parameter'"))?;
                let source = dep
                    .get("dependency_step")
                    .and_then(as_step)
                    .ok_or_else(|| malformed("dependency without a valid 'dependency_step'"))?;
                Ok(Dependency::new(parameter, source))
            })
            .collect::<Result<Vec<_>, PlannerError>>()?,
        Some(_) => return Err(malformed("'dependency' is not a list")),
    };

    payload.insert("UserId".to_string(), Value::String(request.user_id.to_string()));
    payload.insert("UserEmail".to_string(), Value::String(request.user_email.to_string()));
    payload.insert("OriginalQuery".to_string(), Value::String(request.query.to_string()));
    if let Some(request_id) = request.request_id {
        payload.insert("RequestId".to_string(), Value::String(request_id.to_string()));
    }

    Ok(Task::new(step, agent.trim(), payload, status_message, dependencies))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AgentKind, AgentRegistration, CacheSettings};
    use crate::test_support::FakeLlm;
    use chrono::TimeZone;
    use serde_json::json;

    const PREAMBLE: &str = "PLANNER PREAMBLE";

    fn registry() -> Arc<AgentRegistry> {
        Arc::new(AgentRegistry::from_registrations(
            vec![
                AgentRegistration::new("Flights", AgentKind::Http)
                    .with_description("Checks flight availability")
                    .with_template(json!({"Origin": "IATA code", "Destination": "IATA code"})),
                AgentRegistration::new("UserProxyAgent", AgentKind::Interactive)
                    .with_description("Relays a message")
                    .with_template(json!([{"MessageType": "text"}, {"UserMessage": "message"}])),
            ],
            CacheSettings::default(),
        ))
    }

    fn generator(llm: FakeLlm) -> (PlanGenerator, Arc<FakeLlm>) {
        let llm = Arc::new(llm);
        (
            PlanGenerator::new(llm.clone(), registry(), "planner").with_preamble(PREAMBLE),
            llm,
        )
    }

    fn request<'a>(history: &'a str) -> PlanningRequest<'a> {
        PlanningRequest {
            user_id: "u-1",
            user_email: "ada@example.com",
            query: "Flights from LHR to JFK?",
            request_id: Some("req-9"),
            history,
            now: Local.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_prompt_layout() {
        let (g, _) = generator(FakeLlm::new());
        let prompt = g.build_prompt(&request(""));
        assert!(prompt.starts_with("PLANNER PREAMBLE\n\n###################\nCurrent date is 05 March 2024\nuser Id is u-1\n"));
        assert!(prompt.contains("Flights: Checks flight availability\n\t\tDestination: IATA code\n\t\tOrigin: IATA code\n"));
        assert!(prompt.contains("UserProxyAgent: Relays a message\n\t\tMessageType: text\n\t\tUserMessage: message\n"));
        assert!(!prompt.contains("recent chat history"));

        let prompt = g.build_prompt(&request("user: hello"));
        assert!(prompt.ends_with("\nAlso below is the recent chat history for the user:\nuser: hello\n"));
    }

    #[tokio::test]
    async fn test_execute_plan_parsed_and_augmented() {
        let response = json!({
            "ActionType": "Execute",
            "ExecutePlan": [
                {"Step": 1, "Agent name": "Flights", "Agent payload": {"Origin": "LHR", "Destination": "JFK"},
                 "Status Message": "Checking flights", "dependency": []},
                {"Step": "2", "Agent name": "UserProxyAgent", "Agent payload": {"UserMessage": ""},
                 "Status Message": "Replying", "dependency": [{"dependency_parameter": "UserMessage", "dependency_step": 1}]}
            ]
        });
        let (g, _) = generator(FakeLlm::new().on(PREAMBLE, format!("```json\n{}\n```", response)));
        let plan = match g.generate(&request("")).await.unwrap() {
            PlannerOutcome::Plan(plan) => plan,
            other => panic!("expected plan, got {:?}", other),
        };
        assert_eq!(plan.len(), 2);
        let first = plan.get(1).unwrap();
        assert_eq!(first.payload()["UserId"], "u-1");
        assert_eq!(first.payload()["UserEmail"], "ada@example.com");
        assert_eq!(first.payload()["OriginalQuery"], "Flights from LHR to JFK?");
        assert_eq!(first.payload()["RequestId"], "req-9");
        assert_eq!(plan.get(2).unwrap().dependencies(), &[Dependency::new("UserMessage", 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_not_cut_short() {
        use crate::llm::RetryConfig;

        // a first attempt that timed out at 60s followed by a retry that answers
        let slow = || {
            FakeLlm::new()
                .on(PREAMBLE, r#"{"ActionType": "ClarificationNeeded", "Message": "Which date?"}"#)
                .with_delay(Duration::from_secs(90))
        };
        let per_request = Duration::from_secs(60);
        let retry = RetryConfig {
            max_retries: 1,
            max_retry_duration: Duration::from_secs(5),
            ..RetryConfig::default()
        };

        let (g, _) = generator(slow());
        let g = g.with_limits(1024, 0.0, retry.attempt_budget(per_request));
        assert!(matches!(g.generate(&request("")).await, Ok(PlannerOutcome::Action(_))));

        let (g, _) = generator(slow());
        let g = g.with_limits(1024, 0.0, per_request);
        assert!(g.generate(&request("")).await.is_err());
    }

    #[tokio::test]
    async fn test_clarification_short_circuits() {
        let (g, _) = generator(FakeLlm::new().on(
            PREAMBLE,
            r#"{"ActionType": "ClarificationNeeded", "Message": "Which date?"}"#,
        ));
        match g.generate(&request("")).await.unwrap() {
            PlannerOutcome::Action(action) => {
                assert_eq!(action, UserAction::clarification("Which date?"));
            }
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plain_text_becomes_clarification() {
        let (g, llm) = generator(FakeLlm::new().on(PREAMBLE, "Could you tell me the travel date?"));
        match g.generate(&request("")).await.unwrap() {
            PlannerOutcome::Action(action) => {
                assert_eq!(action.action_type, ActionType::ClarificationNeeded);
                assert_eq!(action.message, "Could you tell me the travel date?");
            }
            other => panic!("expected action, got {:?}", other),
        }
        assert_eq!(llm.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_broken_json_retried_in_json_mode() {
        let llm = FakeLlm::new()
            .on(PREAMBLE, r#"{"ActionType": "UserMessage", "Message": "#)
            .on(PREAMBLE, r#"{"ActionType": "UserMessage", "Message": "Hello!"}"#);
        let (g, llm) = generator(llm);
        match g.generate(&request("")).await.unwrap() {
            PlannerOutcome::Action(action) => assert_eq!(action, UserAction::message("Hello!")),
            other => panic!("expected action, got {:?}", other),
        }
        let calls = llm.calls();
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].options.json_mode);
        assert!(calls[1].options.json_mode);
    }

    #[tokio::test]
    async fn test_second_parse_failure_is_fatal() {
        let (g, _) = generator(FakeLlm::new().on(PREAMBLE, r#"{"ActionType": "Execute", "#));
        assert!(matches!(
            g.generate(&request("")).await,
            Err(PlannerError::Unparsable(_))
        ));
    }

    #[tokio::test]
    async fn test_dangling_dependency_is_fatal() {
        let response = json!({
            "ActionType": "Execute",
            "ExecutePlan": [{"Step": 1, "Agent name": "Flights", "Agent payload": {},
                             "dependency": [{"dependency_parameter": "x", "dependency_step": 7}]}]
        });
        let (g, _) = generator(FakeLlm::new().on(PREAMBLE, response.to_string()));
        assert!(matches!(
            g.generate(&request("")).await,
            Err(PlannerError::InvalidPlan(PlanError::DanglingDependency { step: 1, missing: 7 }))
        ));
    }

    #[tokio::test]
    async fn test_unknown_action_type_is_clarification() {
        let raw = r#"{"ActionType": "Dance", "Message": "?"}"#;
        let (g, _) = generator(FakeLlm::new().on(PREAMBLE, raw));
        match g.generate(&request("")).await.unwrap() {
            PlannerOutcome::Action(action) => {
                assert_eq!(action.action_type, ActionType::ClarificationNeeded);
                assert_eq!(action.message, raw);
            }
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_completion_error_propagates() {
        let (g, _) = generator(
            FakeLlm::new().on_error(PREAMBLE, LlmError::content_filtered("blocked".to_string())),
        );
        assert!(matches!(
            g.generate(&request("")).await,
            Err(PlannerError::Completion(_))
        ));
    }
}
