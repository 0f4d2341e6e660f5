//! One user turn, end to end.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::commands::CommandProcessor;
use crate::engine::{ExecutionEngine, MonitorReport, TurnContext, TurnState};
use crate::error::InvokeError;
use crate::history::{render, ConversationHistory, HistoryEntry};
use crate::planner::{PlanGenerator, PlannerOutcome, PlanningRequest};

/// Placeholder for absent request fields.
pub const NOT_AVAILABLE: &str = "NA";

fn not_available() -> String {
    NOT_AVAILABLE.to_string()
}

/// Inbound turn request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestData {
    #[serde(default = "not_available")]
    pub user_id: String,
    #[serde(default = "not_available")]
    pub user_email: String,
    #[serde(default = "not_available")]
    pub user_name: String,
    #[serde(default)]
    pub query: String,
    #[serde(default = "not_available")]
    pub request_id: String,
    #[serde(default)]
    pub is_show_plan_only: bool,
}

impl RequestData {
    pub fn new(user_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_email: not_available(),
            user_name: not_available(),
            query: query.into(),
            request_id: not_available(),
            is_show_plan_only: false,
        }
    }

    fn request_id(&self) -> Option<&str> {
        let id = self.request_id.trim();
        (!id.is_empty() && id != NOT_AVAILABLE).then_some(id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub answer: String,
    /// Sorted, comma-separated agents of the executed plan
    pub agents: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timings: Option<MonitorReport>,
}

impl TurnResponse {
    fn answer(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            agents: String::new(),
            timings: None,
        }
    }
}

pub struct SmartInvoker {
    planner: PlanGenerator,
    engine: ExecutionEngine,
    commands: Option<CommandProcessor>,
    history: Arc<dyn ConversationHistory>,
    history_limit: usize,
}

fn enter(state: &mut TurnState, next: TurnState, user_id: &str) {
    tracing::debug!(user_id = %user_id, from = ?state, to = ?next, "Turn state");
    *state = next;
}

impl SmartInvoker {
    pub fn new(
        planner: PlanGenerator,
        engine: ExecutionEngine,
        history: Arc<dyn ConversationHistory>,
        history_limit: usize,
    ) -> Self {
        Self {
            planner,
            engine,
            commands: None,
            history,
            history_limit,
        }
    }

    pub fn with_commands(mut self, commands: CommandProcessor) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Handle a turn, turning every failure into a user message.
    pub async fn respond(&self, request: RequestData) -> TurnResponse {
        let user_id = request.user_id.clone();
        match self.handle_request(request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(user_id = %user_id, "Turn failed: {}", error);
                TurnResponse::answer(error.user_message())
            }
        }
    }

    pub async fn handle_request(&self, request: RequestData) -> Result<TurnResponse, InvokeError> {
        self.handle_request_with_cancel(request, CancellationToken::new()).await
    }

    pub async fn handle_request_with_cancel(
        &self,
        request: RequestData,
        cancel: CancellationToken,
    ) -> Result<TurnResponse, InvokeError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(InvokeError::InvalidRequest("Query must not be empty".to_string()));
        }
        let user_id = request.user_id.as_str();
        let turn_id = Uuid::new_v4();
        tracing::info!(turn_id = %turn_id, user_id = %user_id, "Handling turn");

        if let Some(commands) = &self.commands {
            if let Some(reply) = commands.process(user_id, query).await {
                return Ok(TurnResponse::answer(reply));
            }
        }

        let mut state = TurnState::Planning;
        let result = self.run_turn(&request, query, &mut state, cancel).await;
        if result.is_err() {
            enter(&mut state, TurnState::Failed, user_id);
        }
        let response = result?;
        tracing::info!(turn_id = %turn_id, agents = %response.agents, "Turn completed");

        self.history.append(user_id, HistoryEntry::user("query", query)).await;
        self.history
            .append(user_id, HistoryEntry::system("response", &response.answer))
            .await;
        Ok(response)
    }

    async fn run_turn(
        &self,
        request: &RequestData,
        query: &str,
        state: &mut TurnState,
        cancel: CancellationToken,
    ) -> Result<TurnResponse, InvokeError> {
        let user_id = request.user_id.as_str();
        let recent = self.history.recent(user_id, self.history_limit).await;
        let history = render(&recent);

        let planning = PlanningRequest {
            user_id,
            user_email: &request.user_email,
            query,
            request_id: request.request_id(),
            history: &history,
            now: Local::now(),
        };

        let plan = match self.planner.generate(&planning).await? {
            PlannerOutcome::Action(action) => {
                self.history
                    .append(
                        user_id,
                        HistoryEntry::system("Query Execution Plan Generated", &action.message),
                    )
                    .await;
                enter(state, TurnState::Done, user_id);
                return Ok(TurnResponse::answer(action.message));
            }
            PlannerOutcome::Plan(plan) => plan,
        };

        let rendered = plan.to_string();
        self.history
            .append(user_id, HistoryEntry::system("Query Execution Plan Generated", &rendered))
            .await;
        let agents = plan.agents_summary();

        if request.is_show_plan_only {
            enter(state, TurnState::Done, user_id);
            return Ok(TurnResponse {
                answer: rendered,
                agents,
                timings: None,
            });
        }

        enter(state, TurnState::Executing, user_id);
        let ctx = TurnContext::new(user_id, query).with_cancel(cancel);
        let outcome = self.engine.execute(plan, &ctx).await?;
        enter(state, TurnState::Done, user_id);

        Ok(TurnResponse {
            answer: outcome.answer,
            agents,
            timings: Some(outcome.report),
        })
    }
}
