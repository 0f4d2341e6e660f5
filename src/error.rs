//! Turn-level errors and the user messages they map to.

use crate::engine::{ExecutionError, MonitorError};
use crate::gateway::{DispatchError, DispatchErrorKind};
use crate::llm::{LlmError, LlmErrorKind};
use crate::plan::PlanError;
use crate::planner::PlannerError;

pub const GENERIC_FAILURE_MESSAGE: &str =
    "Sorry, something went wrong while processing your request. Please try again.";
pub const CONTENT_FILTERED_MESSAGE: &str = "Your request could not be processed because it was flagged by the content safety policy. Please rephrase your question and try again.";
pub const DEPLOYMENT_MISSING_MESSAGE: &str = "The language model needed to answer your request is not available right now. Please reach out for assistance.";

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Plan generation failed: {0}")]
    Generation(String),

    #[error("Generated plan is invalid: {0}")]
    Plan(#[from] PlanError),

    #[error("Completion failed: {0}")]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Monitor misuse: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<PlannerError> for InvokeError {
    fn from(error: PlannerError) -> Self {
        match error {
            PlannerError::Completion(e) => InvokeError::Llm(e),
            PlannerError::InvalidPlan(e) => InvokeError::Plan(e),
            PlannerError::PromptFile { .. } => InvokeError::Configuration(error.to_string()),
            other => InvokeError::Generation(other.to_string()),
        }
    }
}

impl From<ExecutionError> for InvokeError {
    fn from(error: ExecutionError) -> Self {
        match error {
            ExecutionError::Dispatch(e) => InvokeError::Dispatch(e),
            ExecutionError::Monitor(e) => InvokeError::Monitor(e),
            ExecutionError::Cancelled => InvokeError::Cancelled,
            other => InvokeError::Generation(other.to_string()),
        }
    }
}

fn llm_message(error: &LlmError) -> String {
    if error.kind == LlmErrorKind::ContentFiltered || error.code.as_deref() == Some("content_filter") {
        CONTENT_FILTERED_MESSAGE.to_string()
    } else if error.kind == LlmErrorKind::DeploymentNotFound
        || error.code.as_deref() == Some("DeploymentNotFound")
    {
        DEPLOYMENT_MISSING_MESSAGE.to_string()
    } else {
        GENERIC_FAILURE_MESSAGE.to_string()
    }
}

fn dispatch_message(error: &DispatchError) -> String {
    match error.kind {
        DispatchErrorKind::ContentFiltered => CONTENT_FILTERED_MESSAGE.to_string(),
        DispatchErrorKind::DeploymentNotFound => DEPLOYMENT_MISSING_MESSAGE.to_string(),
        DispatchErrorKind::SecretNotFound => format!(
            "The agent ({}) is missing a credential it needs to run. Please reach out for assistance.",
            error.agent
        ),
        DispatchErrorKind::Forbidden => format!(
            "You don't have access to the information provided by the agent ({}). Please reach out for assistance if you think this is a mistake.",
            error.agent
        ),
        _ => {
            let step = error
                .step
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "We couldn't complete your request because the agent ({}) couldn't retrieve the necessary information in step {}. Please try again or reach out for assistance.",
                error.agent, step
            )
        }
    }
}

impl InvokeError {
    /// Text shown to the user for this failure.
    pub fn user_message(&self) -> String {
        match self {
            InvokeError::Llm(e) => llm_message(e),
            InvokeError::Dispatch(e) => dispatch_message(e),
            InvokeError::Cancelled => "Your request was cancelled.".to_string(),
            InvokeError::InvalidRequest(message) => message.clone(),
            InvokeError::Generation(_)
            | InvokeError::Plan(_)
            | InvokeError::Monitor(_)
            | InvokeError::Configuration(_) => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }
}
