//! One step of a generated plan.
//!
//! # Invariants
//! - `result` is set exactly once, on the transition to `Completed`
//! - a task only reaches `Completed` through `Dispatched`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Step ordinal, unique within one plan.
pub type StepId = u32;

/// Data dependency on an earlier step's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Payload key that receives the extracted value
    #[serde(rename = "dependency_parameter")]
    pub parameter: String,
    /// Step whose raw result holds the value
    #[serde(rename = "dependency_step")]
    pub step: StepId,
}

impl Dependency {
    pub fn new(parameter: impl Into<String>, step: StepId) -> Self {
        Self {
            parameter: parameter.into(),
            step,
        }
    }
}

/// Lifecycle of a task within one execution.
///
/// # State Machine
/// ```text
/// Pending -> Ready -> Resolving -> Dispatched -> Completed
///    \         \          \             \-> Failed
///     \---------\----------\-> Failed
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting for dependencies
    Pending,
    /// All dependency results are in the ledger
    Ready,
    /// Dependency values are being extracted
    Resolving,
    /// Handed to the gateway
    Dispatched,
    Completed,
    Failed { reason: String },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            TaskState::Pending => "Pending",
            TaskState::Ready => "Ready",
            TaskState::Resolving => "Resolving",
            TaskState::Dispatched => "Dispatched",
            TaskState::Completed => "Completed",
            TaskState::Failed { .. } => "Failed",
        }
    }
}

/// A unit of work bound to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    step: StepId,
    agent_name: String,
    payload: Map<String, Value>,
    status_message: String,
    dependencies: Vec<Dependency>,
    result: Option<String>,
    state: TaskState,
}

impl Task {
    /// Create a pending task.
    pub fn new(
        step: StepId,
        agent_name: impl Into<String>,
        payload: Map<String, Value>,
        status_message: impl Into<String>,
        dependencies: Vec<Dependency>,
    ) -> Self {
        Self {
            step,
            agent_name: agent_name.into(),
            payload,
            status_message: status_message.into(),
            dependencies,
            result: None,
            state: TaskState::Pending,
        }
    }

    pub fn step(&self) -> StepId {
        self.step
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    /// Readiness is a pure function of the set of completed steps.
    pub fn is_ready<F>(&self, completed: F) -> bool
    where
        F: Fn(StepId) -> bool,
    {
        self.dependencies.iter().all(|d| completed(d.step))
    }

    /// Write resolved dependency values into the payload.
    ///
    /// # Precondition
    /// `self.state == Resolving`
    pub fn apply_resolved(&mut self, values: Vec<(String, String)>) -> Result<(), TaskError> {
        if self.state != TaskState::Resolving {
            return Err(self.invalid("Resolving"));
        }
        for (parameter, value) in values {
            self.payload.insert(parameter, Value::String(value));
        }
        Ok(())
    }

    // State transitions - explicit and validated

    fn invalid(&self, to: &str) -> TaskError {
        TaskError::InvalidTransition {
            step: self.step,
            from: self.state.name().to_string(),
            to: to.to_string(),
        }
    }

    fn advance(&mut self, from: TaskState, to: TaskState) -> Result<(), TaskError> {
        if self.state == from {
            self.state = to;
            Ok(())
        } else {
            Err(self.invalid(to.name()))
        }
    }

    /// Pending -> Ready
    pub fn mark_ready(&mut self) -> Result<(), TaskError> {
        self.advance(TaskState::Pending, TaskState::Ready)
    }

    /// Ready -> Resolving
    pub fn begin_resolving(&mut self) -> Result<(), TaskError> {
        self.advance(TaskState::Ready, TaskState::Resolving)
    }

    /// Resolving -> Dispatched
    pub fn mark_dispatched(&mut self) -> Result<(), TaskError> {
        self.advance(TaskState::Resolving, TaskState::Dispatched)
    }

    /// Dispatched -> Completed, recording the result.
    pub fn complete(&mut self, result: String) -> Result<(), TaskError> {
        if self.result.is_some() {
            return Err(TaskError::ResultAlreadySet(self.step));
        }
        self.advance(TaskState::Dispatched, TaskState::Completed)?;
        self.result = Some(result);
        Ok(())
    }

    /// Any non-terminal state -> Failed
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TaskError> {
        if self.state.is_terminal() {
            return Err(self.invalid("Failed"));
        }
        self.state = TaskState::Failed {
            reason: reason.into(),
        };
        Ok(())
    }
}

/// Errors that can occur during task operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid state transition for step {step} from {from} to {to}")]
    InvalidTransition {
        step: StepId,
        from: String,
        to: String,
    },

    #[error("Result for step {0} is already set")]
    ResultAlreadySet(StepId),
}
