//! Plan execution.
//!
//! A single driver loop owns the plan, the completed-task ledger and the
//! timing monitor. Resolution and dispatch run as futures in a bounded
//! `FuturesUnordered`; every completion comes back to the driver, which
//! applies it and recomputes the ready set before launching more work.

mod aggregate;
mod monitor;

pub use aggregate::{Aggregator, Candidate, NO_DATA_FOUND};
pub use monitor::{MonitorError, MonitorReport, PerformanceMonitor, TimingEntry};

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::gateway::{AgentGateway, DispatchError, DispatchOutcome, DispatchRequest, ResultSource};
use crate::history::{ConversationHistory, HistoryEntry};
use crate::plan::{Plan, StepId, TaskError, TaskState};
use crate::registry::AgentKind;
use crate::resolver::{DependencyResolver, Ledger, Resolution};

/// Lifecycle of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Planning,
    Executing,
    Aggregating,
    Done,
    Failed,
}

/// Receives user-facing progress messages.
pub trait ProgressSink: Send + Sync {
    fn notify(&self, message: &str);
}

/// Progress sink that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn notify(&self, message: &str) {
        tracing::info!(progress = %message, "Progress");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("Step {0} is not part of the plan")]
    UnknownStep(StepId),

    #[error("Execution cancelled")]
    Cancelled,
}

/// How the turn's answer was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerKind {
    /// Every task completed and results were aggregated
    Aggregated,
    /// An interactive agent ended the turn
    Interactive,
    /// A dependency could not be resolved; the answer is its raw source
    Degraded,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub answer: String,
    pub kind: AnswerKind,
    pub report: MonitorReport,
}

/// Identity and query of the turn being executed.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub user_id: String,
    pub query: String,
    pub cancel: CancellationToken,
}

impl TurnContext {
    pub fn new(user_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            query: query.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

enum StepEvent {
    Resolved {
        step: StepId,
        resolution: Resolution,
    },
    Dispatched {
        step: StepId,
        outcome: Result<DispatchOutcome, DispatchError>,
    },
}

pub struct ExecutionEngine {
    gateway: AgentGateway,
    resolver: Arc<DependencyResolver>,
    aggregator: Arc<Aggregator>,
    history: Arc<dyn ConversationHistory>,
    progress: Arc<dyn ProgressSink>,
    max_concurrency: usize,
}

impl ExecutionEngine {
    /// Serial execution; see `with_concurrency`.
    pub fn new(
        gateway: AgentGateway,
        resolver: Arc<DependencyResolver>,
        aggregator: Arc<Aggregator>,
        history: Arc<dyn ConversationHistory>,
    ) -> Self {
        Self {
            gateway,
            resolver,
            aggregator,
            history,
            progress: Arc::new(TracingProgress),
            max_concurrency: 1,
        }
    }

    /// Bound on concurrently running resolutions and dispatches. Zero is treated as one.
    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn gateway(&self) -> &AgentGateway {
        &self.gateway
    }

    /// Execute `plan` to completion or to the first terminal condition.
    pub async fn execute(&self, mut plan: Plan, ctx: &TurnContext) -> Result<ExecutionOutcome, ExecutionError> {
        let mut ledger = Ledger::new();
        let mut completed: Vec<StepId> = Vec::with_capacity(plan.len());
        let mut monitor = PerformanceMonitor::new();
        let mut running: FuturesUnordered<BoxFuture<'static, StepEvent>> = FuturesUnordered::new();

        tracing::info!(
            user_id = %ctx.user_id,
            steps = plan.len(),
            max_concurrency = self.max_concurrency,
            "Executing plan"
        );

        loop {
            if ctx.cancel.is_cancelled() {
                abandon(&mut plan, "cancelled")?;
                monitor.finish();
                return Err(ExecutionError::Cancelled);
            }

            let capacity = self.max_concurrency.saturating_sub(running.len());
            let ready: Vec<StepId> = plan
                .tasks()
                .iter()
                .filter(|t| *t.state() == TaskState::Pending && t.is_ready(|s| ledger.contains_key(&s)))
                .map(|t| t.step())
                .take(capacity)
                .collect();

            for step in ready {
                let Some(task) = plan.get_mut(step) else { continue };
                task.mark_ready()?;
                task.begin_resolving()?;

                if task.has_dependencies() {
                    let resolver = Arc::clone(&self.resolver);
                    let dependencies = task.dependencies().to_vec();
                    let snapshot = ledger.clone();
                    running.push(
                        async move {
                            let resolution = resolver.resolve(step, &dependencies, &snapshot).await;
                            StepEvent::Resolved { step, resolution }
                        }
                        .boxed(),
                    );
                } else {
                    running.push(self.launch_dispatch(&mut plan, &mut monitor, step, ctx)?);
                }
            }

            if running.is_empty() {
                break;
            }

            let event = tokio::select! {
                _ = ctx.cancel.cancelled() => continue,
                Some(event) = running.next() => event,
            };

            match event {
                StepEvent::Resolved {
                    step,
                    resolution: Resolution::Resolved(values),
                } => {
                    if let Some(task) = plan.get_mut(step) {
                        task.apply_resolved(values)?;
                    }
                    running.push(self.launch_dispatch(&mut plan, &mut monitor, step, ctx)?);
                }
                StepEvent::Resolved {
                    step,
                    resolution:
                        Resolution::Degraded {
                            parameter,
                            source_step,
                            content,
                        },
                } => {
                    tracing::info!(
                        step,
                        parameter = %parameter,
                        source_step,
                        "Dependency unresolved, answering with upstream content"
                    );
                    if let Some(task) = plan.get_mut(step) {
                        task.fail(format!("dependency '{}' unresolved", parameter))?;
                    }
                    abandon(&mut plan, "turn ended by unresolved dependency")?;
                    return Ok(ExecutionOutcome {
                        answer: content,
                        kind: AnswerKind::Degraded,
                        report: monitor.finish(),
                    });
                }
                StepEvent::Dispatched { step, outcome } => {
                    monitor.end(step)?;
                    let outcome = match outcome {
                        Ok(outcome) => outcome,
                        Err(error) => {
                            if let Some(task) = plan.get_mut(step) {
                                task.fail(error.to_string())?;
                            }
                            abandon(&mut plan, "turn ended by failed dispatch")?;
                            monitor.finish();
                            return Err(error.into());
                        }
                    };

                    let Some(task) = plan.get_mut(step) else { continue };
                    if outcome.source == ResultSource::Cache {
                        self.progress.notify(&format!("Using cached result for step {}", step));
                    }
                    task.complete(outcome.result.clone())?;
                    let agent = task.agent_name().to_string();
                    ledger.insert(step, outcome.result.clone());
                    completed.push(step);
                    self.progress.notify(&format!("Step {} completed", step));
                    self.history
                        .append(
                            &ctx.user_id,
                            HistoryEntry::system(
                                "Task Execution Completed",
                                &format!(
                                    "Step {} - Task {} Complete.Task Execution Result: {}",
                                    step, agent, outcome.result
                                ),
                            ),
                        )
                        .await;

                    if self.gateway.kind_of(&agent) == Some(AgentKind::Interactive) {
                        tracing::info!(step, agent = %agent, "Interactive agent ended the turn");
                        abandon(&mut plan, "turn ended by interactive agent")?;
                        return Ok(ExecutionOutcome {
                            answer: outcome.result,
                            kind: AnswerKind::Interactive,
                            report: monitor.finish(),
                        });
                    }
                }
            }
        }

        let stuck = plan
            .tasks()
            .iter()
            .filter(|t| !t.state().is_terminal())
            .count();
        if stuck > 0 {
            tracing::warn!(stuck, "Tasks left unscheduled after the ready set drained");
            abandon(&mut plan, "never became ready")?;
        }

        let candidates: Vec<Candidate> = plan
            .independent_tasks()
            .filter_map(|t| {
                t.result().map(|result| Candidate {
                    step: t.step(),
                    status_message: t.status_message().to_string(),
                    result: result.to_string(),
                })
            })
            .collect();

        tracing::debug!(candidates = candidates.len(), "Aggregating results");
        let answer = if candidates.len() > 1 {
            self.aggregator.merge(&ctx.query, &candidates).await
        } else {
            completed
                .last()
                .and_then(|step| ledger.get(step))
                .cloned()
                .unwrap_or_else(|| NO_DATA_FOUND.to_string())
        };

        Ok(ExecutionOutcome {
            answer,
            kind: AnswerKind::Aggregated,
            report: monitor.finish(),
        })
    }

    fn launch_dispatch(
        &self,
        plan: &mut Plan,
        monitor: &mut PerformanceMonitor,
        step: StepId,
        ctx: &TurnContext,
    ) -> Result<BoxFuture<'static, StepEvent>, ExecutionError> {
        let task = plan.get_mut(step).ok_or(ExecutionError::UnknownStep(step))?;
        task.mark_dispatched()?;
        monitor.start(step, task.agent_name())?;
        self.progress.notify(&format!(
            "🏃‍♂️ Executing Agent {} for step {}",
            task.agent_name(),
            step
        ));
        tracing::debug!(step, agent = %task.agent_name(), "Dispatching");

        let gateway = self.gateway.clone();
        let user_id = ctx.user_id.clone();
        let agent = task.agent_name().to_string();
        let payload = task.payload().clone();
        Ok(async move {
            let outcome = gateway
                .dispatch(DispatchRequest {
                    user_id: &user_id,
                    step,
                    agent: &agent,
                    payload: &payload,
                })
                .await;
            StepEvent::Dispatched { step, outcome }
        }
        .boxed())
    }
}

/// Fail every task that has not reached a terminal state.
fn abandon(plan: &mut Plan, reason: &str) -> Result<(), TaskError> {
    let open: Vec<StepId> = plan
        .tasks()
        .iter()
        .filter(|t| !t.state().is_terminal())
        .map(|t| t.step())
        .collect();
    for step in open {
        if let Some(task) = plan.get_mut(step) {
            task.fail(reason)?;
        }
    }
    Ok(())
}
