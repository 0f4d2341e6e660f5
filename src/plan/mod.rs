//! Plan model: the task DAG generated for one user turn.
//!
//! A plan is created fresh per request and discarded with the response.
//! Construction validates the graph so the engine never sees duplicate steps,
//! dangling edges or cycles.

mod task;

pub use task::{Dependency, StepId, Task, TaskError, TaskState};

use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Errors in plan construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("Step {0} appears more than once in the plan")]
    DuplicateStep(StepId),

    #[error("Step {step} depends on unknown step {missing}")]
    DanglingDependency { step: StepId, missing: StepId },

    #[error("Step {0} depends on itself")]
    SelfDependency(StepId),

    #[error("Circular dependency detected in plan")]
    CircularDependency,
}

/// Insertion-ordered collection of tasks.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    tasks: Vec<Task>,
}

impl Plan {
    /// Build and validate a plan.
    ///
    /// # Errors
    /// Duplicate step ids, dependencies on unknown steps, self-dependencies
    /// and cycles are rejected.
    pub fn new(tasks: Vec<Task>) -> Result<Self, PlanError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.step(), i).is_some() {
                return Err(PlanError::DuplicateStep(task.step()));
            }
        }
        for task in &tasks {
            for dep in task.dependencies() {
                if dep.step == task.step() {
                    return Err(PlanError::SelfDependency(task.step()));
                }
                if !index.contains_key(&dep.step) {
                    return Err(PlanError::DanglingDependency {
                        step: task.step(),
                        missing: dep.step,
                    });
                }
            }
        }

        let plan = Self { tasks };
        plan.execution_order()?;
        Ok(plan)
    }

    /// A valid topological order of task indices.
    ///
    /// # Errors
    /// Returns `Err` if there are circular dependencies.
    pub fn execution_order(&self) -> Result<Vec<usize>, PlanError> {
        let n = self.tasks.len();
        let position: HashMap<StepId, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.step(), i))
            .collect();
        let mut in_degree = vec![0usize; n];
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, task) in self.tasks.iter().enumerate() {
            // Repeated edges to the same source count once.
            let sources: BTreeSet<StepId> = task.dependencies().iter().map(|d| d.step).collect();
            for source in sources {
                if let Some(&j) = position.get(&source) {
                    adj[j].push(i);
                    in_degree[i] += 1;
                }
            }
        }

        // Kahn's algorithm, preferring insertion order among ready tasks
        let mut queue: std::collections::VecDeque<usize> =
            (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &next in &adj[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != n {
            Err(PlanError::CircularDependency)
        } else {
            Ok(order)
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, step: StepId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.step() == step)
    }

    pub fn get_mut(&mut self, step: StepId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.step() == step)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks without dependencies, in insertion order.
    pub fn independent_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| !t.has_dependencies())
    }

    /// Sorted, de-duplicated agent names.
    pub fn unique_agents(&self) -> Vec<String> {
        self.tasks
            .iter()
            .map(|t| t.agent_name().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Comma-separated `unique_agents`.
    pub fn agents_summary(&self) -> String {
        self.unique_agents().join(", ")
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Plan with tasks:")?;
        for task in &self.tasks {
            let payload =
                serde_json::to_string(task.payload()).unwrap_or_else(|_| "{}".to_string());
            let dependencies = task
                .dependencies()
                .iter()
                .map(|d| format!("{}: {}", d.parameter, d.step))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(
                f,
                "\nStep {}: {} - {}\n  payload: {}\n  dependencies: [{}]",
                task.step(),
                task.agent_name(),
                task.status_message(),
                payload,
                dependencies
            )?;
        }
        Ok(())
    }
}
