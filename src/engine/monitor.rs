//! Per-step dispatch timings.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::plan::StepId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    #[error("Step {0} was already started")]
    AlreadyStarted(StepId),

    #[error("Step {0} was never started")]
    NotStarted(StepId),

    #[error("Step {0} was already ended")]
    AlreadyEnded(StepId),
}

#[derive(Debug, Clone)]
struct Timing {
    agent: String,
    started: Instant,
    ended: Option<Instant>,
}

/// One row of the timing report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimingEntry {
    pub step: StepId,
    pub agent: String,
    /// `None` while the step is still running
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorReport {
    pub entries: Vec<TimingEntry>,
}

impl MonitorReport {
    /// Sum of finished step durations.
    pub fn total_ms(&self) -> u64 {
        self.entries.iter().filter_map(|e| e.duration_ms).sum()
    }

    /// Render as a fixed-width table.
    pub fn table(&self) -> String {
        let mut out = format!("{:<6} {:<32} {:>12}\n", "Step", "Agent", "Duration ms");
        for entry in &self.entries {
            let duration = entry
                .duration_ms
                .map(|d| d.to_string())
                .unwrap_or_else(|| "running".to_string());
            out.push_str(&format!("{:<6} {:<32} {:>12}\n", entry.step, entry.agent, duration));
        }
        out
    }
}

/// Collects timings for one execution. Owned by the engine driver.
#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    timings: BTreeMap<StepId, Timing>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, step: StepId, agent: &str) -> Result<(), MonitorError> {
        match self.timings.get(&step) {
            Some(timing) if timing.ended.is_none() => Err(MonitorError::AlreadyStarted(step)),
            Some(_) => Err(MonitorError::AlreadyEnded(step)),
            None => {
                self.timings.insert(
                    step,
                    Timing {
                        agent: agent.to_string(),
                        started: Instant::now(),
                        ended: None,
                    },
                );
                Ok(())
            }
        }
    }

    pub fn end(&mut self, step: StepId) -> Result<Duration, MonitorError> {
        let timing = self.timings.get_mut(&step).ok_or(MonitorError::NotStarted(step))?;
        if timing.ended.is_some() {
            return Err(MonitorError::AlreadyEnded(step));
        }
        let now = Instant::now();
        timing.ended = Some(now);
        Ok(now.duration_since(timing.started))
    }

    pub fn report(&self) -> MonitorReport {
        MonitorReport {
            entries: self
                .timings
                .iter()
                .map(|(step, timing)| TimingEntry {
                    step: *step,
                    agent: timing.agent.clone(),
                    duration_ms: timing
                        .ended
                        .map(|end| end.duration_since(timing.started).as_millis() as u64),
                })
                .collect(),
        }
    }

    /// Log the report and return it.
    pub fn finish(&self) -> MonitorReport {
        let report = self.report();
        tracing::info!(
            steps = report.entries.len(),
            total_ms = report.total_ms(),
            "Execution timings\n{}",
            report.table()
        );
        report
    }
}
