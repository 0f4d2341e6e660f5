//! Per-agent circuit breakers.
//!
//! Consecutive transport failures against one agent open its breaker. While
//! open, dispatches fail fast without a network attempt. Once the recovery
//! window has passed a single half-open trial is let through; its outcome
//! closes or re-opens the breaker. A trial that reports nothing within one
//! recovery window is treated as lost and another is allowed.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::registry::BreakerPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Health state for a single agent.
#[derive(Debug, Clone)]
struct AgentHealth {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Start of the outstanding half-open trial
    trial_started: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
}

impl Default for AgentHealth {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started: None,
            total_successes: 0,
            total_failures: 0,
        }
    }
}

/// Returned when the breaker refuses an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerRejection {
    /// Time until a trial will be allowed
    pub retry_in: Duration,
}

/// Serializable snapshot for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub agent: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
}

/// Breaker state for every agent, shared across turns.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerRegistry {
    agents: Arc<RwLock<HashMap<String, AgentHealth>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask permission for one transport attempt.
    pub async fn try_acquire(
        &self,
        agent: &str,
        policy: &BreakerPolicy,
    ) -> Result<(), BreakerRejection> {
        let mut agents = self.agents.write().await;
        let health = agents.entry(agent.to_string()).or_default();
        match health.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened_at = health.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened_at.elapsed();
                let window = policy.recovery_timeout();
                if elapsed < window {
                    return Err(BreakerRejection {
                        retry_in: window - elapsed,
                    });
                }
                tracing::info!(agent = %agent, "Circuit breaker half-open, allowing trial");
                health.state = BreakerState::HalfOpen;
                health.trial_started = Some(Instant::now());
                Ok(())
            }
            BreakerState::HalfOpen => {
                let window = policy.recovery_timeout();
                if let Some(started) = health.trial_started {
                    let elapsed = started.elapsed();
                    if elapsed < window {
                        return Err(BreakerRejection {
                            retry_in: window - elapsed,
                        });
                    }
                    tracing::warn!(
                        agent = %agent,
                        trial_age_secs = elapsed.as_secs(),
                        "Half-open trial never reported, allowing another"
                    );
                }
                health.trial_started = Some(Instant::now());
                Ok(())
            }
        }
    }

    /// Record a successful attempt; closes the breaker.
    pub async fn record_success(&self, agent: &str) {
        let mut agents = self.agents.write().await;
        let health = agents.entry(agent.to_string()).or_default();
        if health.state != BreakerState::Closed {
            tracing::info!(agent = %agent, "Circuit breaker closed");
        }
        health.state = BreakerState::Closed;
        health.consecutive_failures = 0;
        health.opened_at = None;
        health.trial_started = None;
        health.total_successes += 1;
    }

    /// Record a failed transport attempt. Returns the resulting state.
    pub async fn record_failure(&self, agent: &str, policy: &BreakerPolicy) -> BreakerState {
        let mut agents = self.agents.write().await;
        let health = agents.entry(agent.to_string()).or_default();
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.total_failures += 1;
        health.trial_started = None;

        let should_open = match health.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => health.consecutive_failures >= policy.failure_threshold,
            BreakerState::Open => false,
        };
        if should_open {
            health.state = BreakerState::Open;
            health.opened_at = Some(Instant::now());
            tracing::warn!(
                agent = %agent,
                consecutive_failures = health.consecutive_failures,
                cooldown_secs = policy.recovery_timeout_secs,
                "Circuit breaker opened"
            );
        }
        health.state
    }

    /// Give back a half-open trial that ended without a transport outcome.
    pub async fn release(&self, agent: &str) {
        if let Some(health) = self.agents.write().await.get_mut(agent) {
            health.trial_started = None;
        }
    }

    pub async fn state(&self, agent: &str) -> BreakerState {
        self.agents
            .read()
            .await
            .get(agent)
            .map(|h| h.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub async fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let agents = self.agents.read().await;
        let mut snapshot: Vec<_> = agents
            .iter()
            .map(|(name, h)| BreakerSnapshot {
                agent: name.clone(),
                state: h.state,
                consecutive_failures: h.consecutive_failures,
                total_successes: h.total_successes,
                total_failures: h.total_failures,
            })
            .collect();
        snapshot.sort_by(|a, b| a.agent.cmp(&b.agent));
        snapshot
    }
}
