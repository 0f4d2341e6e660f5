//! Agent gateway: one logical call per resolved task.
//!
//! Wraps every registered agent behind the same `dispatch` contract and
//! enforces, in order:
//! - required payload fields
//! - the fingerprint cache, with concurrent identical dispatches coalesced
//! - the per-agent circuit breaker
//! - bounded retry with exponential backoff for transient failures

mod auth;
mod breaker;
mod error;
mod http;
mod interactive;
mod retry;

pub use auth::{ClientCredentialsProvider, EnvSecrets, SecretSource, StaticSecrets, TokenProvider};
pub use breaker::{BreakerRejection, BreakerSnapshot, BreakerState, CircuitBreakerRegistry};
pub use error::{DispatchError, DispatchErrorKind};
pub use http::{stringify_payload, HttpAgent};
pub use interactive::{user_message, InteractiveAgent};
pub use retry::backoff_delay;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::cache::{fingerprint, FingerprintCache};
use crate::plan::StepId;
use crate::registry::{AgentKind, AgentRegistration, AgentRegistry};

/// A callable capability. One `invoke` is one transport attempt.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> AgentKind;

    async fn invoke(&self, payload: &Map<String, Value>) -> Result<String, DispatchError>;
}

/// Construct one agent per registration.
pub fn build_agents(
    registry: &AgentRegistry,
    client: reqwest::Client,
    secrets: Arc<dyn SecretSource>,
    tokens: Option<Arc<dyn TokenProvider>>,
) -> HashMap<String, Arc<dyn Agent>> {
    registry
        .iter()
        .map(|registration| {
            let agent: Arc<dyn Agent> = match registration.kind {
                AgentKind::Http => Arc::new(HttpAgent::new(
                    registration.clone(),
                    client.clone(),
                    Arc::clone(&secrets),
                    tokens.clone(),
                )),
                AgentKind::Interactive => Arc::new(InteractiveAgent::new(&registration.name)),
            };
            (registration.name.clone(), agent)
        })
        .collect()
}

/// One dispatch request.
#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest<'a> {
    pub user_id: &'a str,
    pub step: StepId,
    pub agent: &'a str,
    pub payload: &'a Map<String, Value>,
}

/// Where a successful result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    Agent,
    Cache,
    /// Shared with a concurrent identical dispatch
    Coalesced,
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub result: String,
    pub source: ResultSource,
}

type DispatchFuture = BoxFuture<'static, Result<String, DispatchError>>;
type SharedDispatch = Shared<DispatchFuture>;

struct GatewayInner {
    agents: HashMap<String, Arc<dyn Agent>>,
    registry: Arc<AgentRegistry>,
    cache: Arc<dyn FingerprintCache>,
    cache_enabled: bool,
    cache_ttl: Duration,
    breakers: CircuitBreakerRegistry,
    /// Weak handles only: a flight nobody awaits any more is dropped.
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_flight: AtomicU64,
}

struct InFlight {
    id: u64,
    flight: WeakShared<DispatchFuture>,
}

impl GatewayInner {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a flight's entry once the flight completes or is dropped unfinished.
struct FlightGuard {
    inner: Arc<GatewayInner>,
    key: String,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.inner.in_flight();
        if in_flight.get(&self.key).is_some_and(|entry| entry.id == self.id) {
            in_flight.remove(&self.key);
        }
    }
}

/// Shared across turns; cheap to clone.
#[derive(Clone)]
pub struct AgentGateway {
    inner: Arc<GatewayInner>,
}

impl AgentGateway {
    /// Caching follows the registry's `cache` settings.
    pub fn new(
        registry: Arc<AgentRegistry>,
        agents: HashMap<String, Arc<dyn Agent>>,
        cache: Arc<dyn FingerprintCache>,
    ) -> Self {
        Self::with_options(registry, agents, cache, None, CircuitBreakerRegistry::new())
    }

    /// `cache_enabled` overrides the registry setting when given.
    pub fn with_options(
        registry: Arc<AgentRegistry>,
        agents: HashMap<String, Arc<dyn Agent>>,
        cache: Arc<dyn FingerprintCache>,
        cache_enabled: Option<bool>,
        breakers: CircuitBreakerRegistry,
    ) -> Self {
        let cache_enabled = cache_enabled.unwrap_or(registry.cache().enabled);
        let cache_ttl = registry.cache().ttl();
        Self {
            inner: Arc::new(GatewayInner {
                agents,
                registry,
                cache,
                cache_enabled,
                cache_ttl,
                breakers,
                in_flight: Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.breakers
    }

    pub fn kind_of(&self, agent: &str) -> Option<AgentKind> {
        self.inner.agents.get(agent).map(|a| a.kind())
    }

    /// Dispatch one resolved task.
    pub async fn dispatch(&self, request: DispatchRequest<'_>) -> Result<DispatchOutcome, DispatchError> {
        let DispatchRequest {
            user_id,
            step,
            agent,
            payload,
        } = request;

        let unknown = || {
            DispatchError::new(agent, DispatchErrorKind::UnknownAgent, format!("Agent {} not found", agent))
                .at_step(step)
        };
        let handle = self.inner.agents.get(agent).cloned().ok_or_else(unknown)?;
        let registration = self.inner.registry.get(agent).cloned().ok_or_else(unknown)?;

        if handle.kind() == AgentKind::Interactive {
            let result = handle.invoke(payload).await.map_err(|e| e.at_step(step))?;
            return Ok(DispatchOutcome {
                result,
                source: ResultSource::Agent,
            });
        }

        if let Some(missing) = registration
            .required_fields
            .iter()
            .find(|field| !payload.contains_key(field.as_str()))
        {
            return Err(DispatchError::new(
                agent,
                DispatchErrorKind::MissingField,
                format!("Missing required field: {}", missing),
            )
            .at_step(step));
        }

        if !self.inner.cache_enabled {
            let result = self
                .invoke_with_retry(handle, registration, payload.clone())
                .await
                .map_err(|e| e.at_step(step))?;
            return Ok(DispatchOutcome {
                result,
                source: ResultSource::Agent,
            });
        }

        let key = fingerprint(user_id, agent, payload);
        if let Some(hit) = self.inner.cache.get(&key).await {
            tracing::debug!(agent = %agent, step, "Fingerprint cache hit");
            return Ok(DispatchOutcome {
                result: hit,
                source: ResultSource::Cache,
            });
        }

        let (shared, source) = {
            let mut in_flight = self.inner.in_flight();
            match in_flight.get(&key).and_then(|entry| entry.flight.upgrade()) {
                Some(existing) => {
                    tracing::debug!(agent = %agent, step, "Joining identical in-flight dispatch");
                    (existing, ResultSource::Coalesced)
                }
                None => {
                    let gateway = self.clone();
                    let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                    let guard = FlightGuard {
                        inner: Arc::clone(&self.inner),
                        key: key.clone(),
                        id,
                    };
                    let payload = payload.clone();
                    let flight: SharedDispatch = async move {
                        let result = gateway.invoke_with_retry(handle, registration, payload).await;
                        if let Ok(ref value) = result {
                            gateway
                                .inner
                                .cache
                                .set(&guard.key, value.clone(), gateway.inner.cache_ttl)
                                .await;
                        }
                        drop(guard);
                        result
                    }
                    .boxed()
                    .shared();
                    if let Some(weak) = flight.downgrade() {
                        in_flight.insert(key, InFlight { id, flight: weak });
                    }
                    (flight, ResultSource::Agent)
                }
            }
        };

        let result = shared.await.map_err(|e| e.at_step(step))?;
        Ok(DispatchOutcome { result, source })
    }

    async fn invoke_with_retry(
        &self,
        handle: Arc<dyn Agent>,
        registration: AgentRegistration,
        payload: Map<String, Value>,
    ) -> Result<String, DispatchError> {
        let name = registration.name.as_str();
        let breakers = &self.inner.breakers;
        let mut attempt: u32 = 0;

        loop {
            if let Err(rejection) = breakers.try_acquire(name, &registration.breaker).await {
                tracing::warn!(agent = %name, "Circuit open, failing fast");
                return Err(DispatchError::new(
                    name,
                    DispatchErrorKind::CircuitOpen,
                    format!("Circuit open, next trial in {:?}", rejection.retry_in),
                ));
            }

            let outcome = match tokio::time::timeout(registration.timeout, handle.invoke(&payload)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(DispatchError::new(
                    name,
                    DispatchErrorKind::Timeout,
                    format!("No response within {:?}", registration.timeout),
                )),
            };

            match outcome {
                Ok(result) if result.trim().is_empty() => {
                    breakers.record_success(name).await;
                    return Err(DispatchError::new(
                        name,
                        DispatchErrorKind::Rejected,
                        "Agent returned an empty result",
                    ));
                }
                Ok(result) => {
                    breakers.record_success(name).await;
                    if attempt > 0 {
                        tracing::info!(agent = %name, attempt, "Dispatch succeeded after retries");
                    }
                    return Ok(result);
                }
                Err(error) if error.is_transient() => {
                    let state = breakers.record_failure(name, &registration.breaker).await;
                    let can_retry = registration.idempotent
                        && attempt < registration.retry.max_retries
                        && state != BreakerState::Open;
                    if !can_retry {
                        tracing::error!(agent = %name, attempt, breaker = ?state, "Dispatch failed: {}", error);
                        return Err(error);
                    }
                    let delay = backoff_delay(&registration.retry, attempt, error.retry_after);
                    tracing::warn!(
                        agent = %name,
                        attempt = attempt + 1,
                        "Dispatch attempt failed with {}, retrying in {:?}",
                        error.kind,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    // A status code means the service answered.
                    if error.status.is_some() {
                        breakers.record_success(name).await;
                    } else {
                        breakers.release(name).await;
                    }
                    tracing::error!(agent = %name, "Dispatch failed (non-retryable): {}", error);
                    return Err(error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DisabledCache, InMemoryCache};
    use crate::registry::{CacheSettings, RetryPolicy};
    use crate::test_support::{FakeAgent, FakeReply};
    use serde_json::json;

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_factor: 2.0,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    fn gateway(agent: Arc<FakeAgent>, registration: AgentRegistration, cache_enabled: bool) -> AgentGateway {
        let registry = Arc::new(AgentRegistry::from_registrations(
            vec![registration],
            CacheSettings {
                enabled: cache_enabled,
                ttl: 300,
            },
        ));
        let mut agents: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        agents.insert(agent.name().to_string(), agent);
        let cache: Arc<dyn FingerprintCache> = if cache_enabled {
            Arc::new(InMemoryCache::new())
        } else {
            Arc::new(DisabledCache)
        };
        AgentGateway::new(registry, agents, cache)
    }

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn request<'a>(agent: &'a str, payload: &'a Map<String, Value>) -> DispatchRequest<'a> {
        DispatchRequest {
            user_id: "u1",
            step: 1,
            agent,
            payload,
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_second_call() {
        let agent = Arc::new(FakeAgent::new("Weather", vec![FakeReply::ok("sunny")]));
        let gw = gateway(
            Arc::clone(&agent),
            AgentRegistration::new("Weather", AgentKind::Http),
            true,
        );
        let p = payload(json!({"City": "Paris"}));

        let first = gw.dispatch(request("Weather", &p)).await.unwrap();
        assert_eq!(first.source, ResultSource::Agent);
        let second = gw.dispatch(request("Weather", &p)).await.unwrap();
        assert_eq!(second.source, ResultSource::Cache);
        assert_eq!(second.result, "sunny");
        assert_eq!(agent.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_identical_dispatches_coalesce() {
        let agent = Arc::new(
            FakeAgent::new("Weather", vec![FakeReply::ok("sunny")]).with_delay(Duration::from_millis(50)),
        );
        let gw = gateway(
            Arc::clone(&agent),
            AgentRegistration::new("Weather", AgentKind::Http),
            true,
        );
        let p = payload(json!({"City": "Paris"}));

        let (a, b) = tokio::join!(gw.dispatch(request("Weather", &p)), gw.dispatch(request("Weather", &p)));
        assert_eq!(a.unwrap().result, "sunny");
        assert_eq!(b.unwrap().result, "sunny");
        assert_eq!(agent.calls(), 1);
    }

    #[tokio::test]
    async fn test_without_cache_every_dispatch_calls_agent() {
        let agent = Arc::new(FakeAgent::new("Weather", vec![FakeReply::ok("sunny")]));
        let gw = gateway(
            Arc::clone(&agent),
            AgentRegistration::new("Weather", AgentKind::Http),
            false,
        );
        let p = payload(json!({"City": "Paris"}));
        gw.dispatch(request("Weather", &p)).await.unwrap();
        gw.dispatch(request("Weather", &p)).await.unwrap();
        assert_eq!(agent.calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let agent = Arc::new(FakeAgent::new(
            "Flights",
            vec![FakeReply::status(503), FakeReply::status(502), FakeReply::ok("seats")],
        ));
        let gw = gateway(
            Arc::clone(&agent),
            AgentRegistration::new("Flights", AgentKind::Http).with_retry(fast_retry(3)),
            false,
        );
        let outcome = gw.dispatch(request("Flights", &Map::new())).await.unwrap();
        assert_eq!(outcome.result, "seats");
        assert_eq!(agent.calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let agent = Arc::new(FakeAgent::new("Flights", vec![FakeReply::status(400)]));
        let gw = gateway(
            Arc::clone(&agent),
            AgentRegistration::new("Flights", AgentKind::Http).with_retry(fast_retry(3)),
            false,
        );
        let err = gw.dispatch(request("Flights", &Map::new())).await.unwrap_err();
        assert_eq!(err.kind, DispatchErrorKind::Rejected);
        assert_eq!(err.step, Some(1));
        assert_eq!(agent.calls(), 1);
    }

    #[tokio::test]
    async fn test_non_idempotent_not_retried() {
        let agent = Arc::new(FakeAgent::new("Ticket", vec![FakeReply::status(503)]));
        let mut registration = AgentRegistration::new("Ticket", AgentKind::Http).with_retry(fast_retry(3));
        registration.idempotent = false;
        let gw = gateway(Arc::clone(&agent), registration, false);
        assert!(gw.dispatch(request("Ticket", &Map::new())).await.is_err());
        assert_eq!(agent.calls(), 1);
    }

    #[tokio::test]
    async fn test_breaker_fails_fast_after_three_failures() {
        let agent = Arc::new(FakeAgent::new("Flights", vec![FakeReply::status(503)]));
        let gw = gateway(
            Arc::clone(&agent),
            AgentRegistration::new("Flights", AgentKind::Http).with_retry(fast_retry(0)),
            false,
        );
        for _ in 0..3 {
            let err = gw.dispatch(request("Flights", &Map::new())).await.unwrap_err();
            assert_eq!(err.kind, DispatchErrorKind::Transport);
        }
        let err = gw.dispatch(request("Flights", &Map::new())).await.unwrap_err();
        assert_eq!(err.kind, DispatchErrorKind::CircuitOpen);
        assert_eq!(agent.calls(), 3);
    }

    #[tokio::test]
    async fn test_breaker_opening_stops_retries() {
        let agent = Arc::new(FakeAgent::new("Flights", vec![FakeReply::status(500)]));
        let gw = gateway(
            Arc::clone(&agent),
            AgentRegistration::new("Flights", AgentKind::Http).with_retry(fast_retry(10)),
            false,
        );
        let err = gw.dispatch(request("Flights", &Map::new())).await.unwrap_err();
        assert_eq!(err.kind, DispatchErrorKind::Transport);
        assert_eq!(agent.calls(), 3);
        assert_eq!(gw.breakers().state("Flights").await, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let agent = Arc::new(
            FakeAgent::new("Slow", vec![FakeReply::ok("late")]).with_delay(Duration::from_millis(200)),
        );
        let mut registration = AgentRegistration::new("Slow", AgentKind::Http).with_retry(fast_retry(1));
        registration.timeout = Duration::from_millis(20);
        let gw = gateway(Arc::clone(&agent), registration, false);
        let err = gw.dispatch(request("Slow", &Map::new())).await.unwrap_err();
        assert_eq!(err.kind, DispatchErrorKind::Timeout);
        assert_eq!(agent.calls(), 2);
    }

    #[tokio::test]
    async fn test_required_fields_validated() {
        let agent = Arc::new(FakeAgent::new("Leave", vec![FakeReply::ok("10 days")]));
        let gw = gateway(
            Arc::clone(&agent),
            AgentRegistration::new("Leave", AgentKind::Http).with_required_fields(&["EmployeeId"]),
            false,
        );
        let err = gw.dispatch(request("Leave", &Map::new())).await.unwrap_err();
        assert_eq!(err.kind, DispatchErrorKind::MissingField);
        assert_eq!(agent.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_result_is_rejected() {
        let agent = Arc::new(FakeAgent::new("Leave", vec![FakeReply::ok("  ")]));
        let gw = gateway(Arc::clone(&agent), AgentRegistration::new("Leave", AgentKind::Http), false);
        let err = gw.dispatch(request("Leave", &Map::new())).await.unwrap_err();
        assert_eq!(err.kind, DispatchErrorKind::Rejected);
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let agent = Arc::new(FakeAgent::new("Leave", vec![FakeReply::ok("x")]));
        let gw = gateway(agent, AgentRegistration::new("Leave", AgentKind::Http), false);
        let err = gw.dispatch(request("Nobody", &Map::new())).await.unwrap_err();
        assert_eq!(err.kind, DispatchErrorKind::UnknownAgent);
    }

    #[test]
    fn test_build_agents_per_kind() {
        let registry = AgentRegistry::from_registrations(
            vec![
                AgentRegistration::new("Flights", AgentKind::Http).with_service_url("https://f.example.com"),
                AgentRegistration::new("UserProxyAgent", AgentKind::Interactive),
            ],
            CacheSettings::default(),
        );
        let agents = build_agents(&registry, reqwest::Client::new(), Arc::new(StaticSecrets::new()), None);
        assert_eq!(agents["Flights"].kind(), AgentKind::Http);
        assert_eq!(agents["UserProxyAgent"].kind(), AgentKind::Interactive);
    }

    #[tokio::test]
    async fn test_abandoned_flight_not_joined() {
        let agent = Arc::new(
            FakeAgent::new("Weather", vec![FakeReply::ok("sunny")]).with_delay(Duration::from_millis(100)),
        );
        let gw = gateway(
            Arc::clone(&agent),
            AgentRegistration::new("Weather", AgentKind::Http),
            true,
        );
        let p = payload(json!({"City": "Paris"}));

        let abandoned = tokio::time::timeout(Duration::from_millis(10), gw.dispatch(request("Weather", &p))).await;
        assert!(abandoned.is_err());
        assert!(gw.inner.in_flight().is_empty());

        let outcome = gw.dispatch(request("Weather", &p)).await.unwrap();
        assert_eq!(outcome.source, ResultSource::Agent);
        assert_eq!(outcome.result, "sunny");
        assert_eq!(agent.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_half_open_trial_recovers() {
        let agent = Arc::new(
            FakeAgent::new(
                "Flights",
                vec![
                    FakeReply::status(503),
                    FakeReply::status(503),
                    FakeReply::status(503),
                    FakeReply::ok("seats"),
                ],
            )
            .with_delay(Duration::from_millis(100)),
        );
        let gw = gateway(
            Arc::clone(&agent),
            AgentRegistration::new("Flights", AgentKind::Http).with_retry(fast_retry(0)),
            false,
        );
        for _ in 0..3 {
            assert!(gw.dispatch(request("Flights", &Map::new())).await.is_err());
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        let trial = tokio::time::timeout(Duration::from_millis(10), gw.dispatch(request("Flights", &Map::new()))).await;
        assert!(trial.is_err());
        let err = gw.dispatch(request("Flights", &Map::new())).await.unwrap_err();
        assert_eq!(err.kind, DispatchErrorKind::CircuitOpen);

        tokio::time::advance(Duration::from_secs(10)).await;
        let outcome = gw.dispatch(request("Flights", &Map::new())).await.unwrap();
        assert_eq!(outcome.result, "seats");
        assert_eq!(agent.calls(), 5);
        assert_eq!(gw.breakers().state("Flights").await, BreakerState::Closed);
    }
}
