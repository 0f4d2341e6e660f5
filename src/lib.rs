//! # smart-invoke
//!
//! Turns a natural-language request into a plan of agent calls and runs it.
//!
//! ```text
//!   query ──► CommandProcessor ──► PlanGenerator ──► ExecutionEngine ──► answer
//!                                       │                 │
//!                                       ▼                 ▼
//!                                  LlmClient      DependencyResolver
//!                                                  AgentGateway ──► agents
//!                                                  (cache, breaker, retry)
//! ```
//!
//! ## Modules
//! - `planner`: one completion per turn producing a `Plan` or a `UserAction`
//! - `engine`: readiness loop, aggregation and per-step timings
//! - `resolver`: extraction of dependency values from prior results
//! - `gateway`: agent dispatch with caching, circuit breaking and retry
//! - `registry`: agent registrations loaded at startup
//! - `invoker`: the turn boundary used by the HTTP API

pub mod api;
pub mod cache;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod history;
pub mod invoker;
pub mod llm;
pub mod plan;
pub mod planner;
pub mod prompts;
pub mod registry;
pub mod resolver;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use error::InvokeError;
pub use invoker::{RequestData, SmartInvoker, TurnResponse};
