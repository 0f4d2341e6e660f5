//! HTTP API.
//!
//! - `POST /api/query`: run one turn
//! - `GET /api/health`: liveness plus circuit breaker states

mod routes;

pub use routes::{build_state, router, serve, AppState, HealthResponse};
