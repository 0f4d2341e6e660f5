//! Router, shared state and server startup.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cache::{DisabledCache, FingerprintCache, InMemoryCache};
use crate::commands::CommandProcessor;
use crate::config::Config;
use crate::engine::{Aggregator, ExecutionEngine};
use crate::gateway::{
    build_agents, AgentGateway, BreakerSnapshot, CircuitBreakerRegistry, ClientCredentialsProvider, EnvSecrets,
    TokenProvider,
};
use crate::history::{ConversationHistory, InMemoryHistory};
use crate::invoker::{RequestData, SmartInvoker, TurnResponse};
use crate::llm::{LlmClient, OpenAiClient, RetryConfig};
use crate::planner::PlanGenerator;
use crate::registry::AgentRegistry;
use crate::resolver::DependencyResolver;

/// Shared application state.
pub struct AppState {
    pub invoker: SmartInvoker,
    pub gateway: AgentGateway,
}

/// Wire every component from configuration.
pub async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let registry = Arc::new(AgentRegistry::load(&config.registry_path).await?);
    tracing::info!(agents = registry.len(), path = %config.registry_path.display(), "Agent registry loaded");

    let retry = RetryConfig::default();
    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::with_retry_config(&config.llm, retry.clone()));
    let history: Arc<dyn ConversationHistory> = Arc::new(InMemoryHistory::new());

    let cache_enabled = config.use_cache && registry.cache().enabled;
    let cache: Arc<dyn FingerprintCache> = if cache_enabled {
        Arc::new(InMemoryCache::new())
    } else {
        Arc::new(DisabledCache)
    };

    let bearer = registry.bearer_agents();
    if config.identity.is_none() && !bearer.is_empty() {
        anyhow::bail!(
            "Agents {} use bearer authentication but IDENTITY_TOKEN_URL, IDENTITY_CLIENT_ID and IDENTITY_CLIENT_SECRET are not all set",
            bearer.join(", ")
        );
    }

    let tokens = config
        .identity
        .clone()
        .map(|identity| Arc::new(ClientCredentialsProvider::new(identity)) as Arc<dyn TokenProvider>);
    let agents = build_agents(&registry, reqwest::Client::new(), Arc::new(EnvSecrets), tokens);
    let gateway = AgentGateway::with_options(
        Arc::clone(&registry),
        agents,
        cache,
        Some(cache_enabled),
        CircuitBreakerRegistry::new(),
    );

    let model = config.llm.model.clone();
    // the client times out each attempt; callers only bound the whole retry sequence
    let timeout = retry.attempt_budget(config.llm.timeout);
    tracing::debug!(per_request = ?config.llm.timeout, budget = ?timeout, "Completion time limits");
    let engine = ExecutionEngine::new(
        gateway.clone(),
        Arc::new(DependencyResolver::new(Arc::clone(&llm), model.clone(), timeout)),
        Arc::new(Aggregator::new(Arc::clone(&llm), model.clone(), config.llm.max_tokens, timeout)),
        Arc::clone(&history),
    )
    .with_concurrency(config.execution_concurrency);

    let mut planner = PlanGenerator::new(Arc::clone(&llm), registry, model.clone()).with_limits(
        config.llm.max_tokens,
        config.llm.temperature,
        timeout,
    );
    if let Some(path) = &config.planner_prompt_path {
        planner = planner.with_preamble(PlanGenerator::load_preamble(path).await?);
        tracing::info!(path = %path.display(), "Planner prompt loaded");
    }

    let mut invoker = SmartInvoker::new(planner, engine, Arc::clone(&history), config.history_limit);
    if config.process_commands {
        invoker = invoker.with_commands(CommandProcessor::new(llm, history, model, timeout));
    }

    Ok(AppState { invoker, gateway })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/query", post(query))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let state = Arc::new(build_state(&config).await?);
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    tracing::info!("Shutdown signal received");
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub agents: usize,
    pub breakers: Vec<BreakerSnapshot>,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        agents: state.gateway.registry().len(),
        breakers: state.gateway.breakers().snapshot().await,
    })
}

async fn query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RequestData>,
) -> Result<Json<TurnResponse>, (StatusCode, String)> {
    if request.query.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Query must not be empty".to_string()));
    }
    Ok(Json(state.invoker.respond(request).await))
}
