//! Unified API router for AgentDock
//!
//! Merges the agent router with root-level probes and wraps everything in
//! CORS and request tracing.
//!
//! ## Endpoint Map
//!
//! | Prefix                       | Description                          |
//! |------------------------------|--------------------------------------|
//! | `/health`                    | Liveness probe                       |
//! | `/api/v1/agents/*`           | Definitions, deletion, start/stop    |
//! | `/api/v1/agent-types/:id`    | Launch templates                     |
//! | `/api/v1/artifacts`          | Materialized config artifacts        |
//! | `/ws/agents/:id`             | Streaming chat                       |

use crate::agent::{agent_router, AgentState};
use crate::config::ServerConfig;
use crate::orchestrator::Orchestrator;
use axum::{
    extract::State,
    http::{header, Method},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the complete AgentDock HTTP application
pub fn build_app(orchestrator: Arc<Orchestrator>, server: &ServerConfig) -> Router {
    let cors = build_cors(&server.cors_origins);
    let ping_interval =
        (server.ws_ping_interval_secs > 0).then(|| Duration::from_secs(server.ws_ping_interval_secs));

    let agent_state = AgentState {
        orchestrator: orchestrator.clone(),
        ping_interval,
    };

    Router::new()
        .route("/health", get(health_check).with_state(orchestrator))
        .merge(agent_router(agent_state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    running_agents: usize,
}

async fn health_check(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        running_agents: orchestrator.registry().running().await.len(),
    })
}

fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let parsed: Vec<_> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(parsed)
    }
}
