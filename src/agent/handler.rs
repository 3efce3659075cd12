//! HTTP and WebSocket handlers for agents
//!
//! REST endpoints for definitions, artifacts and session control, plus the
//! streaming chat endpoint. All handlers delegate to the [`Orchestrator`].

use crate::agent::types::*;
use crate::error::Error;
use crate::orchestrator::Orchestrator;
use crate::session::{Outbound, StartOutcome};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

/// Shared state for agent handlers
#[derive(Clone)]
pub struct AgentState {
    pub orchestrator: Arc<Orchestrator>,
    /// Interval between server pings on streaming connections
    pub ping_interval: Option<Duration>,
}

/// Create the agent router with all REST and WebSocket endpoints
pub fn agent_router(state: AgentState) -> Router {
    Router::new()
        // REST endpoints
        .route("/api/v1/agents", post(create_agents).get(list_agents))
        .route(
            "/api/v1/agents/:id",
            get(get_agent).put(update_agent).delete(delete_artifact),
        )
        .route("/api/v1/agents/:id/start", post(start_agent))
        .route("/api/v1/agents/:id/stop", post(stop_agent))
        .route("/api/v1/agents/:id/reset", post(reset_agent))
        .route("/api/v1/agent-types/:type_id", get(get_agent_type))
        .route("/api/v1/artifacts", get(list_artifacts))
        // Streaming chat
        .route("/ws/agents/:id", get(ws_upgrade))
        .with_state(state)
}

fn error_response(err: Error) -> Response {
    if err.status_code().is_server_error() {
        tracing::error!("Request failed: {}", err);
    }
    (err.status_code(), Json(ApiError::from(&err))).into_response()
}

// =============================================================================
// REST handlers
// =============================================================================

/// Pagination parameters for the list endpoint
#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    skip: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

/// Create a batch of agents backed by one config artifact
async fn create_agents(
    State(state): State<AgentState>,
    Json(inputs): Json<Vec<AgentInput>>,
) -> Response {
    match state.orchestrator.create_agents(inputs).await {
        Ok(created) => (StatusCode::CREATED, Json(created.agents)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_agents(State(state): State<AgentState>, Query(query): Query<ListQuery>) -> Response {
    match state.orchestrator.list_agents(query.skip, query.limit) {
        Ok(agents) => Json(agents).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_agent(State(state): State<AgentState>, Path(id): Path<AgentId>) -> Response {
    match state.orchestrator.get_agent(id) {
        Ok(agent) => Json(agent).into_response(),
        Err(e) => error_response(e),
    }
}

async fn update_agent(
    State(state): State<AgentState>,
    Path(id): Path<AgentId>,
    Json(update): Json<AgentUpdate>,
) -> Response {
    match state.orchestrator.update_agent(id, update).await {
        Ok(agent) => Json(agent).into_response(),
        Err(e) => error_response(e),
    }
}

/// Delete a config artifact together with every agent it bundles
async fn delete_artifact(
    State(state): State<AgentState>,
    Path(artifact_id): Path<ArtifactId>,
) -> Response {
    match state.orchestrator.delete_artifact(artifact_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(Error::NotFound(format!("Config file {}", artifact_id))),
        Err(e) => error_response(e),
    }
}

async fn start_agent(State(state): State<AgentState>, Path(id): Path<AgentId>) -> Response {
    match state.orchestrator.start_agent(id).await {
        Ok(outcome) => {
            let message = match outcome {
                StartOutcome::Started => format!("Agent {} started successfully", id),
                StartOutcome::AlreadyRunning => "Agent is already running".to_string(),
            };
            Json(serde_json::json!({
                "message": message,
                "running": true,
                "already_running": outcome == StartOutcome::AlreadyRunning,
            }))
            .into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn stop_agent(State(state): State<AgentState>, Path(id): Path<AgentId>) -> Response {
    match state.orchestrator.stop_agent(id).await {
        Ok(was_running) => Json(serde_json::json!({
            "message": format!("Agent {} stopped", id),
            "running": false,
            "was_running": was_running,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn reset_agent(State(state): State<AgentState>, Path(id): Path<AgentId>) -> Response {
    match state.orchestrator.reset_agent(id).await {
        Ok(()) => Json(serde_json::json!({
            "message": format!("Conversation of agent {} cleared", id),
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_agent_type(State(state): State<AgentState>, Path(type_id): Path<i64>) -> Response {
    match state.orchestrator.agent_type(type_id).await {
        Ok(template) => Json(template).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_artifacts(State(state): State<AgentState>) -> Response {
    match state.orchestrator.list_artifacts() {
        Ok(artifacts) => Json(artifacts).into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// WebSocket handler
// =============================================================================

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(agent_id): Path<AgentId>,
    State(state): State<AgentState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, agent_id, state))
}

/// Close code and reason for a connection refused at setup time
fn setup_close(err: &Error) -> (u16, &'static str) {
    match err {
        Error::NotFound(_) => (close_code::POLICY, "agent not found"),
        Error::StartFailure(_) | Error::Timeout(_) => (close_code::POLICY, "agent failed to start"),
        _ => (close_code::ERROR, "internal error"),
    }
}

/// Serve one streaming client until either side closes
async fn handle_connection(mut socket: WebSocket, agent_id: AgentId, state: AgentState) {
    let (connection, mut outbound) = match state.orchestrator.connect(agent_id).await {
        Ok(admitted) => admitted,
        Err(e) => {
            let (code, reason) = setup_close(&e);
            tracing::warn!(
                agent_id = agent_id,
                code = code,
                "Refusing streaming connection: {}",
                e
            );
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: Cow::Borrowed(reason),
                })))
                .await;
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Forward replies and close instructions to the client
    let ping_interval = state.ping_interval;
    let mut send_task = tokio::spawn(async move {
        let mut ping = ping_interval.map(|every| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        loop {
            let next_ping = async {
                match ping.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                msg = outbound.recv() => match msg {
                    Some(Outbound::Frame(frame)) => {
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::error!(agent_id = agent_id, "Failed to encode frame: {}", e);
                                continue;
                            }
                        };
                        if ws_sender.send(Message::Text(text)).await.is_err() {
                            tracing::debug!(agent_id = agent_id, "WebSocket send failed");
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = ws_sender
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: Cow::Owned(reason),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                },
                _ = next_ping => {
                    if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Relay client messages one at a time
    let orchestrator = state.orchestrator.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let text = inbound_text(&text);
                    orchestrator.relay(&connection, &text).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.orchestrator.disconnect(&connection).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::engine::testing::ScriptedEngine;
    use crate::config::{AgentDockConfig, StorageConfig};
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn make_state() -> (AgentState, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = AgentDockConfig::default();
        config.storage = StorageConfig::rooted_at(dir.path());
        let orchestrator = Orchestrator::open(&config, Arc::new(ScriptedEngine::new()))
            .await
            .unwrap();
        let state = AgentState {
            orchestrator: Arc::new(orchestrator),
            ping_interval: None,
        };
        (state, dir)
    }

    async fn call(
        state: &AgentState,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = agent_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 64)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn batch(names: &[&str]) -> serde_json::Value {
        serde_json::Value::Array(
            names
                .iter()
                .map(|n| {
                    serde_json::json!({
                        "name": n,
                        "agent_type": "echo",
                        "command": "echo",
                        "args": ["hi"],
                        "env": {}
                    })
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let (state, _dir) = make_state().await;
        let (status, created) = call(&state, "POST", "/api/v1/agents", Some(batch(&["a", "b"]))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.as_array().unwrap().len(), 2);
        assert_eq!(created[0]["name"], "a");
        assert_eq!(created[0]["is_active"], true);

        let (status, list) = call(&state, "GET", "/api/v1/agents?skip=1&limit=10", None).await;
        assert_eq!(status, StatusCode::OK);
        let list = list.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["name"], "b");
        assert!(list[0]["file_name"]
            .as_str()
            .unwrap()
            .starts_with("mcp_agents_"));
        assert!(list[0]["file_id"].is_i64());
    }

    #[tokio::test]
    async fn test_duplicate_name_is_400() {
        let (state, _dir) = make_state().await;
        call(&state, "POST", "/api/v1/agents", Some(batch(&["a"]))).await;
        let (status, body) = call(&state, "POST", "/api/v1/agents", Some(batch(&["a"]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "DUPLICATE_NAME");
    }

    #[tokio::test]
    async fn test_empty_batch_is_400() {
        let (state, _dir) = make_state().await;
        let (status, body) = call(&state, "POST", "/api/v1/agents", Some(serde_json::json!([]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_get_and_update() {
        let (state, _dir) = make_state().await;
        let (_, created) = call(&state, "POST", "/api/v1/agents", Some(batch(&["a"]))).await;
        let id = created[0]["id"].as_i64().unwrap();

        let (status, body) = call(&state, "GET", &format!("/api/v1/agents/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["command"], "echo");

        let (status, body) = call(
            &state,
            "PUT",
            &format!("/api/v1/agents/{}", id),
            Some(serde_json::json!({"command": "cat"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["command"], "cat");
        assert_eq!(body["name"], "a");
    }

    #[tokio::test]
    async fn test_missing_agent_envelope() {
        let (state, _dir) = make_state().await;
        let (status, body) = call(&state, "GET", "/api/v1/agents/77", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
        assert_eq!(body["error"]["message"], "Agent 77 not found");

        let (status, _) = call(
            &state,
            "PUT",
            "/api/v1/agents/77",
            Some(serde_json::json!({"name": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_artifact() {
        let (state, _dir) = make_state().await;
        call(&state, "POST", "/api/v1/agents", Some(batch(&["a", "b"]))).await;
        let (_, artifacts) = call(&state, "GET", "/api/v1/artifacts", None).await;
        let artifact_id = artifacts[0]["id"].as_i64().unwrap();
        assert_eq!(artifacts[0]["agents"].as_array().unwrap().len(), 2);

        let uri = format!("/api/v1/agents/{}", artifact_id);
        let (status, _) = call(&state, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, list) = call(&state, "GET", "/api/v1/agents", None).await;
        assert!(list.as_array().unwrap().is_empty());

        let (status, body) = call(&state, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_start_stop_reset() {
        let (state, _dir) = make_state().await;
        let (_, created) = call(&state, "POST", "/api/v1/agents", Some(batch(&["a"]))).await;
        let id = created[0]["id"].as_i64().unwrap();

        let (status, body) = call(&state, "POST", &format!("/api/v1/agents/{}/reset", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "NOT_RUNNING");

        let (status, body) = call(&state, "POST", &format!("/api/v1/agents/{}/start", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], true);
        assert_eq!(body["already_running"], false);
        assert_eq!(body["message"], format!("Agent {} started successfully", id));

        // Second start is still a success and says so
        let (status, body) = call(&state, "POST", &format!("/api/v1/agents/{}/start", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["already_running"], true);
        assert_eq!(body["message"], "Agent is already running");

        let (status, _) = call(&state, "POST", &format!("/api/v1/agents/{}/reset", id), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&state, "POST", &format!("/api/v1/agents/{}/stop", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["was_running"], true);
        assert!(!state.orchestrator.registry().is_running(id).await);
    }

    #[tokio::test]
    async fn test_start_unknown_is_404() {
        let (state, _dir) = make_state().await;
        let (status, _) = call(&state, "POST", "/api/v1/agents/5/start", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_agent_type_template() {
        let (state, dir) = make_state().await;
        std::fs::write(
            dir.path().join("agent-types.json"),
            r#"[{"id":3,"name":"github","command":"npx","args":["gh-mcp"],"env_keys":["GITHUB_TOKEN"]}]"#,
        )
        .unwrap();

        let (status, body) = call(&state, "GET", "/api/v1/agent-types/3", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            serde_json::json!({"command": "npx", "args": ["gh-mcp"], "env_keys": ["GITHUB_TOKEN"]})
        );

        let (status, _) = call(&state, "GET", "/api/v1/agent-types/4", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_setup_close_codes() {
        assert_eq!(
            setup_close(&Error::NotFound("Agent 1".into())),
            (1008, "agent not found")
        );
        assert_eq!(
            setup_close(&Error::StartFailure("boom".into())),
            (1008, "agent failed to start")
        );
        assert_eq!(
            setup_close(&Error::Timeout("slow".into())),
            (1008, "agent failed to start")
        );
        assert_eq!(
            setup_close(&Error::Internal("db".into())),
            (1011, "internal error")
        );
    }

    #[test]
    fn test_list_query_defaults() {
        let query: ListQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.skip, 0);
        assert_eq!(query.limit, 100);
    }
}
