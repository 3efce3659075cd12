//! End-to-end streaming tests against a live server.
//!
//! Agents are `/bin/sh` loops that echo each request line back, so the
//! reply to `{"type":"message","message":"x"}` is `x`.

#![cfg(unix)]

use agentdock::agent::types::{AgentInput, ChatFrame};
use agentdock::agent::ProcessEngine;
use agentdock::api::build_app;
use agentdock::config::{AgentDockConfig, StorageConfig};
use agentdock::Orchestrator;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ECHO: &str = "while IFS= read -r line; do printf '%s\\n' \"$line\"; done";

struct Server {
    addr: SocketAddr,
    orchestrator: Arc<Orchestrator>,
    _dir: TempDir,
}

async fn start_server() -> Server {
    let dir = TempDir::new().unwrap();
    let mut config = AgentDockConfig::default();
    config.storage = StorageConfig::rooted_at(dir.path());
    config.server.ws_ping_interval_secs = 0;
    config.engine.stop_grace_secs = 1;

    let engine = Arc::new(ProcessEngine::new(&config.engine));
    let orchestrator = Arc::new(Orchestrator::open(&config, engine).await.unwrap());
    let app = build_app(orchestrator.clone(), &config.server);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Server {
        addr,
        orchestrator,
        _dir: dir,
    }
}

fn echo_agent(name: &str) -> AgentInput {
    AgentInput::new(name, "shell", "/bin/sh")
        .arg("-c")
        .arg(ECHO)
}

async fn connect(server: &Server, agent_id: i64) -> Client {
    let url = format!("ws://{}/ws/agents/{}", server.addr, agent_id);
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Next message that is not a ping or pong
async fn next_message(ws: &mut Client) -> Message {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

async fn next_frame(ws: &mut Client) -> ChatFrame {
    match next_message(ws).await {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

async fn expect_close(ws: &mut Client) -> (u16, String) {
    match next_message(ws).await {
        Message::Close(Some(frame)) => (u16::from(frame.code), frame.reason.to_string()),
        other => panic!("expected a close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_chat_round_trip_starts_agent_on_connect() {
    let server = start_server().await;
    let created = server
        .orchestrator
        .create_agents(vec![echo_agent("echo")])
        .await
        .unwrap();
    let id = created.agents[0].id;
    assert!(!server.orchestrator.registry().is_running(id).await);

    let mut ws = connect(&server, id).await;

    ws.send(Message::Text("ping".into())).await.unwrap();
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.agent_id, id);
    assert_eq!(frame.message, "ping");
    assert!(frame.error.is_none());
    assert!(server.orchestrator.registry().is_running(id).await);

    ws.send(Message::Text(r#"{"message":"hello there"}"#.into()))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut ws).await.message, "hello there");

    ws.close(None).await.unwrap();
    server.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_replies_go_only_to_sender() {
    let server = start_server().await;
    let created = server
        .orchestrator
        .create_agents(vec![echo_agent("shared")])
        .await
        .unwrap();
    let id = created.agents[0].id;

    let mut first = connect(&server, id).await;
    let mut second = connect(&server, id).await;

    first.send(Message::Text("from-first".into())).await.unwrap();
    second.send(Message::Text("from-second".into())).await.unwrap();

    assert_eq!(next_frame(&mut first).await.message, "from-first");
    assert_eq!(next_frame(&mut second).await.message, "from-second");

    // Nothing else is waiting on either connection
    assert!(
        tokio::time::timeout(Duration::from_millis(200), first.next())
            .await
            .is_err()
    );
    server.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_unknown_agent_is_closed_with_policy_violation() {
    let server = start_server().await;
    let mut ws = connect(&server, 4242).await;
    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!(code, u16::from(CloseCode::Policy));
    assert_eq!(reason, "agent not found");
}

#[tokio::test]
async fn test_unlaunchable_agent_is_closed_with_policy_violation() {
    let server = start_server().await;
    let created = server
        .orchestrator
        .create_agents(vec![AgentInput::new(
            "broken",
            "shell",
            "/nonexistent/agentdock-agent",
        )])
        .await
        .unwrap();
    let id = created.agents[0].id;

    let mut ws = connect(&server, id).await;
    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!(code, 1008);
    assert_eq!(reason, "agent failed to start");
    assert!(!server.orchestrator.registry().is_running(id).await);
}

#[tokio::test]
async fn test_deleting_artifact_closes_connection_normally() {
    let server = start_server().await;
    let created = server
        .orchestrator
        .create_agents(vec![echo_agent("doomed")])
        .await
        .unwrap();
    let id = created.agents[0].id;

    let mut ws = connect(&server, id).await;
    ws.send(Message::Text("still here".into())).await.unwrap();
    assert_eq!(next_frame(&mut ws).await.message, "still here");

    assert!(server
        .orchestrator
        .delete_artifact(created.artifact.id)
        .await
        .unwrap());

    let (code, _) = expect_close(&mut ws).await;
    assert_eq!(code, 1000);
    assert!(!server.orchestrator.registry().is_running(id).await);
    assert!(server.orchestrator.list_agents(0, 100).unwrap().is_empty());
}

#[tokio::test]
async fn test_agent_error_keeps_connection_open() {
    let server = start_server().await;
    let script = "while IFS= read -r line; do echo '{\"error\":\"model unavailable\"}'; done";
    let created = server
        .orchestrator
        .create_agents(vec![AgentInput::new("grumpy", "shell", "/bin/sh")
            .arg("-c")
            .arg(script)])
        .await
        .unwrap();
    let id = created.agents[0].id;

    let mut ws = connect(&server, id).await;
    for _ in 0..2 {
        ws.send(Message::Text("hi".into())).await.unwrap();
        let frame = next_frame(&mut ws).await;
        assert!(frame.message.starts_with("Error processing message:"));
        assert_eq!(frame.error.unwrap().code, "ENGINE_ERROR");
    }
    server.orchestrator.shutdown().await;
}
