//! Subprocess agent engine
//!
//! Spawns the artifact entry's command and speaks line-delimited JSON over
//! its stdio. Every request line gets exactly one reply line:
//!
//! ```text
//! → {"type":"message","message":"ping"}
//! ← {"message":"pong"}            reply
//! ← {"error":"model unavailable"} engine-level failure
//! ← pong                          plain text is taken verbatim
//! → {"type":"reset"}
//! ← {"ok":true}                   anything but {"error":..} acknowledges
//! ```

use crate::agent::engine::{AgentEngine, AgentHandle, LaunchSpec};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

/// How long a fresh process is watched for an immediate exit
const SPAWN_SETTLE: Duration = Duration::from_millis(150);

/// Engine that runs each agent as a child process
pub struct ProcessEngine {
    /// Credential forwarded to every agent when present
    credential: Option<(String, String)>,
    stop_grace: Duration,
    max_reply_bytes: usize,
}

impl ProcessEngine {
    /// Build from engine configuration, capturing the credential variable
    /// from the current environment
    pub fn new(config: &EngineConfig) -> Self {
        let credential = std::env::var(&config.credential_env)
            .ok()
            .map(|value| (config.credential_env.clone(), value));
        if credential.is_none() {
            tracing::warn!(
                var = %config.credential_env,
                "Credential variable not set; agents start without it"
            );
        }
        Self {
            credential,
            stop_grace: config.stop_grace(),
            max_reply_bytes: config.max_reply_bytes,
        }
    }
}

#[async_trait]
impl AgentEngine for ProcessEngine {
    async fn start(&self, spec: &LaunchSpec) -> Result<Arc<dyn AgentHandle>> {
        let entry = &spec.entry;
        tracing::info!(
            agent_id = spec.agent.id,
            name = %spec.agent.name,
            command = %entry.command,
            artifact = %spec.artifact,
            "Spawning agent process"
        );

        let mut command = Command::new(&entry.command);
        command
            .args(&entry.args)
            .envs(&entry.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some((key, value)) = &self.credential {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::StartFailure(format!("failed to spawn '{}': {}", entry.command, e))
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (stdin, stdout) = match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill().await;
                return Err(Error::StartFailure("agent stdio unavailable".to_string()));
            }
        };

        if let Some(stderr) = child.stderr.take() {
            let agent_id = spec.agent.id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(agent_id = agent_id, "agent stderr: {}", line);
                }
            });
        }

        // stdin is already taken, so waiting does not close it
        if let Ok(status) = tokio::time::timeout(SPAWN_SETTLE, child.wait()).await {
            return Err(Error::StartFailure(format!(
                "agent process exited immediately ({})",
                status?
            )));
        }

        tracing::info!(agent_id = spec.agent.id, pid = ?child.id(), "Agent process running");

        Ok(Arc::new(ProcessHandle {
            agent_id: spec.agent.id,
            turn: Mutex::new(()),
            stale: AtomicUsize::new(0),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(Some(child)),
            stop_grace: self.stop_grace,
            max_reply_bytes: self.max_reply_bytes,
        }))
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Request<'a> {
    Message { message: &'a str },
    Reset,
}

enum Reply {
    Text(String),
    Failed(String),
}

impl Reply {
    fn parse(line: &str) -> Self {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(line) {
            if let Some(err) = map.get("error") {
                return match err {
                    serde_json::Value::String(s) => Reply::Failed(s.clone()),
                    other => Reply::Failed(other.to_string()),
                };
            }
            if let Some(serde_json::Value::String(message)) = map.get("message") {
                return Reply::Text(message.clone());
            }
        }
        Reply::Text(line.to_string())
    }
}

struct ProcessHandle {
    agent_id: i64,
    /// One request/reply pair at a time
    turn: Mutex<()>,
    /// Replies still owed for requests whose caller gave up waiting
    stale: AtomicUsize,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Option<Child>>,
    stop_grace: Duration,
    max_reply_bytes: usize,
}

/// Counts a written request as stale if its reply is never read
struct PendingReply<'a> {
    stale: &'a AtomicUsize,
    armed: bool,
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.stale.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl ProcessHandle {
    async fn round_trip(&self, request: &Request<'_>) -> Result<Reply> {
        let _turn = self.turn.lock().await;

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        {
            let mut stdin = self.stdin.lock().await;
            let pipe = stdin
                .as_mut()
                .ok_or_else(|| Error::Engine("agent process stopped".to_string()))?;
            pipe.write_all(line.as_bytes())
                .await
                .map_err(|e| Error::Engine(format!("failed to write to agent: {}", e)))?;
            pipe.flush()
                .await
                .map_err(|e| Error::Engine(format!("failed to write to agent: {}", e)))?;
        }
        let mut pending = PendingReply {
            stale: &self.stale,
            armed: true,
        };

        let mut stdout = self.stdout.lock().await;
        while self.stale.load(Ordering::SeqCst) > 0 {
            let skipped = read_line_limited(&mut stdout, self.max_reply_bytes).await;
            self.stale.fetch_sub(1, Ordering::SeqCst);
            match skipped {
                Ok(LineRead::Eof) | Err(_) => break,
                Ok(_) => tracing::debug!(agent_id = self.agent_id, "Discarded late reply"),
            }
        }

        let read = read_line_limited(&mut stdout, self.max_reply_bytes).await;
        pending.armed = false;
        match read.map_err(|e| Error::Engine(format!("failed to read from agent: {}", e)))? {
            LineRead::Line(reply) => Ok(Reply::parse(reply.trim_end_matches('\r'))),
            LineRead::TooLong => Err(Error::Engine(format!(
                "reply exceeds {} bytes",
                self.max_reply_bytes
            ))),
            LineRead::Eof => Err(Error::Engine("agent process closed its output".to_string())),
        }
    }
}

enum LineRead {
    Line(String),
    TooLong,
    Eof,
}

/// Read one newline-terminated line, discarding the rest of it once it
/// grows past `limit` bytes
async fn read_line_limited(
    reader: &mut BufReader<ChildStdout>,
    limit: usize,
) -> std::io::Result<LineRead> {
    let mut line = Vec::new();
    let mut overflow = false;
    let mut seen_any = false;

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            if !seen_any {
                return Ok(LineRead::Eof);
            }
            break;
        }
        seen_any = true;

        match buf.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                if !overflow {
                    line.extend_from_slice(&buf[..pos]);
                }
                reader.consume(pos + 1);
                break;
            }
            None => {
                let n = buf.len();
                if !overflow {
                    line.extend_from_slice(buf);
                }
                reader.consume(n);
            }
        }

        if line.len() > limit {
            overflow = true;
            line.clear();
        }
    }

    if overflow || line.len() > limit {
        return Ok(LineRead::TooLong);
    }
    Ok(LineRead::Line(String::from_utf8_lossy(&line).into_owned()))
}

#[async_trait]
impl AgentHandle for ProcessHandle {
    async fn send(&self, text: &str) -> Result<String> {
        match self.round_trip(&Request::Message { message: text }).await? {
            Reply::Text(reply) => Ok(reply),
            Reply::Failed(reason) => Err(Error::Engine(reason)),
        }
    }

    async fn reset(&self) -> Result<()> {
        match self.round_trip(&Request::Reset).await? {
            Reply::Text(_) => Ok(()),
            Reply::Failed(reason) => Err(Error::Engine(reason)),
        }
    }

    async fn stop(&self) -> Result<()> {
        // Closing stdin is the polite shutdown request
        drop(self.stdin.lock().await.take());

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(agent_id = self.agent_id, status = %status, "Agent process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(agent_id = self.agent_id, "Failed to wait for agent process: {}", e);
            }
            Err(_) => {
                tracing::warn!(agent_id = self.agent_id, "Force killing agent process");
                child.kill().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_parse() {
        assert!(matches!(Reply::parse(r#"{"message":"pong"}"#), Reply::Text(ref t) if t == "pong"));
        assert!(matches!(Reply::parse(r#"{"error":"boom"}"#), Reply::Failed(ref t) if t == "boom"));
        assert!(matches!(Reply::parse(r#"{"error":{"code":1}}"#), Reply::Failed(ref t) if t.contains("code")));
        assert!(matches!(Reply::parse("plain words"), Reply::Text(ref t) if t == "plain words"));
        assert!(matches!(Reply::parse(r#"{"other":1}"#), Reply::Text(ref t) if t == r#"{"other":1}"#));
    }

    #[test]
    fn test_request_wire_format() {
        let msg = serde_json::to_string(&Request::Message { message: "hi" }).unwrap();
        assert_eq!(msg, r#"{"type":"message","message":"hi"}"#);
        let reset = serde_json::to_string(&Request::Reset).unwrap();
        assert_eq!(reset, r#"{"type":"reset"}"#);
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use crate::agent::types::AgentDefinition;
        use crate::materializer::McpServerEntry;
        use chrono::Utc;
        use indexmap::IndexMap;

        fn engine() -> ProcessEngine {
            ProcessEngine {
                credential: Some(("AGENTDOCK_TEST_KEY".to_string(), "secret".to_string())),
                stop_grace: Duration::from_secs(2),
                max_reply_bytes: 64,
            }
        }

        fn spec(command: &str, script: &str) -> LaunchSpec {
            let now = Utc::now();
            let agent = AgentDefinition {
                id: 7,
                name: "sh".to_string(),
                agent_type: "shell".to_string(),
                command: command.to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                env: IndexMap::from([("GREETING".to_string(), "hello".to_string())]),
                is_active: true,
                created_at: now,
                updated_at: now,
            };
            LaunchSpec {
                entry: McpServerEntry::from(&agent),
                artifact: "test.json".to_string(),
                agent,
            }
        }

        /// Echoes each request line back; requests carry a `message` field
        const ECHO: &str = "while IFS= read -r line; do printf '%s\\n' \"$line\"; done";

        #[tokio::test]
        async fn test_echo_round_trip_and_reset() {
            let handle = engine().start(&spec("/bin/sh", ECHO)).await.unwrap();
            assert_eq!(handle.send("ping").await.unwrap(), "ping");
            handle.reset().await.unwrap();
            assert_eq!(handle.send("again").await.unwrap(), "again");
            handle.stop().await.unwrap();
            assert!(handle.send("late").await.is_err());
        }

        #[tokio::test]
        async fn test_env_and_credential_forwarded() {
            let script = "read -r line; echo \"$GREETING $AGENTDOCK_TEST_KEY\"";
            let handle = engine().start(&spec("/bin/sh", script)).await.unwrap();
            assert_eq!(handle.send("x").await.unwrap(), "hello secret");
            handle.stop().await.unwrap();
        }

        #[tokio::test]
        async fn test_error_reply_is_engine_error() {
            let script = "read -r line; echo '{\"error\":\"nope\"}'";
            let handle = engine().start(&spec("/bin/sh", script)).await.unwrap();
            assert!(matches!(handle.send("x").await, Err(Error::Engine(ref m)) if m == "nope"));
            handle.stop().await.unwrap();
        }

        #[tokio::test]
        async fn test_exit_without_reply() {
            let handle = engine().start(&spec("/bin/sh", "read -r line")).await.unwrap();
            assert!(matches!(handle.send("x").await, Err(Error::Engine(_))));
            handle.stop().await.unwrap();
        }

        #[tokio::test]
        async fn test_oversized_reply_rejected() {
            let script = "read -r line; head -c 200 /dev/zero | tr '\\0' 'a'; echo";
            let handle = engine().start(&spec("/bin/sh", script)).await.unwrap();
            assert!(matches!(handle.send("x").await, Err(Error::Engine(ref m)) if m.contains("exceeds")));
            handle.stop().await.unwrap();
        }

        #[tokio::test]
        async fn test_missing_binary_is_start_failure() {
            let result = engine()
                .start(&spec("/nonexistent/agentdock-agent", ECHO))
                .await;
            assert!(matches!(result, Err(Error::StartFailure(_))));
        }

        #[tokio::test]
        async fn test_immediate_exit_is_start_failure() {
            let result = engine().start(&spec("/bin/sh", "exit 3")).await;
            match result {
                Err(Error::StartFailure(reason)) => assert!(reason.contains("exited immediately")),
                Err(other) => panic!("unexpected error: {}", other),
                Ok(_) => panic!("start succeeded for an exited process"),
            }
        }

        #[tokio::test]
        async fn test_stop_kills_process_ignoring_stdin() {
            let script = "trap '' HUP; sleep 30";
            let mut e = engine();
            e.stop_grace = Duration::from_millis(100);
            let handle = e.start(&spec("/bin/sh", script)).await.unwrap();
            tokio::time::timeout(Duration::from_secs(5), handle.stop())
                .await
                .unwrap()
                .unwrap();
            // Second stop is a no-op
            handle.stop().await.unwrap();
        }
    }
}
