//! Session registry
//!
//! Process-wide map from agent id to its running handle. An id is either
//! absent or running; start is all-or-nothing and concurrent starts for the
//! same id are serialized by a per-id lock so at most one engine handle is
//! ever created.

use crate::agent::engine::{AgentEngine, AgentHandle, LaunchSpec};
use crate::agent::types::AgentId;
use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::locks::{KeyedGuard, KeyedLocks};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// What a successful `start` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Registry of running agents
pub struct SessionRegistry {
    catalog: Arc<Catalog>,
    engine: Arc<dyn AgentEngine>,
    sessions: RwLock<HashMap<AgentId, Arc<dyn AgentHandle>>>,
    /// Per-id locks held across start and stop
    transitions: KeyedLocks<AgentId>,
    reply_timeout: Option<Duration>,
}

impl SessionRegistry {
    pub fn new(
        catalog: Arc<Catalog>,
        engine: Arc<dyn AgentEngine>,
        reply_timeout: Option<Duration>,
    ) -> Self {
        Self {
            catalog,
            engine,
            sessions: RwLock::new(HashMap::new()),
            transitions: KeyedLocks::new(),
            reply_timeout,
        }
    }

    /// Start an agent unless it is already running.
    ///
    /// On any error the id stays absent.
    pub async fn start(&self, id: AgentId) -> Result<StartOutcome> {
        if self.is_running(id).await {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let _slot = self.transition(id).await;
        if self.is_running(id).await {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let spec = self.resolve(id).await?;
        let handle = self.engine.start(&spec).await.map_err(|e| match e {
            Error::StartFailure(_) => e,
            other => Error::StartFailure(other.to_string()),
        })?;

        self.sessions.write().await.insert(id, handle);
        tracing::info!(agent_id = id, name = %spec.agent.name, "Agent session started");
        Ok(StartOutcome::Started)
    }

    async fn resolve(&self, id: AgentId) -> Result<LaunchSpec> {
        let agent = self
            .catalog
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("Agent {}", id)))?;
        if !agent.is_active {
            return Err(Error::StartFailure("agent is inactive".to_string()));
        }

        let artifact = self.catalog.artifact_for_agent(id)?.ok_or_else(|| {
            Error::StartFailure(format!("agent {} has no config artifact", id))
        })?;
        let servers = match self.catalog.materializer().load(&artifact.name).await {
            Ok(servers) => servers,
            Err(Error::NotFound(_)) => {
                return Err(Error::StartFailure(format!(
                    "config artifact {} is missing",
                    artifact.name
                )));
            }
            Err(e) => return Err(e),
        };

        let name = agent.name.clone();
        LaunchSpec::from_artifact(agent, &artifact.name, servers).ok_or_else(|| {
            Error::StartFailure(format!(
                "config artifact {} has no entry for '{}'",
                artifact.name, name
            ))
        })
    }

    pub async fn is_running(&self, id: AgentId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    /// Running ids in ascending order
    pub async fn running(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.sessions.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stop an agent. Returns whether it was running.
    ///
    /// The id is absent afterwards even if engine teardown fails.
    pub async fn stop(&self, id: AgentId) -> bool {
        let _slot = self.transition(id).await;
        let handle = self.sessions.write().await.remove(&id);
        match handle {
            Some(handle) => {
                if let Err(e) = handle.stop().await {
                    tracing::warn!(agent_id = id, "Engine teardown failed: {}", e);
                }
                tracing::info!(agent_id = id, "Agent session stopped");
                true
            }
            None => false,
        }
    }

    /// Run one conversational turn.
    ///
    /// Concurrent sends to the same agent are not queued here; whether they
    /// interleave is up to the engine.
    pub async fn send(&self, id: AgentId, text: &str) -> Result<String> {
        let handle = self.handle(id).await?;
        match self.reply_timeout {
            Some(limit) => tokio::time::timeout(limit, handle.send(text))
                .await
                .map_err(|_| {
                    Error::Timeout(format!(
                        "agent {} did not reply within {}s",
                        id,
                        limit.as_secs()
                    ))
                })?,
            None => handle.send(text).await,
        }
    }

    /// Clear the agent's conversation memory
    pub async fn reset(&self, id: AgentId) -> Result<()> {
        self.handle(id).await?.reset().await
    }

    /// Stop every running agent, best effort
    pub async fn shutdown(&self) {
        let drained: Vec<(AgentId, Arc<dyn AgentHandle>)> =
            self.sessions.write().await.drain().collect();
        if drained.is_empty() {
            return;
        }

        tracing::info!("Stopping {} running agents", drained.len());
        let stops = drained.into_iter().map(|(id, handle)| async move {
            if let Err(e) = handle.stop().await {
                tracing::warn!(agent_id = id, "Engine teardown failed during shutdown: {}", e);
            }
        });
        futures::future::join_all(stops).await;
    }

    async fn handle(&self, id: AgentId) -> Result<Arc<dyn AgentHandle>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::NotRunning(id))
    }

    async fn transition(&self, id: AgentId) -> KeyedGuard<'_, AgentId> {
        self.transitions.lock(id).await
    }
}
