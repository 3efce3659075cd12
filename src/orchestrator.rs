//! Session orchestrator
//!
//! Facade over the catalog, materializer, registry and multiplexer. Holds no
//! state of its own beyond the shared components.

use crate::agent::engine::AgentEngine;
use crate::agent::types::{
    AgentDefinition, AgentId, AgentInput, AgentListing, AgentType, AgentTypeTemplate,
    AgentUpdate, ArtifactId, ChatFrame, ConfigArtifact,
};
use crate::catalog::{Catalog, CreatedBatch};
use crate::config::AgentDockConfig;
use crate::error::{Error, Result};
use crate::materializer::ConfigMaterializer;
use crate::session::{
    ConnectionId, ConnectionMultiplexer, Outbound, SessionRegistry, StartOutcome,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Largest page `list_agents` will return
pub const MAX_PAGE: usize = 1000;

/// WebSocket close code for a normal close
pub const CLOSE_NORMAL: u16 = axum::extract::ws::close_code::NORMAL;

/// Reason sent to connections whose agent was deleted
pub const DELETED_REASON: &str = "agent deleted";

/// A streaming client bound to one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConnection {
    pub agent_id: AgentId,
    pub id: ConnectionId,
}

/// Frames and close instructions for one connection's writer
pub type OutboundRx = mpsc::UnboundedReceiver<Outbound>;

pub struct Orchestrator {
    catalog: Arc<Catalog>,
    registry: Arc<SessionRegistry>,
    multiplexer: Arc<ConnectionMultiplexer>,
    agent_types_path: PathBuf,
    start_timeout: Duration,
}

impl Orchestrator {
    /// Open storage described by `config` and wire the components together
    pub async fn open(config: &AgentDockConfig, engine: Arc<dyn AgentEngine>) -> Result<Self> {
        let storage = &config.storage;
        let materializer = Arc::new(ConfigMaterializer::open(storage.config_dir_path()).await?);
        let catalog = Arc::new(Catalog::open(
            storage.database_path(),
            materializer,
            config.catalog.batch_mode,
        )?);

        tracing::info!(
            database = %storage.database_path().display(),
            configs = %storage.config_dir_path().display(),
            batch_mode = ?catalog.batch_mode(),
            "Catalog opened"
        );

        let registry = Arc::new(SessionRegistry::new(
            catalog.clone(),
            engine,
            config.engine.reply_timeout(),
        ));
        Ok(Self::new(
            catalog,
            registry,
            storage.agent_types_path(),
            config.engine.start_timeout(),
        ))
    }

    pub fn new(
        catalog: Arc<Catalog>,
        registry: Arc<SessionRegistry>,
        agent_types_path: PathBuf,
        start_timeout: Duration,
    ) -> Self {
        let multiplexer = Arc::new(ConnectionMultiplexer::new(registry.clone()));
        Self {
            catalog,
            registry,
            multiplexer,
            agent_types_path,
            start_timeout,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn multiplexer(&self) -> &Arc<ConnectionMultiplexer> {
        &self.multiplexer
    }

    // =========================================================================
    // Definitions
    // =========================================================================

    pub async fn create_agents(&self, inputs: Vec<AgentInput>) -> Result<CreatedBatch> {
        self.catalog.create_batch(inputs).await
    }

    pub fn list_agents(&self, skip: usize, limit: usize) -> Result<Vec<AgentListing>> {
        self.catalog.list(skip, limit.min(MAX_PAGE))
    }

    pub fn get_agent(&self, id: AgentId) -> Result<AgentListing> {
        self.catalog
            .get_listing(id)?
            .ok_or_else(|| Error::NotFound(format!("Agent {}", id)))
    }

    /// Apply a partial update. A running session keeps the fields it was
    /// launched with until it is restarted.
    pub async fn update_agent(&self, id: AgentId, update: AgentUpdate) -> Result<AgentDefinition> {
        self.catalog
            .update(id, update)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Agent {}", id)))
    }

    pub fn list_artifacts(&self) -> Result<Vec<ConfigArtifact>> {
        self.catalog.list_artifacts()
    }

    /// Delete an artifact and everything that belongs to it.
    ///
    /// Returns `false` for an unknown artifact. Runs under the artifact's
    /// lock, so an update of a member either lands before the cascade (and
    /// its files are removed with the rest) or finds its row gone. Steps run
    /// in an order where each one is idempotent, so retrying after a
    /// failure converges: files first (no new start can resolve a launch
    /// entry after that), then sessions and connections, then the catalog
    /// rows in one transaction.
    pub async fn delete_artifact(&self, artifact_id: ArtifactId) -> Result<bool> {
        let Some(artifact) = self.catalog.get_artifact(artifact_id)? else {
            return Ok(false);
        };
        let materializer = self.catalog.materializer();
        let _guard = materializer.lock(&artifact.name).await;

        // Another delete may have finished while we waited
        if self.catalog.get_artifact(artifact_id)?.is_none() {
            return Ok(false);
        }
        let members = self.catalog.members(artifact_id)?;

        for agent in &members {
            materializer
                .delete(&ConfigMaterializer::single_name(agent.id))
                .await?;
        }
        materializer.delete(&artifact.name).await?;

        for agent in &members {
            self.release(agent.id).await;
        }

        if self.catalog.remove_artifact(artifact_id)?.is_none() {
            return Ok(false);
        }

        // A start that resolved its launch entry before the files went away
        // may have finished since
        for agent in &members {
            self.release(agent.id).await;
        }

        tracing::info!(
            artifact_id = artifact_id,
            artifact = %artifact.name,
            agents = members.len(),
            "Deleted artifact"
        );
        Ok(true)
    }

    async fn release(&self, id: AgentId) {
        self.multiplexer
            .close_all(id, CLOSE_NORMAL, DELETED_REASON)
            .await;
        self.registry.stop(id).await;
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    pub async fn start_agent(&self, id: AgentId) -> Result<StartOutcome> {
        self.registry.start(id).await
    }

    /// Stop a running agent. Returns whether it was running.
    pub async fn stop_agent(&self, id: AgentId) -> Result<bool> {
        if self.catalog.get(id)?.is_none() && !self.registry.is_running(id).await {
            return Err(Error::NotFound(format!("Agent {}", id)));
        }
        Ok(self.registry.stop(id).await)
    }

    pub async fn reset_agent(&self, id: AgentId) -> Result<()> {
        self.registry.reset(id).await
    }

    /// Connect-time precondition: start the agent if needed, bounded by
    /// the start timeout
    pub async fn ensure_running(&self, id: AgentId) -> Result<()> {
        match tokio::time::timeout(self.start_timeout, self.registry.start(id)).await {
            Ok(outcome) => outcome.map(|_| ()),
            Err(_) => Err(Error::Timeout(format!(
                "agent {} did not start within {}s",
                id,
                self.start_timeout.as_secs()
            ))),
        }
    }

    /// Admit a streaming client: attach, then ensure the agent runs.
    ///
    /// A delete racing the start finds the connection attached and closes
    /// it. On a start error the connection is detached before returning.
    pub async fn connect(&self, id: AgentId) -> Result<(ClientConnection, OutboundRx)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = ClientConnection {
            agent_id: id,
            id: self.multiplexer.attach(id, tx).await,
        };

        if let Err(e) = self.ensure_running(id).await {
            self.multiplexer.detach(id, connection.id).await;
            return Err(e);
        }

        tracing::info!(agent_id = id, connection_id = %connection.id, "Client connected");
        Ok((connection, rx))
    }

    /// Relay one client message; the outcome is delivered to the client
    pub async fn relay(&self, connection: &ClientConnection, text: &str) -> ChatFrame {
        self.multiplexer
            .relay_inbound(connection.agent_id, connection.id, text)
            .await
    }

    pub async fn disconnect(&self, connection: &ClientConnection) {
        self.multiplexer
            .detach(connection.agent_id, connection.id)
            .await;
        tracing::info!(
            agent_id = connection.agent_id,
            connection_id = %connection.id,
            "Client disconnected"
        );
    }

    /// Stop every running agent
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }

    // =========================================================================
    // Agent types
    // =========================================================================

    pub async fn agent_types(&self) -> Result<Vec<AgentType>> {
        let data = match tokio::fs::read_to_string(&self.agent_types_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Config(format!(
                    "agent types file {} not found",
                    self.agent_types_path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&data)?)
    }

    pub async fn agent_type(&self, type_id: i64) -> Result<AgentTypeTemplate> {
        self.agent_types()
            .await?
            .into_iter()
            .find(|t| t.id == type_id)
            .map(AgentTypeTemplate::from)
            .ok_or_else(|| Error::NotFound(format!("Agent type {}", type_id)))
    }
}
