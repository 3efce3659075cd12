//! Agent engine seam
//!
//! The orchestrator never looks inside a running agent. It asks an
//! [`AgentEngine`] to start one from a [`LaunchSpec`] and then talks to the
//! returned [`AgentHandle`].

use crate::agent::types::AgentDefinition;
use crate::error::Result;
use crate::materializer::{McpServerEntry, McpServersFile};
use async_trait::async_trait;
use std::sync::Arc;

/// Everything an engine needs to launch one agent
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Catalog record being launched
    pub agent: AgentDefinition,
    /// Name of the artifact the entry was resolved from
    pub artifact: String,
    /// This agent's entry inside the artifact
    pub entry: McpServerEntry,
}

impl LaunchSpec {
    /// Resolve the agent's entry from a loaded artifact
    pub fn from_artifact(
        agent: AgentDefinition,
        artifact: impl Into<String>,
        mut servers: McpServersFile,
    ) -> Option<Self> {
        let entry = servers.servers.shift_remove(&agent.name)?;
        Some(Self {
            agent,
            artifact: artifact.into(),
            entry,
        })
    }
}

/// Starts agents
#[async_trait]
pub trait AgentEngine: Send + Sync {
    /// Launch an agent. An error means nothing was left running.
    async fn start(&self, spec: &LaunchSpec) -> Result<Arc<dyn AgentHandle>>;
}

/// Live reference to one running agent
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// Run one conversational turn and return the reply
    async fn send(&self, text: &str) -> Result<String>;

    /// Clear the agent's conversation memory
    async fn reset(&self) -> Result<()>;

    /// Tear the agent down. Called once, when the session is removed.
    async fn stop(&self) -> Result<()>;
}
