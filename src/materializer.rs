//! Config materializer
//!
//! Turns agent definitions into `mcpServers` JSON files consumed by the
//! agent engine. A batch create produces one timestamped file bundling every
//! member; updates additionally keep a per-agent file in sync.
//!
//! All writes go through a uniquely named temporary file in the same
//! directory followed by a rename, so readers never observe a half-written
//! artifact. Entries keep the order in which agents were given.
//!
//! Read-modify-write sequences on one artifact (update, delete) hold the
//! artifact's lock from [`ConfigMaterializer::lock`] for their whole
//! duration.

use crate::agent::types::{AgentDefinition, AgentId, AgentInput};
use crate::error::{Error, Result};
use crate::locks::{KeyedGuard, KeyedLocks};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Launch entry for one agent inside an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerEntry {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
}

impl From<&AgentDefinition> for McpServerEntry {
    fn from(agent: &AgentDefinition) -> Self {
        Self {
            command: agent.command.clone(),
            args: agent.args.clone(),
            env: agent.env.clone(),
        }
    }
}

impl From<&AgentInput> for McpServerEntry {
    fn from(input: &AgentInput) -> Self {
        Self {
            command: input.command.clone(),
            args: input.args.clone(),
            env: input.env.clone(),
        }
    }
}

/// Parsed content of an artifact file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServersFile {
    #[serde(rename = "mcpServers")]
    pub servers: IndexMap<String, McpServerEntry>,
}

impl McpServersFile {
    pub fn from_agents<'a>(agents: impl IntoIterator<Item = &'a AgentDefinition>) -> Self {
        Self {
            servers: agents
                .into_iter()
                .map(|a| (a.name.clone(), McpServerEntry::from(a)))
                .collect(),
        }
    }

    pub fn from_inputs<'a>(inputs: impl IntoIterator<Item = &'a AgentInput>) -> Self {
        Self {
            servers: inputs
                .into_iter()
                .map(|i| (i.name.clone(), McpServerEntry::from(i)))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Writes, reads and deletes artifact files under one directory
pub struct ConfigMaterializer {
    dir: PathBuf,
    /// Serializes batch name allocation so two batches in the same second
    /// cannot claim the same file
    batch_lock: Mutex<()>,
    artifact_locks: KeyedLocks<String>,
}

impl ConfigMaterializer {
    /// Open a materializer rooted at `dir`, creating the directory if needed
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            batch_lock: Mutex::new(()),
            artifact_locks: KeyedLocks::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute path of an artifact by name
    pub fn path_of(&self, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        Ok(self.dir.join(name))
    }

    /// Exclusive access to one artifact, held across read-modify-write
    /// sequences that span the catalog and the file
    pub async fn lock(&self, name: &str) -> KeyedGuard<'_, String> {
        self.artifact_locks.lock(name.to_string()).await
    }

    /// Name of the standalone artifact kept for one agent
    pub fn single_name(id: AgentId) -> String {
        format!("agent_{}_mcp.json", id)
    }

    /// Write a new batch artifact covering `agents`, returning its name
    pub async fn write_batch(&self, agents: &[AgentDefinition]) -> Result<String> {
        self.write_batch_servers(&McpServersFile::from_agents(agents))
            .await
    }

    /// Write a new batch artifact from prepared server entries
    pub async fn write_batch_servers(&self, servers: &McpServersFile) -> Result<String> {
        if servers.is_empty() {
            return Err(Error::Validation(
                "cannot materialize an empty batch".to_string(),
            ));
        }

        let _guard = self.batch_lock.lock().await;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut name = format!("mcp_agents_{}.json", stamp);
        let mut suffix = 1;
        while tokio::fs::try_exists(self.dir.join(&name)).await? {
            name = format!("mcp_agents_{}_{}.json", stamp, suffix);
            suffix += 1;
        }

        self.write_atomic(&name, servers).await?;
        tracing::debug!(artifact = %name, members = servers.servers.len(), "Wrote batch artifact");
        Ok(name)
    }

    /// Regenerate an existing batch artifact from current definitions
    pub async fn rewrite(&self, name: &str, agents: &[AgentDefinition]) -> Result<()> {
        check_name(name)?;
        self.write_atomic(name, &McpServersFile::from_agents(agents))
            .await
    }

    /// Write or overwrite the standalone artifact for one agent
    pub async fn write_single(&self, agent: &AgentDefinition) -> Result<String> {
        let name = Self::single_name(agent.id);
        self.write_atomic(&name, &McpServersFile::from_agents([agent]))
            .await?;
        Ok(name)
    }

    /// Read and parse an artifact
    pub async fn load(&self, name: &str) -> Result<McpServersFile> {
        let path = self.path_of(name)?;
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("Config file {}", name)));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&data)?)
    }

    /// Remove an artifact. Returns `false` when it was already absent.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path_of(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(artifact = %name, "Deleted artifact");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomic(&self, name: &str, content: &McpServersFile) -> Result<()> {
        let json = serde_json::to_string_pretty(content)?;
        let target = self.dir.join(name);
        let tmp = self.dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));

        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Artifact names are plain file names inside the config directory
fn check_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name == "."
        || name == ".."
    {
        return Err(Error::Validation(format!(
            "invalid artifact name '{}'",
            name
        )));
    }
    Ok(())
}
