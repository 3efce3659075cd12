//! AgentDock configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main AgentDock configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDockConfig {
    /// HTTP / WebSocket server configuration
    pub server: ServerConfig,

    /// Storage locations
    pub storage: StorageConfig,

    /// Catalog behaviour
    pub catalog: CatalogConfig,

    /// External engine configuration
    pub engine: EngineConfig,
}

impl AgentDockConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Allowed CORS origins (empty = any)
    pub cors_origins: Vec<String>,

    /// WebSocket ping interval in seconds
    pub ws_ping_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            cors_origins: Vec::new(),
            ws_ping_interval_secs: 20,
        }
    }
}

/// Storage configuration
///
/// Relative paths are resolved under `data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for all AgentDock state
    pub data_dir: PathBuf,

    /// SQLite database file
    pub database: PathBuf,

    /// Directory holding materialized agent config files
    pub config_dir: PathBuf,

    /// JSON file with agent type templates
    pub agent_types_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: PathBuf::from("agentdock.db"),
            config_dir: PathBuf::from("configs"),
            agent_types_file: PathBuf::from("agent-types.json"),
        }
    }
}

impl StorageConfig {
    /// Storage rooted at `data_dir` with default file names
    pub fn rooted_at(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve(&self.database)
    }

    pub fn config_dir_path(&self) -> PathBuf {
        self.resolve(&self.config_dir)
    }

    pub fn agent_types_path(&self) -> PathBuf {
        self.resolve(&self.agent_types_file)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }
}

/// Default data directory (~/.agentdock)
pub fn default_data_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agentdock")
}

/// How a batch create behaves when one definition is rejected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// All definitions, the artifact file and its record commit together
    #[default]
    Atomic,
    /// Each definition commits on its own; a later conflict leaves earlier
    /// rows persisted and creates no artifact
    Sequential,
}

/// Catalog configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub batch_mode: BatchMode,
}

/// External engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Environment variable holding the engine credential. Forwarded to
    /// launched agents, never read by the orchestrator itself.
    pub credential_env: String,

    /// Upper bound on a connect-time implicit start, in seconds
    pub start_timeout_secs: u64,

    /// Upper bound on a single conversational turn (0 = unbounded)
    pub reply_timeout_secs: u64,

    /// Grace period between closing stdin and killing an agent process
    pub stop_grace_secs: u64,

    /// Longest reply line accepted from an agent process
    pub max_reply_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            credential_env: "GROQ_API_KEY".to_string(),
            start_timeout_secs: 30,
            reply_timeout_secs: 300,
            stop_grace_secs: 5,
            max_reply_bytes: 1024 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        (self.reply_timeout_secs > 0).then(|| Duration::from_secs(self.reply_timeout_secs))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}
