//! Wire and domain types for agent definitions, artifacts and chat frames
//!
//! REST bodies use snake_case fields; streaming frames use camelCase.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Catalog identifier of an agent definition
pub type AgentId = i64;

/// Catalog identifier of a config artifact
pub type ArtifactId = i64;

// =============================================================================
// Agent definitions
// =============================================================================

/// A persisted, launchable agent definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: AgentId,
    pub name: String,
    pub agent_type: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: IndexMap<String, String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One entry of a batch-create request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInput {
    pub name: String,
    pub agent_type: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl AgentInput {
    /// Minimal input, mostly for tests and tooling
    pub fn new(
        name: impl Into<String>,
        agent_type: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            command: command.into(),
            args: Vec::new(),
            env: IndexMap::new(),
            is_active: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("agent name must not be empty".into()));
        }
        if self.command.trim().is_empty() {
            return Err(Error::Validation(format!(
                "agent '{}' has an empty command",
                self.name
            )));
        }
        Ok(())
    }
}

/// Partial update; absent fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub agent_type: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<IndexMap<String, String>>,
    pub is_active: Option<bool>,
}

impl AgentUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.agent_type.is_none()
            && self.command.is_none()
            && self.args.is_none()
            && self.env.is_none()
            && self.is_active.is_none()
    }

    /// Apply the provided fields onto `agent`
    pub fn apply_to(self, agent: &mut AgentDefinition) -> Result<()> {
        if let Some(name) = self.name {
            if name.trim().is_empty() {
                return Err(Error::Validation("agent name must not be empty".into()));
            }
            agent.name = name;
        }
        if let Some(agent_type) = self.agent_type {
            agent.agent_type = agent_type;
        }
        if let Some(command) = self.command {
            if command.trim().is_empty() {
                return Err(Error::Validation("command must not be empty".into()));
            }
            agent.command = command;
        }
        if let Some(args) = self.args {
            agent.args = args;
        }
        if let Some(env) = self.env {
            agent.env = env;
        }
        if let Some(is_active) = self.is_active {
            agent.is_active = is_active;
        }
        Ok(())
    }
}

/// Agent definition decorated with its owning artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentListing {
    #[serde(flatten)]
    pub agent: AgentDefinition,
    pub file_name: Option<String>,
    pub file_id: Option<ArtifactId>,
}

// =============================================================================
// Artifacts
// =============================================================================

/// Record of one materialized batch config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigArtifact {
    pub id: ArtifactId,
    pub name: String,
    /// Member agent ids in creation order
    pub agents: Vec<AgentId>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Agent type templates
// =============================================================================

/// Template describing how to launch a known kind of agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentType {
    pub id: i64,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env_keys: Vec<String>,
}

/// Launch template returned by the agent types endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTypeTemplate {
    pub command: String,
    pub args: Vec<String>,
    pub env_keys: Vec<String>,
}

impl From<AgentType> for AgentTypeTemplate {
    fn from(t: AgentType) -> Self {
        Self {
            command: t.command,
            args: t.args,
            env_keys: t.env_keys,
        }
    }
}

// =============================================================================
// Streaming frames
// =============================================================================

/// Frame sent to a streaming client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatFrame {
    pub agent_id: AgentId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FrameError>,
}

/// Agent-level failure carried inside a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameError {
    pub code: String,
    pub message: String,
}

impl ChatFrame {
    pub fn reply(agent_id: AgentId, message: impl Into<String>) -> Self {
        Self {
            agent_id,
            message: message.into(),
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn failure(agent_id: AgentId, err: &Error) -> Self {
        Self {
            agent_id,
            message: format!("Error processing message: {}", err),
            timestamp: Utc::now(),
            error: Some(FrameError {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Extract the chat text from an inbound frame.
///
/// A JSON object carrying a string `message` field is unwrapped; anything
/// else is taken verbatim.
pub fn inbound_text(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => match map.get("message") {
            Some(serde_json::Value::String(text)) => text.clone(),
            _ => raw.to_string(),
        },
        _ => raw.to_string(),
    }
}

// =============================================================================
// REST envelopes
// =============================================================================

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

/// API error detail
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

impl From<&Error> for ApiError {
    fn from(err: &Error) -> Self {
        Self {
            error: ApiErrorDetail {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_agent() -> AgentDefinition {
        let now = Utc::now();
        AgentDefinition {
            id: 1,
            name: "slack-agent-1".to_string(),
            agent_type: "slack".to_string(),
            command: "python".to_string(),
            args: vec!["app.py".to_string()],
            env: IndexMap::from([("API_KEY".to_string(), "k".to_string())]),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_agent_input_defaults() {
        let json = r#"{"name":"a","agent_type":"echo","command":"echo"}"#;
        let input: AgentInput = serde_json::from_str(json).unwrap();
        assert!(input.args.is_empty());
        assert!(input.env.is_empty());
        assert!(input.is_active);
        input.validate().unwrap();
    }

    #[test]
    fn test_agent_input_rejects_blank_fields() {
        let input = AgentInput::new("  ", "echo", "echo");
        assert!(matches!(input.validate(), Err(Error::Validation(_))));
        let input = AgentInput::new("a", "echo", "");
        assert!(matches!(input.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_update_applies_only_given_fields() {
        let mut agent = sample_agent();
        let update = AgentUpdate {
            command: Some("uv".to_string()),
            is_active: Some(false),
            ..Default::default()
        };
        update.apply_to(&mut agent).unwrap();
        assert_eq!(agent.command, "uv");
        assert!(!agent.is_active);
        assert_eq!(agent.name, "slack-agent-1");
        assert_eq!(agent.args, vec!["app.py".to_string()]);
    }

    #[test]
    fn test_update_is_empty() {
        assert!(AgentUpdate::default().is_empty());
        let update: AgentUpdate = serde_json::from_str(r#"{"name":"b"}"#).unwrap();
        assert!(!update.is_empty());
    }

    #[test]
    fn test_listing_flattens_agent() {
        let listing = AgentListing {
            agent: sample_agent(),
            file_name: Some("mcp_agents_20240220_100000.json".to_string()),
            file_id: Some(4),
        };
        let value = serde_json::to_value(&listing).unwrap();
        assert_eq!(value["name"], "slack-agent-1");
        assert_eq!(value["file_id"], 4);
        assert_eq!(value["file_name"], "mcp_agents_20240220_100000.json");
    }

    #[test]
    fn test_chat_frame_uses_camel_case() {
        let frame = ChatFrame::reply(3, "pong");
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"agentId\":3"));
        assert!(json.contains("\"message\":\"pong\""));
        assert!(json.contains("\"timestamp\""));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_failure_frame_carries_code() {
        let frame = ChatFrame::failure(3, &Error::NotRunning(3));
        assert!(frame.is_error());
        assert!(frame.message.starts_with("Error processing message:"));
        assert_eq!(frame.error.unwrap().code, "NOT_RUNNING");
    }

    #[test]
    fn test_inbound_text_unwraps_message_field() {
        assert_eq!(inbound_text(r#"{"message":"hello"}"#), "hello");
        assert_eq!(inbound_text("plain text"), "plain text");
        assert_eq!(inbound_text(r#"{"other":1}"#), r#"{"other":1}"#);
        assert_eq!(inbound_text("[1,2]"), "[1,2]");
    }

    #[test]
    fn test_api_error_from_error() {
        let err = Error::DuplicateName("a".into());
        let api = ApiError::from(&err);
        assert_eq!(api.error.code, "DUPLICATE_NAME");
        assert!(api.error.message.contains("'a'"));
    }
}
