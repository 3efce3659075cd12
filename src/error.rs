//! AgentDock error types

use axum::http::StatusCode;
use thiserror::Error;

/// AgentDock error type
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown agent, artifact or agent type
    #[error("{0} not found")]
    NotFound(String),

    /// An agent with this name already exists
    #[error("Agent with name '{0}' already exists")]
    DuplicateName(String),

    /// The engine failed to launch the agent
    #[error("Failed to start agent: {0}")]
    StartFailure(String),

    /// The agent has no running session
    #[error("Agent {0} is not running")]
    NotRunning(i64),

    /// The engine did not answer in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Request rejected before touching any state
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine error while talking to a running agent
    #[error("Engine error: {0}")]
    Engine(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status used when this error crosses the REST boundary
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::DuplicateName(_) | Self::StartFailure(_) | Self::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NotRunning(_) => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Engine(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Database(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for error envelopes and frames
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::DuplicateName(_) => "DUPLICATE_NAME",
            Self::StartFailure(_) => "START_FAILED",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::Timeout(_) => "TIMEOUT",
            Self::Validation(_) => "BAD_REQUEST",
            Self::Engine(_) => "ENGINE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Config(_) | Self::Serialization(_) | Self::Database(_) | Self::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }
}

/// Result type alias for AgentDock operations
pub type Result<T> = std::result::Result<T, Error>;
