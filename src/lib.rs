//! AgentDock - launch MCP agent definitions on demand and chat with them
//!
//! AgentDock keeps a catalog of agent definitions (command, arguments,
//! environment), materializes them into `mcpServers` config files, starts
//! them through an external engine when asked and relays chat messages
//! between streaming clients and the running agents.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     HTTP / WebSocket (axum)                   │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │
//! ┌──────────────────────────────▼───────────────────────────────┐
//! │                      Session Orchestrator                     │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────────────┐  │
//! │  │   Catalog    │ │   Registry   │ │     Multiplexer      │  │
//! │  │  (SQLite)    │ │ id → handle  │ │ id → {connections}   │  │
//! │  └──────┬───────┘ └──────┬───────┘ └──────────────────────┘  │
//! │  ┌──────▼───────┐        │                                    │
//! │  │ Materializer │        │                                    │
//! │  │ (JSON files) │        │                                    │
//! │  └──────────────┘        │                                    │
//! └──────────────────────────┼───────────────────────────────────┘
//!                            │ start / send / reset / stop
//!                    ┌───────▼────────┐
//!                    │  Agent engine  │
//!                    └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`catalog`]: persisted definitions and artifact membership
//! - [`materializer`]: artifact files on disk
//! - [`session`]: running-agent registry and connection multiplexer
//! - [`orchestrator`]: facade composing the above
//! - [`agent`]: domain types, engine seam and HTTP handlers
//! - [`api`]: the assembled router
//! - [`config`]: configuration management

pub mod agent;
pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod locks;
pub mod materializer;
pub mod orchestrator;
pub mod session;

pub use config::AgentDockConfig;
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
