//! Agent module: definitions, the engine seam and the HTTP surface
//!
//! ## Architecture
//!
//! ```text
//! Client ←→ REST / WS (JSON) ←→ handler ←→ Orchestrator ←→ SessionRegistry ←→ AgentEngine
//!                                                              │                 └ launcher (stdio NDJSON)
//!                                                              └ Catalog + ConfigMaterializer
//! ```

pub mod engine;
pub mod handler;
pub mod launcher;
pub mod types;

pub use engine::{AgentEngine, AgentHandle, LaunchSpec};
pub use handler::{agent_router, AgentState};
pub use launcher::ProcessEngine;
