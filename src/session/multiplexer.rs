//! Connection multiplexer
//!
//! Tracks the live streaming connections of each agent and relays their
//! messages through the [`SessionRegistry`]. A reply goes back only to the
//! connection whose message triggered it; siblings on the same agent never
//! see it.

use crate::agent::types::{AgentId, ChatFrame};
use crate::session::registry::SessionRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Identity of one attached connection
pub type ConnectionId = Uuid;

/// Instruction for a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ChatFrame),
    Close { code: u16, reason: String },
}

/// Sender half owned by the multiplexer
pub type OutboundTx = mpsc::UnboundedSender<Outbound>;

pub struct ConnectionMultiplexer {
    registry: Arc<SessionRegistry>,
    connections: RwLock<HashMap<AgentId, HashMap<ConnectionId, OutboundTx>>>,
}

impl ConnectionMultiplexer {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection under an agent
    pub async fn attach(&self, agent_id: AgentId, tx: OutboundTx) -> ConnectionId {
        let connection_id = Uuid::new_v4();
        self.connections
            .write()
            .await
            .entry(agent_id)
            .or_default()
            .insert(connection_id, tx);
        tracing::debug!(agent_id = agent_id, connection_id = %connection_id, "Connection attached");
        connection_id
    }

    /// Remove a connection. The agent's key goes away with its last one.
    pub async fn detach(&self, agent_id: AgentId, connection_id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        let Some(set) = connections.get_mut(&agent_id) else {
            return false;
        };
        let removed = set.remove(&connection_id).is_some();
        if set.is_empty() {
            connections.remove(&agent_id);
        }
        if removed {
            tracing::debug!(agent_id = agent_id, connection_id = %connection_id, "Connection detached");
        }
        removed
    }

    /// Forward one inbound message and deliver the outcome to its sender.
    ///
    /// Agent-level failures become error frames; the connection stays open.
    pub async fn relay_inbound(
        &self,
        agent_id: AgentId,
        connection_id: ConnectionId,
        text: &str,
    ) -> ChatFrame {
        let frame = match self.registry.send(agent_id, text).await {
            Ok(reply) => ChatFrame::reply(agent_id, reply),
            Err(e) => {
                tracing::warn!(
                    agent_id = agent_id,
                    connection_id = %connection_id,
                    "Error processing message: {}",
                    e
                );
                ChatFrame::failure(agent_id, &e)
            }
        };

        let tx = self
            .connections
            .read()
            .await
            .get(&agent_id)
            .and_then(|set| set.get(&connection_id))
            .cloned();
        match tx {
            Some(tx) => {
                if tx.send(Outbound::Frame(frame.clone())).is_err() {
                    tracing::debug!(connection_id = %connection_id, "Reply dropped, writer gone");
                }
            }
            None => {
                tracing::debug!(connection_id = %connection_id, "Reply dropped, connection detached");
            }
        }
        frame
    }

    /// Close and forget every connection of an agent
    pub async fn close_all(&self, agent_id: AgentId, code: u16, reason: &str) -> usize {
        let set = self.connections.write().await.remove(&agent_id);
        let Some(set) = set else {
            return 0;
        };
        for tx in set.values() {
            let _ = tx.send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
        tracing::info!(agent_id = agent_id, connections = set.len(), "Closed agent connections");
        set.len()
    }

    pub async fn connection_count(&self, agent_id: AgentId) -> usize {
        self.connections
            .read()
            .await
            .get(&agent_id)
            .map_or(0, HashMap::len)
    }

    /// Agents with at least one attached connection
    pub async fn agents(&self) -> usize {
        self.connections.read().await.len()
    }
}
