//! SQLite schema and row mapping for the agent catalog

use crate::agent::types::{AgentDefinition, AgentListing, ConfigArtifact};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use serde::de::DeserializeOwned;

pub(super) fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS agents (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL UNIQUE,
            agent_type  TEXT NOT NULL,
            command     TEXT NOT NULL,
            args_json   TEXT NOT NULL DEFAULT '[]',
            env_json    TEXT NOT NULL DEFAULT '{}',
            is_active   INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS artifacts (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL UNIQUE,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS artifact_members (
            artifact_id INTEGER NOT NULL REFERENCES artifacts(id) ON DELETE CASCADE,
            agent_id    INTEGER NOT NULL UNIQUE REFERENCES agents(id) ON DELETE CASCADE,
            position    INTEGER NOT NULL,
            PRIMARY KEY (artifact_id, position)
        );
        ",
    )?;
    Ok(())
}

pub(super) const AGENT_COLUMNS: &str =
    "a.id, a.name, a.agent_type, a.command, a.args_json, a.env_json, a.is_active, a.created_at, a.updated_at";

pub(super) fn map_agent(row: &Row) -> rusqlite::Result<AgentDefinition> {
    Ok(AgentDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        agent_type: row.get(2)?,
        command: row.get(3)?,
        args: json_column(row, 4)?,
        env: json_column(row, 5)?,
        is_active: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Agent columns followed by the owning artifact's name and id
pub(super) fn map_listing(row: &Row) -> rusqlite::Result<AgentListing> {
    Ok(AgentListing {
        agent: map_agent(row)?,
        file_name: row.get(9)?,
        file_id: row.get(10)?,
    })
}

/// Artifact row without members; callers fill `agents` via [`member_ids`]
pub(super) fn map_artifact(row: &Row) -> rusqlite::Result<ConfigArtifact> {
    Ok(ConfigArtifact {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
        agents: Vec::new(),
    })
}

pub(super) const ARTIFACT_COLUMNS: &str = "f.id, f.name, f.created_at";

/// Member ids of an artifact in creation order
pub(super) fn member_ids(conn: &Connection, artifact_id: i64) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT agent_id FROM artifact_members WHERE artifact_id = ?1 ORDER BY position",
    )?;
    let ids = stmt
        .query_map([artifact_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

fn json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(super) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
