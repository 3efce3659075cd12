//! Agent catalog: persisted agent definitions and config artifacts
//!
//! Backed by SQLite. Artifact membership is an explicit table keyed by
//! agent id (`agent_id UNIQUE`), so an agent belongs to at most one
//! artifact and lookups never depend on string matching.
//!
//! Database access is synchronous and short; the connection lock is never
//! held across an `.await`.

mod schema;

use crate::agent::types::{
    AgentDefinition, AgentId, AgentInput, AgentListing, AgentUpdate, ArtifactId, ConfigArtifact,
};
use crate::config::BatchMode;
use crate::error::{Error, Result};
use crate::materializer::{ConfigMaterializer, McpServersFile};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Result of a successful batch create
#[derive(Debug, Clone)]
pub struct CreatedBatch {
    pub agents: Vec<AgentDefinition>,
    pub artifact: ConfigArtifact,
}

/// Members and record removed together with an artifact
#[derive(Debug, Clone)]
pub struct RemovedArtifact {
    pub artifact: ConfigArtifact,
    pub members: Vec<AgentDefinition>,
}

/// Persisted record of agent definitions and their artifacts
pub struct Catalog {
    conn: Mutex<Connection>,
    materializer: Arc<ConfigMaterializer>,
    batch_mode: BatchMode,
}

impl Catalog {
    /// Open (or create) the catalog database at `path`
    pub fn open(
        path: impl AsRef<Path>,
        materializer: Arc<ConfigMaterializer>,
        batch_mode: BatchMode,
    ) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, materializer, batch_mode)
    }

    /// Open an in-memory catalog (for testing)
    pub fn open_in_memory(
        materializer: Arc<ConfigMaterializer>,
        batch_mode: BatchMode,
    ) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, materializer, batch_mode)
    }

    fn with_connection(
        conn: Connection,
        materializer: Arc<ConfigMaterializer>,
        batch_mode: BatchMode,
    ) -> Result<Self> {
        schema::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            materializer,
            batch_mode,
        })
    }

    pub fn materializer(&self) -> &Arc<ConfigMaterializer> {
        &self.materializer
    }

    pub fn batch_mode(&self) -> BatchMode {
        self.batch_mode
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("catalog connection lock poisoned".to_string()))
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Persist a batch of definitions and materialize one artifact for it.
    ///
    /// In [`BatchMode::Atomic`] nothing is persisted unless every
    /// definition, the artifact file and the artifact record succeed. In
    /// [`BatchMode::Sequential`] each definition commits on its own and a
    /// later conflict leaves the earlier ones in place.
    pub async fn create_batch(&self, inputs: Vec<AgentInput>) -> Result<CreatedBatch> {
        if inputs.is_empty() {
            return Err(Error::Validation(
                "at least one agent definition is required".to_string(),
            ));
        }
        for input in &inputs {
            input.validate()?;
        }

        let created = match self.batch_mode {
            BatchMode::Atomic => self.create_atomic(&inputs).await?,
            BatchMode::Sequential => self.create_sequential(&inputs).await?,
        };

        tracing::info!(
            artifact_id = created.artifact.id,
            artifact = %created.artifact.name,
            agents = created.agents.len(),
            "Created agent batch"
        );
        Ok(created)
    }

    async fn create_atomic(&self, inputs: &[AgentInput]) -> Result<CreatedBatch> {
        let mut seen = HashSet::new();
        for input in inputs {
            if !seen.insert(input.name.as_str()) {
                return Err(Error::DuplicateName(input.name.clone()));
            }
        }
        self.ensure_names_free(inputs)?;

        let now = Utc::now();
        let file_name = self
            .materializer
            .write_batch_servers(&McpServersFile::from_inputs(inputs))
            .await?;

        match self.commit_batch(inputs, &file_name, now) {
            Ok(created) => Ok(created),
            Err(e) => {
                if let Err(cleanup) = self.materializer.delete(&file_name).await {
                    tracing::warn!(
                        artifact = %file_name,
                        "Failed to remove artifact after rollback: {}",
                        cleanup
                    );
                }
                Err(e)
            }
        }
    }

    async fn create_sequential(&self, inputs: &[AgentInput]) -> Result<CreatedBatch> {
        let now = Utc::now();
        let mut agents = Vec::with_capacity(inputs.len());
        for input in inputs {
            let agent = {
                let conn = self.lock()?;
                insert_agent(&conn, input, now)?
            };
            tracing::debug!(agent_id = agent.id, name = %agent.name, "Inserted agent");
            agents.push(agent);
        }

        let file_name = self.materializer.write_batch(&agents).await?;
        let ids: Vec<AgentId> = agents.iter().map(|a| a.id).collect();

        match self.record_artifact(&file_name, &ids, now) {
            Ok(artifact) => Ok(CreatedBatch { agents, artifact }),
            Err(e) => {
                let _ = self.materializer.delete(&file_name).await;
                Err(e)
            }
        }
    }

    fn record_artifact(
        &self,
        file_name: &str,
        ids: &[AgentId],
        now: DateTime<Utc>,
    ) -> Result<ConfigArtifact> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let artifact = insert_artifact(&tx, file_name, ids, now)?;
        tx.commit()?;
        Ok(artifact)
    }

    fn ensure_names_free(&self, inputs: &[AgentInput]) -> Result<()> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT 1 FROM agents WHERE name = ?1")?;
        for input in inputs {
            if stmt.exists([&input.name])? {
                return Err(Error::DuplicateName(input.name.clone()));
            }
        }
        Ok(())
    }

    fn commit_batch(
        &self,
        inputs: &[AgentInput],
        file_name: &str,
        now: DateTime<Utc>,
    ) -> Result<CreatedBatch> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut agents = Vec::with_capacity(inputs.len());
        for input in inputs {
            agents.push(insert_agent(&tx, input, now)?);
        }
        let ids: Vec<AgentId> = agents.iter().map(|a| a.id).collect();
        let artifact = insert_artifact(&tx, file_name, &ids, now)?;

        tx.commit()?;
        Ok(CreatedBatch { agents, artifact })
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Get a definition by id
    pub fn get(&self, id: AgentId) -> Result<Option<AgentDefinition>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM agents a WHERE a.id = ?1", schema::AGENT_COLUMNS);
        Ok(conn.query_row(&sql, [id], schema::map_agent).optional()?)
    }

    /// Get a definition by id, decorated with its owning artifact
    pub fn get_listing(&self, id: AgentId) -> Result<Option<AgentListing>> {
        let conn = self.lock()?;
        let sql = format!("{} WHERE a.id = ?1", listing_select());
        Ok(conn.query_row(&sql, [id], schema::map_listing).optional()?)
    }

    /// List definitions ordered by id
    pub fn list(&self, offset: usize, limit: usize) -> Result<Vec<AgentListing>> {
        let conn = self.lock()?;
        let sql = format!("{} ORDER BY a.id LIMIT ?1 OFFSET ?2", listing_select());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], schema::map_listing)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Number of persisted definitions
    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Artifact owning the given agent, if any
    pub fn artifact_for_agent(&self, id: AgentId) -> Result<Option<ConfigArtifact>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM artifacts f
               JOIN artifact_members m ON m.artifact_id = f.id
              WHERE m.agent_id = ?1",
            schema::ARTIFACT_COLUMNS
        );
        load_artifact(&conn, &sql, id)
    }

    pub fn get_artifact(&self, id: ArtifactId) -> Result<Option<ConfigArtifact>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM artifacts f WHERE f.id = ?1",
            schema::ARTIFACT_COLUMNS
        );
        load_artifact(&conn, &sql, id)
    }

    pub fn list_artifacts(&self) -> Result<Vec<ConfigArtifact>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM artifacts f ORDER BY f.id",
            schema::ARTIFACT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut artifacts = stmt
            .query_map([], schema::map_artifact)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for artifact in &mut artifacts {
            artifact.agents = schema::member_ids(&conn, artifact.id)?;
        }
        Ok(artifacts)
    }

    /// Member definitions of an artifact in creation order
    pub fn members(&self, artifact_id: ArtifactId) -> Result<Vec<AgentDefinition>> {
        let conn = self.lock()?;
        members_of(&conn, artifact_id)
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Apply a partial update and refresh the materialized configs.
    ///
    /// Rewrites the per-agent artifact and the owning batch artifact so the
    /// next launch sees the new fields. Running sessions are not restarted.
    /// The row change and both file writes happen under the owning
    /// artifact's lock. An update without fields returns the current record.
    pub async fn update(&self, id: AgentId, update: AgentUpdate) -> Result<Option<AgentDefinition>> {
        if update.is_empty() {
            return self.get(id);
        }

        let owner = self.artifact_for_agent(id)?;
        let lock_name = match &owner {
            Some(artifact) => artifact.name.clone(),
            None => ConfigMaterializer::single_name(id),
        };
        let _guard = self.materializer.lock(&lock_name).await;

        // Gone if the owning artifact was deleted while we waited
        let agent = match self.apply_update(id, update)? {
            Some(agent) => agent,
            None => return Ok(None),
        };

        self.materializer.write_single(&agent).await?;
        if let Some(artifact) = owner {
            let members = self.members(artifact.id)?;
            self.materializer.rewrite(&artifact.name, &members).await?;
        }

        tracing::info!(agent_id = id, name = %agent.name, "Updated agent");
        Ok(Some(agent))
    }

    fn apply_update(&self, id: AgentId, update: AgentUpdate) -> Result<Option<AgentDefinition>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM agents a WHERE a.id = ?1", schema::AGENT_COLUMNS);
        let mut agent = match conn.query_row(&sql, [id], schema::map_agent).optional()? {
            Some(agent) => agent,
            None => return Ok(None),
        };

        update.apply_to(&mut agent)?;
        agent.updated_at = Utc::now();

        let result = conn.execute(
            "UPDATE agents
                SET name = ?2, agent_type = ?3, command = ?4, args_json = ?5,
                    env_json = ?6, is_active = ?7, updated_at = ?8
              WHERE id = ?1",
            params![
                agent.id,
                agent.name,
                agent.agent_type,
                agent.command,
                serde_json::to_string(&agent.args)?,
                serde_json::to_string(&agent.env)?,
                agent.is_active,
                agent.updated_at,
            ],
        );
        match result {
            Ok(_) => Ok(Some(agent)),
            Err(e) if schema::is_unique_violation(&e) => Err(Error::DuplicateName(agent.name)),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete an artifact record and all of its member rows in one
    /// transaction. Files are left to the caller.
    pub fn remove_artifact(&self, id: ArtifactId) -> Result<Option<RemovedArtifact>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let sql = format!(
            "SELECT {} FROM artifacts f WHERE f.id = ?1",
            schema::ARTIFACT_COLUMNS
        );
        let artifact = match load_artifact(&tx, &sql, id)? {
            Some(artifact) => artifact,
            None => return Ok(None),
        };
        let members = members_of(&tx, id)?;

        tx.execute(
            "DELETE FROM agents
              WHERE id IN (SELECT agent_id FROM artifact_members WHERE artifact_id = ?1)",
            [id],
        )?;
        tx.execute("DELETE FROM artifacts WHERE id = ?1", [id])?;
        tx.commit()?;

        Ok(Some(RemovedArtifact { artifact, members }))
    }
}

fn listing_select() -> String {
    format!(
        "SELECT {}, f.name, f.id FROM agents a
           LEFT JOIN artifact_members m ON m.agent_id = a.id
           LEFT JOIN artifacts f ON f.id = m.artifact_id",
        schema::AGENT_COLUMNS
    )
}

fn insert_agent(conn: &Connection, input: &AgentInput, now: DateTime<Utc>) -> Result<AgentDefinition> {
    let result = conn.execute(
        "INSERT INTO agents (name, agent_type, command, args_json, env_json, is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            input.name,
            input.agent_type,
            input.command,
            serde_json::to_string(&input.args)?,
            serde_json::to_string(&input.env)?,
            input.is_active,
            now,
        ],
    );
    match result {
        Ok(_) => {}
        Err(e) if schema::is_unique_violation(&e) => {
            return Err(Error::DuplicateName(input.name.clone()));
        }
        Err(e) => return Err(e.into()),
    }

    Ok(AgentDefinition {
        id: conn.last_insert_rowid(),
        name: input.name.clone(),
        agent_type: input.agent_type.clone(),
        command: input.command.clone(),
        args: input.args.clone(),
        env: input.env.clone(),
        is_active: input.is_active,
        created_at: now,
        updated_at: now,
    })
}

fn insert_artifact(
    conn: &Connection,
    name: &str,
    members: &[AgentId],
    now: DateTime<Utc>,
) -> Result<ConfigArtifact> {
    conn.execute(
        "INSERT INTO artifacts (name, created_at) VALUES (?1, ?2)",
        params![name, now],
    )?;
    let id = conn.last_insert_rowid();

    let mut stmt = conn.prepare_cached(
        "INSERT INTO artifact_members (artifact_id, agent_id, position) VALUES (?1, ?2, ?3)",
    )?;
    for (position, agent_id) in members.iter().enumerate() {
        stmt.execute(params![id, agent_id, position as i64])?;
    }

    Ok(ConfigArtifact {
        id,
        name: name.to_string(),
        agents: members.to_vec(),
        created_at: now,
    })
}

fn load_artifact(conn: &Connection, sql: &str, key: i64) -> Result<Option<ConfigArtifact>> {
    let mut artifact = match conn.query_row(sql, [key], schema::map_artifact).optional()? {
        Some(artifact) => artifact,
        None => return Ok(None),
    };
    artifact.agents = schema::member_ids(conn, artifact.id)?;
    Ok(Some(artifact))
}

fn members_of(conn: &Connection, artifact_id: ArtifactId) -> Result<Vec<AgentDefinition>> {
    let sql = format!(
        "SELECT {} FROM agents a
           JOIN artifact_members m ON m.agent_id = a.id
          WHERE m.artifact_id = ?1
          ORDER BY m.position",
        schema::AGENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([artifact_id], schema::map_agent)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
