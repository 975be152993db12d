//! SQLite implementation of [`TraceStore`].
//!
//! [`SqliteStore`] persists LMP definitions and invocation traces in a
//! SQLite database with WAL mode, atomic transactions on every write, and
//! automatic schema migrations. Structured fields are stored as JSON TEXT
//! columns via serde_json; oversized invocation contents move to the
//! content-addressed [`BlobStore`].

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use lmtrace_core::id::{InvocationId, LmpId};
use lmtrace_core::model::{CapturedValue, Invocation, InvocationContents, LmpDefinition, LmpKind};

use crate::blob::BlobStore;
use crate::error::StorageError;
use crate::traits::TraceStore;

/// Externalization threshold: contents whose combined serialized size
/// exceeds this move to the blob store. 100 KiB.
pub const EXTERNALIZATION_THRESHOLD: usize = 100 * 1024;

/// Blob type tag for externalized invocation contents.
const CONTENTS_BLOB_KIND: &str = "invocation-contents";

/// SQLite-backed implementation of [`TraceStore`].
///
/// Every write operation is wrapped in a transaction for atomicity. The
/// database uses WAL mode for performance and foreign keys for integrity.
pub struct SqliteStore {
    conn: Connection,
    blobs: BlobStore,
    externalization_threshold: usize,
}

impl SqliteStore {
    /// Opens (or creates) a SQLite database at `path`, with blobs rooted
    /// at the blob store's directory.
    pub fn open(path: &str, blobs: BlobStore) -> Result<Self, StorageError> {
        let conn = crate::schema::open_database(path)?;
        Ok(SqliteStore {
            conn,
            blobs,
            externalization_threshold: EXTERNALIZATION_THRESHOLD,
        })
    }

    /// Opens an in-memory SQLite database (for testing).
    pub fn in_memory(blobs: BlobStore) -> Result<Self, StorageError> {
        let conn = crate::schema::open_in_memory()?;
        Ok(SqliteStore {
            conn,
            blobs,
            externalization_threshold: EXTERNALIZATION_THRESHOLD,
        })
    }

    /// Overrides the externalization threshold.
    pub fn with_externalization_threshold(mut self, bytes: usize) -> Self {
        self.externalization_threshold = bytes;
        self
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Serializes an LmpKind to TEXT.
    fn kind_to_str(kind: LmpKind) -> &'static str {
        match kind {
            LmpKind::Lm => "lm",
            LmpKind::Tool => "tool",
            LmpKind::Multimodal => "multimodal",
            LmpKind::Other => "other",
        }
    }

    /// Deserializes an LmpKind from TEXT.
    fn str_to_kind(s: &str) -> LmpKind {
        match s {
            "lm" => LmpKind::Lm,
            "tool" => LmpKind::Tool,
            "multimodal" => LmpKind::Multimodal,
            _ => LmpKind::Other,
        }
    }

    fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StorageError> {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StorageError::IntegrityError {
                reason: format!("unparseable timestamp {:?}: {}", s, e),
            })
    }

    /// Reads a definition row plus its uses edges, if present.
    fn read_definition(
        conn: &Connection,
        id: &LmpId,
    ) -> Result<Option<LmpDefinition>, StorageError> {
        let row = conn
            .query_row(
                "SELECT name, source, dependencies, language, lmp_type, api_params,
                        commit_message, version_number, created_at, num_invocations
                 FROM lmps WHERE lmp_id = ?1",
                params![id.0],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, i64>(9)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            name,
            source,
            dependencies,
            language,
            lmp_type,
            api_params,
            commit_message,
            version_number,
            created_at,
            num_invocations,
        )) = row
        else {
            return Ok(None);
        };

        let uses = {
            let mut stmt = conn
                .prepare_cached("SELECT uses_id FROM lmp_uses WHERE lmp_id = ?1 ORDER BY rowid")?;
            let rows = stmt.query_map(params![id.0], |row| row.get::<_, String>(0))?;
            let mut uses = Vec::new();
            for row in rows {
                uses.push(LmpId(row?));
            }
            uses
        };

        Ok(Some(LmpDefinition {
            lmp_id: id.clone(),
            name,
            source,
            dependencies,
            language,
            kind: Self::str_to_kind(&lmp_type),
            api_params: serde_json::from_str(&api_params)?,
            commit_message,
            version_number,
            created_at: Self::parse_timestamp(&created_at)?,
            uses,
            num_invocations,
        }))
    }

    /// Inserts the contents row, externalizing to the blob store when the
    /// combined payload exceeds the threshold.
    fn insert_contents(
        tx: &Transaction<'_>,
        blobs: &BlobStore,
        threshold: usize,
        inv: &Invocation,
        contents: &InvocationContents,
    ) -> Result<(), StorageError> {
        let size = contents.serialized_len()?;
        if size > threshold {
            let mut external = contents.clone();
            external.is_external = true;
            let payload = serde_json::to_vec(&external)?;
            let blob_id = blobs.store(CONTENTS_BLOB_KIND, &payload)?;
            tx.execute(
                "INSERT INTO invocation_contents (invocation_id, is_external, external_blob_id)
                 VALUES (?1, 1, ?2)",
                params![inv.id.0, blob_id.0],
            )?;
        } else {
            tx.execute(
                "INSERT INTO invocation_contents
                   (invocation_id, params, results, invocation_api_params,
                    global_vars, free_vars, is_external)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![
                    inv.id.0,
                    serde_json::to_string(&contents.params)?,
                    serde_json::to_string(&contents.results)?,
                    serde_json::to_string(&contents.invocation_api_params)?,
                    serde_json::to_string(&contents.global_vars)?,
                    serde_json::to_string(&contents.free_vars)?,
                ],
            )?;
        }
        Ok(())
    }
}

impl TraceStore for SqliteStore {
    fn write_definition(
        &mut self,
        def: &LmpDefinition,
    ) -> Result<(LmpDefinition, bool), StorageError> {
        let tx = self.conn.transaction()?;

        // Same identity already written: no-op, return the stored row.
        if let Some(existing) = Self::read_definition(&tx, &def.lmp_id)? {
            tx.commit()?;
            return Ok((existing, false));
        }

        // Version numbers must come fresh from the store, never a cache.
        let previous: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version_number), 0) FROM lmps WHERE name = ?1",
            params![def.name],
            |row| row.get(0),
        )?;
        let version = previous + 1;

        let commit_message = if def.commit_message.is_empty() {
            if version == 1 {
                "Initial version".to_string()
            } else {
                format!("Updated to version {}", version)
            }
        } else {
            def.commit_message.clone()
        };

        tx.execute(
            "INSERT INTO lmps
               (lmp_id, name, source, dependencies, language, lmp_type, api_params,
                commit_message, version_number, created_at, num_invocations)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
            params![
                def.lmp_id.0,
                def.name,
                def.source,
                def.dependencies,
                def.language,
                Self::kind_to_str(def.kind),
                serde_json::to_string(&def.api_params)?,
                commit_message,
                version,
                def.created_at.to_rfc3339(),
            ],
        )?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO lmp_uses (lmp_id, uses_id) VALUES (?1, ?2)",
            )?;
            for uses in &def.uses {
                stmt.execute(params![def.lmp_id.0, uses.0])?;
            }
        }

        tx.commit()?;

        let stored = LmpDefinition {
            version_number: version,
            commit_message,
            num_invocations: 0,
            ..def.clone()
        };
        Ok((stored, true))
    }

    fn write_invocation(
        &mut self,
        inv: &Invocation,
        contents: &InvocationContents,
    ) -> Result<bool, StorageError> {
        let blobs = self.blobs.clone();
        let threshold = self.externalization_threshold;
        let tx = self.conn.transaction()?;

        // Retried write with the same id: the whole transaction
        // degenerates to a no-op, counter included.
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO invocations
               (id, lmp_id, latency_ms, prompt_tokens, completion_tokens,
                state_cache_key, created_at, used_by_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                inv.id.0,
                inv.lmp_id.0,
                inv.latency_ms,
                inv.prompt_tokens,
                inv.completion_tokens,
                inv.state_cache_key,
                inv.created_at.to_rfc3339(),
                inv.used_by_id.as_ref().map(|id| id.0.as_str()),
            ],
        )?;
        if inserted == 0 {
            tx.commit()?;
            return Ok(false);
        }

        Self::insert_contents(&tx, &blobs, threshold, inv, contents)?;

        // An unknown lmp_id already failed the INSERT above via the
        // foreign key, rolling the transaction back.
        tx.execute(
            "UPDATE lmps SET num_invocations = num_invocations + 1 WHERE lmp_id = ?1",
            params![inv.lmp_id.0],
        )?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO invocation_consumes (invocation_id, consumed_id)
                 VALUES (?1, ?2)",
            )?;
            for consumed in &inv.consumes {
                stmt.execute(params![inv.id.0, consumed.0])?;
            }
        }

        tx.commit()?;
        Ok(true)
    }

    fn get_definition(&self, id: &LmpId) -> Result<LmpDefinition, StorageError> {
        Self::read_definition(&self.conn, id)?
            .ok_or_else(|| StorageError::DefinitionNotFound(id.0.clone()))
    }

    fn get_versions(&self, name: &str) -> Result<Vec<LmpDefinition>, StorageError> {
        let ids: Vec<LmpId> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT lmp_id FROM lmps WHERE name = ?1 ORDER BY version_number",
            )?;
            let rows = stmt.query_map(params![name], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(LmpId(row?));
            }
            ids
        };
        let mut versions = Vec::with_capacity(ids.len());
        for id in &ids {
            versions.push(self.get_definition(id)?);
        }
        Ok(versions)
    }

    fn latest_version_number(&self, name: &str) -> Result<i64, StorageError> {
        let version: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(version_number), 0) FROM lmps WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    fn get_invocation(
        &self,
        id: &InvocationId,
    ) -> Result<(Invocation, InvocationContents), StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT lmp_id, latency_ms, prompt_tokens, completion_tokens,
                        state_cache_key, created_at, used_by_id
                 FROM invocations WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            lmp_id,
            latency_ms,
            prompt_tokens,
            completion_tokens,
            state_cache_key,
            created_at,
            used_by_id,
        )) = row
        else {
            return Err(StorageError::InvocationNotFound(id.0.clone()));
        };

        let consumes = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT consumed_id FROM invocation_consumes
                 WHERE invocation_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![id.0], |row| row.get::<_, String>(0))?;
            let mut consumes = Vec::new();
            for row in rows {
                consumes.push(InvocationId(row?));
            }
            consumes
        };

        let invocation = Invocation {
            id: id.clone(),
            lmp_id: LmpId(lmp_id),
            latency_ms,
            prompt_tokens,
            completion_tokens,
            state_cache_key,
            created_at: Self::parse_timestamp(&created_at)?,
            used_by_id: used_by_id.map(InvocationId),
            consumes,
        };

        let contents_row = self
            .conn
            .query_row(
                "SELECT params, results, invocation_api_params, global_vars,
                        free_vars, is_external, external_blob_id
                 FROM invocation_contents WHERE invocation_id = ?1",
                params![id.0],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((params, results, api_params, global_vars, free_vars, is_external, blob_id)) =
            contents_row
        else {
            return Err(StorageError::IntegrityError {
                reason: format!("invocation {} has no contents row", id),
            });
        };

        let contents = if is_external != 0 {
            let blob_id = blob_id.ok_or_else(|| StorageError::IntegrityError {
                reason: format!("externalized invocation {} has no blob reference", id),
            })?;
            let payload = self.blobs.retrieve(&lmtrace_core::id::BlobId(blob_id))?;
            serde_json::from_slice::<InvocationContents>(&payload)?
        } else {
            let text = |column: Option<String>, name: &str| {
                column.ok_or_else(|| StorageError::IntegrityError {
                    reason: format!("inline invocation {} missing column {}", id, name),
                })
            };
            InvocationContents {
                params: serde_json::from_str(&text(params, "params")?)?,
                results: serde_json::from_str(&text(results, "results")?)?,
                invocation_api_params: serde_json::from_str(&text(
                    api_params,
                    "invocation_api_params",
                )?)?,
                global_vars: serde_json::from_str::<IndexMap<String, CapturedValue>>(&text(
                    global_vars,
                    "global_vars",
                )?)?,
                free_vars: serde_json::from_str::<IndexMap<String, CapturedValue>>(&text(
                    free_vars,
                    "free_vars",
                )?)?,
                is_external: false,
            }
        };

        Ok((invocation, contents))
    }

    fn invocations_for(&self, lmp_id: &LmpId) -> Result<Vec<Invocation>, StorageError> {
        let ids: Vec<InvocationId> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT id FROM invocations WHERE lmp_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map(params![lmp_id.0], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(InvocationId(row?));
            }
            ids
        };
        let mut invocations = Vec::with_capacity(ids.len());
        for id in &ids {
            let (invocation, _) = self.get_invocation(id)?;
            invocations.push(invocation);
        }
        Ok(invocations)
    }
}
