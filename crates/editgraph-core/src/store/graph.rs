//! Semantic edit graph: append-only edit records with symbol and
//! conversation indexes.
//!
//! Every edit is stored once as a JSON document in `edits.data` alongside a
//! queryable projection of its scalar fields. Queries always rebuild full
//! [`Edit`] values from the document.

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::errors::{EditGraphError, EditGraphResult};
use crate::models::{timestamp_column, Edit};
use crate::query::guards::{clamp_limit, truncate_query, MAX_QUERY_LIMIT};
use crate::query::knowledge;
use crate::store::backend::{open_backend, SqlRow, SqlValue, SqliteBackend, StorageBackend};
use crate::store::schema;

/// Aggregate counts over the whole store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditStatistics {
    pub total_edits: usize,
    /// Edit type string to count, most frequent first.
    pub by_type: IndexMap<String, usize>,
    pub unique_files: usize,
    pub unique_symbols: usize,
}

pub struct SemanticEditGraph {
    backend: Box<dyn StorageBackend>,
    // Serializes multi-statement writes across threads.
    write_lock: Mutex<()>,
}

impl SemanticEditGraph {
    pub fn open(config: &StoreConfig) -> EditGraphResult<Self> {
        Self::with_backend(open_backend(config)?)
    }

    pub fn open_in_memory() -> EditGraphResult<Self> {
        Self::with_backend(Box::new(SqliteBackend::open_in_memory()?))
    }

    pub fn with_backend(backend: Box<dyn StorageBackend>) -> EditGraphResult<Self> {
        backend.init_schema()?;
        Ok(Self {
            backend,
            write_lock: Mutex::new(()),
        })
    }

    pub fn engine_name(&self) -> &'static str {
        self.backend.engine_name()
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Persist `edit` and its symbol and conversation rows in one transaction.
    ///
    /// Fails with [`EditGraphError::Database`] when the id is already stored.
    pub fn record_edit(&self, edit: &Edit) -> EditGraphResult<String> {
        let data = serde_json::to_string(edit)?;
        let _guard = self.write_lock.lock();

        if self.scalar_count("SELECT COUNT(*) FROM edits WHERE id = ?", &[edit.id.as_str().into()])? > 0 {
            return Err(EditGraphError::Database(format!(
                "Edit {} is already recorded",
                edit.id
            )));
        }

        self.backend.execute_batch("BEGIN;")?;
        match self.insert_rows(edit, data) {
            Ok(()) => {
                self.backend.execute_batch("COMMIT;")?;
                debug!("Recorded edit {} ({})", edit.short_id(), edit.edit_type);
                Ok(edit.id.clone())
            }
            Err(e) => {
                if let Err(rollback_err) = self.backend.execute_batch("ROLLBACK;") {
                    warn!("Rollback after failed insert also failed: {rollback_err}");
                }
                Err(e)
            }
        }
    }

    fn insert_rows(&self, edit: &Edit, data: String) -> EditGraphResult<()> {
        self.backend.execute(
            "INSERT INTO edits (id, file_path, edit_type, user_intent, confidence, timestamp, \
             git_commit_hash, parent_edit_id, execution_trace_id, data) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            &[
                edit.id.as_str().into(),
                edit.file_path.clone().into(),
                edit.edit_type.as_str().into(),
                edit.user_intent.as_str().into(),
                edit.confidence.into(),
                timestamp_column(&edit.timestamp).into(),
                edit.git_commit_hash.clone().into(),
                edit.parent_edit_id.clone().into(),
                edit.execution_trace_id.clone().into(),
                data.into(),
            ],
        )?;

        let symbols = edit
            .primary_symbol
            .iter()
            .map(|s| (s, true))
            .chain(edit.affected_symbols.iter().map(|s| (s, false)));
        let mut next_id = self.next_id("symbols")?;
        for (symbol, is_primary) in symbols {
            let file_path = if symbol.file_path.is_empty() {
                edit.file_path.clone()
            } else {
                Some(symbol.file_path.clone())
            };
            self.backend.execute(
                "INSERT INTO symbols (id, edit_id, symbol_name, symbol_kind, file_path, is_primary) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                &[
                    next_id.into(),
                    edit.id.as_str().into(),
                    symbol.name.as_str().into(),
                    symbol.kind.as_str().into(),
                    file_path.into(),
                    is_primary.into(),
                ],
            )?;
            next_id += 1;
        }

        if let Some(ctx) = &edit.conversation_context {
            self.backend.execute(
                "INSERT INTO conversations (id, edit_id, conversation_id, turn_index, \
                 user_message, intent_summary) VALUES (?, ?, ?, ?, ?, ?)",
                &[
                    self.next_id("conversations")?.into(),
                    edit.id.as_str().into(),
                    ctx.conversation_id.as_str().into(),
                    (ctx.turn_index as i64).into(),
                    ctx.user_message.as_str().into(),
                    ctx.intent_summary.clone().into(),
                ],
            )?;
        }
        Ok(())
    }

    fn next_id(&self, table: &str) -> EditGraphResult<i64> {
        let sql = format!("SELECT COALESCE(MAX(id), 0) FROM {table}");
        let rows = self.backend.query(&sql, &[])?;
        let current = rows
            .first()
            .and_then(|r| r.first())
            .and_then(SqlValue::as_i64)
            .unwrap_or(0);
        Ok(current + 1)
    }

    /// Drop every table and recreate the empty schema.
    pub fn reset(&self) -> EditGraphResult<()> {
        let _guard = self.write_lock.lock();
        for stmt in schema::DROP_STATEMENTS {
            self.backend.execute_batch(stmt)?;
        }
        self.backend.init_schema()?;
        warn!("Edit graph reset; all records dropped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    fn scalar_count(&self, sql: &str, params: &[SqlValue]) -> EditGraphResult<usize> {
        let rows = self.backend.query(sql, params)?;
        Ok(rows
            .first()
            .and_then(|r| r.first())
            .and_then(SqlValue::as_i64)
            .unwrap_or(0)
            .max(0) as usize)
    }

    fn decode_rows(rows: Vec<SqlRow>) -> Vec<Edit> {
        rows.into_iter()
            .filter_map(|row| {
                let data = row.first().and_then(SqlValue::as_str)?;
                match serde_json::from_str::<Edit>(data) {
                    Ok(edit) => Some(edit),
                    Err(e) => {
                        warn!("Skipping undecodable edit row: {e}");
                        None
                    }
                }
            })
            .collect()
    }

    fn query_edits(&self, sql: &str, params: &[SqlValue]) -> EditGraphResult<Vec<Edit>> {
        Ok(Self::decode_rows(self.backend.query(sql, params)?))
    }

    pub fn get_edit(&self, edit_id: &str) -> EditGraphResult<Option<Edit>> {
        Ok(self
            .query_edits("SELECT data FROM edits WHERE id = ?", &[edit_id.into()])?
            .into_iter()
            .next())
    }

    pub fn edit_count(&self) -> EditGraphResult<usize> {
        self.scalar_count("SELECT COUNT(*) FROM edits", &[])
    }

    /// Edits touching any symbol whose name contains `symbol_name`.
    pub fn query_by_symbol(&self, symbol_name: &str, limit: usize) -> EditGraphResult<Vec<Edit>> {
        let needle = truncate_query(symbol_name);
        self.query_edits(
            "SELECT data FROM edits WHERE id IN \
             (SELECT edit_id FROM symbols WHERE instr(symbol_name, ?) > 0) \
             ORDER BY timestamp DESC LIMIT ?",
            &[needle.into(), limit_param(limit)],
        )
    }

    pub fn query_by_file(&self, file_path: &str, limit: usize) -> EditGraphResult<Vec<Edit>> {
        self.query_edits(
            "SELECT data FROM edits WHERE file_path = ? ORDER BY timestamp DESC LIMIT ?",
            &[file_path.into(), limit_param(limit)],
        )
    }

    /// Edits whose user intent contains `keywords`.
    pub fn query_by_intent(&self, keywords: &str, limit: usize) -> EditGraphResult<Vec<Edit>> {
        let needle = truncate_query(keywords);
        self.query_edits(
            "SELECT data FROM edits WHERE instr(user_intent, ?) > 0 \
             ORDER BY timestamp DESC LIMIT ?",
            &[needle.into(), limit_param(limit)],
        )
    }

    /// Every edit of a conversation in turn order.
    pub fn query_by_conversation(&self, conversation_id: &str) -> EditGraphResult<Vec<Edit>> {
        self.query_edits(
            "SELECT e.data FROM edits e JOIN conversations c ON c.edit_id = e.id \
             WHERE c.conversation_id = ? ORDER BY c.turn_index ASC, e.timestamp ASC",
            &[conversation_id.into()],
        )
    }

    pub fn get_statistics(&self) -> EditGraphResult<EditStatistics> {
        let mut by_type = IndexMap::new();
        let rows = self.backend.query(
            "SELECT edit_type, COUNT(*) AS count FROM edits \
             GROUP BY edit_type ORDER BY count DESC, edit_type ASC",
            &[],
        )?;
        for row in rows {
            if let (Some(kind), Some(count)) = (
                row.first().and_then(SqlValue::as_str),
                row.get(1).and_then(SqlValue::as_i64),
            ) {
                by_type.insert(kind.to_string(), count.max(0) as usize);
            }
        }

        Ok(EditStatistics {
            total_edits: self.edit_count()?,
            by_type,
            unique_files: self.scalar_count("SELECT COUNT(DISTINCT file_path) FROM edits", &[])?,
            unique_symbols: self
                .scalar_count("SELECT COUNT(DISTINCT symbol_name) FROM symbols", &[])?,
        })
    }

    // -----------------------------------------------------------------------
    // Derived views
    // -----------------------------------------------------------------------

    pub fn get_institutional_knowledge(
        &self,
        file_path: &str,
        max_edits: usize,
    ) -> EditGraphResult<String> {
        knowledge::institutional_knowledge(self, file_path, max_edits)
    }

    pub fn get_related_edits(&self, edit: &Edit, limit: usize) -> EditGraphResult<Vec<Edit>> {
        knowledge::related_edits(self, edit, limit)
    }

    pub fn get_edit_chain(&self, edit_id: &str) -> EditGraphResult<Vec<Edit>> {
        knowledge::edit_chain(self, edit_id)
    }
}

fn limit_param(limit: usize) -> SqlValue {
    SqlValue::Integer(clamp_limit(limit, MAX_QUERY_LIMIT) as i64)
}
