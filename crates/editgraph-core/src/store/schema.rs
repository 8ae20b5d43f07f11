//! Shared DDL for the edit graph.
//!
//! One statement list serves both embedded engines, so column types stay
//! within the subset SQLite and DuckDB agree on (TEXT, INTEGER, DOUBLE,
//! BOOLEAN). Surrogate ids are assigned by the store rather than by
//! AUTOINCREMENT.

/// Tables and indexes, created with `IF NOT EXISTS` so replays are no-ops.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables ──────────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS edits (
        id TEXT PRIMARY KEY,
        file_path TEXT,
        edit_type TEXT NOT NULL,
        user_intent TEXT,
        confidence DOUBLE,
        timestamp TEXT NOT NULL,
        git_commit_hash TEXT,
        parent_edit_id TEXT,
        execution_trace_id TEXT,
        data TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS symbols (
        id INTEGER PRIMARY KEY,
        edit_id TEXT NOT NULL REFERENCES edits(id),
        symbol_name TEXT NOT NULL,
        symbol_kind TEXT NOT NULL,
        file_path TEXT,
        is_primary BOOLEAN NOT NULL DEFAULT FALSE
    );",
    "CREATE TABLE IF NOT EXISTS conversations (
        id INTEGER PRIMARY KEY,
        edit_id TEXT NOT NULL REFERENCES edits(id),
        conversation_id TEXT NOT NULL,
        turn_index INTEGER,
        user_message TEXT,
        intent_summary TEXT
    );",
    // ── indexes ─────────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_edits_file_path ON edits(file_path);",
    "CREATE INDEX IF NOT EXISTS idx_edits_timestamp ON edits(timestamp);",
    "CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(symbol_name);",
    "CREATE INDEX IF NOT EXISTS idx_conversations_id ON conversations(conversation_id);",
];

/// Children first so foreign keys never block the drop.
pub const DROP_STATEMENTS: &[&str] = &[
    "DROP TABLE IF EXISTS conversations;",
    "DROP TABLE IF EXISTS symbols;",
    "DROP TABLE IF EXISTS edits;",
];

pub const TABLE_NAMES: &[&str] = &["edits", "symbols", "conversations"];
