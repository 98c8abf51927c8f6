//! SQL DDL for all mnemon tables.
//!
//! Defines the `fragments`, `fragment_links`, `fragment_versions`,
//! `tool_feedback`, `task_feedback`, `fragments_fts` (FTS5), `fragments_vec`
//! (vec0), and `schema_meta` tables. All DDL uses `IF NOT EXISTS` for
//! idempotent initialization.
//!
//! Array-valued fields (`keywords`, `linked_to`, feedback lists) are stored
//! as JSON text; keyword-overlap search goes through the FTS5 table instead
//! of scanning the JSON.

use rusqlite::Connection;

/// All schema DDL statements for mnemon's core tables.
const SCHEMA_SQL: &str = r#"
-- Core fragment storage
CREATE TABLE IF NOT EXISTS fragments (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    topic TEXT NOT NULL,
    keywords TEXT NOT NULL DEFAULT '[]',
    type TEXT NOT NULL CHECK(type IN ('fact','decision','error','preference','procedure','relation')),
    importance REAL NOT NULL DEFAULT 0.5 CHECK(importance >= 0.0 AND importance <= 1.0),
    content_hash TEXT NOT NULL,
    source TEXT,
    linked_to TEXT NOT NULL DEFAULT '[]',
    agent_id TEXT NOT NULL DEFAULT 'default',
    access_count INTEGER NOT NULL DEFAULT 0,
    accessed_at TEXT,
    created_at TEXT NOT NULL,
    ttl_tier TEXT NOT NULL DEFAULT 'warm' CHECK(ttl_tier IN ('hot','warm','cold','permanent')),
    estimated_tokens INTEGER NOT NULL DEFAULT 0,
    utility_score REAL NOT NULL DEFAULT 1.0,
    verified_at TEXT NOT NULL,
    is_anchor INTEGER NOT NULL DEFAULT 0
);

-- Hash uniqueness per agent scope is enforced by the insert gate; the index
-- stays non-unique so the dedup-merge stage can reconcile drift.
CREATE INDEX IF NOT EXISTS idx_fragments_hash ON fragments(agent_id, content_hash);
CREATE INDEX IF NOT EXISTS idx_fragments_topic ON fragments(topic);
CREATE INDEX IF NOT EXISTS idx_fragments_type ON fragments(type);
CREATE INDEX IF NOT EXISTS idx_fragments_importance ON fragments(importance DESC);
CREATE INDEX IF NOT EXISTS idx_fragments_created ON fragments(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_fragments_agent ON fragments(agent_id);
CREATE INDEX IF NOT EXISTS idx_fragments_tier_created ON fragments(ttl_tier, created_at);
CREATE INDEX IF NOT EXISTS idx_fragments_source ON fragments(source);
CREATE INDEX IF NOT EXISTS idx_fragments_verified ON fragments(verified_at);
CREATE INDEX IF NOT EXISTS idx_fragments_anchor ON fragments(is_anchor) WHERE is_anchor = 1;

-- Keyword overlap search (BM25)
CREATE VIRTUAL TABLE IF NOT EXISTS fragments_fts USING fts5(
    body,
    id UNINDEXED
);

-- Typed fragment graph
CREATE TABLE IF NOT EXISTS fragment_links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_id TEXT NOT NULL REFERENCES fragments(id) ON DELETE CASCADE,
    to_id TEXT NOT NULL REFERENCES fragments(id) ON DELETE CASCADE,
    relation_type TEXT NOT NULL CHECK(relation_type IN ('related','caused_by','resolved_by','part_of','contradicts','superseded_by')),
    created_at TEXT NOT NULL,
    UNIQUE(from_id, to_id, relation_type)
);

CREATE INDEX IF NOT EXISTS idx_links_from ON fragment_links(from_id);
CREATE INDEX IF NOT EXISTS idx_links_to ON fragment_links(to_id);
CREATE INDEX IF NOT EXISTS idx_links_relation ON fragment_links(relation_type);

-- Pre-amendment snapshots, append-only
CREATE TABLE IF NOT EXISTS fragment_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fragment_id TEXT NOT NULL REFERENCES fragments(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    topic TEXT NOT NULL,
    keywords TEXT NOT NULL DEFAULT '[]',
    type TEXT NOT NULL,
    importance REAL NOT NULL,
    amended_at TEXT NOT NULL,
    amended_by TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_versions_fragment ON fragment_versions(fragment_id);

-- Per-tool agent feedback
CREATE TABLE IF NOT EXISTS tool_feedback (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tool_name TEXT NOT NULL,
    relevant INTEGER NOT NULL,
    sufficient INTEGER NOT NULL,
    suggestion TEXT,
    context TEXT,
    session_id TEXT,
    trigger_type TEXT NOT NULL DEFAULT 'voluntary' CHECK(trigger_type IN ('sampled','voluntary')),
    created_at TEXT NOT NULL
);

-- Whole-task feedback from reflect
CREATE TABLE IF NOT EXISTS task_feedback (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT,
    overall_success INTEGER NOT NULL,
    tool_highlights TEXT NOT NULL DEFAULT '[]',
    tool_pain_points TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
/// A fragment without an embedding simply has no row here.
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS fragments_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[1536]
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
