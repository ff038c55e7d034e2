use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA busy_timeout = 5000;
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS change_groups (
    group_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id BLOB NOT NULL CHECK (length(session_id) = 16),
    source_id BLOB NOT NULL CHECK (length(source_id) = 16),
    name TEXT NOT NULL,
    owner TEXT,
    comment TEXT NOT NULL DEFAULT '',
    change_time TEXT NOT NULL,
    execution_order INTEGER NOT NULL,
    status TEXT NOT NULL,
    contains_backlogged INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('now','subsec') * 1000 AS INTEGER))
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_groups_order ON change_groups (session_id, execution_order);
CREATE UNIQUE INDEX IF NOT EXISTS idx_groups_completed_name
    ON change_groups (session_id, source_id, name) WHERE status = 'complete';
CREATE INDEX IF NOT EXISTS idx_groups_status ON change_groups (session_id, status, execution_order);
CREATE INDEX IF NOT EXISTS idx_groups_name ON change_groups (session_id, source_id, name);

CREATE TABLE IF NOT EXISTS change_actions (
    action_id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id INTEGER NOT NULL REFERENCES change_groups (group_id),
    action_order INTEGER NOT NULL,
    kind TEXT NOT NULL,
    path TEXT NOT NULL COLLATE NOCASE,
    from_path TEXT COLLATE NOCASE,
    content_type TEXT NOT NULL DEFAULT '',
    item TEXT NOT NULL DEFAULT '',
    version TEXT,
    translated_path TEXT,
    status TEXT NOT NULL,
    conflicted INTEGER NOT NULL DEFAULT 0,
    fingerprint BLOB NOT NULL CHECK (length(fingerprint) = 32)
);
CREATE INDEX IF NOT EXISTS idx_actions_group ON change_actions (group_id, action_order);
CREATE INDEX IF NOT EXISTS idx_actions_path ON change_actions (path);
CREATE INDEX IF NOT EXISTS idx_actions_from_path ON change_actions (from_path) WHERE from_path IS NOT NULL;

CREATE TABLE IF NOT EXISTS conflicts (
    conflict_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id BLOB NOT NULL CHECK (length(session_id) = 16),
    source_id BLOB NOT NULL CHECK (length(source_id) = 16),
    conflict_type TEXT NOT NULL,
    target_kind TEXT NOT NULL,
    target_id INTEGER NOT NULL,
    group_id INTEGER,
    scope_hint TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT '',
    fingerprint BLOB CHECK (fingerprint IS NULL OR length(fingerprint) = 32),
    status TEXT NOT NULL,
    resolved_by_rule INTEGER REFERENCES resolution_rules (rule_id),
    resolved_by TEXT,
    outcome BLOB,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conflicts_target ON conflicts (target_kind, target_id, conflict_type);
CREATE INDEX IF NOT EXISTS idx_conflicts_status ON conflicts (session_id, status);
CREATE INDEX IF NOT EXISTS idx_conflicts_group ON conflicts (group_id) WHERE group_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS resolution_rules (
    rule_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id BLOB NOT NULL CHECK (length(session_id) = 16),
    conflict_type TEXT NOT NULL,
    scope TEXT NOT NULL,
    action TEXT NOT NULL,
    details TEXT,
    data BLOB NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rules_type ON resolution_rules (session_id, conflict_type);

CREATE TABLE IF NOT EXISTS high_water_marks (
    session_id BLOB NOT NULL CHECK (length(session_id) = 16),
    source_id BLOB NOT NULL CHECK (length(source_id) = 16),
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('now','subsec') * 1000 AS INTEGER)),
    PRIMARY KEY (session_id, source_id, name)
);

CREATE TABLE IF NOT EXISTS conversion_history (
    session_id BLOB NOT NULL CHECK (length(session_id) = 16),
    source_id BLOB NOT NULL CHECK (length(source_id) = 16),
    source_change TEXT NOT NULL,
    peer_source_id BLOB NOT NULL CHECK (length(peer_source_id) = 16),
    peer_change TEXT NOT NULL,
    recorded_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('now','subsec') * 1000 AS INTEGER)),
    PRIMARY KEY (session_id, source_id, source_change)
);
CREATE INDEX IF NOT EXISTS idx_conversion_peer ON conversion_history (session_id, peer_source_id, peer_change);

CREATE TABLE IF NOT EXISTS link_change_groups (
    group_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id BLOB NOT NULL CHECK (length(session_id) = 16),
    source_id BLOB NOT NULL CHECK (length(source_id) = 16),
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    contains_conflicted INTEGER NOT NULL DEFAULT 0,
    age INTEGER NOT NULL DEFAULT 0,
    retries_at_age INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_link_groups_status ON link_change_groups (session_id, status, group_id);

CREATE TABLE IF NOT EXISTS link_change_actions (
    action_id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id INTEGER NOT NULL REFERENCES link_change_groups (group_id),
    kind TEXT NOT NULL,
    source_artifact_id TEXT NOT NULL,
    source_uri TEXT NOT NULL COLLATE NOCASE,
    target_uri TEXT NOT NULL COLLATE NOCASE,
    link_type TEXT NOT NULL COLLATE NOCASE,
    comment TEXT NOT NULL DEFAULT '',
    is_locked INTEGER NOT NULL DEFAULT 0,
    target_kind TEXT NOT NULL,
    status TEXT NOT NULL,
    conflicted INTEGER NOT NULL DEFAULT 0,
    server_link_change_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_link_actions_group ON link_change_actions (group_id, action_id);
CREATE INDEX IF NOT EXISTS idx_link_actions_link ON link_change_actions (source_uri, target_uri, link_type);
CREATE INDEX IF NOT EXISTS idx_link_actions_server ON link_change_actions (server_link_change_id)
    WHERE server_link_change_id IS NOT NULL;
";
