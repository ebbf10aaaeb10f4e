//! SQLite DDL for the call record store.

use rusqlite::Connection;

/// Bumped when a migration is added.
pub(crate) const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS calls (
    call_id        TEXT PRIMARY KEY,
    direction      TEXT NOT NULL,
    caller         TEXT NOT NULL,
    called         TEXT NOT NULL,
    scheme_id      TEXT NOT NULL,
    assistant_id   TEXT,
    status         TEXT NOT NULL,
    started_at     TEXT NOT NULL,     -- RFC 3339
    answered_at    TEXT,
    ended_at       TEXT,
    recording_path TEXT
);

CREATE INDEX IF NOT EXISTS idx_calls_status ON calls(status);

CREATE TABLE IF NOT EXISTS voicemails (
    id             TEXT PRIMARY KEY,
    call_id        TEXT NOT NULL REFERENCES calls(call_id),
    caller         TEXT NOT NULL,
    called         TEXT NOT NULL,
    recording_path TEXT,
    duration_ms    INTEGER NOT NULL DEFAULT 0,
    transcript     TEXT NOT NULL DEFAULT '',
    created_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS turns (
    call_id        TEXT NOT NULL REFERENCES calls(call_id),
    turn_index     INTEGER NOT NULL,
    user_text      TEXT NOT NULL,
    assistant_text TEXT NOT NULL,
    interrupted    INTEGER NOT NULL DEFAULT 0,
    created_at     TEXT NOT NULL,
    PRIMARY KEY (call_id, turn_index)
);
"#;

pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        rusqlite::params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_meta WHERE key = 'schema_version'")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().ok())
        }
        None => Ok(None),
    }
}
