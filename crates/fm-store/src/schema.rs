use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    // Checkpoint every ~400KB instead of the default ~4MB
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // Stale WAL from a crashed process. In-memory databases fail this, which is fine.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::debug!("startup WAL checkpoint complete");
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS nodes (
            id              TEXT PRIMARY KEY,
            category        TEXT NOT NULL,
            x               REAL NOT NULL,
            y               REAL NOT NULL,
            z               REAL NOT NULL,
            act_resting     REAL NOT NULL,
            act_threshold   REAL NOT NULL,
            act_current     REAL NOT NULL,
            confidence      REAL NOT NULL,
            resonance       REAL NOT NULL DEFAULT 0,
            access_history  TEXT NOT NULL DEFAULT '[]',
            last_adapted    INTEGER NOT NULL DEFAULT 0,
            created_at      INTEGER NOT NULL DEFAULT 0,
            content         TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_nodes_category ON nodes(category);
        ",
    )?;

    let stored: Option<i64> = conn
        .query_row(
            "SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .ok();
    if let Some(version) = stored
        && version > SCHEMA_VERSION
    {
        tracing::warn!(version, supported = SCHEMA_VERSION, "database written by a newer schema");
    }

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}
