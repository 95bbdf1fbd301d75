//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: pending record queue and customer identity
    r#"
    -- AUTOINCREMENT keeps ids unique for the lifetime of the file,
    -- so a deleted id is never handed out again.
    CREATE TABLE IF NOT EXISTS pending_records (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        kind             TEXT NOT NULL,
        event_type       TEXT,
        project_token    TEXT NOT NULL,
        -- Delivery target at creation time; NULL falls back to the configured project
        base_url         TEXT,
        authorization    TEXT,
        customer_ids     JSON NOT NULL,
        properties       JSON NOT NULL,
        timestamp        REAL NOT NULL,
        retries          INTEGER NOT NULL DEFAULT 0,
        created_at       DATETIME NOT NULL
    );

    -- Single row: the customer records are attributed to
    CREATE TABLE IF NOT EXISTS customer (
        id               INTEGER PRIMARY KEY CHECK (id = 1),
        customer_ids     JSON NOT NULL,
        push_token       TEXT,
        updated_at       DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_pending_records_kind ON pending_records(kind, id);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
