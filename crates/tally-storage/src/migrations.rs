//! Database schema migrations for the audit log.

use rusqlite::Connection;
use tracing::info;

use tally_core::error::TallyError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), TallyError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| TallyError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| TallyError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: action_log");
    }

    Ok(())
}

/// Version 1: append-only action log.
fn apply_v1(conn: &Connection) -> Result<(), TallyError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS action_log (
            id          TEXT PRIMARY KEY NOT NULL,
            agent       TEXT NOT NULL,
            action      TEXT NOT NULL,
            details     TEXT NOT NULL DEFAULT '{}',
            timestamp   INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_action_log_timestamp
            ON action_log (timestamp DESC);

        CREATE INDEX IF NOT EXISTS idx_action_log_agent
            ON action_log (agent, timestamp DESC);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'action_log');
        ",
    )
    .map_err(|e| TallyError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}
