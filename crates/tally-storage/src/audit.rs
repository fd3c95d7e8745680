//! Action log sinks.
//!
//! Every sink is best-effort: a failure to record an action is logged and
//! swallowed so it never aborts the operation being audited.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use tally_core::error::{Result, TallyError};

use crate::db::Database;

/// Append-only audit sink.
pub trait AuditLog: Send + Sync {
    fn log(&self, agent: &str, action: &str, details: &Value);
}

/// A recorded action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub agent: String,
    pub action: String,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

/// Audit sink writing to the `action_log` SQLite table.
#[derive(Debug)]
pub struct SqliteAuditLog {
    db: Database,
}

impl SqliteAuditLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert one record and return its id.
    pub fn record(&self, agent: &str, action: &str, details: &Value) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let details_json = serde_json::to_string(details)?;
        let timestamp = Utc::now().timestamp_millis();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO action_log (id, agent, action, details, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), agent, action, details_json, timestamp],
            )
            .map_err(|e| TallyError::Storage(format!("Failed to insert action: {}", e)))?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Most recent records first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, agent, action, details, timestamp FROM action_log
                     ORDER BY timestamp DESC, rowid DESC LIMIT ?1",
                )
                .map_err(|e| TallyError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })
                .map_err(|e| TallyError::Storage(e.to_string()))?;

            let mut records = Vec::new();
            for row in rows {
                let (id, agent, action, details, millis) =
                    row.map_err(|e| TallyError::Storage(e.to_string()))?;
                records.push(AuditRecord {
                    id: Uuid::parse_str(&id)
                        .map_err(|e| TallyError::Storage(format!("Bad action id: {}", e)))?,
                    agent,
                    action,
                    details: serde_json::from_str(&details)?,
                    timestamp: Utc
                        .timestamp_millis_opt(millis)
                        .single()
                        .unwrap_or_default(),
                });
            }
            Ok(records)
        })
    }
}

impl AuditLog for SqliteAuditLog {
    fn log(&self, agent: &str, action: &str, details: &Value) {
        match self.record(agent, action, details) {
            Ok(_) => info!(agent, action, "Action logged"),
            Err(e) => warn!(agent, action, error = %e, "Failed to record action"),
        }
    }
}

/// Audit sink that only emits a tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn log(&self, agent: &str, action: &str, details: &Value) {
        info!(agent, action, details = %details, "Action logged");
    }
}

/// Audit sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditLog;

impl AuditLog for NoopAuditLog {
    fn log(&self, _agent: &str, _action: &str, _details: &Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_and_read_back() {
        let log = SqliteAuditLog::new(Database::in_memory().unwrap());
        log.record("RAG", "Indexed file", &json!({"file": "a.json", "rows_indexed": 3}))
            .unwrap();
        log.record("RAG", "Retrieved and answered", &json!({"query": "atm", "top_k": 5}))
            .unwrap();

        let records = log.recent(10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, "Retrieved and answered");
        assert_eq!(records[1].details["rows_indexed"], json!(3));
        assert!(records.iter().all(|r| r.agent == "RAG"));
    }

    #[test]
    fn test_recent_respects_limit() {
        let log = SqliteAuditLog::new(Database::in_memory().unwrap());
        for i in 0..5 {
            log.log("RAG", "Indexed file", &json!({ "n": i }));
        }
        assert_eq!(log.recent(3).unwrap().len(), 3);
    }

    #[test]
    fn test_trait_objects_do_not_panic() {
        let sinks: Vec<Box<dyn AuditLog>> = vec![
            Box::new(TracingAuditLog),
            Box::new(NoopAuditLog),
            Box::new(SqliteAuditLog::new(Database::in_memory().unwrap())),
        ];
        for sink in &sinks {
            sink.log("RAG", "noop", &json!({}));
        }
    }
}
