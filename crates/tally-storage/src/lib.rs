//! Tally storage crate - metadata store, audit log and durable file writes.
//!
//! The metadata store is a JSON-lines file kept fully in memory. The audit
//! log is an SQLite table behind a WAL-mode connection with migrations.

pub mod atomic;
pub mod audit;
pub mod db;
pub mod metadata;
pub mod migrations;

pub use atomic::write_atomic;
pub use audit::{AuditLog, AuditRecord, NoopAuditLog, SqliteAuditLog, TracingAuditLog};
pub use db::Database;
pub use metadata::{JsonlMetadataStore, MetadataStore};
