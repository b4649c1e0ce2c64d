//! SQLite database for normalized unit records
//!
//! ## Tables
//!
//! - `units` - one row per unit with its DAG metrics
//! - `parenthoods`, `unit_witnesses`, `unit_authors` - DAG structure and authorship
//! - `messages` and per-app tables (`polls`, `votes`, `attestations`, `assets`, ...)
//! - `inputs`, `outputs`, commission outputs
//!
//! All writes happen inside a transaction opened by the writer; readers share
//! the same connection behind a mutex.

pub mod query;
pub mod schema;
pub mod stats;
pub mod units;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::WriterError;

/// SQLite database holding the relational copy of the DAG
pub struct LedgerDb {
    conn: Mutex<Connection>,
}

impl LedgerDb {
    /// Open or create the ledger database
    pub fn open(path: &Path) -> Result<Self, WriterError> {
        info!("Opening SQLite database at {:?}", path);

        let conn = Connection::open(path)?;

        // WAL keeps readers unblocked while a commit is in flight
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, WriterError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), WriterError> {
        self.with_conn(schema::init_schema)
    }

    /// Run a read against the shared connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, WriterError>
    where
        F: FnOnce(&Connection) -> Result<T, WriterError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| WriterError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, WriterError>
    where
        F: FnOnce(&mut Connection) -> Result<T, WriterError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| WriterError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Row counts of the main tables
    pub fn stats(&self) -> Result<DbStats, WriterError> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64, WriterError> {
                let n: i64 =
                    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
                Ok(n as u64)
            };

            Ok(DbStats {
                unit_count: count("units")?,
                free_unit_count: conn.query_row(
                    "SELECT COUNT(*) FROM units WHERE is_free=1",
                    [],
                    |row| row.get::<_, i64>(0),
                )? as u64,
                stable_unit_count: conn.query_row(
                    "SELECT COUNT(*) FROM units WHERE is_stable=1",
                    [],
                    |row| row.get::<_, i64>(0),
                )? as u64,
                message_count: count("messages")?,
                output_count: count("outputs")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub unit_count: u64,
    pub free_unit_count: u64,
    pub stable_unit_count: u64,
    pub message_count: u64,
    pub output_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stats() {
        let db = LedgerDb::open_in_memory().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.unit_count, 0);
        assert_eq!(stats.output_count, 0);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db = LedgerDb::open(&dir.path().join("ledger.sqlite")).unwrap();
        drop(db);
        // Reopening finds the existing schema
        let db = LedgerDb::open(&dir.path().join("ledger.sqlite")).unwrap();
        assert_eq!(db.stats().unwrap().unit_count, 0);
    }
}
