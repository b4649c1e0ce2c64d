//! Query planner statistics refresh
//!
//! SQLite picks bad plans for the DAG queries until `ANALYZE` has seen a
//! representative `units` table. After every `REFRESH_EVERY` committed units
//! we re-analyze once the table has doubled since the last run, and stop
//! once it is too large for `ANALYZE` to be cheap.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::WriterError;

const REFRESH_EVERY: u64 = 100;

pub struct PlannerStats {
    count_writes: AtomicU64,
    analyzed_units: AtomicU64,
    too_big: AtomicBool,
    max_units: u64,
}

impl PlannerStats {
    pub fn new(max_units: u64) -> Self {
        Self {
            count_writes: AtomicU64::new(0),
            analyzed_units: AtomicU64::new(0),
            too_big: AtomicBool::new(false),
            max_units,
        }
    }

    pub fn count_writes(&self) -> u64 {
        self.count_writes.load(Ordering::Relaxed)
    }

    /// Record one committed unit; returns true when `ANALYZE` ran
    pub fn record_write(&self, conn: &Connection) -> Result<bool, WriterError> {
        let count_writes = self.count_writes.fetch_add(1, Ordering::Relaxed) + 1;
        if count_writes % REFRESH_EVERY != 0 || self.too_big.load(Ordering::Relaxed) {
            return Ok(false);
        }

        let count_units: Option<i64> =
            conn.query_row("SELECT MAX(rowid) FROM units", [], |row| row.get(0))?;
        let count_units = count_units.unwrap_or(0) as u64;
        if count_units > self.max_units {
            info!(count_units, "Units table too big, no more planner stats refreshes");
            self.too_big.store(true, Ordering::Relaxed);
            return Ok(false);
        }

        let analyzed = self.count_of_analyzed_units(conn)?;
        debug!(count_units, analyzed, "Checking planner stats");
        if count_units < 2 * analyzed {
            return Ok(false);
        }

        self.analyzed_units.store(count_units, Ordering::Relaxed);
        conn.execute_batch("ANALYZE; ANALYZE sqlite_master;")?;
        info!(count_units, "SQLite planner stats updated");
        Ok(true)
    }

    fn count_of_analyzed_units(&self, conn: &Connection) -> Result<u64, WriterError> {
        let cached = self.analyzed_units.load(Ordering::Relaxed);
        if cached > 0 {
            return Ok(cached);
        }

        let has_stat_table = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name='sqlite_stat1'",
                [],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !has_stat_table {
            return Ok(0);
        }

        let stat: Option<String> = conn
            .query_row(
                "SELECT stat FROM sqlite_stat1 WHERE tbl='units' AND idx='sqlite_autoindex_units_1'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(stat) = stat else {
            debug!("No stat for sqlite_autoindex_units_1");
            return Ok(0);
        };

        // First number of the stat string is the row count
        Ok(stat
            .split(' ')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    fn insert_units(conn: &Connection, from: usize, to: usize) {
        for i in from..to {
            conn.execute(
                "INSERT INTO units (unit, version, alt) VALUES (?, '1.0', '1')",
                [format!("U{}", i)],
            )
            .unwrap();
        }
    }

    #[test]
    fn test_analyze_runs_every_hundred_writes_when_table_doubled() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let stats = PlannerStats::new(500_000);

        insert_units(&conn, 0, 100);
        let ran: Vec<bool> = (0..100).map(|_| stats.record_write(&conn).unwrap()).collect();
        assert_eq!(ran.iter().filter(|r| **r).count(), 1);
        assert!(ran[99]);

        // 150 units is less than twice the 100 analyzed
        insert_units(&conn, 100, 150);
        let ran: Vec<bool> = (0..100).map(|_| stats.record_write(&conn).unwrap()).collect();
        assert!(!ran.iter().any(|r| *r));
        assert_eq!(stats.count_writes(), 200);
    }

    #[test]
    fn test_stops_when_too_big() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let stats = PlannerStats::new(10);
        insert_units(&conn, 0, 20);
        for _ in 0..99 {
            stats.record_write(&conn).unwrap();
        }
        assert!(!stats.record_write(&conn).unwrap());
        assert!(stats.too_big.load(Ordering::Relaxed));
    }
}
