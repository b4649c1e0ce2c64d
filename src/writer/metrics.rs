//! DAG metrics engine
//!
//! Recomputes best parent, level and witnessed level from the rows already
//! committed for the ancestors and compares them with what the validator
//! derived. A disagreement means the two disagree about the DAG, so by
//! default the commit fails.

use std::fmt::Display;

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::config::{ErrorPolicy, ProtocolConstants};
use crate::db::query::Query;
use crate::db::units;
use crate::error::{Metric, WriterError};
use crate::events::EventBus;
use crate::joint::Unit;
use crate::sql_params;
use crate::validation::ValidationState;

/// Applies the configured policy to metric mismatches
pub struct MetricsChecker<'a> {
    pub policy: ErrorPolicy,
    pub constants: &'a ProtocolConstants,
    pub events: &'a EventBus,
    /// Messages of mismatches that were reported instead of failing
    pub reported: Vec<String>,
}

impl<'a> MetricsChecker<'a> {
    pub fn new(policy: ErrorPolicy, constants: &'a ProtocolConstants, events: &'a EventBus) -> Self {
        Self {
            policy,
            constants,
            events,
            reported: Vec::new(),
        }
    }

    fn check<T: PartialEq + Display>(
        &mut self,
        unit: &str,
        metric: Metric,
        validation: Option<T>,
        writer: T,
    ) -> Result<(), WriterError> {
        if validation.as_ref() == Some(&writer) {
            return Ok(());
        }
        let err = WriterError::ConsensusMismatch {
            metric,
            validation: validation.map_or_else(|| "none".to_string(), |v| v.to_string()),
            writer: writer.to_string(),
        };
        match self.policy {
            ErrorPolicy::Fatal => Err(err),
            ErrorPolicy::Report => {
                let message = err.to_string();
                self.events.emit_nonfatal(unit, message.clone());
                self.reported.push(message);
                Ok(())
            }
        }
    }

    /// Choose the best parent among witness-compatible parents
    pub fn update_best_parent(
        &mut self,
        conn: &Connection,
        unit: &Unit,
        state: &ValidationState,
    ) -> Result<String, WriterError> {
        let rows = units::select_best_parent(
            conn,
            &unit.unit,
            &unit.parent_units,
            unit.witness_list_unit.as_deref(),
            self.constants.min_shared_witnesses(),
        )?;
        let [best_parent] = rows.as_slice() else {
            return Err(WriterError::BestParentNotFound(unit.unit.clone()));
        };
        self.check(
            &unit.unit,
            Metric::BestParent,
            state.best_parent_unit.as_deref(),
            best_parent.as_str(),
        )?;

        Query::new(
            "UPDATE units SET best_parent_unit=? WHERE unit=?",
            sql_params![best_parent, &unit.unit],
        )
        .execute(conn)?;
        debug!(unit = %unit.unit, best_parent = %best_parent, "Best parent set");
        Ok(best_parent.clone())
    }

    /// Level is one above the highest parent.
    ///
    /// The parent maximum is read twice, through SQL and through each
    /// parent's props, and the two must agree. With trusted metrics only
    /// the props read is done.
    pub fn update_level(
        &mut self,
        conn: &Connection,
        unit: &Unit,
        state: &ValidationState,
        trust_validator_metrics: bool,
    ) -> Result<u64, WriterError> {
        let mut props_max = 0;
        for parent in &unit.parent_units {
            let props = units::read_static_unit_props(conn, parent)?;
            if let Some(level) = props.level {
                props_max = props_max.max(level);
            }
        }

        if !trust_validator_metrics {
            // SQL result on the validation side, props on the writer side
            let sql_max = units::max_level(conn, &unit.parent_units)?;
            self.check(&unit.unit, Metric::MaxLevel, sql_max, props_max)?;
        }

        let level = props_max + 1;
        if state.level.is_some() {
            self.check(&unit.unit, Metric::Level, state.level, level)?;
        }

        Query::new("UPDATE units SET level=? WHERE unit=?", sql_params![level, &unit.unit]).execute(conn)?;
        debug!(unit = %unit.unit, level, "Level set");
        Ok(level)
    }

    /// Level of the first unit on the best parent chain (starting at the
    /// best parent, excluding the unit itself) by which a majority of the
    /// unit's witnesses have authored.
    pub fn update_witnessed_level(
        &mut self,
        conn: &Connection,
        unit: &Unit,
        best_parent_unit: &str,
        state: &ValidationState,
    ) -> Result<u64, WriterError> {
        let witnesses = match &unit.witnesses {
            Some(witnesses) => witnesses.clone(),
            None => {
                let witness_list_unit = unit.witness_list_unit.as_deref().ok_or_else(|| {
                    WriterError::Inconsistency(format!("unit {} has no witness list", unit.unit))
                })?;
                units::read_witness_list(conn, witness_list_unit)?
            }
        };

        let witnessed_level = self.walk_best_parent_chain(conn, &witnesses, best_parent_unit)?;
        self.check(
            &unit.unit,
            Metric::WitnessedLevel,
            state.witnessed_level,
            witnessed_level,
        )?;

        Query::new(
            "UPDATE units SET witnessed_level=? WHERE unit=?",
            sql_params![witnessed_level, &unit.unit],
        )
        .execute(conn)?;
        debug!(unit = %unit.unit, witnessed_level, "Witnessed level set");
        Ok(witnessed_level)
    }

    fn walk_best_parent_chain(
        &self,
        conn: &Connection,
        witnesses: &[String],
        start_unit: &str,
    ) -> Result<u64, WriterError> {
        let mut collected: Vec<String> = Vec::new();
        let mut current = start_unit.to_string();
        loop {
            let props = units::read_static_unit_props(conn, &current)?;
            let level = props
                .level
                .ok_or_else(|| WriterError::Inconsistency(format!("null level of {}", current)))?;
            if level == 0 {
                return Ok(0);
            }

            for author in units::read_unit_authors(conn, &current)? {
                if witnesses.contains(&author) && !collected.contains(&author) {
                    collected.push(author);
                }
            }
            if collected.len() >= self.constants.majority_of_witnesses {
                return Ok(level);
            }

            current = props.best_parent_unit.ok_or_else(|| {
                WriterError::Inconsistency(format!("no best parent for non-genesis unit {}", current))
            })?;
        }
    }

    pub fn into_reported(self) -> Vec<String> {
        if !self.reported.is_empty() {
            warn!(count = self.reported.len(), "Metric mismatches reported and ignored");
        }
        self.reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;
    use crate::validation::Sequence;
    use rusqlite::params;
    use serde_json::json;

    const WITNESSES: [&str; 3] = ["W1", "W2", "W3"];

    fn constants() -> ProtocolConstants {
        ProtocolConstants {
            count_witnesses: 3,
            max_witness_list_mutations: 1,
            majority_of_witnesses: 2,
            ..ProtocolConstants::default()
        }
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        for w in WITNESSES {
            conn.execute(
                "INSERT INTO unit_witnesses (unit, address) VALUES ('G', ?)",
                params![w],
            )
            .unwrap();
        }
        conn
    }

    fn insert(conn: &Connection, unit: &str, level: u64, best_parent: Option<&str>, author: &str) {
        conn.execute(
            "INSERT INTO units (unit, version, alt, witness_list_unit, level, witnessed_level, best_parent_unit)
             VALUES (?, '1.0', '1', 'G', ?, 0, ?)",
            params![unit, level as i64, best_parent],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO unit_authors (unit, address) VALUES (?, ?)",
            params![unit, author],
        )
        .unwrap();
    }

    fn new_unit(unit: &str, parents: &[&str]) -> Unit {
        serde_json::from_value(json!({
            "unit": unit, "version": "1.0", "alt": "1", "witness_list_unit": "G",
            "parent_units": parents, "authors": [{"address": "USER"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_witnessed_level_is_level_where_majority_appears() {
        let conn = setup();
        let constants = constants();
        let events = EventBus::new();
        insert(&conn, "G", 0, None, "W1");
        insert(&conn, "A", 1, Some("G"), "W1");
        insert(&conn, "B", 2, Some("A"), "USER");
        insert(&conn, "C", 3, Some("B"), "W2");
        insert(&conn, "D", 4, Some("C"), "W2");

        let unit = new_unit("NEW", &["D"]);
        conn.execute(
            "INSERT INTO units (unit, version, alt, witness_list_unit) VALUES ('NEW', '1.0', '1', 'G')",
            [],
        )
        .unwrap();
        let mut state = ValidationState::new(Sequence::Good);
        state.witnessed_level = Some(1);

        // D(W2), C(W2), B, A(W1): majority of 2 reached at A
        let mut checker = MetricsChecker::new(ErrorPolicy::Fatal, &constants, &events);
        let wl = checker.update_witnessed_level(&conn, &unit, "D", &state).unwrap();
        assert_eq!(wl, 1);
    }

    #[test]
    fn test_level_mismatch_is_fatal_or_reported() {
        let conn = setup();
        let constants = constants();
        let events = EventBus::new();
        insert(&conn, "G", 0, None, "W1");
        insert(&conn, "A", 1, Some("G"), "W1");
        insert(&conn, "B", 3, Some("A"), "W2");
        conn.execute(
            "INSERT INTO units (unit, version, alt, witness_list_unit) VALUES ('NEW', '1.0', '1', 'G')",
            [],
        )
        .unwrap();

        let unit = new_unit("NEW", &["A", "B"]);
        let mut state = ValidationState::new(Sequence::Good);
        state.level = Some(3);

        let mut fatal = MetricsChecker::new(ErrorPolicy::Fatal, &constants, &events);
        let err = fatal.update_level(&conn, &unit, &state, false).unwrap_err();
        assert_eq!(err.to_string(), "different levels, validation: 3, writer: 4");

        let mut receiver = events.subscribe();
        let mut report = MetricsChecker::new(ErrorPolicy::Report, &constants, &events);
        assert_eq!(report.update_level(&conn, &unit, &state, false).unwrap(), 4);
        assert_eq!(report.into_reported().len(), 1);
        assert!(matches!(
            receiver.try_recv(),
            Ok(crate::events::WriterEvent::NonfatalError { .. })
        ));
    }

    #[test]
    fn test_best_parent_tie_breaks_on_unit() {
        let conn = setup();
        let constants = constants();
        let events = EventBus::new();
        insert(&conn, "G", 0, None, "W1");
        insert(&conn, "P2", 1, Some("G"), "W1");
        insert(&conn, "P1", 1, Some("G"), "W2");
        conn.execute(
            "INSERT INTO units (unit, version, alt, witness_list_unit) VALUES ('NEW', '1.0', '1', 'G')",
            [],
        )
        .unwrap();

        let unit = new_unit("NEW", &["P1", "P2"]);
        let mut state = ValidationState::new(Sequence::Good);
        state.best_parent_unit = Some("P1".into());

        let mut checker = MetricsChecker::new(ErrorPolicy::Fatal, &constants, &events);
        assert_eq!(checker.update_best_parent(&conn, &unit, &state).unwrap(), "P1");
        let stored: String = conn
            .query_row("SELECT best_parent_unit FROM units WHERE unit='NEW'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stored, "P1");
    }
}
