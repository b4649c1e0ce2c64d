//! Unit property readers
//!
//! These run on whatever connection or transaction the caller holds, so the
//! metrics engine sees the rows written earlier in the same commit.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::dag_cache::UnitProps;
use crate::db::query::{Query, SqlParam};
use crate::error::WriterError;
use crate::sql_params;
use crate::validation::Sequence;

/// Props that never change once a unit's metrics are set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticUnitProps {
    pub level: Option<u64>,
    pub witnessed_level: Option<u64>,
    pub best_parent_unit: Option<String>,
    pub witness_list_unit: Option<String>,
}

pub fn read_static_unit_props(conn: &Connection, unit: &str) -> Result<StaticUnitProps, WriterError> {
    conn.query_row(
        "SELECT level, witnessed_level, best_parent_unit, witness_list_unit FROM units WHERE unit=?",
        params![unit],
        |row| {
            Ok(StaticUnitProps {
                level: row.get::<_, Option<i64>>(0)?.map(|l| l as u64),
                witnessed_level: row.get::<_, Option<i64>>(1)?.map(|l| l as u64),
                best_parent_unit: row.get(2)?,
                witness_list_unit: row.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| WriterError::Inconsistency(format!("unit {} not found", unit)))
}

/// Author addresses of a unit, sorted
pub fn read_unit_authors(conn: &Connection, unit: &str) -> Result<Vec<String>, WriterError> {
    let mut stmt = conn.prepare("SELECT address FROM unit_authors WHERE unit=? ORDER BY address")?;
    let authors = stmt
        .query_map(params![unit], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(authors)
}

/// Witnesses declared by a witness list unit, sorted
pub fn read_witness_list(conn: &Connection, witness_list_unit: &str) -> Result<Vec<String>, WriterError> {
    let mut stmt = conn.prepare("SELECT address FROM unit_witnesses WHERE unit=? ORDER BY address")?;
    let witnesses = stmt
        .query_map(params![witness_list_unit], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    if witnesses.is_empty() {
        return Err(WriterError::Inconsistency(format!(
            "witness list of {} not found",
            witness_list_unit
        )));
    }
    Ok(witnesses)
}

/// Best parent candidates of `unit`, best first.
///
/// A parent qualifies when it uses the same witness list unit or shares at
/// least `min_shared_witnesses` witnesses with the new unit. Ranking:
/// witnessed level desc, distance from witnessed level asc, unit asc.
pub fn select_best_parent(
    conn: &Connection,
    unit: &str,
    parent_units: &[String],
    witness_list_unit: Option<&str>,
    min_shared_witnesses: usize,
) -> Result<Vec<String>, WriterError> {
    let query = Query::new(
        r#"
        SELECT unit
        FROM units AS parent_units
        WHERE unit IN(?)
            AND (witness_list_unit=? OR (
                SELECT COUNT(*)
                FROM unit_witnesses
                JOIN unit_witnesses AS parent_witnesses USING(address)
                WHERE parent_witnesses.unit IN(parent_units.unit, parent_units.witness_list_unit)
                    AND unit_witnesses.unit IN(?, ?)
            )>=?)
        ORDER BY witnessed_level DESC,
            level-witnessed_level ASC,
            unit ASC
        LIMIT 1
        "#,
        sql_params![
            parent_units,
            witness_list_unit,
            unit,
            witness_list_unit,
            min_shared_witnesses
        ],
    );
    let (sql, values) = query.expand()?;
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(values), |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}

/// `MAX(level)` over the given units, `None` when none of them has a level
pub fn max_level(conn: &Connection, units: &[String]) -> Result<Option<u64>, WriterError> {
    let query = Query::new(
        "SELECT MAX(level) FROM units WHERE unit IN(?)",
        vec![SqlParam::from(units)],
    );
    let (sql, values) = query.expand()?;
    let max: Option<i64> =
        conn.query_row(&sql, rusqlite::params_from_iter(values), |row| row.get(0))?;
    Ok(max.map(|l| l as u64))
}

/// Output spent by a transfer input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrcOutput {
    pub address: String,
    pub denomination: u32,
    pub asset: Option<String>,
}

pub fn read_src_outputs(
    conn: &Connection,
    unit: &str,
    message_index: u32,
    output_index: u32,
) -> Result<Vec<SrcOutput>, WriterError> {
    let mut stmt = conn.prepare(
        "SELECT address, denomination, asset FROM outputs WHERE unit=? AND message_index=? AND output_index=?",
    )?;
    let outputs = stmt
        .query_map(params![unit, message_index, output_index], |row| {
            Ok(SrcOutput {
                address: row.get(0)?,
                denomination: row.get(1)?,
                asset: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(outputs)
}

// =============================================================================
// Cache rebuild
// =============================================================================

const UNIT_PROPS_COLUMNS: &str = "unit, level, witnessed_level, best_parent_unit, \
    latest_included_mc_index, main_chain_index, is_on_main_chain, is_free, is_stable, \
    timestamp, headers_commission, payload_commission, sequence, \
    COALESCE(witness_list_unit, unit) AS witness_list_unit";

fn unit_props_from_row(row: &Row<'_>) -> Result<(UnitProps, String), rusqlite::Error> {
    let opt_u64 = |idx: usize| -> Result<Option<u64>, rusqlite::Error> {
        Ok(row.get::<_, Option<i64>>(idx)?.map(|v| v as u64))
    };
    let sequence: String = row.get(12)?;
    let props = UnitProps {
        unit: row.get(0)?,
        level: opt_u64(1)?,
        witnessed_level: opt_u64(2)?,
        best_parent_unit: row.get(3)?,
        latest_included_mc_index: opt_u64(4)?,
        main_chain_index: opt_u64(5)?,
        is_on_main_chain: row.get(6)?,
        is_free: row.get(7)?,
        is_stable: row.get(8)?,
        timestamp: row.get::<_, i64>(9)? as u64,
        headers_commission: row.get::<_, i64>(10)? as u64,
        payload_commission: row.get::<_, i64>(11)? as u64,
        sequence: Sequence::Good,
        author_addresses: Vec::new(),
        witness_list_unit: row.get(13)?,
        parent_units: Vec::new(),
        earned_headers_commission_recipients: None,
    };
    Ok((props, sequence))
}

fn read_unit_props_where(
    conn: &Connection,
    condition: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<UnitProps>, WriterError> {
    let sql = format!("SELECT {} FROM units WHERE {} ORDER BY unit", UNIT_PROPS_COLUMNS, condition);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, unit_props_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut result = Vec::with_capacity(rows.len());
    for (mut props, sequence) in rows {
        props.sequence = sequence
            .parse()
            .map_err(|e: String| WriterError::Inconsistency(format!("unit {}: {}", props.unit, e)))?;
        props.author_addresses = read_unit_authors(conn, &props.unit)?;
        props.parent_units = read_parent_units(conn, &props.unit)?;
        props.earned_headers_commission_recipients =
            read_earned_headers_commission_recipients(conn, &props.unit)?;
        result.push(props);
    }
    Ok(result)
}

pub fn read_parent_units(conn: &Connection, unit: &str) -> Result<Vec<String>, WriterError> {
    let mut stmt =
        conn.prepare("SELECT parent_unit FROM parenthoods WHERE child_unit=? ORDER BY parent_unit")?;
    let parents = stmt
        .query_map(params![unit], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(parents)
}

fn read_earned_headers_commission_recipients(
    conn: &Connection,
    unit: &str,
) -> Result<Option<BTreeMap<String, u32>>, WriterError> {
    let mut stmt = conn.prepare(
        "SELECT address, earned_headers_commission_share FROM earned_headers_commission_recipients WHERE unit=?",
    )?;
    let shares = stmt
        .query_map(params![unit], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<BTreeMap<String, u32>, _>>()?;
    Ok(if shares.is_empty() { None } else { Some(shares) })
}

/// All units not yet stable
pub fn read_unstable_units(conn: &Connection) -> Result<Vec<UnitProps>, WriterError> {
    read_unit_props_where(conn, "is_stable=0", &[])
}

/// Stable units on the last `depth` main chain indexes
pub fn read_recent_stable_units(conn: &Connection, depth: u64) -> Result<Vec<UnitProps>, WriterError> {
    let last_stable_mci: Option<i64> = conn.query_row(
        "SELECT MAX(main_chain_index) FROM units WHERE is_stable=1",
        [],
        |row| row.get(0),
    )?;
    let Some(last_stable_mci) = last_stable_mci else {
        return Ok(Vec::new());
    };
    let from_mci = last_stable_mci - depth as i64;
    read_unit_props_where(conn, "is_stable=1 AND main_chain_index>=?", &[&from_mci])
}

/// Pending hash tree balls, ball to unit
pub fn read_hash_tree_balls(conn: &Connection) -> Result<Vec<(String, String)>, WriterError> {
    let mut stmt = conn.prepare("SELECT ball, unit FROM hash_tree_balls")?;
    let balls = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(balls)
}

pub fn unit_exists(conn: &Connection, unit: &str) -> Result<bool, WriterError> {
    let found = conn
        .query_row("SELECT 1 FROM units WHERE unit=?", params![unit], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}
