//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::WriterError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), WriterError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, WriterError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), WriterError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), WriterError> {
    conn.execute_batch(UNITS_SCHEMA)?;
    conn.execute_batch(MESSAGES_SCHEMA)?;
    conn.execute_batch(PAYMENTS_SCHEMA)?;
    conn.execute_batch(INDEXES_SCHEMA)?;
    Ok(())
}

/// Units, DAG structure, authorship
const UNITS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS units (
    unit TEXT PRIMARY KEY NOT NULL,
    creation_date TEXT NOT NULL DEFAULT (datetime('now')),
    version TEXT NOT NULL,
    alt TEXT NOT NULL,
    witness_list_unit TEXT,
    last_ball_unit TEXT,
    content_hash TEXT,
    headers_commission INTEGER NOT NULL DEFAULT 0,
    payload_commission INTEGER NOT NULL DEFAULT 0,
    is_free INTEGER NOT NULL DEFAULT 1,
    is_on_main_chain INTEGER NOT NULL DEFAULT 0,
    main_chain_index INTEGER,
    latest_included_mc_index INTEGER,
    level INTEGER,
    witnessed_level INTEGER,
    is_stable INTEGER NOT NULL DEFAULT 0,
    sequence TEXT NOT NULL DEFAULT 'good',
    best_parent_unit TEXT,
    timestamp INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS balls (
    ball TEXT PRIMARY KEY NOT NULL,
    unit TEXT NOT NULL UNIQUE,
    creation_date TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Balls received in a hash tree before their units arrived
CREATE TABLE IF NOT EXISTS hash_tree_balls (
    ball TEXT PRIMARY KEY NOT NULL,
    unit TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS skiplist_units (
    unit TEXT NOT NULL,
    skiplist_unit TEXT NOT NULL,
    PRIMARY KEY (unit, skiplist_unit)
);

CREATE TABLE IF NOT EXISTS parenthoods (
    child_unit TEXT NOT NULL,
    parent_unit TEXT NOT NULL,
    PRIMARY KEY (parent_unit, child_unit)
);

CREATE TABLE IF NOT EXISTS unit_witnesses (
    unit TEXT NOT NULL,
    address TEXT NOT NULL,
    PRIMARY KEY (unit, address)
);

CREATE TABLE IF NOT EXISTS witness_list_hashes (
    witness_list_unit TEXT PRIMARY KEY NOT NULL,
    witness_list_hash TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS definitions (
    definition_chash TEXT PRIMARY KEY NOT NULL,
    definition TEXT NOT NULL,
    has_references INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS addresses (
    address TEXT PRIMARY KEY NOT NULL,
    creation_date TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS unit_authors (
    unit TEXT NOT NULL,
    address TEXT NOT NULL,
    definition_chash TEXT,
    _mci INTEGER,
    PRIMARY KEY (unit, address)
);

CREATE TABLE IF NOT EXISTS earned_headers_commission_recipients (
    unit TEXT NOT NULL,
    address TEXT NOT NULL,
    earned_headers_commission_share INTEGER NOT NULL,
    PRIMARY KEY (unit, address)
);
"#;

/// Messages and per-app satellite tables
const MESSAGES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    unit TEXT NOT NULL,
    message_index INTEGER NOT NULL,
    app TEXT NOT NULL,
    payload_location TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    payload TEXT,
    payload_uri_hash TEXT,
    payload_uri TEXT,
    PRIMARY KEY (unit, message_index)
);

CREATE TABLE IF NOT EXISTS address_definition_changes (
    unit TEXT NOT NULL,
    message_index INTEGER NOT NULL,
    address TEXT NOT NULL,
    definition_chash TEXT NOT NULL,
    PRIMARY KEY (unit, message_index)
);

CREATE TABLE IF NOT EXISTS polls (
    unit TEXT PRIMARY KEY NOT NULL,
    message_index INTEGER NOT NULL,
    question TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS poll_choices (
    unit TEXT NOT NULL,
    choice_index INTEGER NOT NULL,
    choice TEXT NOT NULL,
    PRIMARY KEY (unit, choice_index)
);

CREATE TABLE IF NOT EXISTS votes (
    unit TEXT NOT NULL,
    message_index INTEGER NOT NULL,
    poll_unit TEXT NOT NULL,
    choice TEXT NOT NULL,
    PRIMARY KEY (unit, message_index)
);

CREATE TABLE IF NOT EXISTS attestations (
    unit TEXT NOT NULL,
    message_index INTEGER NOT NULL,
    attestor_address TEXT NOT NULL,
    address TEXT NOT NULL,
    PRIMARY KEY (unit, message_index)
);

CREATE TABLE IF NOT EXISTS attested_fields (
    unit TEXT NOT NULL,
    message_index INTEGER NOT NULL,
    attestor_address TEXT NOT NULL,
    address TEXT NOT NULL,
    field TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (unit, message_index, field)
);

CREATE TABLE IF NOT EXISTS assets (
    unit TEXT PRIMARY KEY NOT NULL,
    message_index INTEGER NOT NULL,
    cap INTEGER,
    is_private INTEGER NOT NULL,
    is_transferrable INTEGER NOT NULL,
    auto_destroy INTEGER NOT NULL,
    fixed_denominations INTEGER NOT NULL,
    issued_by_definer_only INTEGER NOT NULL,
    cosigned_by_definer INTEGER NOT NULL,
    spender_attested INTEGER NOT NULL,
    issue_condition TEXT,
    transfer_condition TEXT
);

CREATE TABLE IF NOT EXISTS asset_attestors (
    unit TEXT NOT NULL,
    message_index INTEGER NOT NULL,
    asset TEXT NOT NULL,
    attestor_address TEXT NOT NULL,
    PRIMARY KEY (unit, message_index, attestor_address)
);

CREATE TABLE IF NOT EXISTS asset_denominations (
    asset TEXT NOT NULL,
    denomination INTEGER NOT NULL,
    count_coins INTEGER,
    PRIMARY KEY (asset, denomination)
);

CREATE TABLE IF NOT EXISTS spend_proofs (
    unit TEXT NOT NULL,
    message_index INTEGER NOT NULL,
    spend_proof_index INTEGER NOT NULL,
    spend_proof TEXT NOT NULL,
    address TEXT NOT NULL,
    PRIMARY KEY (unit, message_index, spend_proof_index)
);
"#;

/// Inputs, outputs and commission outputs
const PAYMENTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS inputs (
    unit TEXT NOT NULL,
    message_index INTEGER NOT NULL,
    input_index INTEGER NOT NULL,
    asset TEXT,
    denomination INTEGER NOT NULL DEFAULT 1,
    is_unique INTEGER,
    type TEXT NOT NULL,
    src_unit TEXT,
    src_message_index INTEGER,
    src_output_index INTEGER,
    from_main_chain_index INTEGER,
    to_main_chain_index INTEGER,
    serial_number INTEGER,
    amount INTEGER,
    address TEXT,
    PRIMARY KEY (unit, message_index, input_index)
);

CREATE TABLE IF NOT EXISTS outputs (
    output_id INTEGER PRIMARY KEY AUTOINCREMENT,
    unit TEXT NOT NULL,
    message_index INTEGER NOT NULL,
    output_index INTEGER NOT NULL,
    address TEXT NOT NULL,
    amount INTEGER NOT NULL,
    asset TEXT,
    denomination INTEGER NOT NULL DEFAULT 1,
    is_serial INTEGER,
    is_spent INTEGER NOT NULL DEFAULT 0,
    UNIQUE (unit, message_index, output_index)
);

CREATE TABLE IF NOT EXISTS headers_commission_outputs (
    main_chain_index INTEGER NOT NULL,
    address TEXT NOT NULL,
    amount INTEGER NOT NULL,
    is_spent INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (main_chain_index, address)
);

CREATE TABLE IF NOT EXISTS witnessing_outputs (
    main_chain_index INTEGER NOT NULL,
    address TEXT NOT NULL,
    amount INTEGER NOT NULL,
    is_spent INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (main_chain_index, address)
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_units_free ON units(is_free);
CREATE INDEX IF NOT EXISTS idx_units_stable ON units(is_stable);
CREATE INDEX IF NOT EXISTS idx_units_mci ON units(main_chain_index);
CREATE INDEX IF NOT EXISTS idx_units_best_parent ON units(best_parent_unit);
CREATE INDEX IF NOT EXISTS idx_parenthoods_child ON parenthoods(child_unit);
CREATE INDEX IF NOT EXISTS idx_unit_authors_address ON unit_authors(address);
CREATE INDEX IF NOT EXISTS idx_unit_witnesses_address ON unit_witnesses(address);
CREATE INDEX IF NOT EXISTS idx_inputs_src ON inputs(src_unit, src_message_index, src_output_index);
CREATE INDEX IF NOT EXISTS idx_outputs_address ON outputs(address, is_spent);
CREATE INDEX IF NOT EXISTS idx_attested_fields_address ON attested_fields(address);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        let version: i32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('units', 'inputs', 'outputs', 'poll_choices')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }
}
