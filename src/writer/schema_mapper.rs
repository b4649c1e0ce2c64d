//! Joint to relational rows
//!
//! Produces the ordered statement list for everything except payment
//! inputs and outputs, which need reads against earlier outputs and are
//! handled by the payment resolver.

use crate::db::query::{Query, SqlParam};
use crate::error::WriterError;
use crate::joint::{
    AddressDefinitionChangePayload, AssetAttestorsPayload, AssetPayload, AttestationPayload, Joint,
    Message, PollPayload, Unit, VotePayload,
};
use crate::sql_params;
use crate::validation::{AdditionalQuery, Sequence, ValidationState};
use crate::writer::WriteContext;

/// Statements for one joint, in execution order
#[derive(Debug, Clone, Default)]
pub struct WriteSet {
    pub queries: Vec<Query>,
    /// Author addresses in unit order
    pub author_addresses: Vec<String>,
    /// Ball whose pending hash tree entry this joint resolves
    pub resolved_ball: Option<String>,
}

impl WriteSet {
    fn push(&mut self, query: Query) {
        self.queries.push(query);
    }
}

/// Validator-supplied statements, run before the unit's own rows
pub fn additional_queries(state: &ValidationState) -> Vec<Query> {
    state
        .additional_queries
        .iter()
        .map(|query| match query {
            AdditionalQuery::DemoteConflicting { units } => Query::new(
                "UPDATE units SET sequence='temp-bad' WHERE unit IN(?) AND sequence='good'",
                sql_params![units.as_slice()],
            ),
            AdditionalQuery::Raw { sql, params } => Query::new(sql.clone(), params.clone()),
        })
        .collect()
}

/// Map a validated joint to its rows
pub fn map_joint(
    joint: &Joint,
    state: &ValidationState,
    ctx: &WriteContext<'_>,
) -> Result<WriteSet, WriterError> {
    let unit = &joint.unit;
    // A stripped final-bad unit may come back with content
    let ignore = state.sequence == Sequence::FinalBad;
    let mut set = WriteSet {
        author_addresses: unit.author_addresses(),
        ..WriteSet::default()
    };
    let first_author = set
        .author_addresses
        .first()
        .cloned()
        .ok_or_else(|| WriterError::Inconsistency(format!("unit {} has no authors", unit.unit)))?;

    set.push(unit_row(unit, state, ctx, ignore));

    if let (Some(ball), false) = (&joint.ball, ctx.light) {
        set.push(Query::insert("balls", &["ball", "unit"], sql_params![ball, &unit.unit], ignore));
        set.push(Query::new(
            "DELETE FROM hash_tree_balls WHERE ball=? AND unit=?",
            sql_params![ball, &unit.unit],
        ));
        set.resolved_ball = Some(ball.clone());
        for skiplist_unit in joint.skiplist_units.iter().flatten() {
            set.push(Query::insert(
                "skiplist_units",
                &["unit", "skiplist_unit"],
                sql_params![&unit.unit, skiplist_unit],
                ignore,
            ));
        }
    }

    for parent in &unit.parent_units {
        set.push(Query::insert(
            "parenthoods",
            &["child_unit", "parent_unit"],
            sql_params![&unit.unit, parent],
            ignore,
        ));
    }

    if ctx.is_genesis {
        set.push(Query::new(
            "UPDATE units SET is_on_main_chain=1, main_chain_index=0, is_stable=1, level=0, witnessed_level=0 \
             WHERE unit=?",
            sql_params![&unit.unit],
        ));
    } else {
        set.push(Query::new(
            "UPDATE units SET is_free=0 WHERE unit IN(?)",
            sql_params![unit.parent_units.as_slice()],
        ));
    }

    if let Some(witnesses) = &unit.witnesses {
        for address in witnesses {
            set.push(Query::insert(
                "unit_witnesses",
                &["unit", "address"],
                sql_params![&unit.unit, address],
                ignore,
            ));
        }
        set.push(Query::insert(
            "witness_list_hashes",
            &["witness_list_unit", "witness_list_hash"],
            sql_params![&unit.unit, ctx.hasher.witness_list_hash(witnesses)?],
            true,
        ));
    }

    map_authors(&mut set, unit, ctx, ignore)?;

    if unit.content_hash.is_none() {
        for (message_index, message) in unit.messages.iter().enumerate() {
            map_message(&mut set, unit, message_index, message, &first_author, ctx, ignore)?;
        }
    }

    for recipient in unit.earned_headers_commission_recipients.iter().flatten() {
        set.push(Query::insert(
            "earned_headers_commission_recipients",
            &["unit", "address", "earned_headers_commission_share"],
            sql_params![&unit.unit, &recipient.address, recipient.earned_headers_commission_share],
            ignore,
        ));
    }

    Ok(set)
}

fn unit_row(unit: &Unit, state: &ValidationState, ctx: &WriteContext<'_>, ignore: bool) -> Query {
    let timestamp = if unit.version == ctx.constants.version_without_timestamp {
        0
    } else {
        unit.timestamp.unwrap_or(0)
    };

    let mut columns = vec![
        "unit",
        "version",
        "alt",
        "witness_list_unit",
        "last_ball_unit",
        "headers_commission",
        "payload_commission",
        "sequence",
        "content_hash",
        "timestamp",
    ];
    let mut values = vec!["?"; columns.len()];
    let mut params = sql_params![
        &unit.unit,
        &unit.version,
        &unit.alt,
        unit.witness_list_unit.as_ref(),
        unit.last_ball_unit.as_ref(),
        unit.headers_commission.unwrap_or(0),
        unit.payload_commission.unwrap_or(0),
        state.sequence.as_str(),
        unit.content_hash.as_ref(),
        timestamp,
    ];

    if ctx.light {
        columns.push("main_chain_index");
        values.push("?");
        params.push(SqlParam::from(unit.main_chain_index));
        // Without a timestamp the column keeps its insertion-time default
        if let Some(timestamp) = unit.timestamp {
            columns.push("creation_date");
            values.push("datetime(?, 'unixepoch')");
            params.push(SqlParam::from(timestamp));
        }
    }
    if ctx.trust_validator_metrics {
        columns.extend(["best_parent_unit", "witnessed_level"]);
        values.extend(["?", "?"]);
        params.push(SqlParam::from(state.best_parent_unit.as_ref()));
        params.push(SqlParam::from(state.witnessed_level));
    }

    Query::new(
        format!(
            "INSERT {}INTO units ({}) VALUES ({})",
            if ignore { "OR IGNORE " } else { "" },
            columns.join(", "),
            values.join(",")
        ),
        params,
    )
}

fn map_authors(
    set: &mut WriteSet,
    unit: &Unit,
    ctx: &WriteContext<'_>,
    ignore: bool,
) -> Result<(), WriterError> {
    for author in &unit.authors {
        let mut definition_chash = None;
        if let Some(definition) = &author.definition {
            let chash = ctx.hasher.definition_chash(definition)?;
            // Out-of-order delivery can bring the same definition twice
            set.push(Query::insert(
                "definitions",
                &["definition_chash", "definition", "has_references"],
                sql_params![
                    &chash,
                    serde_json::to_string(definition)?,
                    ctx.hasher.has_references(definition)
                ],
                true,
            ));
            // Only the first use of an address reveals the definition it is named after
            if chash == author.address {
                set.push(address_row(&author.address));
            }
            definition_chash = Some(chash);
        } else if unit.content_hash.is_some() {
            set.push(address_row(&author.address));
        }

        set.push(Query::insert(
            "unit_authors",
            &["unit", "address", "definition_chash"],
            sql_params![&unit.unit, &author.address, definition_chash],
            ignore,
        ));
    }

    if ctx.is_genesis {
        set.push(Query::new(
            "UPDATE unit_authors SET _mci=0 WHERE unit=?",
            sql_params![&unit.unit],
        ));
    }
    Ok(())
}

fn address_row(address: &str) -> Query {
    Query::insert("addresses", &["address"], sql_params![address], true)
}

fn map_message(
    set: &mut WriteSet,
    unit: &Unit,
    message_index: usize,
    message: &Message,
    first_author: &str,
    ctx: &WriteContext<'_>,
    ignore: bool,
) -> Result<(), WriterError> {
    let unit_id = unit.unit.as_str();
    set.push(Query::insert(
        "messages",
        &[
            "unit",
            "message_index",
            "app",
            "payload_hash",
            "payload_location",
            "payload",
            "payload_uri",
            "payload_uri_hash",
        ],
        sql_params![
            unit_id,
            message_index,
            &message.app,
            &message.payload_hash,
            message.payload_location.as_str(),
            message.text_payload()?,
            message.payload_uri.as_ref(),
            message.payload_uri_hash.as_ref(),
        ],
        ignore,
    ));

    if message.is_inline() {
        match message.app.as_str() {
            "address_definition_change" => {
                let change: AddressDefinitionChangePayload = message.payload_as(message_index)?;
                let address = change.address.unwrap_or_else(|| first_author.to_string());
                set.push(Query::insert(
                    "address_definition_changes",
                    &["unit", "message_index", "address", "definition_chash"],
                    sql_params![unit_id, message_index, address, change.definition_chash],
                    ignore,
                ));
            }
            "poll" => {
                let poll: PollPayload = message.payload_as(message_index)?;
                set.push(Query::insert(
                    "polls",
                    &["unit", "message_index", "question"],
                    sql_params![unit_id, message_index, poll.question],
                    ignore,
                ));
                for (choice_index, choice) in poll.choices.iter().enumerate() {
                    set.push(Query::insert(
                        "poll_choices",
                        &["unit", "choice_index", "choice"],
                        sql_params![unit_id, choice_index, choice],
                        ignore,
                    ));
                }
            }
            "vote" => {
                let vote: VotePayload = message.payload_as(message_index)?;
                set.push(Query::insert(
                    "votes",
                    &["unit", "message_index", "poll_unit", "choice"],
                    sql_params![unit_id, message_index, vote.unit, vote.choice],
                    ignore,
                ));
            }
            "attestation" => {
                let attestation: AttestationPayload = message.payload_as(message_index)?;
                set.push(Query::insert(
                    "attestations",
                    &["unit", "message_index", "attestor_address", "address"],
                    sql_params![unit_id, message_index, first_author, &attestation.address],
                    ignore,
                ));
                for (field, value) in &attestation.profile {
                    let Some(value) = attested_value(field, value, ctx) else {
                        continue;
                    };
                    set.push(Query::insert(
                        "attested_fields",
                        &["unit", "message_index", "attestor_address", "address", "field", "value"],
                        sql_params![unit_id, message_index, first_author, &attestation.address, field, value],
                        ignore,
                    ));
                }
            }
            "asset" => {
                let asset: AssetPayload = message.payload_as(message_index)?;
                map_asset(set, unit_id, message_index, &asset, ignore)?;
            }
            "asset_attestors" => {
                let amendment: AssetAttestorsPayload = message.payload_as(message_index)?;
                for attestor in &amendment.attestors {
                    set.push(Query::insert(
                        "asset_attestors",
                        &["unit", "message_index", "asset", "attestor_address"],
                        sql_params![unit_id, message_index, &amendment.asset, attestor],
                        ignore,
                    ));
                }
            }
            // Payments go through the payment resolver
            _ => {}
        }
    }

    for (spend_proof_index, proof) in message.spend_proofs.iter().flatten().enumerate() {
        let address = proof.address.as_deref().unwrap_or(first_author);
        set.push(Query::insert(
            "spend_proofs",
            &["unit", "message_index", "spend_proof_index", "spend_proof", "address"],
            sql_params![unit_id, message_index, spend_proof_index, &proof.spend_proof, address],
            ignore,
        ));
    }
    Ok(())
}

/// Profile field/value pairs worth indexing
fn attested_value<'v>(
    field: &str,
    value: &'v serde_json::Value,
    ctx: &WriteContext<'_>,
) -> Option<&'v str> {
    let value = value.as_str()?;
    let field_ok = !field.is_empty()
        && field == field.trim()
        && field.chars().count() <= ctx.constants.max_profile_field_length;
    let value_ok = !value.is_empty()
        && value == value.trim()
        && value.chars().count() <= ctx.constants.max_profile_value_length;
    (field_ok && value_ok).then_some(value)
}

fn map_asset(
    set: &mut WriteSet,
    unit_id: &str,
    message_index: usize,
    asset: &AssetPayload,
    ignore: bool,
) -> Result<(), WriterError> {
    let condition = |c: &Option<serde_json::Value>| -> Result<Option<String>, WriterError> {
        Ok(match c {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        })
    };

    set.push(Query::insert(
        "assets",
        &[
            "unit",
            "message_index",
            "cap",
            "is_private",
            "is_transferrable",
            "auto_destroy",
            "fixed_denominations",
            "issued_by_definer_only",
            "cosigned_by_definer",
            "spender_attested",
            "issue_condition",
            "transfer_condition",
        ],
        sql_params![
            unit_id,
            message_index,
            asset.cap,
            asset.is_private,
            asset.is_transferrable,
            asset.auto_destroy,
            asset.fixed_denominations,
            asset.issued_by_definer_only,
            asset.cosigned_by_definer,
            asset.spender_attested,
            condition(&asset.issue_condition)?,
            condition(&asset.transfer_condition)?,
        ],
        ignore,
    ));

    // The asset is identified by the unit that defines it
    for attestor in asset.attestors.iter().flatten() {
        set.push(Query::insert(
            "asset_attestors",
            &["unit", "message_index", "asset", "attestor_address"],
            sql_params![unit_id, message_index, unit_id, attestor],
            ignore,
        ));
    }
    for denomination in asset.denominations.iter().flatten() {
        set.push(Query::insert(
            "asset_denominations",
            &["asset", "denomination", "count_coins"],
            sql_params![unit_id, denomination.denomination, denomination.count_coins],
            ignore,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConstants;
    use crate::db::query::execute_all;
    use crate::db::schema::init_schema;
    use crate::object_hash::{ObjectHasher, Sha256Hasher};
    use rusqlite::Connection;
    use serde_json::json;

    fn ctx<'a>(constants: &'a ProtocolConstants, hasher: &'a Sha256Hasher) -> WriteContext<'a> {
        WriteContext {
            light: false,
            trust_validator_metrics: false,
            is_genesis: false,
            constants,
            hasher,
        }
    }

    fn joint(value: serde_json::Value) -> Joint {
        serde_json::from_value(value).unwrap()
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_messages_and_satellites() {
        let constants = ProtocolConstants::default();
        let hasher = Sha256Hasher;
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let long_value = "x".repeat(101);
        let joint = joint(json!({
            "unit": {
                "unit": "U1", "version": "2.0", "alt": "1", "timestamp": 1700000000,
                "witness_list_unit": "W", "parent_units": ["P"], "last_ball_unit": "P",
                "authors": [{"address": "AUTHOR"}],
                "messages": [
                    {"app": "text", "payload_location": "inline", "payload_hash": "h0", "payload": "hi"},
                    {"app": "poll", "payload_location": "inline", "payload_hash": "h1",
                     "payload": {"question": "Q?", "choices": ["yes", "no"]}},
                    {"app": "attestation", "payload_location": "inline", "payload_hash": "h2",
                     "payload": {"address": "SUBJECT", "profile": {
                        "name": "Alice", " padded": "v", "age": 30, "bio": long_value
                     }}},
                    {"app": "asset", "payload_location": "inline", "payload_hash": "h3",
                     "payload": {"cap": 1000, "is_private": false, "is_transferrable": true,
                                 "attestors": ["ATT"], "denominations": [{"denomination": 1, "count_coins": 5}]}},
                    {"app": "address_definition_change", "payload_location": "inline", "payload_hash": "h4",
                     "payload": {"definition_chash": "NEWCHASH"},
                     "spend_proofs": [{"spend_proof": "SP"}]}
                ]
            }
        }));
        let state = ValidationState::new(Sequence::Good);
        let set = map_joint(&joint, &state, &ctx(&constants, &hasher)).unwrap();
        conn.execute("INSERT INTO units (unit, version, alt) VALUES ('P', '1.0', '1')", [])
            .unwrap();
        execute_all(&conn, &set.queries).unwrap();

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM messages WHERE unit='U1'"), 5);
        let text: String = conn
            .query_row("SELECT payload FROM messages WHERE message_index=0", [], |r| r.get(0))
            .unwrap();
        assert_eq!(text, "hi");
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM poll_choices"), 2);
        // Only the trimmed string field within limits is indexed
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM attested_fields"), 1);
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM asset_attestors WHERE asset='U1' AND attestor_address='ATT'"),
            1
        );
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM asset_denominations WHERE asset='U1'"), 1);
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM address_definition_changes WHERE address='AUTHOR'"),
            1
        );
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM spend_proofs WHERE address='AUTHOR'"), 1);
        assert_eq!(count(&conn, "SELECT is_free FROM units WHERE unit='P'"), 0);
        assert_eq!(count(&conn, "SELECT timestamp FROM units WHERE unit='U1'"), 1700000000);
    }

    #[test]
    fn test_empty_profile_fields_are_not_indexed() {
        let constants = ProtocolConstants::default();
        let hasher = Sha256Hasher;
        let joint = joint(json!({
            "unit": {
                "unit": "U5", "version": "1.0", "alt": "1", "parent_units": ["P"],
                "authors": [{"address": "AUTHOR"}],
                "messages": [{"app": "attestation", "payload_location": "inline", "payload_hash": "h",
                    "payload": {"address": "SUBJECT", "profile": {
                        "email": "", "": "x", "   ": "y", "name": "Bob"
                    }}}]
            }
        }));
        let set = map_joint(&joint, &ValidationState::new(Sequence::Good), &ctx(&constants, &hasher)).unwrap();

        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        execute_all(&conn, &set.queries).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM attested_fields"), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM attested_fields WHERE field='name'"), 1);
    }

    #[test]
    fn test_definition_registers_address_only_when_chash_matches() {
        let constants = ProtocolConstants::default();
        let hasher = Sha256Hasher;
        let definition = json!(["sig", {"pubkey": "KEY"}]);
        let address = hasher.definition_chash(&definition).unwrap();

        let joint = joint(json!({
            "unit": {
                "unit": "U2", "version": "1.0", "alt": "1", "timestamp": 5, "parent_units": ["P"],
                "authors": [
                    {"address": address, "definition": definition},
                    {"address": "OTHER", "definition": ["sig", {"pubkey": "K2"}]}
                ]
            }
        }));
        let set = map_joint(&joint, &ValidationState::new(Sequence::Good), &ctx(&constants, &hasher)).unwrap();

        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        execute_all(&conn, &set.queries).unwrap();

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM definitions"), 2);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM addresses"), 1);
        // Version without timestamps stores 0
        assert_eq!(count(&conn, "SELECT timestamp FROM units WHERE unit='U2'"), 0);
    }

    #[test]
    fn test_final_bad_uses_insert_or_ignore() {
        let constants = ProtocolConstants::default();
        let hasher = Sha256Hasher;
        let joint = joint(json!({
            "unit": {"unit": "U3", "version": "1.0", "alt": "1", "parent_units": ["P"],
                     "authors": [{"address": "A"}]}
        }));
        let set = map_joint(
            &joint,
            &ValidationState::new(Sequence::FinalBad),
            &ctx(&constants, &hasher),
        )
        .unwrap();
        assert!(set.queries[0].sql.starts_with("INSERT OR IGNORE INTO units"));
        assert!(set
            .queries
            .iter()
            .filter(|q| q.sql.starts_with("INSERT"))
            .all(|q| q.sql.starts_with("INSERT OR IGNORE")));
    }

    #[test]
    fn test_light_and_trusted_columns() {
        let constants = ProtocolConstants::default();
        let hasher = Sha256Hasher;
        let mut ctx = ctx(&constants, &hasher);
        ctx.light = true;
        ctx.trust_validator_metrics = true;
        let joint = joint(json!({
            "unit": {"unit": "U4", "version": "2.0", "alt": "1", "parent_units": ["P"],
                     "timestamp": 1700000000, "main_chain_index": 9,
                     "authors": [{"address": "A"}]},
            "ball": "BALL"
        }));
        let mut state = ValidationState::new(Sequence::Good);
        state.best_parent_unit = Some("P".into());
        state.witnessed_level = Some(3);
        let set = map_joint(&joint, &state, &ctx).unwrap();

        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        execute_all(&conn, &set.queries).unwrap();
        let (mci, bp, wl, created): (i64, String, i64, String) = conn
            .query_row(
                "SELECT main_chain_index, best_parent_unit, witnessed_level, creation_date FROM units",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!((mci, bp.as_str(), wl), (9, "P", 3));
        assert_eq!(created, "2023-11-14 22:13:20");
        // Light nodes do not store balls
        assert!(set.resolved_ball.is_none());
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM balls"), 0);
    }

    #[test]
    fn test_demotion_query() {
        let mut state = ValidationState::new(Sequence::TempBad);
        state.additional_queries.push(AdditionalQuery::DemoteConflicting {
            units: vec!["C1".into(), "C2".into()],
        });
        let queries = additional_queries(&state);
        let (sql, values) = queries[0].expand().unwrap();
        assert!(sql.contains("IN(?,?)"));
        assert_eq!(values.len(), 2);
    }
}
