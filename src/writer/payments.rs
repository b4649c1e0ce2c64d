//! Payment inputs and outputs
//!
//! Each input needs an owning address. With a single author that is the
//! author; otherwise commission and issue inputs name it and transfer
//! inputs inherit it from the output they spend.

use rusqlite::Connection;
use tracing::debug;

use crate::db::query::{execute_all, Query};
use crate::db::units::read_src_outputs;
use crate::error::WriterError;
use crate::joint::{Input, InputType, PaymentPayload, Unit};
use crate::sql_params;
use crate::validation::{Sequence, ValidationState};
use crate::writer::WriteContext;

/// Write the inputs and outputs of every inline payment message
pub fn resolve_payments(
    conn: &Connection,
    unit: &Unit,
    author_addresses: &[String],
    state: &ValidationState,
    ctx: &WriteContext<'_>,
) -> Result<(), WriterError> {
    let queries = payment_queries(conn, unit, author_addresses, state, ctx)?;
    if !queries.is_empty() {
        debug!(unit = %unit.unit, count = queries.len(), "Writing payment rows");
    }
    execute_all(conn, &queries)
}

/// Statements for the payments of `unit`, resolving addresses against `conn`
pub fn payment_queries(
    conn: &Connection,
    unit: &Unit,
    author_addresses: &[String],
    state: &ValidationState,
    ctx: &WriteContext<'_>,
) -> Result<Vec<Query>, WriterError> {
    let ignore = state.sequence == Sequence::FinalBad;
    let mut queries = Vec::new();

    for (message_index, message) in unit.messages.iter().enumerate() {
        if !message.is_inline() || message.app != "payment" {
            continue;
        }
        let payload: PaymentPayload = message.payload_as(message_index)?;
        let denomination = payload.denomination();

        for (input_index, input) in payload.inputs.iter().enumerate() {
            let kind = input.kind();
            let address = input_address(conn, input, &payload, author_addresses, ctx)?;
            let is_unique = if state.is_double_spend(message_index, input_index) || ctx.light {
                None
            } else {
                Some(1u32)
            };

            let (src_unit, src_message_index, src_output_index) = match kind {
                InputType::Transfer => (input.unit.as_ref(), input.message_index, input.output_index),
                _ => (None, None, None),
            };
            let (from_mci, to_mci) = match kind {
                InputType::HeadersCommission | InputType::Witnessing => {
                    (input.from_main_chain_index, input.to_main_chain_index)
                }
                _ => (None, None),
            };

            queries.push(Query::insert(
                "inputs",
                &[
                    "unit",
                    "message_index",
                    "input_index",
                    "type",
                    "src_unit",
                    "src_message_index",
                    "src_output_index",
                    "from_main_chain_index",
                    "to_main_chain_index",
                    "denomination",
                    "amount",
                    "serial_number",
                    "asset",
                    "is_unique",
                    "address",
                ],
                sql_params![
                    &unit.unit,
                    message_index,
                    input_index,
                    kind.as_str(),
                    src_unit,
                    src_message_index,
                    src_output_index,
                    from_mci,
                    to_mci,
                    denomination,
                    input.amount,
                    input.serial_number,
                    payload.asset.as_ref(),
                    is_unique,
                    address.as_ref(),
                ],
                ignore,
            ));

            match kind {
                InputType::Transfer => queries.push(Query::new(
                    "UPDATE outputs SET is_spent=1 WHERE unit=? AND message_index=? AND output_index=?",
                    sql_params![src_unit, src_message_index, src_output_index],
                )),
                InputType::HeadersCommission | InputType::Witnessing => queries.push(Query::new(
                    format!(
                        "UPDATE {}_outputs SET is_spent=1 \
                         WHERE main_chain_index>=? AND main_chain_index<=? AND address=?",
                        kind.as_str()
                    ),
                    sql_params![from_mci, to_mci, address.as_ref()],
                )),
                InputType::Issue => {}
            }
        }

        // Public payments only spend stable serial inputs, so every output is serial
        for (output_index, output) in payload.outputs.iter().enumerate() {
            queries.push(Query::new(
                format!(
                    "INSERT {}INTO outputs \
                     (unit, message_index, output_index, address, amount, asset, denomination, is_serial) \
                     VALUES(?,?,?,?,?,?,?,1)",
                    if ignore { "OR IGNORE " } else { "" }
                ),
                sql_params![
                    &unit.unit,
                    message_index,
                    output_index,
                    &output.address,
                    output.amount,
                    payload.asset.as_ref(),
                    denomination,
                ],
            ));
        }
    }
    Ok(queries)
}

fn input_address(
    conn: &Connection,
    input: &Input,
    payload: &PaymentPayload,
    author_addresses: &[String],
    ctx: &WriteContext<'_>,
) -> Result<Option<String>, WriterError> {
    if let [single] = author_addresses {
        return Ok(Some(single.clone()));
    }
    match input.kind() {
        InputType::HeadersCommission | InputType::Witnessing | InputType::Issue => Ok(input.address.clone()),
        InputType::Transfer => address_from_src_output(conn, input, payload, author_addresses, ctx),
    }
}

fn address_from_src_output(
    conn: &Connection,
    input: &Input,
    payload: &PaymentPayload,
    author_addresses: &[String],
    ctx: &WriteContext<'_>,
) -> Result<Option<String>, WriterError> {
    let src_unit = input.unit.as_deref().unwrap_or_default();
    let message_index = input.message_index.unwrap_or_default();
    let output_index = input.output_index.unwrap_or_default();

    let mut rows = read_src_outputs(conn, src_unit, message_index, output_index)?;
    if rows.len() > 1 {
        return Err(WriterError::SourceOutputMismatch(format!(
            "multiple src outputs found for {}:{}:{}",
            src_unit, message_index, output_index
        )));
    }
    let Some(row) = rows.pop() else {
        // Light nodes do not store the outputs they did not receive
        if ctx.light {
            return Ok(None);
        }
        return Err(WriterError::SourceOutputNotFound {
            unit: src_unit.to_string(),
            message_index,
            output_index,
        });
    };

    if row.asset != payload.asset {
        return Err(WriterError::SourceOutputMismatch(format!(
            "asset doesn't match: {:?} vs {:?}",
            row.asset, payload.asset
        )));
    }
    if row.denomination != payload.denomination() {
        return Err(WriterError::SourceOutputMismatch(format!(
            "denomination doesn't match: {} vs {}",
            row.denomination,
            payload.denomination()
        )));
    }
    if !author_addresses.contains(&row.address) {
        return Err(WriterError::SourceOutputMismatch(format!(
            "src output address {} not among authors",
            row.address
        )));
    }
    Ok(Some(row.address))
}
