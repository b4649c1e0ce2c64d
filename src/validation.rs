//! Validation state handed over by the validator
//!
//! The writer adopts or cross-checks these values; it never validates a unit itself.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::db::query::SqlParam;

/// Conflict status of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sequence {
    #[serde(rename = "good")]
    Good,
    #[serde(rename = "temp-bad")]
    TempBad,
    #[serde(rename = "final-bad")]
    FinalBad,
}

impl Sequence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sequence::Good => "good",
            Sequence::TempBad => "temp-bad",
            Sequence::FinalBad => "final-bad",
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sequence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "good" => Ok(Sequence::Good),
            "temp-bad" => Ok(Sequence::TempBad),
            "final-bad" => Ok(Sequence::FinalBad),
            other => Err(format!("unknown sequence: {}", other)),
        }
    }
}

/// Coordinates of an input the validator found to be double-spent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoubleSpendInput {
    pub message_index: usize,
    pub input_index: usize,
}

/// Extra write produced by the validator when it received a double-spend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdditionalQuery {
    /// Degrade unstable conflicting units from `good` to `temp-bad`
    DemoteConflicting { units: Vec<String> },
    /// Any other statement, executed verbatim
    Raw {
        sql: String,
        #[serde(default)]
        params: Vec<SqlParam>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationState {
    pub sequence: Sequence,
    /// `None` only for the genesis unit
    #[serde(default)]
    pub best_parent_unit: Option<String>,
    #[serde(default)]
    pub witnessed_level: Option<u64>,
    /// Level computed by the validator, when it computed one
    #[serde(default)]
    pub level: Option<u64>,
    #[serde(default)]
    pub double_spend_inputs: Vec<DoubleSpendInput>,
    #[serde(default)]
    pub additional_queries: Vec<AdditionalQuery>,
    /// Unit was authored by an autonomous agent
    #[serde(default)]
    pub is_aa: bool,
    #[serde(default)]
    pub initial_trigger_mci: Option<u64>,
}

impl ValidationState {
    pub fn new(sequence: Sequence) -> Self {
        Self {
            sequence,
            best_parent_unit: None,
            witnessed_level: None,
            level: None,
            double_spend_inputs: Vec::new(),
            additional_queries: Vec::new(),
            is_aa: false,
            initial_trigger_mci: None,
        }
    }

    /// Whether the validator marked this input as contested
    pub fn is_double_spend(&self, message_index: usize, input_index: usize) -> bool {
        self.double_spend_inputs
            .iter()
            .any(|ds| ds.message_index == message_index && ds.input_index == input_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sequence_wire_names() {
        assert_eq!(serde_json::to_value(Sequence::TempBad).unwrap(), json!("temp-bad"));
        assert_eq!("final-bad".parse::<Sequence>().unwrap(), Sequence::FinalBad);
        assert!("bad".parse::<Sequence>().is_err());
    }

    #[test]
    fn test_additional_queries_are_tagged() {
        let state: ValidationState = serde_json::from_value(json!({
            "sequence": "temp-bad",
            "best_parent_unit": "P",
            "witnessed_level": 3,
            "double_spend_inputs": [{"message_index": 0, "input_index": 1}],
            "additional_queries": [
                {"kind": "demote_conflicting", "units": ["C1"]},
                {"kind": "raw", "sql": "UPDATE inputs SET is_unique=NULL WHERE unit=?", "params": ["C1"]}
            ]
        }))
        .unwrap();
        assert!(state.is_double_spend(0, 1));
        assert!(!state.is_double_spend(1, 0));
        assert_eq!(
            state.additional_queries[0],
            AdditionalQuery::DemoteConflicting { units: vec!["C1".into()] }
        );
        assert!(matches!(state.additional_queries[1], AdditionalQuery::Raw { .. }));
    }
}
