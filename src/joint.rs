//! Unit and joint data model
//!
//! A joint is a unit plus the main-chain ball metadata a peer may attach to
//! it. Message payloads stay as raw JSON on the message and are decoded into
//! the typed payload structs below only where a table needs their fields.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::WriterError;

/// A unit with optional ball and skiplist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Joint {
    pub unit: Unit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ball: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skiplist_units: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Joint {
    pub fn new(unit: Unit) -> Self {
        Self {
            unit,
            ball: None,
            skiplist_units: None,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Content-derived unit hash
    pub unit: String,
    pub version: String,
    pub alt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_list_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witnesses: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ball: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ball_unit: Option<String>,
    /// Empty only for the genesis unit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_units: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers_commission: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_commission: Option<u64>,
    /// Set when the unit content was stripped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    pub authors: Vec<Author>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earned_headers_commission_recipients: Option<Vec<EarnedHeadersCommissionRecipient>>,
    /// Only present on units delivered to light nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_chain_index: Option<u64>,
    /// Fields this crate does not interpret, kept so the stored snapshot
    /// is the object that was received
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Unit {
    pub fn author_addresses(&self) -> Vec<String> {
        self.authors.iter().map(|a| a.address.clone()).collect()
    }

    /// The witness list unit of this unit, or the unit itself when it declares witnesses inline
    pub fn effective_witness_list_unit(&self) -> &str {
        self.witness_list_unit.as_deref().unwrap_or(&self.unit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub address: String,
    /// Present when the address definition is revealed for the first time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub authentifiers: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadLocation {
    Inline,
    Uri,
    None,
}

impl PayloadLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadLocation::Inline => "inline",
            PayloadLocation::Uri => "uri",
            PayloadLocation::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub app: String,
    pub payload_location: PayloadLocation,
    pub payload_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_uri_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spend_proofs: Option<Vec<SpendProof>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    pub fn is_inline(&self) -> bool {
        self.payload_location == PayloadLocation::Inline
    }

    /// Decode the inline payload into a typed struct
    pub fn payload_as<T: DeserializeOwned>(&self, message_index: usize) -> Result<T, WriterError> {
        let value = self.payload.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value).map_err(|source| WriterError::Payload {
            message_index,
            source,
        })
    }

    /// Payload text stored in the `messages` row, if the app keeps one
    pub fn text_payload(&self) -> Result<Option<String>, WriterError> {
        let payload = match &self.payload {
            Some(payload) => payload,
            None => return Ok(None),
        };
        match self.app.as_str() {
            "text" => Ok(payload.as_str().map(str::to_string)),
            "data" | "profile" | "attestation" | "definition_template" => {
                Ok(Some(serde_json::to_string(payload)?))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendProof {
    pub spend_proof: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarnedHeadersCommissionRecipient {
    pub address: String,
    pub earned_headers_commission_share: u32,
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denomination: Option<u32>,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
}

impl PaymentPayload {
    pub fn denomination(&self) -> u32 {
        self.denomination.unwrap_or(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    Transfer,
    HeadersCommission,
    Witnessing,
    Issue,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::Transfer => "transfer",
            InputType::HeadersCommission => "headers_commission",
            InputType::Witnessing => "witnessing",
            InputType::Issue => "issue",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    /// Absent means transfer
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<InputType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_main_chain_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_main_chain_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Input {
    pub fn kind(&self) -> InputType {
        self.kind.unwrap_or(InputType::Transfer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollPayload {
    pub question: String,
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotePayload {
    pub unit: String,
    pub choice: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationPayload {
    pub address: String,
    pub profile: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap: Option<u64>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_transferrable: bool,
    #[serde(default)]
    pub auto_destroy: bool,
    #[serde(default)]
    pub fixed_denominations: bool,
    #[serde(default)]
    pub issued_by_definer_only: bool,
    #[serde(default)]
    pub cosigned_by_definer: bool,
    #[serde(default)]
    pub spender_attested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_condition: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_condition: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denominations: Option<Vec<Denomination>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Denomination {
    pub denomination: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count_coins: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetAttestorsPayload {
    pub asset: String,
    pub attestors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressDefinitionChangePayload {
    pub definition_chash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_defaults_to_transfer() {
        let input: Input = serde_json::from_value(json!({
            "unit": "U1", "message_index": 0, "output_index": 2
        }))
        .unwrap();
        assert_eq!(input.kind(), InputType::Transfer);

        let input: Input = serde_json::from_value(json!({
            "type": "headers_commission", "from_main_chain_index": 1, "to_main_chain_index": 5
        }))
        .unwrap();
        assert_eq!(input.kind(), InputType::HeadersCommission);
    }

    #[test]
    fn test_text_payload_by_app() {
        let mut message = Message {
            app: "text".into(),
            payload_location: PayloadLocation::Inline,
            payload_hash: "h".into(),
            payload: Some(json!("hello")),
            payload_uri: None,
            payload_uri_hash: None,
            spend_proofs: None,
            extra: serde_json::Map::new(),
        };
        assert_eq!(message.text_payload().unwrap().as_deref(), Some("hello"));

        message.app = "data".into();
        message.payload = Some(json!({"k": 1}));
        assert_eq!(message.text_payload().unwrap().as_deref(), Some(r#"{"k":1}"#));

        message.app = "payment".into();
        assert_eq!(message.text_payload().unwrap(), None);
    }

    #[test]
    fn test_bad_payload_reports_message_index() {
        let message = Message {
            app: "poll".into(),
            payload_location: PayloadLocation::Inline,
            payload_hash: "h".into(),
            payload: Some(json!({"question": 5})),
            payload_uri: None,
            payload_uri_hash: None,
            spend_proofs: None,
            extra: serde_json::Map::new(),
        };
        let err = message.payload_as::<PollPayload>(3).unwrap_err();
        assert!(matches!(err, WriterError::Payload { message_index: 3, .. }));
    }

    #[test]
    fn test_effective_witness_list_unit() {
        let unit: Unit = serde_json::from_value(json!({
            "unit": "U", "version": "1.0", "alt": "1",
            "witnesses": ["A", "B"], "authors": [{"address": "A"}]
        }))
        .unwrap();
        assert_eq!(unit.effective_witness_list_unit(), "U");
        assert!(unit.parent_units.is_empty());
    }

    #[test]
    fn test_unknown_fields_survive_reserialization() {
        let original = json!({
            "unit": {
                "unit": "U", "version": "4.0", "alt": "1", "parent_units": ["P"],
                "tps_fee": 10, "oversize_fee": 0,
                "signed_message": {"text": "hi"},
                "authors": [{"address": "A", "authentifiers": {"r": "sig"}, "note": 1}],
                "messages": [{"app": "text", "payload_location": "inline", "payload_hash": "h",
                              "payload": "x", "extra_field": true}]
            },
            "ball": "B",
            "arrived_from": "peer"
        });
        let joint: Joint = serde_json::from_value(original.clone()).unwrap();
        assert_eq!(joint.unit.extra.get("tps_fee"), Some(&json!(10)));
        assert_eq!(serde_json::to_value(&joint).unwrap(), original);
    }
}
