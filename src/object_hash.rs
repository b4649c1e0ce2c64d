//! Canonical hashing of JSON objects
//!
//! Objects are flattened into a source string (type-tagged components
//! separated by NUL, object keys sorted) and hashed with SHA-256. The
//! writer only needs two hashes: the definition hash that becomes an
//! address, and the base64 hash of an inline witness list.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::WriterError;

const COMPONENT_SEPARATOR: &str = "\x00";

/// Length in bytes of a definition hash
const CHASH_BYTES: usize = 20;

/// Hashes the writer derives from unit content
pub trait ObjectHasher: Send + Sync {
    /// Hash of an address definition; equals the address it defines
    fn definition_chash(&self, definition: &Value) -> Result<String, WriterError>;

    /// Hash identifying an inline witness list
    fn witness_list_hash(&self, witnesses: &[String]) -> Result<String, WriterError>;

    /// Whether evaluating the definition reads other DAG state
    fn has_references(&self, definition: &Value) -> bool {
        has_references(definition)
    }
}

/// SHA-256 over the canonical source string.
///
/// Definition hashes are upper-case hex, not the checksummed base32 form
/// real addresses use.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ObjectHasher for Sha256Hasher {
    fn definition_chash(&self, definition: &Value) -> Result<String, WriterError> {
        let digest = Sha256::digest(source_string(definition)?.as_bytes());
        Ok(hex::encode_upper(&digest[..CHASH_BYTES]))
    }

    fn witness_list_hash(&self, witnesses: &[String]) -> Result<String, WriterError> {
        let value = Value::from(witnesses.to_vec());
        base64_hash(&value)
    }
}

/// base64 of the SHA-256 of the source string
pub fn base64_hash(value: &Value) -> Result<String, WriterError> {
    let digest = Sha256::digest(source_string(value)?.as_bytes());
    Ok(BASE64.encode(digest))
}

/// Canonical string form of a JSON value
pub fn source_string(value: &Value) -> Result<String, WriterError> {
    let mut components = Vec::new();
    extract_components(value, &mut components)?;
    Ok(components.join(COMPONENT_SEPARATOR))
}

fn extract_components(value: &Value, components: &mut Vec<String>) -> Result<(), WriterError> {
    match value {
        Value::String(s) => {
            components.push("s".into());
            components.push(s.clone());
        }
        Value::Number(n) => {
            components.push("n".into());
            components.push(n.to_string());
        }
        Value::Bool(b) => {
            components.push("b".into());
            components.push(b.to_string());
        }
        Value::Array(items) => {
            if items.is_empty() {
                return Err(WriterError::Internal("empty array in hashed object".into()));
            }
            components.push("[".into());
            for item in items {
                extract_components(item, components)?;
            }
            components.push("]".into());
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                components.push(key.clone());
                extract_components(&map[key.as_str()], components)?;
            }
        }
        Value::Null => {
            return Err(WriterError::Internal("null in hashed object".into()));
        }
    }
    Ok(())
}

/// True when a definition contains an operator that reads the DAG
/// (data feeds, attestations, other addresses, balances, ...).
pub fn has_references(definition: &Value) -> bool {
    let Some(parts) = definition.as_array() else {
        return false;
    };
    let (Some(op), Some(args)) = (parts.first().and_then(Value::as_str), parts.get(1)) else {
        return false;
    };
    match op {
        "sig" | "hash" => false,
        "or" | "and" => args
            .as_array()
            .map(|subs| subs.iter().any(has_references))
            .unwrap_or(false),
        "r of set" => args
            .get("set")
            .and_then(Value::as_array)
            .map(|subs| subs.iter().any(has_references))
            .unwrap_or(false),
        "weighted and" => args
            .get("set")
            .and_then(Value::as_array)
            .map(|subs| {
                subs.iter()
                    .filter_map(|s| s.get("value"))
                    .any(has_references)
            })
            .unwrap_or(false),
        "not" => has_references(args),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_string_sorts_keys() {
        let a = source_string(&json!({"b": 1, "a": "x"})).unwrap();
        let b = source_string(&json!({"a": "x", "b": 1})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "a\0s\0x\0b\0n\x001");
    }

    #[test]
    fn test_null_is_rejected() {
        assert!(source_string(&json!({"a": null})).is_err());
    }

    #[test]
    fn test_chash_is_stable_and_sized() {
        let hasher = Sha256Hasher;
        let definition = json!(["sig", {"pubkey": "A1"}]);
        let chash = hasher.definition_chash(&definition).unwrap();
        assert_eq!(chash.len(), CHASH_BYTES * 2);
        assert_eq!(chash, hasher.definition_chash(&definition).unwrap());
        assert_ne!(chash, hasher.definition_chash(&json!(["sig", {"pubkey": "A2"}])).unwrap());
    }

    #[test]
    fn test_witness_list_hash_is_base64() {
        let hash = Sha256Hasher
            .witness_list_hash(&["W1".to_string(), "W2".to_string()])
            .unwrap();
        assert_eq!(BASE64.decode(hash).unwrap().len(), 32);
    }

    #[test]
    fn test_has_references() {
        assert!(!has_references(&json!(["sig", {"pubkey": "K"}])));
        assert!(!has_references(&json!(["or", [["sig", {"pubkey": "K"}], ["hash", {"hash": "H"}]]])));
        assert!(has_references(&json!(["and", [["sig", {"pubkey": "K"}], ["in data feed", [["X"], "f", "=", "1"]]]])));
        assert!(has_references(&json!(["r of set", {"required": 1, "set": [["address", "ADDR"]]}])));
        assert!(has_references(&json!(["weighted and", {"required": 1, "set": [{"weight": 1, "value": ["seen", {}]}]}])));
        assert!(!has_references(&json!("garbage")));
    }
}
