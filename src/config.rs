//! Configuration for dag-writer

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::WriterError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dag-writer")
}

/// What to do when a recomputed DAG metric disagrees with the validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Fail the commit; the owning process is expected to stop
    Fatal,
    /// Log and publish a non-fatal event, keep the writer's value
    Report,
}

/// Protocol constants consulted by the metrics engine and schema mapper.
///
/// Defaults mirror the production constant set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConstants {
    #[serde(default = "default_count_witnesses")]
    pub count_witnesses: usize,

    #[serde(default = "default_max_witness_list_mutations")]
    pub max_witness_list_mutations: usize,

    #[serde(default = "default_majority_of_witnesses")]
    pub majority_of_witnesses: usize,

    #[serde(default = "default_max_profile_field_length")]
    pub max_profile_field_length: usize,

    #[serde(default = "default_max_profile_value_length")]
    pub max_profile_value_length: usize,

    /// Units of this version carry no timestamp (stored as 0)
    #[serde(default = "default_version_without_timestamp")]
    pub version_without_timestamp: String,
}

fn default_count_witnesses() -> usize {
    12
}

fn default_max_witness_list_mutations() -> usize {
    1
}

fn default_majority_of_witnesses() -> usize {
    7
}

fn default_max_profile_field_length() -> usize {
    50
}

fn default_max_profile_value_length() -> usize {
    100
}

fn default_version_without_timestamp() -> String {
    "1.0".to_string()
}

impl Default for ProtocolConstants {
    fn default() -> Self {
        Self {
            count_witnesses: default_count_witnesses(),
            max_witness_list_mutations: default_max_witness_list_mutations(),
            majority_of_witnesses: default_majority_of_witnesses(),
            max_profile_field_length: default_max_profile_field_length(),
            max_profile_value_length: default_max_profile_value_length(),
            version_without_timestamp: default_version_without_timestamp(),
        }
    }
}

impl ProtocolConstants {
    /// Minimum number of shared witnesses for a parent to be a best parent candidate
    pub fn min_shared_witnesses(&self) -> usize {
        self.count_witnesses - self.max_witness_list_mutations
    }
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage directory for the SQLite file and the joint KV tree
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Light node: no ancestor data, no metrics, no main chain updates
    #[serde(default)]
    pub light: bool,

    /// Adopt the validator's best parent and witnessed level without recomputing
    #[serde(default)]
    pub trust_validator_metrics: bool,

    /// Explicit mismatch policy; derived from `light` when unset
    #[serde(default)]
    pub error_policy: Option<ErrorPolicy>,

    /// Identifier of the genesis unit
    #[serde(default = "default_genesis_unit")]
    pub genesis_unit: String,

    /// Number of most recent stable MCIs kept in the stable cache after a rebuild
    #[serde(default = "default_stable_cache_depth")]
    pub stable_cache_depth: u64,

    /// Broadcast channel capacity for saved-unit notifications
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,

    /// Refresh SQLite planner statistics as units accumulate
    #[serde(default = "default_true")]
    pub refresh_planner_stats: bool,

    /// Stop refreshing planner statistics above this many units
    #[serde(default = "default_stats_max_units")]
    pub stats_max_units: u64,

    #[serde(default)]
    pub protocol: ProtocolConstants,
}

fn default_genesis_unit() -> String {
    "oj8yEksX9Ubq7lLc+p6F2uyHUuynugeVq4+ikT67X6E=".to_string()
}

fn default_stable_cache_depth() -> u64 {
    110
}

fn default_event_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_stats_max_units() -> u64 {
    500_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            light: false,
            trust_validator_metrics: false,
            error_policy: None,
            genesis_unit: default_genesis_unit(),
            protocol: ProtocolConstants::default(),
            stable_cache_depth: default_stable_cache_depth(),
            event_channel_capacity: default_event_capacity(),
            refresh_planner_stats: true,
            stats_max_units: default_stats_max_units(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Effective mismatch policy
    pub fn error_policy(&self) -> ErrorPolicy {
        match self.error_policy {
            Some(policy) => policy,
            None if self.light => ErrorPolicy::Report,
            None => ErrorPolicy::Fatal,
        }
    }

    /// Reject protocol constants the metrics engine cannot work with
    pub fn validate(&self) -> Result<(), WriterError> {
        let p = &self.protocol;
        if p.count_witnesses == 0 {
            return Err(WriterError::Config("count_witnesses must be positive".into()));
        }
        if p.max_witness_list_mutations > p.count_witnesses {
            return Err(WriterError::Config(format!(
                "max_witness_list_mutations {} exceeds count_witnesses {}",
                p.max_witness_list_mutations, p.count_witnesses
            )));
        }
        if p.majority_of_witnesses * 2 <= p.count_witnesses
            || p.majority_of_witnesses > p.count_witnesses
        {
            return Err(WriterError::Config(format!(
                "majority_of_witnesses {} is not a majority of {}",
                p.majority_of_witnesses, p.count_witnesses
            )));
        }
        if self.genesis_unit.is_empty() {
            return Err(WriterError::Config("genesis_unit is empty".into()));
        }
        Ok(())
    }

    /// Get SQLite database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join("ledger.sqlite")
    }

    /// Get joint KV store path
    pub fn kv_path(&self) -> PathBuf {
        self.storage_dir.join("joints.sled")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_follows_light_mode() {
        let mut config = Config::default();
        assert_eq!(config.error_policy(), ErrorPolicy::Fatal);
        config.light = true;
        assert_eq!(config.error_policy(), ErrorPolicy::Report);
        config.error_policy = Some(ErrorPolicy::Fatal);
        assert_eq!(config.error_policy(), ErrorPolicy::Fatal);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            light = true

            [protocol]
            count_witnesses = 3
            majority_of_witnesses = 2
            "#,
        )
        .unwrap();
        assert!(config.light);
        assert_eq!(config.protocol.count_witnesses, 3);
        assert_eq!(config.protocol.max_witness_list_mutations, 1);
        assert_eq!(config.protocol.min_shared_witnesses(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_minority() {
        let mut config = Config::default();
        config.protocol.majority_of_witnesses = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.genesis_unit = "G".into();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.genesis_unit, "G");
    }
}
