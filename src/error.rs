//! Error types for dag-writer

use std::fmt;

use thiserror::Error;

/// Structural metric recomputed by the writer and cross-checked against
/// the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    BestParent,
    Level,
    /// SQL `MAX(level)` against the per-parent props reader
    MaxLevel,
    WitnessedLevel,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Metric::BestParent => "best parent",
            Metric::Level => "level",
            Metric::MaxLevel => "max level",
            Metric::WitnessedLevel => "witnessed level",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("different {metric}s, validation: {validation}, writer: {writer}")]
    ConsensusMismatch {
        metric: Metric,
        validation: String,
        writer: String,
    },

    #[error("zero or more than one best parent unit for {0}")]
    BestParentNotFound(String),

    #[error("src output not found: {unit}:{message_index}:{output_index}")]
    SourceOutputNotFound {
        unit: String,
        message_index: u32,
        output_index: u32,
    },

    #[error("src output mismatch: {0}")]
    SourceOutputMismatch(String),

    #[error("Inconsistent DAG state: {0}")]
    Inconsistency(String),

    #[error("AA unit {0} has no initial trigger MCI")]
    MissingTriggerMci(String),

    #[error("Invalid payload in message {message_index}: {source}")]
    Payload {
        message_index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("KV store error: {0}")]
    KvStore(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WriterError {
    /// Invariant violations a validator should already have excluded.
    ///
    /// A full node must not keep running after one of these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WriterError::ConsensusMismatch { .. }
                | WriterError::BestParentNotFound(_)
                | WriterError::SourceOutputNotFound { .. }
                | WriterError::SourceOutputMismatch(_)
                | WriterError::Inconsistency(_)
                | WriterError::MissingTriggerMci(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_message() {
        let err = WriterError::ConsensusMismatch {
            metric: Metric::WitnessedLevel,
            validation: "3".into(),
            writer: "4".into(),
        };
        assert_eq!(
            err.to_string(),
            "different witnessed levels, validation: 3, writer: 4"
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_storage_errors_are_not_fatal() {
        let err = WriterError::Internal("lock poisoned".into());
        assert!(!err.is_fatal());
    }
}
