//! DAG Writer - commit path for a DAG ledger
//!
//! Persists units that a validator has already accepted. Each unit is
//! written atomically to two stores under one global write lock:
//!
//! - **SQLite** (`ledger.sqlite`): normalized unit records, one row per
//!   unit, parent edge, author, message, input and output
//! - **sled** (`joints.sled`): the joint snapshot keyed by unit id
//!
//! While writing, the writer recomputes the structural DAG metrics (best
//! parent, level, witnessed level) from committed ancestors and checks them
//! against the validator's values. It keeps an in-memory [`DagCache`] of
//! unstable and recently stable units and publishes a saved-unit event once
//! the commit is durable.
//!
//! ## Storage Layout
//!
//! ```text
//! <storage_dir>/
//! ├── ledger.sqlite          # Relational store
//! ├── joints.sled/           # Joint snapshots
//! └── config.toml            # Configuration
//! ```

pub mod collaborators;
pub mod config;
pub mod dag_cache;
pub mod db;
pub mod error;
pub mod events;
pub mod joint;
pub mod kv;
pub mod object_hash;
pub mod validation;
pub mod writer;

pub use collaborators::{
    AaDefinitionInstaller, Collaborators, MainChainUpdater, ObjectHasher, Sha256Hasher,
    SpendableMciCache,
};
pub use config::{Config, ErrorPolicy, ProtocolConstants};
pub use dag_cache::{CacheSnapshot, DagCache, UnitProps};
pub use db::{DbStats, LedgerDb};
pub use error::{Metric, WriterError};
pub use events::{spawn_logging_listener, EventBus, WriterEvent};
pub use joint::{Joint, Message, Unit};
pub use kv::JointStore;
pub use validation::{AdditionalQuery, DoubleSpendInput, Sequence, ValidationState};
pub use writer::{CommitOutcome, CommitReport, PreCommitHook, WriteGuard, WriteLock, Writer};
