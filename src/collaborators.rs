//! Components the writer calls into but does not own
//!
//! The main chain sweep, the AA definition registry and the spendable MCI
//! cache live elsewhere in a node. They run synchronously on the writer's
//! transaction and see the rows written so far.

use std::sync::Arc;

use rusqlite::Connection;
use sled::Batch;
use tracing::debug;

use crate::dag_cache::DagCache;
use crate::error::WriterError;
pub use crate::object_hash::{ObjectHasher, Sha256Hasher};

/// Main chain stabilization entry point
pub trait MainChainUpdater: Send + Sync {
    fn update_main_chain(
        &self,
        conn: &Connection,
        batch: &mut Batch,
        unit: &str,
        is_aa: bool,
        cache: &DagCache,
    ) -> Result<(), WriterError>;
}

/// Registers AA definitions created by an AA-authored unit
pub trait AaDefinitionInstaller: Send + Sync {
    fn insert_aa_definitions(
        &self,
        conn: &Connection,
        payloads: &[serde_json::Value],
        unit: &str,
        initial_trigger_mci: u64,
        cache: &DagCache,
    ) -> Result<(), WriterError>;
}

/// Cached upper bound of spendable commission MCIs
pub trait SpendableMciCache: Send + Sync {
    fn reset_max_spendable_mci(&self);
}

/// Everything the writer delegates to
#[derive(Clone)]
pub struct Collaborators {
    pub main_chain: Arc<dyn MainChainUpdater>,
    pub aa_definitions: Arc<dyn AaDefinitionInstaller>,
    pub spendable_mci: Arc<dyn SpendableMciCache>,
    pub hasher: Arc<dyn ObjectHasher>,
}

impl Collaborators {
    /// No-op collaborators, for a standalone store or tests.
    ///
    /// The default [`Sha256Hasher`] does not produce the network's checksummed
    /// address format, so a real address never equals its definition hash
    /// and first-use `addresses` rows are not written. A node replaces it
    /// through [`Collaborators::with_hasher`].
    pub fn detached() -> Self {
        Self {
            main_chain: Arc::new(Detached),
            aa_definitions: Arc::new(Detached),
            spendable_mci: Arc::new(Detached),
            hasher: Arc::new(Sha256Hasher),
        }
    }

    pub fn with_main_chain(mut self, main_chain: Arc<dyn MainChainUpdater>) -> Self {
        self.main_chain = main_chain;
        self
    }

    pub fn with_aa_definitions(mut self, installer: Arc<dyn AaDefinitionInstaller>) -> Self {
        self.aa_definitions = installer;
        self
    }

    pub fn with_spendable_mci(mut self, cache: Arc<dyn SpendableMciCache>) -> Self {
        self.spendable_mci = cache;
        self
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn ObjectHasher>) -> Self {
        self.hasher = hasher;
        self
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::detached()
    }
}

struct Detached;

impl MainChainUpdater for Detached {
    fn update_main_chain(
        &self,
        _conn: &Connection,
        _batch: &mut Batch,
        unit: &str,
        _is_aa: bool,
        _cache: &DagCache,
    ) -> Result<(), WriterError> {
        debug!(unit = %unit, "No main chain updater attached");
        Ok(())
    }
}

impl AaDefinitionInstaller for Detached {
    fn insert_aa_definitions(
        &self,
        _conn: &Connection,
        payloads: &[serde_json::Value],
        unit: &str,
        _initial_trigger_mci: u64,
        _cache: &DagCache,
    ) -> Result<(), WriterError> {
        debug!(unit = %unit, count = payloads.len(), "No AA installer attached");
        Ok(())
    }
}

impl SpendableMciCache for Detached {
    fn reset_max_spendable_mci(&self) {}
}
