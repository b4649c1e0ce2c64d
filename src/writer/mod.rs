//! Commit coordinator
//!
//! `Writer` persists one validated joint at a time:
//!
//! 1. take the global write lock (FIFO)
//! 2. open a transaction and run the validator's additional writes
//! 3. write the unit's rows ([`schema_mapper`], [`payments`])
//! 4. seed the DAG cache, then recompute and cross-check the DAG metrics
//!    ([`metrics`]) and hand over to the main chain updater
//! 5. stage the joint snapshot, write the KV batch, commit
//! 6. release the lock and notify
//!
//! Any failure rolls back, resets the spendable MCI cache and rebuilds the
//! DAG cache from storage. Rolled back units are never announced.

pub mod lock;
pub mod metrics;
pub mod payments;
pub mod pipeline;
pub mod schema_mapper;

use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::Serialize;
use sled::Batch;
use tracing::{debug, error, info, warn};

use crate::collaborators::{Collaborators, ObjectHasher};
use crate::config::{Config, ErrorPolicy, ProtocolConstants};
use crate::dag_cache::{cacheable_messages, DagCache, UnitProps};
use crate::db::query::execute_all;
use crate::db::stats::PlannerStats;
use crate::db::LedgerDb;
use crate::error::WriterError;
use crate::events::EventBus;
use crate::joint::{Joint, Unit};
use crate::kv::JointStore;
use crate::validation::{AdditionalQuery, ValidationState};

pub use lock::{WriteGuard, WriteLock};
pub use pipeline::{CommitOutcome, CommitPhase, PhaseEvent, PhaseTracker};
use metrics::MetricsChecker;

/// Runs inside the transaction after all rows are written, before commit
pub type PreCommitHook = Box<dyn FnOnce(&Connection) -> Result<(), WriterError> + Send>;

/// Settings shared by the row mappers for one commit
pub struct WriteContext<'a> {
    pub light: bool,
    pub trust_validator_metrics: bool,
    pub is_genesis: bool,
    pub constants: &'a ProtocolConstants,
    pub hasher: &'a dyn ObjectHasher,
}

/// Result of a successful commit
#[derive(Debug, Clone, Serialize)]
pub struct CommitReport {
    pub unit: String,
    pub outcome: CommitOutcome,
    pub is_genesis: bool,
    pub best_parent_unit: Option<String>,
    pub level: Option<u64>,
    pub witnessed_level: Option<u64>,
    /// Units degraded to `temp-bad` by this commit
    pub demoted_units: Vec<String>,
    /// Metric mismatches tolerated under the report policy
    pub nonfatal_errors: Vec<String>,
    pub lock_wait: Duration,
    pub elapsed: Duration,
}

/// What `write_unit` settled for the unit
struct UnitWrite {
    is_genesis: bool,
    best_parent_unit: Option<String>,
    level: Option<u64>,
    witnessed_level: Option<u64>,
    demoted_units: Vec<String>,
    nonfatal_errors: Vec<String>,
}

/// Single writer for the DAG store
#[derive(Clone)]
pub struct Writer {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    config: Config,
    policy: ErrorPolicy,
    db: Arc<LedgerDb>,
    joints: JointStore,
    cache: Arc<DagCache>,
    events: Arc<EventBus>,
    lock: WriteLock,
    collaborators: Collaborators,
    planner_stats: PlannerStats,
}

impl Writer {
    /// Open the stores under `config.storage_dir` and load the DAG cache
    pub fn open(config: Config, collaborators: Collaborators) -> Result<Self, WriterError> {
        std::fs::create_dir_all(&config.storage_dir)?;
        let db = Arc::new(LedgerDb::open(&config.database_path())?);
        let joints = JointStore::open(config.kv_path())?;
        Self::new(config, db, joints, collaborators)
    }

    /// Build a writer over existing stores; the cache is loaded from them
    pub fn new(
        config: Config,
        db: Arc<LedgerDb>,
        joints: JointStore,
        collaborators: Collaborators,
    ) -> Result<Self, WriterError> {
        config.validate()?;
        let cache = Arc::new(DagCache::new());
        db.with_conn(|conn| cache.rebuild_from_store(conn, &joints, config.stable_cache_depth))?;

        let policy = config.error_policy();
        info!(
            light = config.light,
            trust_validator_metrics = config.trust_validator_metrics,
            policy = ?policy,
            "Writer ready"
        );

        Ok(Self {
            inner: Arc::new(WriterInner {
                policy,
                events: Arc::new(EventBus::with_capacity(config.event_channel_capacity)),
                planner_stats: PlannerStats::new(config.stats_max_units),
                lock: WriteLock::new(),
                config,
                db,
                joints,
                cache,
                collaborators,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn db(&self) -> &Arc<LedgerDb> {
        &self.inner.db
    }

    pub fn joints(&self) -> &JointStore {
        &self.inner.joints
    }

    pub fn cache(&self) -> &Arc<DagCache> {
        &self.inner.cache
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn lock(&self) -> &WriteLock {
        &self.inner.lock
    }

    pub fn planner_stats(&self) -> &PlannerStats {
        &self.inner.planner_stats
    }

    /// Commit a joint in its own transaction
    pub async fn save_joint(
        &self,
        joint: Joint,
        state: ValidationState,
    ) -> Result<CommitReport, WriterError> {
        self.save(joint, state, None).await
    }

    /// Commit a joint, running `hook` inside the transaction just before commit.
    ///
    /// The hook is skipped for the genesis unit.
    pub async fn save_joint_with_hook(
        &self,
        joint: Joint,
        state: ValidationState,
        hook: PreCommitHook,
    ) -> Result<CommitReport, WriterError> {
        self.save(joint, state, Some(hook)).await
    }

    async fn save(
        &self,
        joint: Joint,
        state: ValidationState,
        hook: Option<PreCommitHook>,
    ) -> Result<CommitReport, WriterError> {
        let started = Instant::now();
        debug!(unit = %joint.unit.unit, waiting = self.inner.lock.waiting(), "Waiting for write lock");
        let guard = self.inner.lock.acquire().await;
        let lock_wait = started.elapsed();

        let inner = self.inner.clone();
        // Once the lock is held the commit runs to completion
        tokio::task::spawn_blocking(move || {
            inner.commit_fresh(joint, state, hook, guard, started, lock_wait)
        })
        .await
        .map_err(|e| WriterError::Internal(format!("commit task failed: {}", e)))?
    }

    /// Write a joint into a transaction owned by the caller.
    ///
    /// The caller holds `guard` from [`Writer::lock`], commits or rolls back
    /// `conn` and writes `batch`. Nothing is announced here: after a commit
    /// call [`Writer::notify_saved`]; after a rollback call
    /// [`Writer::recover`]. Blocking.
    pub fn save_joint_in(
        &self,
        guard: &WriteGuard,
        conn: &Connection,
        batch: &mut Batch,
        joint: &Joint,
        state: &ValidationState,
    ) -> Result<CommitReport, WriterError> {
        if !self.inner.lock.owns(guard) {
            return Err(WriterError::Internal(
                "nested save with a guard from another lock".into(),
            ));
        }
        let started = Instant::now();
        let mut tracker = PhaseTracker::new(&joint.unit.unit);
        tracker.step(PhaseEvent::LockGranted)?;
        tracker.step(PhaseEvent::TransactionBegun)?;

        let written = match self.inner.write_unit(conn, batch, joint, state, None, &mut tracker) {
            Ok(written) => written,
            Err(err) => {
                tracker.fail();
                error!(unit = %joint.unit.unit, error = %err, "Failed to write unit in caller's transaction");
                return Err(err);
            }
        };
        tracker.step(PhaseEvent::Finalize)?;
        tracker.step(PhaseEvent::Committed)?;

        let report = written.into_report(&joint.unit.unit, &tracker, Duration::ZERO, started.elapsed());
        debug!(unit = %report.unit, "Unit written in caller's transaction");
        Ok(report)
    }

    /// Announce units committed through [`Writer::save_joint_in`]
    pub fn notify_saved(&self, joints: impl IntoIterator<Item = Joint>) {
        for joint in joints {
            self.inner.events.emit_saved(Arc::new(joint));
        }
    }

    /// Restore in-memory state after the caller rolled back a transaction
    pub fn recover(&self, conn: &Connection) -> Result<(), WriterError> {
        self.inner.recover(conn)
    }

    /// Reload the DAG cache from committed storage
    pub fn rebuild_cache(&self) -> Result<(), WriterError> {
        let inner = &self.inner;
        inner
            .db
            .with_conn(|conn| inner.cache.rebuild_from_store(conn, &inner.joints, inner.config.stable_cache_depth))
    }
}

impl WriterInner {
    fn commit_fresh(
        &self,
        joint: Joint,
        state: ValidationState,
        hook: Option<PreCommitHook>,
        guard: WriteGuard,
        started: Instant,
        lock_wait: Duration,
    ) -> Result<CommitReport, WriterError> {
        let unit = joint.unit.unit.clone();
        info!(unit = %unit, lock_wait_ms = lock_wait.as_millis() as u64, "Got lock to write");
        let mut tracker = PhaseTracker::new(&unit);
        tracker.step(PhaseEvent::LockGranted)?;

        let result = self.db.with_conn_mut(|conn| {
            let result = self.run_transaction(conn, &joint, &state, hook, &mut tracker);
            if let Err(err) = &result {
                error!(unit = %unit, error = %err, "Rolled back unit");
                if let Err(recover_err) = self.recover(conn) {
                    error!(unit = %unit, error = %recover_err, "Failed to restore state after rollback");
                }
            }
            result
        });
        if result.is_err() {
            tracker.fail();
        }
        drop(guard);

        let written = result?;
        if self.config.refresh_planner_stats {
            // Runs after the write lock is released
            if let Err(err) = self.db.with_conn(|conn| self.planner_stats.record_write(conn)) {
                warn!(error = %err, "Failed to refresh planner stats");
            }
        }
        let report = written.into_report(&unit, &tracker, lock_wait, started.elapsed());
        info!(
            unit = %unit,
            elapsed_ms = report.elapsed.as_millis() as u64,
            level = ?report.level,
            "Committed unit"
        );
        self.events.emit_saved(Arc::new(joint));
        Ok(report)
    }

    fn run_transaction(
        &self,
        conn: &mut Connection,
        joint: &Joint,
        state: &ValidationState,
        hook: Option<PreCommitHook>,
        tracker: &mut PhaseTracker,
    ) -> Result<UnitWrite, WriterError> {
        let tx = conn.transaction()?;
        tracker.step(PhaseEvent::TransactionBegun)?;

        let mut batch = Batch::default();
        let written = match self.write_unit(&tx, &mut batch, joint, state, hook, tracker) {
            Ok(written) => written,
            Err(err) => {
                tracker.fail();
                tx.rollback()?;
                return Err(err);
            }
        };

        tracker.step(PhaseEvent::Finalize)?;
        if let Err(err) = self.joints.write_batch(batch) {
            tracker.fail();
            tx.rollback()?;
            return Err(err);
        }
        tx.commit()?;
        tracker.step(PhaseEvent::Committed)?;
        Ok(written)
    }

    /// Every write of one unit, on a connection with an open transaction
    fn write_unit(
        &self,
        conn: &Connection,
        batch: &mut Batch,
        joint: &Joint,
        state: &ValidationState,
        hook: Option<PreCommitHook>,
        tracker: &mut PhaseTracker,
    ) -> Result<UnitWrite, WriterError> {
        let unit = &joint.unit;
        let is_genesis = unit.unit == self.config.genesis_unit;
        let light = self.config.light;
        let trust = self.config.trust_validator_metrics;
        let ctx = WriteContext {
            light,
            trust_validator_metrics: trust,
            is_genesis,
            constants: &self.config.protocol,
            hasher: self.collaborators.hasher.as_ref(),
        };

        // Validator writes come first, they exist only for double-spends
        execute_all(conn, &schema_mapper::additional_queries(state))?;
        let mut demoted_units = Vec::new();
        for query in &state.additional_queries {
            if let AdditionalQuery::DemoteConflicting { units } = query {
                demoted_units.extend(self.cache.demote_to_temp_bad(units));
            }
        }

        let write_set = schema_mapper::map_joint(joint, state, &ctx)?;
        execute_all(conn, &write_set.queries)?;
        if let Some(ball) = &write_set.resolved_ball {
            self.cache.remove_hash_tree_ball(ball);
        }

        let props = new_unit_props(unit, state, &ctx);
        if is_genesis {
            self.cache.insert_stable(props);
        } else {
            self.cache.mark_consumed(&unit.parent_units);
            self.cache.insert_unstable(props);
            if let Some(best_parent) = &state.best_parent_unit {
                self.cache.add_best_child(best_parent, &unit.unit);
            }
        }

        payments::resolve_payments(conn, unit, &write_set.author_addresses, state, &ctx)?;
        tracker.step(PhaseEvent::WriteSetApplied)?;

        let mut checker = MetricsChecker::new(self.policy, &self.config.protocol, &self.events);
        let mut best_parent_unit = if is_genesis { None } else { state.best_parent_unit.clone() };
        let mut level = if is_genesis { Some(0) } else { None };
        let mut witnessed_level = if is_genesis { Some(0) } else { None };

        if !is_genesis {
            if !light {
                self.install_aa_definitions(conn, unit, state)?;

                if !trust {
                    best_parent_unit = Some(checker.update_best_parent(conn, unit, state)?);
                }
                level = Some(checker.update_level(conn, unit, state, trust)?);
                witnessed_level = match (&best_parent_unit, trust) {
                    (_, true) => state.witnessed_level,
                    (Some(best_parent), false) => {
                        Some(checker.update_witnessed_level(conn, unit, best_parent, state)?)
                    }
                    (None, false) => return Err(WriterError::BestParentNotFound(unit.unit.clone())),
                };

                self.cache.update_unstable(&unit.unit, |props| {
                    props.best_parent_unit = best_parent_unit.clone();
                    props.level = level;
                    props.witnessed_level = witnessed_level;
                });

                debug!(unit = %unit.unit, "Updating main chain");
                self.collaborators
                    .main_chain
                    .update_main_chain(conn, batch, &unit.unit, state.is_aa, &self.cache)?;
            }
            if let Some(hook) = hook {
                debug!(unit = %unit.unit, "Executing pre-commit hook");
                hook(conn)?;
            }
        }
        tracker.step(PhaseEvent::MetricsChecked)?;

        if !is_genesis {
            self.cache
                .add_unstable_messages(&unit.unit, cacheable_messages(&unit.messages));
        }
        let mut snapshot = joint.clone();
        if !light {
            snapshot.unit.main_chain_index = None;
        }
        JointStore::stage_joint(batch, &snapshot)?;

        Ok(UnitWrite {
            is_genesis,
            best_parent_unit: if light && !trust { None } else { best_parent_unit },
            level,
            witnessed_level,
            demoted_units,
            nonfatal_errors: checker.into_reported(),
        })
    }

    fn install_aa_definitions(
        &self,
        conn: &Connection,
        unit: &Unit,
        state: &ValidationState,
    ) -> Result<(), WriterError> {
        if !state.is_aa {
            return Ok(());
        }
        let mci = state
            .initial_trigger_mci
            .ok_or_else(|| WriterError::MissingTriggerMci(unit.unit.clone()))?;
        let payloads: Vec<serde_json::Value> = unit
            .messages
            .iter()
            .filter(|m| m.app == "definition")
            .filter_map(|m| m.payload.clone())
            .collect();
        if payloads.is_empty() {
            return Ok(());
        }
        info!(unit = %unit.unit, count = payloads.len(), "Inserting AA definitions");
        self.collaborators
            .aa_definitions
            .insert_aa_definitions(conn, &payloads, &unit.unit, mci, &self.cache)
    }

    fn recover(&self, conn: &Connection) -> Result<(), WriterError> {
        self.collaborators.spendable_mci.reset_max_spendable_mci();
        self.cache
            .rebuild_from_store(conn, &self.joints, self.config.stable_cache_depth)
    }
}

impl UnitWrite {
    fn into_report(
        self,
        unit: &str,
        tracker: &PhaseTracker,
        lock_wait: Duration,
        elapsed: Duration,
    ) -> CommitReport {
        CommitReport {
            unit: unit.to_string(),
            outcome: tracker.phase().outcome().unwrap_or(CommitOutcome::Committed),
            is_genesis: self.is_genesis,
            best_parent_unit: self.best_parent_unit,
            level: self.level,
            witnessed_level: self.witnessed_level,
            demoted_units: self.demoted_units,
            nonfatal_errors: self.nonfatal_errors,
            lock_wait,
            elapsed,
        }
    }
}

/// Cache entry for a unit about to be written, matching what a rebuild
/// would read back once its metrics are set
fn new_unit_props(unit: &Unit, state: &ValidationState, ctx: &WriteContext<'_>) -> UnitProps {
    let timestamp = if unit.version == ctx.constants.version_without_timestamp {
        0
    } else {
        unit.timestamp.unwrap_or(0)
    };
    let mut author_addresses = unit.author_addresses();
    author_addresses.sort();
    let mut parent_units = unit.parent_units.clone();
    parent_units.sort();

    let (best_parent_unit, witnessed_level) = if ctx.is_genesis {
        (None, Some(0))
    } else if ctx.trust_validator_metrics {
        (state.best_parent_unit.clone(), state.witnessed_level)
    } else {
        (None, None)
    };
    let main_chain_index = if ctx.is_genesis {
        Some(0)
    } else if ctx.light {
        unit.main_chain_index
    } else {
        None
    };

    UnitProps {
        unit: unit.unit.clone(),
        level: if ctx.is_genesis { Some(0) } else { None },
        witnessed_level,
        best_parent_unit,
        latest_included_mc_index: None,
        main_chain_index,
        is_on_main_chain: ctx.is_genesis,
        is_free: true,
        is_stable: ctx.is_genesis,
        timestamp,
        headers_commission: unit.headers_commission.unwrap_or(0),
        payload_commission: unit.payload_commission.unwrap_or(0),
        sequence: state.sequence,
        author_addresses,
        witness_list_unit: unit.effective_witness_list_unit().to_string(),
        parent_units,
        earned_headers_commission_recipients: unit
            .earned_headers_commission_recipients
            .as_ref()
            .filter(|recipients| !recipients.is_empty())
            .map(|recipients| {
                recipients
                    .iter()
                    .map(|r| (r.address.clone(), r.earned_headers_commission_share))
                    .collect()
            }),
    }
}
