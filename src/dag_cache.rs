//! In-process DAG cache
//!
//! Unit id to derived properties, split into an unstable and a stable
//! partition. The commit coordinator and the main chain sweep are the only
//! writers, and they go through the mutation methods below. After a failed
//! commit the whole cache is rebuilt from storage.

use std::collections::{BTreeMap, BTreeSet};

use dashmap::DashMap;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::units;
use crate::error::WriterError;
use crate::joint::Message;
use crate::kv::JointStore;
use crate::validation::Sequence;

/// Derived properties of a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitProps {
    pub unit: String,
    pub level: Option<u64>,
    pub witnessed_level: Option<u64>,
    pub best_parent_unit: Option<String>,
    pub latest_included_mc_index: Option<u64>,
    pub main_chain_index: Option<u64>,
    pub is_on_main_chain: bool,
    pub is_free: bool,
    pub is_stable: bool,
    pub timestamp: u64,
    pub headers_commission: u64,
    pub payload_commission: u64,
    pub sequence: Sequence,
    /// Sorted
    pub author_addresses: Vec<String>,
    /// The unit itself when it declares its witnesses inline
    pub witness_list_unit: String,
    /// Sorted
    pub parent_units: Vec<String>,
    pub earned_headers_commission_recipients: Option<BTreeMap<String, u32>>,
}

impl UnitProps {
    pub fn is_genesis(&self) -> bool {
        self.parent_units.is_empty()
    }
}

/// Ordered copy of the whole cache, for comparisons and diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CacheSnapshot {
    pub unstable: BTreeMap<String, UnitProps>,
    pub stable: BTreeMap<String, UnitProps>,
    pub stable_units_by_mci: BTreeMap<u64, BTreeSet<String>>,
    pub best_children: BTreeMap<String, BTreeSet<String>>,
    pub unstable_message_units: BTreeSet<String>,
    pub hash_tree_units_by_ball: BTreeMap<String, String>,
}

/// Process-wide DAG cache
#[derive(Default)]
pub struct DagCache {
    unstable: DashMap<String, UnitProps>,
    stable: DashMap<String, UnitProps>,
    stable_units_by_mci: DashMap<u64, Vec<String>>,
    /// Best parent to the unstable units that picked it
    best_children: DashMap<String, Vec<String>>,
    /// `data_feed` and `definition` messages of unstable units
    unstable_messages: DashMap<String, Vec<Message>>,
    hash_tree_units_by_ball: DashMap<String, String>,
}

impl DagCache {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Props of a unit from either partition
    pub fn get(&self, unit: &str) -> Option<UnitProps> {
        if let Some(props) = self.unstable.get(unit) {
            return Some(props.clone());
        }
        self.stable.get(unit).map(|props| props.clone())
    }

    pub fn is_unstable(&self, unit: &str) -> bool {
        self.unstable.contains_key(unit)
    }

    pub fn is_stable(&self, unit: &str) -> bool {
        self.stable.contains_key(unit)
    }

    pub fn unstable_count(&self) -> usize {
        self.unstable.len()
    }

    pub fn stable_count(&self) -> usize {
        self.stable.len()
    }

    pub fn stable_units_at_mci(&self, mci: u64) -> Vec<String> {
        self.stable_units_by_mci
            .get(&mci)
            .map(|units| units.clone())
            .unwrap_or_default()
    }

    pub fn best_children(&self, unit: &str) -> Vec<String> {
        self.best_children
            .get(unit)
            .map(|children| children.clone())
            .unwrap_or_default()
    }

    pub fn unstable_messages(&self, unit: &str) -> Vec<Message> {
        self.unstable_messages
            .get(unit)
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    pub fn hash_tree_unit(&self, ball: &str) -> Option<String> {
        self.hash_tree_units_by_ball.get(ball).map(|unit| unit.clone())
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let props = |map: &DashMap<String, UnitProps>| {
            map.iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect()
        };
        CacheSnapshot {
            unstable: props(&self.unstable),
            stable: props(&self.stable),
            stable_units_by_mci: self
                .stable_units_by_mci
                .iter()
                .map(|entry| (*entry.key(), entry.value().iter().cloned().collect()))
                .collect(),
            best_children: self
                .best_children
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().iter().cloned().collect()))
                .collect(),
            unstable_message_units: self
                .unstable_messages
                .iter()
                .map(|entry| entry.key().clone())
                .collect(),
            hash_tree_units_by_ball: self
                .hash_tree_units_by_ball
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub fn insert_unstable(&self, props: UnitProps) {
        debug!(unit = %props.unit, "Caching unstable unit");
        self.unstable.insert(props.unit.clone(), props);
    }

    pub fn insert_stable(&self, props: UnitProps) {
        debug!(unit = %props.unit, mci = ?props.main_chain_index, "Caching stable unit");
        if let Some(mci) = props.main_chain_index {
            let mut units = self.stable_units_by_mci.entry(mci).or_default();
            if !units.contains(&props.unit) {
                units.push(props.unit.clone());
            }
        }
        self.stable.insert(props.unit.clone(), props);
    }

    /// Apply `f` to an unstable unit's props; false when the unit is not cached
    pub fn update_unstable<F>(&self, unit: &str, f: F) -> bool
    where
        F: FnOnce(&mut UnitProps),
    {
        match self.unstable.get_mut(unit) {
            Some(mut props) => {
                f(&mut props);
                true
            }
            None => false,
        }
    }

    /// Move a unit into the stable partition at `mci`
    pub fn promote_to_stable(&self, unit: &str, mci: u64) -> bool {
        let Some((_, mut props)) = self.unstable.remove(unit) else {
            warn!(unit = %unit, "Cannot stabilize unit missing from the unstable cache");
            return false;
        };
        props.is_stable = true;
        props.main_chain_index = Some(mci);
        self.best_children.remove(unit);
        self.unstable_messages.remove(unit);
        self.insert_stable(props);
        true
    }

    /// Parents gained a child and are no longer free
    pub fn mark_consumed(&self, parent_units: &[String]) {
        for parent in parent_units {
            let mut found = false;
            if let Some(mut props) = self.unstable.get_mut(parent) {
                props.is_free = false;
                found = true;
            }
            if let Some(mut props) = self.stable.get_mut(parent) {
                props.is_free = false;
                found = true;
            }
            if !found {
                debug!(unit = %parent, "Consumed parent not in cache");
            }
        }
    }

    /// Degrade cached `good` units to `temp-bad`; returns the units changed.
    ///
    /// Units absent from the unstable partition are skipped.
    pub fn demote_to_temp_bad(&self, units: &[String]) -> Vec<String> {
        let mut demoted = Vec::new();
        for unit in units {
            match self.unstable.get_mut(unit) {
                Some(mut props) => {
                    if props.sequence == Sequence::Good {
                        props.sequence = Sequence::TempBad;
                        demoted.push(unit.clone());
                    }
                }
                None => warn!(unit = %unit, "Conflicting unit not in unstable cache, skipping"),
            }
        }
        demoted
    }

    /// Record `child` under its best parent when the parent is still unstable
    pub fn add_best_child(&self, best_parent_unit: &str, child: &str) {
        if !self.unstable.contains_key(best_parent_unit) {
            return;
        }
        let mut children = self.best_children.entry(best_parent_unit.to_string()).or_default();
        if !children.iter().any(|c| c == child) {
            children.push(child.to_string());
        }
    }

    pub fn add_unstable_messages(&self, unit: &str, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        self.unstable_messages.insert(unit.to_string(), messages);
    }

    pub fn add_hash_tree_ball(&self, ball: &str, unit: &str) {
        self.hash_tree_units_by_ball
            .insert(ball.to_string(), unit.to_string());
    }

    /// The unit for this ball has arrived
    pub fn remove_hash_tree_ball(&self, ball: &str) -> Option<String> {
        self.hash_tree_units_by_ball.remove(ball).map(|(_, unit)| unit)
    }

    pub fn clear(&self) {
        self.unstable.clear();
        self.stable.clear();
        self.stable_units_by_mci.clear();
        self.best_children.clear();
        self.unstable_messages.clear();
        self.hash_tree_units_by_ball.clear();
    }

    /// Drop everything and reload from committed storage.
    ///
    /// Loads all unstable units and the stable units of the last
    /// `stable_depth` main chain indexes.
    pub fn rebuild_from_store(
        &self,
        conn: &Connection,
        joints: &JointStore,
        stable_depth: u64,
    ) -> Result<(), WriterError> {
        let unstable = units::read_unstable_units(conn)?;
        let stable = units::read_recent_stable_units(conn, stable_depth)?;
        let hash_tree_balls = units::read_hash_tree_balls(conn)?;

        self.clear();

        for props in stable {
            self.insert_stable(props);
        }
        for props in &unstable {
            self.unstable.insert(props.unit.clone(), props.clone());
        }
        for props in &unstable {
            if let Some(best_parent) = &props.best_parent_unit {
                self.add_best_child(best_parent, &props.unit);
            }
            if let Some(joint) = joints.get_joint(&props.unit)? {
                self.add_unstable_messages(&props.unit, cacheable_messages(&joint.unit.messages));
            }
        }
        for (ball, unit) in hash_tree_balls {
            self.add_hash_tree_ball(&ball, &unit);
        }

        info!(
            unstable = self.unstable.len(),
            stable = self.stable.len(),
            "Rebuilt DAG cache from storage"
        );
        Ok(())
    }
}

/// Messages that stay in memory while their unit is unstable
pub fn cacheable_messages(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .filter(|m| m.app == "data_feed" || m.app == "definition")
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(unit: &str, parents: &[&str]) -> UnitProps {
        UnitProps {
            unit: unit.to_string(),
            level: Some(1),
            witnessed_level: Some(0),
            best_parent_unit: parents.first().map(|p| p.to_string()),
            latest_included_mc_index: None,
            main_chain_index: None,
            is_on_main_chain: false,
            is_free: true,
            is_stable: false,
            timestamp: 0,
            headers_commission: 0,
            payload_commission: 0,
            sequence: Sequence::Good,
            author_addresses: vec!["A".into()],
            witness_list_unit: "W".into(),
            parent_units: parents.iter().map(|p| p.to_string()).collect(),
            earned_headers_commission_recipients: None,
        }
    }

    #[test]
    fn test_demote_only_touches_good_unstable_units() {
        let cache = DagCache::new();
        cache.insert_unstable(props("A", &["G"]));
        let mut bad = props("B", &["G"]);
        bad.sequence = Sequence::FinalBad;
        cache.insert_unstable(bad);

        let demoted = cache.demote_to_temp_bad(&["A".into(), "B".into(), "MISSING".into()]);
        assert_eq!(demoted, vec!["A".to_string()]);
        assert_eq!(cache.get("A").unwrap().sequence, Sequence::TempBad);
        assert_eq!(cache.get("B").unwrap().sequence, Sequence::FinalBad);
    }

    #[test]
    fn test_promote_moves_partitions() {
        let cache = DagCache::new();
        cache.insert_unstable(props("A", &["G"]));
        cache.insert_unstable(props("B", &["A"]));
        cache.add_best_child("A", "B");
        assert_eq!(cache.best_children("A"), vec!["B".to_string()]);

        assert!(cache.promote_to_stable("A", 1));
        assert!(cache.is_stable("A"));
        assert!(!cache.is_unstable("A"));
        assert_eq!(cache.stable_units_at_mci(1), vec!["A".to_string()]);
        assert!(cache.best_children("A").is_empty());
        assert!(!cache.promote_to_stable("A", 1));
    }

    #[test]
    fn test_best_child_requires_unstable_parent() {
        let cache = DagCache::new();
        let mut genesis = props("G", &[]);
        genesis.is_stable = true;
        genesis.main_chain_index = Some(0);
        cache.insert_stable(genesis);
        cache.add_best_child("G", "A");
        assert!(cache.best_children("G").is_empty());
    }

    #[test]
    fn test_mark_consumed_in_both_partitions() {
        let cache = DagCache::new();
        let mut genesis = props("G", &[]);
        genesis.main_chain_index = Some(0);
        cache.insert_stable(genesis);
        cache.insert_unstable(props("A", &["G"]));
        cache.mark_consumed(&["G".into(), "A".into()]);
        assert!(!cache.get("G").unwrap().is_free);
        assert!(!cache.get("A").unwrap().is_free);
    }

    #[test]
    fn test_hash_tree_balls() {
        let cache = DagCache::new();
        cache.add_hash_tree_ball("ball", "U");
        assert_eq!(cache.hash_tree_unit("ball").as_deref(), Some("U"));
        assert_eq!(cache.remove_hash_tree_ball("ball").as_deref(), Some("U"));
        assert!(cache.snapshot().hash_tree_units_by_ball.is_empty());
    }
}
