//! Group-by-count aggregation.
//!
//! The aggregation is split at the re-partitioning boundary:
//! - [`GroupAssigner`] is keyed by source key and remembers which group each
//!   key currently contributes to, turning change records into [`CountDelta`]s.
//! - [`CountStore`] is keyed by group and folds deltas into running counts,
//!   emitting the changelog of the count table.
//!
//! [`GroupCountStage`] composes both halves for a single-owner pipeline. In the
//! partitioned runtime the deltas travel between the two over a channel routed
//! by group key.

use std::collections::HashMap;
use std::hash::Hash;

use tracing::warn;

use crate::error::GroupingError;
use crate::metrics_consts::{COUNT_UPDATES, GROUPING_ERRORS};
use crate::record::{ChangeRecord, CountDelta};

type GroupKeyFn<V, G> = Box<dyn Fn(&V) -> Result<G, GroupingError> + Send + Sync>;

pub struct GroupAssigner<K, V, G> {
    group_of: HashMap<K, G>,
    group_key_of: GroupKeyFn<V, G>,
}

impl<K, V, G> GroupAssigner<K, V, G>
where
    K: Eq + Hash + Clone,
    G: Eq + Clone,
{
    pub fn new<F>(group_key_of: F) -> Self
    where
        F: Fn(&V) -> Result<G, GroupingError> + Send + Sync + 'static,
    {
        Self {
            group_of: HashMap::new(),
            group_key_of: Box::new(group_key_of),
        }
    }

    /// Work out how `record` moves its key between groups.
    ///
    /// Returns at most two deltas, always decrement-then-increment when a key
    /// is reassigned. A record that keeps its key in the same group yields none.
    pub fn assign(&mut self, record: &ChangeRecord<K, V>) -> Vec<CountDelta<G>> {
        let new_group = match &record.value {
            None => None,
            Some(value) => match (self.group_key_of)(value) {
                Ok(group) => Some(group),
                Err(e) => {
                    metrics::counter!(GROUPING_ERRORS, "reason" => e.reason()).increment(1);
                    None
                }
            },
        };

        let Some(new_group) = new_group else {
            return match self.group_of.remove(&record.key) {
                Some(old_group) => vec![CountDelta::decrement(old_group)],
                None => Vec::new(),
            };
        };

        match self.group_of.insert(record.key.clone(), new_group.clone()) {
            Some(old_group) if old_group == new_group => Vec::new(),
            Some(old_group) => vec![
                CountDelta::decrement(old_group),
                CountDelta::increment(new_group),
            ],
            None => vec![CountDelta::increment(new_group)],
        }
    }

    pub fn group_of(&self, key: &K) -> Option<&G> {
        self.group_of.get(key)
    }

    pub fn assignments(&self) -> impl Iterator<Item = (&K, &G)> {
        self.group_of.iter()
    }
}

/// Running count of source keys per group. Owned by exactly one stage and
/// dropped with it.
#[derive(Debug)]
pub struct CountStore<G> {
    name: String,
    counts: HashMap<G, i64>,
}

impl<G> CountStore<G>
where
    G: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counts: HashMap::new(),
        }
    }

    /// Fold one delta into the store and return the group's new row. A group
    /// whose count reaches zero no longer exists and is emitted as a tombstone.
    pub fn apply(&mut self, delta: CountDelta<G>) -> ChangeRecord<G, i64> {
        let count = self.counts.entry(delta.group.clone()).or_insert(0);
        *count += delta.delta;
        let count = *count;

        metrics::counter!(COUNT_UPDATES, "store" => self.name.clone()).increment(1);

        if count > 0 {
            return ChangeRecord::upsert(delta.group, count);
        }

        if count < 0 {
            warn!(
                store = %self.name,
                group = ?delta.group,
                count,
                "Count went negative, dropping group"
            );
        }
        self.counts.remove(&delta.group);
        ChangeRecord::tombstone(delta.group)
    }

    pub fn count(&self, group: &G) -> i64 {
        self.counts.get(group).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&G, &i64)> {
        self.counts.iter()
    }
}

pub struct GroupCountStage<K, V, G> {
    assigner: GroupAssigner<K, V, G>,
    store: CountStore<G>,
}

impl<K, V, G> GroupCountStage<K, V, G>
where
    K: Eq + Hash + Clone,
    G: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new<F>(group_key_of: F, store: CountStore<G>) -> Self
    where
        F: Fn(&V) -> Result<G, GroupingError> + Send + Sync + 'static,
    {
        Self {
            assigner: GroupAssigner::new(group_key_of),
            store,
        }
    }

    /// Emits zero, one or two count changes for one input record.
    pub fn process(&mut self, record: &ChangeRecord<K, V>) -> Vec<ChangeRecord<G, i64>> {
        self.assigner
            .assign(record)
            .into_iter()
            .map(|delta| self.store.apply(delta))
            .collect()
    }

    pub fn count(&self, group: &G) -> i64 {
        self.store.count(group)
    }

    pub fn group_of(&self, key: &K) -> Option<&G> {
        self.assigner.group_of(key)
    }

    pub fn store(&self) -> &CountStore<G> {
        &self.store
    }

    pub fn assigner(&self) -> &GroupAssigner<K, V, G> {
        &self.assigner
    }
}
