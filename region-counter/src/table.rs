//! Compacted table: the latest-value-per-key view of a change feed.

use std::collections::HashMap;
use std::hash::Hash;

use tracing::trace;

use crate::record::ChangeRecord;

/// Applies change records in arrival order and exposes the resulting
/// point-in-time mapping. Every applied record is handed back so the caller
/// can forward it downstream.
#[derive(Debug)]
pub struct CompactedTable<K, V> {
    name: String,
    rows: HashMap<K, V>,
}

impl<K, V> CompactedTable<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: HashMap::new(),
        }
    }

    /// Upsert or delete `record.key`, then re-emit the record unchanged.
    pub fn apply(&mut self, record: ChangeRecord<K, V>) -> ChangeRecord<K, V> {
        trace!(table = %self.name, tombstone = record.is_tombstone(), "Applying change");
        match &record.value {
            Some(value) => {
                self.rows.insert(record.key.clone(), value.clone());
            }
            None => {
                self.rows.remove(&record.key);
            }
        }
        record
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.rows.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.rows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let mut table = CompactedTable::new("test");
        table.apply(ChangeRecord::upsert("k1", 1));
        table.apply(ChangeRecord::upsert("k1", 2));
        table.apply(ChangeRecord::upsert("k2", 5));

        assert_eq!(table.get(&"k1"), Some(&2));
        assert_eq!(table.get(&"k2"), Some(&5));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_tombstone_removes_key() {
        let mut table = CompactedTable::new("test");
        table.apply(ChangeRecord::upsert("k1", 1));
        let emitted = table.apply(ChangeRecord::tombstone("k1"));

        assert!(emitted.is_tombstone());
        assert_eq!(table.get(&"k1"), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_tombstone_for_unknown_key_is_not_an_error() {
        let mut table: CompactedTable<&str, i32> = CompactedTable::new("test");
        let emitted = table.apply(ChangeRecord::tombstone("never-seen"));
        assert_eq!(emitted, ChangeRecord::tombstone("never-seen"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_apply_reemits_record_unchanged() {
        let mut table = CompactedTable::new("test");
        let record = ChangeRecord::upsert("k1".to_string(), vec![1, 2, 3]);
        assert_eq!(table.apply(record.clone()), record);
    }

    #[test]
    fn test_reapplying_same_record_is_idempotent() {
        let mut table = CompactedTable::new("test");
        table.apply(ChangeRecord::upsert("k1", 7));
        table.apply(ChangeRecord::upsert("k1", 7));
        assert_eq!(table.get(&"k1"), Some(&7));
        assert_eq!(table.len(), 1);
    }
}
