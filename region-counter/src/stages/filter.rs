use std::collections::HashSet;
use std::hash::Hash;

use crate::metrics_consts::FILTER_RESULT;
use crate::record::ChangeRecord;

type Predicate<K, V> = Box<dyn Fn(&K, &V) -> bool + Send + Sync>;

/// Drops records failing a predicate while keeping downstream tables compacted:
/// a key that stops matching is retracted with a tombstone instead of silently
/// going stale.
pub struct FilterStage<K, V> {
    name: &'static str,
    predicate: Predicate<K, V>,
    passing: HashSet<K>,
}

impl<K, V> FilterStage<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new<F>(name: &'static str, predicate: F) -> Self
    where
        F: Fn(&K, &V) -> bool + Send + Sync + 'static,
    {
        Self {
            name,
            predicate: Box::new(predicate),
            passing: HashSet::new(),
        }
    }

    pub fn process(&mut self, record: ChangeRecord<K, V>) -> Option<ChangeRecord<K, V>> {
        let Some(value) = &record.value else {
            self.passing.remove(&record.key);
            self.observe("tombstone");
            return Some(record);
        };

        if (self.predicate)(&record.key, value) {
            self.passing.insert(record.key.clone());
            self.observe("pass");
            return Some(record);
        }

        if self.passing.remove(&record.key) {
            self.observe("retract");
            Some(ChangeRecord::tombstone(record.key))
        } else {
            self.observe("reject");
            None
        }
    }

    pub fn is_passing(&self, key: &K) -> bool {
        self.passing.contains(key)
    }

    pub fn passing_len(&self) -> usize {
        self.passing.len()
    }

    fn observe(&self, result: &'static str) {
        metrics::counter!(FILTER_RESULT, "stage" => self.name, "result" => result).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn over_ten() -> FilterStage<&'static str, i64> {
        FilterStage::new("test", |_, count: &i64| *count > 10)
    }

    #[test]
    fn test_matching_record_passes_unchanged() {
        let mut filter = over_ten();
        let record = ChangeRecord::upsert("EU", 11);
        assert_eq!(filter.process(record.clone()), Some(record));
        assert!(filter.is_passing(&"EU"));
    }

    #[test]
    fn test_never_matching_key_emits_nothing() {
        let mut filter = over_ten();
        assert_eq!(filter.process(ChangeRecord::upsert("EU", 3)), None);
        assert_eq!(filter.process(ChangeRecord::upsert("EU", 4)), None);
        assert!(!filter.is_passing(&"EU"));
    }

    #[test]
    fn test_key_that_stops_matching_is_retracted_once() {
        let mut filter = over_ten();
        filter.process(ChangeRecord::upsert("EU", 11));

        assert_eq!(
            filter.process(ChangeRecord::upsert("EU", 10)),
            Some(ChangeRecord::tombstone("EU"))
        );
        assert_eq!(filter.process(ChangeRecord::upsert("EU", 9)), None);
        assert_eq!(filter.passing_len(), 0);
    }

    #[test]
    fn test_incoming_tombstone_is_forwarded() {
        let mut filter = over_ten();
        filter.process(ChangeRecord::upsert("EU", 11));

        assert_eq!(
            filter.process(ChangeRecord::tombstone("EU")),
            Some(ChangeRecord::tombstone("EU"))
        );
        assert!(!filter.is_passing(&"EU"));

        // forwarded even for keys that never passed
        assert_eq!(
            filter.process(ChangeRecord::tombstone("APAC")),
            Some(ChangeRecord::tombstone("APAC"))
        );
    }

    #[test]
    fn test_predicate_sees_the_key() {
        let mut filter: FilterStage<&str, i64> = FilterStage::new("test", |k: &&str, _: &i64| k.starts_with('E'));
        assert!(filter.process(ChangeRecord::upsert("EU", 0)).is_some());
        assert!(filter.process(ChangeRecord::upsert("APAC", 0)).is_none());
    }
}
