/// The unit of data flowing between stages: the latest value for `key`, or its
/// deletion when `value` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord<K, V> {
    pub key: K,
    pub value: Option<V>,
}

impl<K, V> ChangeRecord<K, V> {
    pub fn upsert(key: K, value: V) -> Self {
        Self {
            key,
            value: Some(value),
        }
    }

    pub fn tombstone(key: K) -> Self {
        Self { key, value: None }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// A +1/-1 contribution of one source key to a group's count. This is what
/// crosses the re-partitioning boundary between the source-keyed and the
/// group-keyed halves of the aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountDelta<G> {
    pub group: G,
    pub delta: i64,
}

impl<G> CountDelta<G> {
    pub fn increment(group: G) -> Self {
        Self { group, delta: 1 }
    }

    pub fn decrement(group: G) -> Self {
        Self { group, delta: -1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone_has_no_value() {
        let record: ChangeRecord<String, i64> = ChangeRecord::tombstone("EU".to_string());
        assert!(record.is_tombstone());
        assert!(!ChangeRecord::upsert("EU".to_string(), 1).is_tombstone());
    }
}
