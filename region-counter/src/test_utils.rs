//! In-memory sinks and record builders shared by unit and integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::profile::UserProfile;
use crate::record::ChangeRecord;
use crate::sink::Sink;

/// Records every publish in arrival order.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<ChangeRecord<String, i64>>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<ChangeRecord<String, i64>> {
        self.records.lock().unwrap().clone()
    }

    pub fn records_for(&self, key: &str) -> Vec<ChangeRecord<String, i64>> {
        self.records()
            .into_iter()
            .filter(|r| r.key == key)
            .collect()
    }

    /// The compacted view a downstream reader of the sink would end up with.
    pub fn latest(&self) -> HashMap<String, i64> {
        let mut latest = HashMap::new();
        for record in self.records() {
            match record.value {
                Some(count) => {
                    latest.insert(record.key, count);
                }
                None => {
                    latest.remove(&record.key);
                }
            }
        }
        latest
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn publish(&self, key: &str, count: Option<i64>) -> Result<(), SinkError> {
        self.records.lock().unwrap().push(ChangeRecord {
            key: key.to_string(),
            value: count,
        });
        Ok(())
    }
}

/// Fails the first `failures` publishes with a transient error.
pub struct FlakySink {
    failures: usize,
    attempts: AtomicUsize,
    published: Mutex<Vec<(String, Option<i64>)>>,
}

impl FlakySink {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            attempts: AtomicUsize::new(0),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<(String, Option<i64>)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for FlakySink {
    async fn publish(&self, key: &str, count: Option<i64>) -> Result<(), SinkError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(SinkError::Transient(format!("attempt {attempt} failed")));
        }
        self.published
            .lock()
            .unwrap()
            .push((key.to_string(), count));
        Ok(())
    }
}

/// Rejects every publish with a fatal error.
#[derive(Default)]
pub struct FailingSink {
    attempts: AtomicUsize,
}

impl FailingSink {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for FailingSink {
    async fn publish(&self, key: &str, _count: Option<i64>) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Fatal(format!("refusing {key}")))
    }
}

pub fn profile(experience_len: usize, region: &str) -> UserProfile {
    UserProfile::new("x".repeat(experience_len), region)
}

pub fn upsert(user: &str, experience_len: usize, region: &str) -> ChangeRecord<String, UserProfile> {
    ChangeRecord::upsert(user.to_string(), profile(experience_len, region))
}

pub fn delete(user: &str) -> ChangeRecord<String, UserProfile> {
    ChangeRecord::tombstone(user.to_string())
}
