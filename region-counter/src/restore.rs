//! Tracks the startup replay of the source topic.
//!
//! Tables live only in memory and no offsets are committed, so every start
//! replays each source partition from its low watermark. The replay is over
//! once the last offset that existed at startup has been consumed on every
//! partition.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct RestoreProgress {
    // partition -> last offset present at startup
    remaining: HashMap<i32, i64>,
}

impl RestoreProgress {
    /// Build from `(partition, low, high)` watermarks. Empty partitions have
    /// nothing to replay.
    pub fn from_watermarks(watermarks: impl IntoIterator<Item = (i32, i64, i64)>) -> Self {
        let remaining = watermarks
            .into_iter()
            .filter(|(_, low, high)| high > low)
            .map(|(partition, _, high)| (partition, high - 1))
            .collect();
        Self { remaining }
    }

    pub fn is_restoring(&self) -> bool {
        !self.remaining.is_empty()
    }

    pub fn pending_partitions(&self) -> usize {
        self.remaining.len()
    }

    /// Record a consumed offset. Returns true only for the message that
    /// completes the replay.
    pub fn observe(&mut self, partition: i32, offset: i64) -> bool {
        match self.remaining.get(&partition) {
            Some(last) if offset >= *last => {
                self.remaining.remove(&partition);
                self.remaining.is_empty()
            }
            _ => false,
        }
    }
}
