//! The user-region pipeline:
//! profiles → completeness filter → region count → threshold filter → sink.
//!
//! [`Pipeline`] runs every stage on one owner and is what the partitioned
//! runtime in [`crate::partition`] splits in two at the region boundary:
//! [`SourceStage`] (keyed by user id) and [`GroupStage`] (keyed by region).

use crate::config::PipelineSettings;
use crate::error::{GroupingError, SinkError};
use crate::profile::UserProfile;
use crate::record::{ChangeRecord, CountDelta};
use crate::sink::Sink;
use crate::stages::{CountStore, FilterStage, GroupAssigner, GroupCountStage};
use crate::table::CompactedTable;

pub const PROFILES_TABLE: &str = "profiles";
pub const COMPLETE_PROFILES_TABLE: &str = "complete_profiles";
pub const COMPLETENESS_STAGE: &str = "completeness";
pub const THRESHOLD_STAGE: &str = "threshold";

pub type ProfileRecord = ChangeRecord<String, UserProfile>;
pub type CountRecord = ChangeRecord<String, i64>;

pub fn completeness_filter(min_bytes: usize) -> FilterStage<String, UserProfile> {
    FilterStage::new(COMPLETENESS_STAGE, move |_, profile: &UserProfile| {
        profile.is_complete(min_bytes)
    })
}

pub fn threshold_filter(threshold: i64) -> FilterStage<String, i64> {
    FilterStage::new(THRESHOLD_STAGE, move |_, count: &i64| *count > threshold)
}

fn region_of(profile: &UserProfile) -> Result<String, GroupingError> {
    profile.region_key()
}

/// Source-keyed half: raw profiles in, region count deltas out.
pub struct SourceStage {
    profiles: CompactedTable<String, UserProfile>,
    completeness: FilterStage<String, UserProfile>,
    complete_profiles: CompactedTable<String, UserProfile>,
    assigner: GroupAssigner<String, UserProfile, String>,
}

impl SourceStage {
    pub fn new(settings: &PipelineSettings) -> Self {
        Self {
            profiles: CompactedTable::new(PROFILES_TABLE),
            completeness: completeness_filter(settings.completeness_threshold),
            complete_profiles: CompactedTable::new(COMPLETE_PROFILES_TABLE),
            assigner: GroupAssigner::new(region_of),
        }
    }

    pub fn process(&mut self, record: ProfileRecord) -> Vec<CountDelta<String>> {
        let record = self.profiles.apply(record);
        let Some(record) = self.completeness.process(record) else {
            return Vec::new();
        };
        let record = self.complete_profiles.apply(record);
        self.assigner.assign(&record)
    }

    pub fn profiles(&self) -> &CompactedTable<String, UserProfile> {
        &self.profiles
    }

    pub fn region_of(&self, user: &str) -> Option<&String> {
        self.assigner.group_of(&user.to_string())
    }
}

/// Region-keyed half: count deltas in, threshold-filtered count changes out.
pub struct GroupStage {
    store: CountStore<String>,
    counts: CompactedTable<String, i64>,
    threshold: FilterStage<String, i64>,
}

impl GroupStage {
    pub fn new(settings: &PipelineSettings) -> Self {
        Self {
            store: CountStore::new(settings.count_store_name.clone()),
            counts: CompactedTable::new(settings.count_store_name.clone()),
            threshold: threshold_filter(settings.count_threshold),
        }
    }

    pub fn process(&mut self, delta: CountDelta<String>) -> Option<CountRecord> {
        let row = self.counts.apply(self.store.apply(delta));
        self.threshold.process(row)
    }

    pub fn count(&self, region: &str) -> i64 {
        self.store.count(&region.to_string())
    }

    pub fn counts(&self) -> &CompactedTable<String, i64> {
        &self.counts
    }

    /// The published view of `regions` as it stands now: the count for
    /// regions above the threshold, a tombstone for every other one.
    pub fn snapshot(&self, regions: impl IntoIterator<Item = String>) -> Vec<CountRecord> {
        regions
            .into_iter()
            .map(|region| {
                if self.threshold.is_passing(&region) {
                    let count = self.store.count(&region);
                    ChangeRecord::upsert(region, count)
                } else {
                    ChangeRecord::tombstone(region)
                }
            })
            .collect()
    }
}

/// All stages on a single owner, in order.
pub struct Pipeline {
    profiles: CompactedTable<String, UserProfile>,
    completeness: FilterStage<String, UserProfile>,
    complete_profiles: CompactedTable<String, UserProfile>,
    region_counts: GroupCountStage<String, UserProfile, String>,
    counts: CompactedTable<String, i64>,
    threshold: FilterStage<String, i64>,
}

impl Pipeline {
    pub fn new(settings: &PipelineSettings) -> Self {
        Self {
            profiles: CompactedTable::new(PROFILES_TABLE),
            completeness: completeness_filter(settings.completeness_threshold),
            complete_profiles: CompactedTable::new(COMPLETE_PROFILES_TABLE),
            region_counts: GroupCountStage::new(
                region_of,
                CountStore::new(settings.count_store_name.clone()),
            ),
            counts: CompactedTable::new(settings.count_store_name.clone()),
            threshold: threshold_filter(settings.count_threshold),
        }
    }

    /// Push one source record through every stage and return what reaches the sink.
    pub fn process(&mut self, record: ProfileRecord) -> Vec<CountRecord> {
        let record = self.profiles.apply(record);
        let Some(record) = self.completeness.process(record) else {
            return Vec::new();
        };
        let record = self.complete_profiles.apply(record);

        self.region_counts
            .process(&record)
            .into_iter()
            .map(|row| self.counts.apply(row))
            .filter_map(|row| self.threshold.process(row))
            .collect()
    }

    /// Like [`Pipeline::process`], publishing each output before returning.
    pub async fn process_into(
        &mut self,
        record: ProfileRecord,
        sink: &dyn Sink,
    ) -> Result<(), SinkError> {
        for out in self.process(record) {
            sink.publish(&out.key, out.value).await?;
        }
        Ok(())
    }

    pub fn count(&self, region: &str) -> i64 {
        self.region_counts.count(&region.to_string())
    }

    pub fn region_of(&self, user: &str) -> Option<&String> {
        self.region_counts.group_of(&user.to_string())
    }

    pub fn profiles(&self) -> &CompactedTable<String, UserProfile> {
        &self.profiles
    }

    pub fn complete_profiles(&self) -> &CompactedTable<String, UserProfile> {
        &self.complete_profiles
    }

    pub fn counts(&self) -> &CompactedTable<String, i64> {
        &self.counts
    }

    pub fn is_published(&self, region: &str) -> bool {
        self.threshold.is_passing(&region.to_string())
    }
}
