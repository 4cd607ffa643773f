//! Partitioned runtime for the pipeline.
//!
//! Records are routed by user id to source workers, each owning a
//! [`SourceStage`] for its slice of the key space. Count deltas are then
//! re-partitioned by region to group workers, each owning a [`GroupStage`]
//! and publishing to the sink. Every worker is a single task with a bounded
//! inbox, so:
//! 1. Ordering is preserved per user id and per region
//! 2. Partitions run in parallel without sharing mutable state
//! 3. A slow sink backs up into the source through the full inboxes
//!
//! A pipeline started with [`PartitionedPipeline::start_restoring`] rebuilds
//! its tables without publishing. [`PartitionedPipeline::finish_restore`]
//! sends a marker through every source worker; each group worker publishes a
//! snapshot of the regions it touched once the marker has arrived from all of
//! them, and runs live from then on.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use siphasher::sip::SipHasher13;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineSettings;
use crate::error::{ConfigError, PipelineError};
use crate::health::{ComponentStatus, HealthHandle};
use crate::metrics_consts::{PARTITION_BACKPRESSURE, SINK_FAILURES};
use crate::pipeline::{CountRecord, GroupStage, ProfileRecord, SourceStage};
use crate::record::CountDelta;
use crate::sink::Sink;

const SOURCE_WORKER: &str = "source";
const GROUP_WORKER: &str = "group";

/// Stable partition for `key`; the same key always lands on the same worker.
/// `partitions` must be non-zero.
pub fn partition_for<K: Hash + ?Sized>(key: &K, partitions: usize) -> usize {
    let mut hasher = SipHasher13::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

enum SourceMessage {
    Record(ProfileRecord),
    Restored,
}

enum GroupMessage {
    Delta(CountDelta<String>),
    Restored,
}

async fn send_with_backpressure<T>(
    sender: &mpsc::Sender<T>,
    item: T,
    stage: &'static str,
    partition: usize,
) -> Result<(), PipelineError> {
    if sender.capacity() == 0 {
        metrics::counter!(
            PARTITION_BACKPRESSURE,
            "stage" => stage,
            "partition" => partition.to_string()
        )
        .increment(1);
    }
    sender
        .send(item)
        .await
        .map_err(|_| PipelineError::WorkerGone { stage, partition })
}

pub struct PartitionedPipeline {
    source_senders: Vec<mpsc::Sender<SourceMessage>>,
    source_handles: Vec<JoinHandle<Result<(), PipelineError>>>,
    group_handles: Vec<JoinHandle<Result<(), PipelineError>>>,
    cancel: CancellationToken,
}

impl PartitionedPipeline {
    /// Spawn all workers on the current tokio runtime, publishing from the
    /// first record.
    pub fn start(settings: &PipelineSettings, sink: Arc<dyn Sink>) -> Result<Self, ConfigError> {
        Self::spawn(settings, sink, false)
    }

    /// Spawn all workers in restore mode: nothing is published until
    /// [`PartitionedPipeline::finish_restore`].
    pub fn start_restoring(
        settings: &PipelineSettings,
        sink: Arc<dyn Sink>,
    ) -> Result<Self, ConfigError> {
        Self::spawn(settings, sink, true)
    }

    fn spawn(
        settings: &PipelineSettings,
        sink: Arc<dyn Sink>,
        restoring: bool,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        let cancel = CancellationToken::new();

        let mut group_senders = Vec::with_capacity(settings.group_partitions);
        let mut group_handles = Vec::with_capacity(settings.group_partitions);
        for partition in 0..settings.group_partitions {
            let (sender, receiver) = mpsc::channel(settings.partition_channel_capacity);
            let worker = GroupWorker {
                partition,
                stage: GroupStage::new(settings),
                sink: sink.clone(),
                cancel: cancel.clone(),
                restore: restoring.then(|| PendingRestore {
                    markers: settings.source_partitions,
                    touched: HashSet::new(),
                }),
            };
            group_senders.push(sender);
            group_handles.push(tokio::spawn(worker.run(receiver)));
        }

        let mut source_senders = Vec::with_capacity(settings.source_partitions);
        let mut source_handles = Vec::with_capacity(settings.source_partitions);
        for partition in 0..settings.source_partitions {
            let (sender, receiver) = mpsc::channel(settings.partition_channel_capacity);
            let stage = SourceStage::new(settings);
            let handle = tokio::spawn(run_source_worker(
                partition,
                receiver,
                stage,
                group_senders.clone(),
                cancel.clone(),
            ));
            source_senders.push(sender);
            source_handles.push(handle);
        }

        info!(
            source_partitions = settings.source_partitions,
            group_partitions = settings.group_partitions,
            restoring,
            "Started partitioned pipeline"
        );

        Ok(Self {
            source_senders,
            source_handles,
            group_handles,
            cancel,
        })
    }

    /// Hand a record to the worker owning its key. Waits while that worker's
    /// inbox is full.
    pub async fn dispatch(&self, record: ProfileRecord) -> Result<(), PipelineError> {
        let partition = partition_for(record.key.as_str(), self.source_senders.len());
        self.send_to_source(partition, SourceMessage::Record(record))
            .await
    }

    /// End the restore phase. Every record dispatched before this call is
    /// part of the rebuilt state.
    pub async fn finish_restore(&self) -> Result<(), PipelineError> {
        for partition in 0..self.source_senders.len() {
            self.send_to_source(partition, SourceMessage::Restored)
                .await?;
        }
        Ok(())
    }

    async fn send_to_source(
        &self,
        partition: usize,
        message: SourceMessage,
    ) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            sent = send_with_backpressure(
                &self.source_senders[partition],
                message,
                SOURCE_WORKER,
                partition,
            ) => sent,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every worker once it finishes the record in hand.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report healthy to `liveness` while the pipeline runs, and unhealthy
    /// once it is cancelled.
    pub fn watch_health(&self, liveness: HealthHandle) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let interval = liveness.deadline() / 2;
        tokio::spawn(async move {
            loop {
                liveness.report_healthy();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            liveness.report_status(ComponentStatus::Unhealthy);
        })
    }

    /// Close the inboxes, let every worker drain, and report the first failure.
    pub async fn shutdown(self) -> Result<(), PipelineError> {
        drop(self.source_senders);

        let mut first_error = None;
        // source workers hold the group senders; group inboxes close once they exit
        for (stage, handles) in [
            (SOURCE_WORKER, self.source_handles),
            (GROUP_WORKER, self.group_handles),
        ] {
            for (partition, handle) in handles.into_iter().enumerate() {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!("Partition worker {stage}/{partition} panicked: {e}");
                        Err(PipelineError::WorkerGone { stage, partition })
                    }
                };
                if let Err(e) = result {
                    first_error = Some(prefer_root_cause(first_error, e));
                }
            }
        }

        // workers stopped, nothing left to report on
        self.cancel.cancel();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// A worker that lost its downstream only reports a symptom; keep the sink
// error that caused it.
fn prefer_root_cause(current: Option<PipelineError>, next: PipelineError) -> PipelineError {
    match current {
        Some(PipelineError::Sink(e)) => PipelineError::Sink(e),
        Some(current) if !matches!(next, PipelineError::Sink(_)) => current,
        _ => next,
    }
}

async fn run_source_worker(
    partition: usize,
    mut receiver: mpsc::Receiver<SourceMessage>,
    mut stage: SourceStage,
    group_senders: Vec<mpsc::Sender<GroupMessage>>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    debug!("Source worker {partition} started");
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = receiver.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        let outgoing: Vec<(usize, GroupMessage)> = match message {
            SourceMessage::Record(record) => stage
                .process(record)
                .into_iter()
                .map(|delta| {
                    let target = partition_for(delta.group.as_str(), group_senders.len());
                    (target, GroupMessage::Delta(delta))
                })
                .collect(),
            // every group worker waits for the marker from every source worker
            SourceMessage::Restored => (0..group_senders.len())
                .map(|target| (target, GroupMessage::Restored))
                .collect(),
        };

        for (target, message) in outgoing {
            if let Err(e) =
                send_with_backpressure(&group_senders[target], message, GROUP_WORKER, target).await
            {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                warn!("Source worker {partition} lost its downstream: {e}");
                cancel.cancel();
                return Err(e);
            }
        }
    }
    debug!("Source worker {partition} stopped");
    Ok(())
}

struct PendingRestore {
    markers: usize,
    touched: HashSet<String>,
}

struct GroupWorker {
    partition: usize,
    stage: GroupStage,
    sink: Arc<dyn Sink>,
    cancel: CancellationToken,
    restore: Option<PendingRestore>,
}

impl GroupWorker {
    async fn run(mut self, mut receiver: mpsc::Receiver<GroupMessage>) -> Result<(), PipelineError> {
        debug!("Group worker {} started", self.partition);
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
            };

            match message {
                GroupMessage::Delta(delta) => {
                    let region = delta.group.clone();
                    let out = self.stage.process(delta);
                    if let Some(restore) = self.restore.as_mut() {
                        restore.touched.insert(region);
                        continue;
                    }
                    if let Some(out) = out {
                        self.publish(out).await?;
                    }
                }
                GroupMessage::Restored => self.on_restore_marker().await?,
            }
        }
        debug!("Group worker {} stopped", self.partition);
        Ok(())
    }

    async fn on_restore_marker(&mut self) -> Result<(), PipelineError> {
        let Some(restore) = self.restore.as_mut() else {
            return Ok(());
        };
        restore.markers = restore.markers.saturating_sub(1);
        if restore.markers > 0 {
            return Ok(());
        }

        let touched = std::mem::take(&mut restore.touched);
        self.restore = None;
        info!(
            regions = touched.len(),
            "Group worker {} restored, publishing snapshot", self.partition
        );
        for out in self.stage.snapshot(touched) {
            self.publish(out).await?;
        }
        Ok(())
    }

    async fn publish(&self, out: CountRecord) -> Result<(), PipelineError> {
        if let Err(e) = self.sink.publish(&out.key, out.value).await {
            error!(
                region = %out.key,
                "Group worker {} failed to publish, stopping pipeline: {e}", self.partition
            );
            metrics::counter!(SINK_FAILURES).increment(1);
            self.cancel.cancel();
            return Err(e.into());
        }
        Ok(())
    }
}
