use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
    Message,
};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, PipelineSettings};
use crate::health::{ComponentStatus, HealthHandle, HealthRegistry};
use crate::kafka::{assign_for_replay, create_kafka_consumer, create_kafka_producer};
use crate::metrics_consts::{KAFKA_CONSUMER_ERROR, RECORDS_CONSUMED};
use crate::partition::PartitionedPipeline;
use crate::restore::RestoreProgress;
use crate::sink::{KafkaSink, RetryingSink, Sink};
use crate::source::{Forwarded, SourceDecoder};

const LIVENESS_DEADLINE: Duration = Duration::from_secs(30);
const CONSUMER_HEALTH_INTERVAL: Duration = Duration::from_secs(10);

pub struct RegionCountService {
    config: Config,
    consumer: StreamConsumer,
    decoder: SourceDecoder,
    sink: Arc<RetryingSink<KafkaSink>>,
    pipeline: PartitionedPipeline,
    restore: RestoreProgress,
    consumer_health: HealthHandle,
    pipeline_health: JoinHandle<()>,
}

impl RegionCountService {
    pub async fn new(
        config: Config,
        settings: PipelineSettings,
        liveness: HealthRegistry,
    ) -> Result<Self> {
        let producer = create_kafka_producer(
            &config,
            liveness.register("kafka-producer", LIVENESS_DEADLINE),
        )
        .await
        .context("Failed to create Kafka producer")?;
        let sink = Arc::new(RetryingSink::new(
            KafkaSink::new(
                producer,
                config.kafka_sink_topic.clone(),
                settings.count_format.codec(),
                config.producer_shutdown_timeout(),
            ),
            settings.sink_retry.clone(),
        ));

        let consumer = create_kafka_consumer(&config).context("Failed to create Kafka consumer")?;
        let restore = assign_for_replay(&consumer, &config)
            .context("Failed to assign source partitions for replay")?;

        let decoder = SourceDecoder::from_settings(&settings);
        let pipeline = PartitionedPipeline::start_restoring(&settings, sink.clone())
            .context("Invalid pipeline settings")?;
        let pipeline_health =
            pipeline.watch_health(liveness.register("pipeline", LIVENESS_DEADLINE));
        let consumer_health = liveness.register("source-consumer", LIVENESS_DEADLINE);

        info!(
            "Region count service initialized: consuming from '{}', producing to '{}'",
            config.kafka_source_topic, config.kafka_sink_topic
        );

        Ok(Self {
            config,
            consumer,
            decoder,
            sink,
            pipeline,
            restore,
            consumer_health,
            pipeline_health,
        })
    }

    /// Consume until `shutdown` fires, a fatal Kafka error occurs or the
    /// pipeline stops on a sink failure. Workers are drained before returning.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting region count service");
        let pipeline_stopped = self.pipeline.cancellation_token();
        let mut health_tick = tokio::time::interval(CONSUMER_HEALTH_INTERVAL);
        let mut consecutive_errors = 0_u64;

        let mut consume_result = if self.restore.is_restoring() {
            Ok(())
        } else {
            self.finish_restore().await
        };

        while consume_result.is_ok() {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = pipeline_stopped.cancelled() => {
                    warn!("Pipeline stopped, leaving consume loop");
                    break;
                }
                _ = health_tick.tick() => {
                    self.consumer_health.report_healthy();
                    continue;
                }
                message = self.consumer.recv() => message,
            };

            match message {
                Ok(message) => {
                    consecutive_errors = 0;
                    metrics::counter!(RECORDS_CONSUMED).increment(1);
                    match self
                        .decoder
                        .forward(&self.pipeline, message.key(), message.payload())
                        .await
                    {
                        Ok(Forwarded::Dispatched) => {}
                        Ok(Forwarded::Skipped(e)) => warn!(
                            "Skipping undecodable message ({}:{} offset {}): {e:#}",
                            message.topic(),
                            message.partition(),
                            message.offset(),
                        ),
                        // the pipeline is gone, shutdown() reports why
                        Err(_) => break,
                    }
                    if self.restore.observe(message.partition(), message.offset()) {
                        consume_result = self.finish_restore().await;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    match classify_consumer_error(&e, consecutive_errors) {
                        ConsumerErrorAction::Retry { label, backoff } => {
                            warn!("Kafka consumer error ({label}): {e}");
                            metrics::counter!(KAFKA_CONSUMER_ERROR, "error" => label)
                                .increment(1);
                            sleep(backoff).await;
                        }
                        ConsumerErrorAction::Stop => {
                            metrics::counter!(KAFKA_CONSUMER_ERROR, "error" => "fatal")
                                .increment(1);
                            self.consumer_health
                                .report_status(ComponentStatus::Unhealthy);
                            if e != KafkaError::Canceled {
                                error!("Fatal Kafka consumer error: {e}");
                                consume_result = Err(anyhow::anyhow!(
                                    "FATAL Kafka error - shutting down consume loop: {e}"
                                ));
                            }
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown(consume_result).await
    }

    async fn finish_restore(&self) -> Result<()> {
        info!(
            "Replay of {} complete, publishing restored counts",
            self.config.kafka_source_topic
        );
        self.pipeline
            .finish_restore()
            .await
            .context("Failed to end the restore phase")
    }

    async fn shutdown(self, consume_result: Result<()>) -> Result<()> {
        info!(
            "Graceful shutdown: releasing source topic {}...",
            self.config.kafka_source_topic
        );
        if let Err(e) = self.consumer.unassign() {
            warn!("Failed to release source partitions: {e}");
        }

        info!("Graceful shutdown: draining partition workers...");
        let pipeline_result = self.pipeline.shutdown().await;
        if let Err(e) = self.pipeline_health.await {
            warn!("Pipeline health reporter failed: {e}");
        }

        info!(
            "Graceful shutdown: flushing producer to sink topic {}...",
            self.config.kafka_sink_topic
        );
        if let Err(e) = self.sink.flush().await {
            warn!("Failed to flush producer on graceful shutdown: {e:#}");
        }
        info!("Graceful shutdown: completed");

        pipeline_result.context("Pipeline stopped on a fatal error")?;
        consume_result
    }
}

#[derive(Debug, PartialEq)]
enum ConsumerErrorAction {
    Retry {
        label: &'static str,
        backoff: Duration,
    },
    Stop,
}

// The consumer is assigned its partitions directly and never commits, so
// rebalance and commit errors cannot reach it.
fn classify_consumer_error(e: &KafkaError, consecutive: u64) -> ConsumerErrorAction {
    let backoff = Duration::from_millis(100 * consecutive.min(10));
    match e {
        // "auto.offset.reset" moves the position back to the start of the log
        KafkaError::MessageConsumption(RDKafkaErrorCode::OffsetOutOfRange) => {
            ConsumerErrorAction::Retry {
                label: "offset_out_of_range",
                backoff: Duration::from_millis(500),
            }
        }
        KafkaError::MessageConsumption(_) => ConsumerErrorAction::Retry {
            label: "consumer",
            backoff,
        },
        KafkaError::Global(
            RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure,
        ) => ConsumerErrorAction::Retry {
            label: "broker_transport",
            backoff: Duration::from_secs(consecutive.min(5)),
        },
        KafkaError::Global(RDKafkaErrorCode::Authentication)
        | KafkaError::MessageConsumptionFatal(_)
        | KafkaError::Canceled => ConsumerErrorAction::Stop,
        _ => ConsumerErrorAction::Retry {
            label: "unexpected",
            backoff,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(KafkaError::MessageConsumption(RDKafkaErrorCode::OffsetOutOfRange), Some("offset_out_of_range"); "offset out of range")]
    #[test_case(KafkaError::MessageConsumption(RDKafkaErrorCode::UnknownTopicOrPartition), Some("consumer"); "consumption error")]
    #[test_case(KafkaError::Global(RDKafkaErrorCode::AllBrokersDown), Some("broker_transport"); "brokers down")]
    #[test_case(KafkaError::Global(RDKafkaErrorCode::Authentication), None; "authentication")]
    #[test_case(KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fatal), None; "fatal consumption")]
    #[test_case(KafkaError::Canceled, None; "canceled")]
    fn test_consumer_error_classification(e: KafkaError, retry_label: Option<&str>) {
        match classify_consumer_error(&e, 1) {
            ConsumerErrorAction::Retry { label, .. } => assert_eq!(Some(label), retry_label),
            ConsumerErrorAction::Stop => assert_eq!(None, retry_label),
        }
    }

    #[test]
    fn test_consumer_backoff_is_capped() {
        let e = KafkaError::MessageConsumption(RDKafkaErrorCode::UnknownTopicOrPartition);
        assert_eq!(
            classify_consumer_error(&e, 3),
            ConsumerErrorAction::Retry {
                label: "consumer",
                backoff: Duration::from_millis(300),
            }
        );
        assert_eq!(
            classify_consumer_error(&e, 1_000),
            ConsumerErrorAction::Retry {
                label: "consumer",
                backoff: Duration::from_secs(1),
            }
        );
    }
}
