//! Output adapters for the final count changelog.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{info, warn};

use crate::codec::Codec;
use crate::config::RetrySettings;
use crate::error::SinkError;
use crate::kafka::KafkaContext;
use crate::metrics_consts::{KAFKA_PRODUCER_ERROR, SINK_PUBLISHED, SINK_RETRIES};

/// Destination for the final changelog. `publish` may block the calling
/// stage; that is the pipeline's backpressure.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Publish the latest count for `key`, or its deletion when `count` is `None`.
    async fn publish(&self, key: &str, count: Option<i64>) -> Result<(), SinkError>;

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Retries transient failures of the wrapped sink with exponential backoff
/// until the attempt budget is spent.
pub struct RetryingSink<S> {
    inner: S,
    settings: RetrySettings,
}

impl<S: Sink> RetryingSink<S> {
    pub fn new(inner: S, settings: RetrySettings) -> Self {
        Self { inner, settings }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn strategy(&self) -> impl Iterator<Item = Duration> {
        // base 2 with factor initial/2 doubles from the initial backoff
        let factor = (self.settings.initial_backoff.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.settings.max_backoff)
            .take(self.settings.max_attempts.saturating_sub(1))
            .map(jitter)
    }
}

#[async_trait]
impl<S: Sink> Sink for RetryingSink<S> {
    async fn publish(&self, key: &str, count: Option<i64>) -> Result<(), SinkError> {
        let mut attempts = 0usize;
        let result = RetryIf::spawn(
            self.strategy(),
            || {
                attempts += 1;
                self.inner.publish(key, count)
            },
            |e: &SinkError| {
                if e.is_transient() {
                    metrics::counter!(SINK_RETRIES).increment(1);
                    warn!(key, error = %e, "Sink publish failed, will retry");
                }
                e.is_transient()
            },
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(SinkError::Transient(last)) => Err(SinkError::RetriesExhausted { attempts, last }),
            Err(e) => Err(e),
        }
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.inner.flush().await
    }
}

/// Publishes counts to a Kafka topic keyed by group.
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    codec: Box<dyn Codec<i64>>,
    flush_timeout: Duration,
}

impl KafkaSink {
    pub fn new(
        producer: FutureProducer<KafkaContext>,
        topic: String,
        codec: Box<dyn Codec<i64>>,
        flush_timeout: Duration,
    ) -> Self {
        Self {
            producer,
            topic,
            codec,
            flush_timeout,
        }
    }
}

#[async_trait]
impl Sink for KafkaSink {
    async fn publish(&self, key: &str, count: Option<i64>) -> Result<(), SinkError> {
        let payload = count
            .map(|c| self.codec.encode(&c))
            .transpose()
            .map_err(|e| SinkError::Fatal(format!("failed to encode count for {key}: {e}")))?;

        let record = FutureRecord {
            topic: &self.topic,
            partition: None, // producer hashes the group key, keeping per-key order
            key: Some(key),
            payload: payload.as_deref(),
            timestamp: None,
            headers: None,
        };

        let future = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| classify_kafka_error(e, "enqueue"))?;

        match future.await {
            Ok(Ok(_)) => {
                let kind = if count.is_some() { "value" } else { "tombstone" };
                metrics::counter!(SINK_PUBLISHED, "kind" => kind).increment(1);
                Ok(())
            }
            Ok(Err((e, _))) => Err(classify_kafka_error(e, "delivery")),
            Err(_) => {
                metrics::counter!(
                    KAFKA_PRODUCER_ERROR,
                    &[("level", "warn"), ("error", "send_future_canceled"),]
                )
                .increment(1);
                Err(SinkError::Transient("send future was canceled".to_string()))
            }
        }
    }

    async fn flush(&self) -> Result<(), SinkError> {
        info!("Flushing producer to sink topic {}", self.topic);
        self.producer.flush(self.flush_timeout).map_err(|e| {
            metrics::counter!(
                KAFKA_PRODUCER_ERROR,
                &[("level", "warn"), ("error", "flush_producer"),]
            )
            .increment(1);
            SinkError::Transient(format!("failed to flush producer: {e:?}"))
        })
    }
}

fn classify_kafka_error(e: KafkaError, stage: &'static str) -> SinkError {
    let transient = matches!(
        e.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::QueueFull
                | RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::NotLeaderForPartition
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NetworkException
        )
    );

    let level = if transient { "warn" } else { "error" };
    metrics::counter!(KAFKA_PRODUCER_ERROR, "level" => level, "error" => stage).increment(1);

    if transient {
        SinkError::Transient(format!("{stage}: {e:?}"))
    } else {
        SinkError::Fatal(format!("{stage}: {e:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FailingSink, FlakySink, MemorySink};

    fn fast_retries(max_attempts: usize) -> RetrySettings {
        RetrySettings {
            max_attempts,
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_retrying_sink_recovers_from_transient_failures() {
        let sink = RetryingSink::new(FlakySink::new(2), fast_retries(5));

        sink.publish("EU", Some(3)).await.unwrap();

        assert_eq!(sink.inner().attempts(), 3);
        assert_eq!(sink.inner().published(), vec![("EU".to_string(), Some(3))]);
    }

    #[tokio::test]
    async fn test_retrying_sink_gives_up_after_budget() {
        let sink = RetryingSink::new(FlakySink::new(10), fast_retries(3));

        let err = sink.publish("EU", Some(3)).await.unwrap_err();

        assert!(matches!(
            err,
            SinkError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(sink.inner().attempts(), 3);
        assert!(sink.inner().published().is_empty());
    }

    #[tokio::test]
    async fn test_retrying_sink_does_not_retry_fatal_errors() {
        let sink = RetryingSink::new(FailingSink::default(), fast_retries(5));

        let err = sink.publish("EU", None).await.unwrap_err();

        assert!(matches!(err, SinkError::Fatal(_)));
        assert_eq!(sink.inner().attempts(), 1);
    }

    #[tokio::test]
    async fn test_retrying_sink_passes_through_success() {
        let sink = RetryingSink::new(MemorySink::default(), fast_retries(1));
        sink.publish("EU", Some(1)).await.unwrap();
        sink.publish("EU", None).await.unwrap();
        assert_eq!(
            sink.inner().records(),
            vec![
                crate::record::ChangeRecord::upsert("EU".to_string(), 1),
                crate::record::ChangeRecord::tombstone("EU".to_string()),
            ]
        );
    }
}
