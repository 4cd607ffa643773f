use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::{ClientConfig, ClientContext, Offset, Statistics, TopicPartitionList};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::health::HealthHandle;
use crate::restore::RestoreProgress;

const KAFKA_PRODUCER_QUEUE_DEPTH: &str = "kafka_producer_queue_depth";

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl ClientContext for KafkaContext {
    fn stats(&self, stats: Statistics) {
        // librdkafka only emits stats while its background thread is alive
        self.liveness.report_healthy();
        metrics::gauge!(KAFKA_PRODUCER_QUEUE_DEPTH).set(stats.msg_cnt as f64);
    }
}

fn base_client_config(config: &Config) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    client_config
}

pub async fn create_kafka_producer(
    config: &Config,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = base_client_config(config);
    client_config
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.kafka_producer_queue_messages.to_string(),
        )
        // per-key order must survive producer retries
        .set("enable.idempotence", "true");

    debug!("rdkafka producer configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> = client_config.create_with_context(KafkaContext { liveness })?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, config.metadata_timeout())
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

/// Consumer settings for the source topic. Tables are rebuilt from the topic
/// on every start, so offsets are never stored or committed.
pub fn consumer_client_config(config: &Config) -> ClientConfig {
    let mut client_config = base_client_config(config);
    client_config
        .set("group.id", &config.kafka_consumer_group)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        // only consulted when a replay position was compacted or expired away
        .set("auto.offset.reset", "earliest");
    client_config
}

pub fn create_kafka_consumer(config: &Config) -> Result<StreamConsumer, KafkaError> {
    let client_config = consumer_client_config(config);
    debug!("rdkafka consumer configuration: {:?}", client_config);
    client_config.create()
}

/// Assign every partition of the source topic from its beginning and return
/// how far the replay has to go before the tables match the topic.
pub fn assign_for_replay(
    consumer: &StreamConsumer,
    config: &Config,
) -> Result<RestoreProgress, KafkaError> {
    let topic = config.kafka_source_topic.as_str();
    let timeout = config.metadata_timeout();

    let metadata = consumer.fetch_metadata(Some(topic), timeout)?;
    let partitions: Vec<i32> = metadata
        .topics()
        .iter()
        .filter(|t| t.name() == topic)
        .flat_map(|t| t.partitions().iter().map(|p| p.id()))
        .collect();
    if partitions.is_empty() {
        error!("Source topic {topic} has no partitions");
        return Err(KafkaError::MetadataFetch(
            RDKafkaErrorCode::UnknownTopicOrPartition,
        ));
    }

    let mut assignment = TopicPartitionList::new();
    let mut watermarks = Vec::with_capacity(partitions.len());
    for partition in partitions {
        let (low, high) = consumer.fetch_watermarks(topic, partition, timeout)?;
        watermarks.push((partition, low, high));
        assignment.add_partition_offset(topic, partition, Offset::Beginning)?;
    }
    consumer.assign(&assignment)?;

    let progress = RestoreProgress::from_watermarks(watermarks);
    info!(
        "Replaying {topic} from the beginning: {} partition(s) to restore",
        progress.pending_partitions()
    );
    Ok(progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use envconfig::Envconfig;
    use std::collections::HashMap;

    #[test]
    fn test_consumer_never_commits_offsets() {
        // a stale override from an older deployment must not turn commits back on
        let env = HashMap::from([
            ("KAFKA_CONSUMER_AUTO_COMMIT".to_string(), "true".to_string()),
            ("KAFKA_TLS".to_string(), "true".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();
        config.resolve().unwrap();

        let client_config = consumer_client_config(&config);
        assert_eq!(client_config.get("enable.auto.commit"), Some("false"));
        assert_eq!(client_config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(client_config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(client_config.get("security.protocol"), Some("ssl"));
    }
}
