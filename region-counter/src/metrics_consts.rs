// ==== Source metrics ====
/// Counter for messages received from the source feed
pub const RECORDS_CONSUMED: &str = "region_counter_records_consumed_total";

/// Counter for source messages skipped because they could not be decoded
pub const DECODE_ERRORS: &str = "region_counter_decode_errors_total";

// ==== Stage metrics ====
/// Counter for filter decisions, labelled by stage and result
pub const FILTER_RESULT: &str = "region_counter_filter_result_total";

/// Counter for records whose group key could not be derived
pub const GROUPING_ERRORS: &str = "region_counter_grouping_errors_total";

/// Counter for group count changes emitted by the count store
pub const COUNT_UPDATES: &str = "region_counter_count_updates_total";

/// Counter for sends that found a partition inbox full
pub const PARTITION_BACKPRESSURE: &str = "region_counter_partition_backpressure_total";

// ==== Sink metrics ====
/// Counter for records published to the sink, labelled by kind (value/tombstone)
pub const SINK_PUBLISHED: &str = "region_counter_sink_published_total";

/// Counter for transient sink failures that were retried
pub const SINK_RETRIES: &str = "region_counter_sink_retries_total";

/// Counter for sink failures that stopped the pipeline
pub const SINK_FAILURES: &str = "region_counter_sink_failures_total";

// ==== Kafka metrics ====
pub const KAFKA_CONSUMER_ERROR: &str = "kafka_consumer_error";
pub const KAFKA_PRODUCER_ERROR: &str = "kafka_producer_error";
