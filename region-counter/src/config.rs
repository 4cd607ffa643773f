use std::time::Duration;

use envconfig::Envconfig;

use crate::codec::{CountFormat, KeyFormat, ProfileFormat};
use crate::error::ConfigError;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "streams-user-region-example")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "15")]
    pub kafka_metadata_timeout_secs: u64,

    #[envconfig(default = "UserProfile")]
    pub kafka_source_topic: String,

    #[envconfig(default = "LargeCountsByRegion")]
    pub kafka_sink_topic: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Producer configuration
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(default = "10")]
    pub kafka_producer_graceful_shutdown_secs: u64,

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32,

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String,

    // Serialization
    #[envconfig(default = "string")]
    pub key_format: String,

    #[envconfig(default = "json")]
    pub profile_format: String,

    #[envconfig(default = "long")]
    pub count_format: String,

    // Aggregation
    #[envconfig(default = "CountsByRegion")]
    pub count_store_name: String,

    #[envconfig(default = "200")]
    pub completeness_threshold: usize,

    #[envconfig(default = "10000000")]
    pub count_threshold: i64,

    // Partitioned runtime
    #[envconfig(default = "4")]
    pub source_partitions: usize,

    #[envconfig(default = "4")]
    pub group_partitions: usize,

    #[envconfig(default = "1024")]
    pub partition_channel_capacity: usize,

    // Sink retries
    #[envconfig(default = "8")]
    pub sink_retry_max_attempts: usize,

    #[envconfig(default = "100")]
    pub sink_retry_initial_backoff_ms: u64,

    #[envconfig(default = "5000")]
    pub sink_retry_max_backoff_ms: u64,

    // HTTP server configuration
    #[envconfig(default = "0.0.0.0:8080")]
    pub bind_address: String,

    #[envconfig(default = "false")]
    pub export_prometheus: bool,
}

/// Everything the pipeline itself needs, validated once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub key_format: KeyFormat,
    pub profile_format: ProfileFormat,
    pub count_format: CountFormat,
    pub count_store_name: String,
    pub completeness_threshold: usize,
    pub count_threshold: i64,
    pub source_partitions: usize,
    pub group_partitions: usize,
    pub partition_channel_capacity: usize,
    pub sink_retry: RetrySettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            key_format: KeyFormat::String,
            profile_format: ProfileFormat::Json,
            count_format: CountFormat::Long,
            count_store_name: "CountsByRegion".to_string(),
            completeness_threshold: 200,
            count_threshold: 10_000_000,
            source_partitions: 4,
            group_partitions: 4,
            partition_channel_capacity: 1024,
            sink_retry: RetrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Initialize from environment variables (for production and tests)
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn producer_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.kafka_producer_graceful_shutdown_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.kafka_metadata_timeout_secs)
    }

    /// Validate the raw options and resolve them into pipeline settings. Any
    /// error here is fatal: nothing has been consumed yet.
    pub fn resolve(&self) -> Result<PipelineSettings, ConfigError> {
        require_non_empty("KAFKA_HOSTS", &self.kafka_hosts)?;
        require_non_empty("KAFKA_CONSUMER_GROUP", &self.kafka_consumer_group)?;
        require_non_empty("KAFKA_SOURCE_TOPIC", &self.kafka_source_topic)?;
        require_non_empty("KAFKA_SINK_TOPIC", &self.kafka_sink_topic)?;

        if self.kafka_source_topic == self.kafka_sink_topic {
            return Err(ConfigError::Invalid {
                option: "KAFKA_SINK_TOPIC",
                reason: "must differ from KAFKA_SOURCE_TOPIC".to_string(),
            });
        }

        let settings = PipelineSettings {
            key_format: self.key_format.parse()?,
            profile_format: self.profile_format.parse()?,
            count_format: self.count_format.parse()?,
            count_store_name: self.count_store_name.clone(),
            completeness_threshold: self.completeness_threshold,
            count_threshold: self.count_threshold,
            source_partitions: self.source_partitions,
            group_partitions: self.group_partitions,
            partition_channel_capacity: self.partition_channel_capacity,
            sink_retry: RetrySettings {
                max_attempts: self.sink_retry_max_attempts,
                initial_backoff: Duration::from_millis(self.sink_retry_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.sink_retry_max_backoff_ms),
            },
        };
        settings.validate()?;
        Ok(settings)
    }
}

impl PipelineSettings {
    /// Checks the invariants the runtime relies on. [`Config::resolve`] runs
    /// this, and so does every entry point that takes hand-built settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("COUNT_STORE_NAME", &self.count_store_name)?;
        require_positive("SOURCE_PARTITIONS", self.source_partitions)?;
        require_positive("GROUP_PARTITIONS", self.group_partitions)?;
        require_positive("PARTITION_CHANNEL_CAPACITY", self.partition_channel_capacity)?;
        require_positive("SINK_RETRY_MAX_ATTEMPTS", self.sink_retry.max_attempts)?;

        if self.count_threshold < 0 {
            return Err(ConfigError::Invalid {
                option: "COUNT_THRESHOLD",
                reason: format!("{} is negative", self.count_threshold),
            });
        }

        if self.sink_retry.initial_backoff > self.sink_retry.max_backoff {
            return Err(ConfigError::Invalid {
                option: "SINK_RETRY_INITIAL_BACKOFF_MS",
                reason: format!(
                    "{:?} exceeds SINK_RETRY_MAX_BACKOFF_MS ({:?})",
                    self.sink_retry.initial_backoff, self.sink_retry.max_backoff
                ),
            });
        }

        Ok(())
    }
}

fn require_non_empty(option: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Empty(option));
    }
    Ok(())
}

fn require_positive(option: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NotPositive { option });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(overrides: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = overrides
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn test_defaults_resolve() {
        let config = config_from(&[]);
        assert_eq!(config.kafka_source_topic, "UserProfile");
        assert_eq!(config.kafka_sink_topic, "LargeCountsByRegion");

        let settings = config.resolve().unwrap();
        assert_eq!(settings, PipelineSettings::default());
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = config_from(&[
            ("COMPLETENESS_THRESHOLD", "10"),
            ("COUNT_THRESHOLD", "3"),
            ("COUNT_FORMAT", "decimal"),
            ("GROUP_PARTITIONS", "16"),
        ]);
        let settings = config.resolve().unwrap();
        assert_eq!(settings.completeness_threshold, 10);
        assert_eq!(settings.count_threshold, 3);
        assert_eq!(settings.count_format, CountFormat::Decimal);
        assert_eq!(settings.group_partitions, 16);
    }

    #[test]
    fn test_empty_topic_is_rejected() {
        let config = config_from(&[("KAFKA_SOURCE_TOPIC", " ")]);
        assert_eq!(
            config.resolve(),
            Err(ConfigError::Empty("KAFKA_SOURCE_TOPIC"))
        );
    }

    #[test]
    fn test_zero_partitions_is_rejected() {
        let config = config_from(&[("SOURCE_PARTITIONS", "0")]);
        assert_eq!(
            config.resolve(),
            Err(ConfigError::NotPositive {
                option: "SOURCE_PARTITIONS"
            })
        );
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        let config = config_from(&[("PROFILE_FORMAT", "avro")]);
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::UnknownFormat {
                option: "PROFILE_FORMAT",
                ..
            })
        ));
    }

    #[test]
    fn test_same_source_and_sink_topic_is_rejected() {
        let config = config_from(&[
            ("KAFKA_SOURCE_TOPIC", "profiles"),
            ("KAFKA_SINK_TOPIC", "profiles"),
        ]);
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::Invalid {
                option: "KAFKA_SINK_TOPIC",
                ..
            })
        ));
    }

    #[test]
    fn test_hand_built_settings_are_validated() {
        assert_eq!(PipelineSettings::default().validate(), Ok(()));

        let settings = PipelineSettings {
            partition_channel_capacity: 0,
            ..PipelineSettings::default()
        };
        assert_eq!(
            settings.validate(),
            Err(ConfigError::NotPositive {
                option: "PARTITION_CHANNEL_CAPACITY"
            })
        );

        let settings = PipelineSettings {
            sink_retry: RetrySettings {
                initial_backoff: Duration::from_secs(10),
                ..RetrySettings::default()
            },
            ..PipelineSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid {
                option: "SINK_RETRY_INITIAL_BACKOFF_MS",
                ..
            })
        ));
    }

    #[test]
    fn test_unparseable_number_fails_loading() {
        let env: HashMap<String, String> =
            HashMap::from([("COUNT_THRESHOLD".to_string(), "lots".to_string())]);
        assert!(Config::init_from_hashmap(&env).is_err());
    }
}
