use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::error::ConfigError;

/// Anchor for offset resolution on partition assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetMode {
    Begin,
    End,
    #[default]
    Stored,
}

impl FromStr for OffsetMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "begin" | "beginning" => Ok(OffsetMode::Begin),
            "end" => Ok(OffsetMode::End),
            "stored" => Ok(OffsetMode::Stored),
            other => Err(ConfigError::OffsetMode(other.to_string())),
        }
    }
}

/// Per-subscription offset resolution policy.
///
/// `time_offset`/`date_offset` and anchor+bias are mutually exclusive
/// resolution paths: when either is set to a non-default value the
/// subscription resolves by timestamp and `bias` does not apply.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPolicy {
    pub offset_mode: OffsetMode,
    /// Signed delta applied to the anchor offset
    pub bias: i64,
    /// Look-back interval; non-zero switches to timestamp resolution
    pub time_offset: Duration,
    /// Absolute base point; overrides "now" for the timestamp path
    pub date_offset: Option<DateTime<Utc>>,
}

impl SubscriptionPolicy {
    /// True when this policy resolves by timestamp rather than anchor+bias.
    pub fn is_timestamp_based(&self) -> bool {
        self.date_offset.is_some() || !self.time_offset.is_zero()
    }

    /// The timestamp the broker is queried with on the timestamp path:
    /// `(date_offset or now) - time_offset`.
    pub fn base_timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let base = self.date_offset.unwrap_or(now);
        base - chrono::Duration::from_std(self.time_offset).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka connection
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "kafka-pipeline")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Offset resolution policy
    #[envconfig(default = "stored")]
    pub offset_mode: String,

    #[envconfig(default = "0")]
    pub offset_bias: i64,

    #[envconfig(default = "0")]
    pub time_offset_ms: u64,

    /// RFC 3339 timestamp; when set, resolution is timestamp-based
    pub date_offset: Option<String>,

    /// Timeout for each broker query during offset resolution
    #[envconfig(default = "5")]
    pub query_timeout_secs: u64,

    // Pipeline defaults
    #[envconfig(default = "16")]
    pub buffer_size: usize,

    #[envconfig(default = "100")]
    pub batch_size: usize,

    #[envconfig(default = "5000")]
    pub batch_time_ms: u64,

    // Consumer loop
    #[envconfig(default = "1")]
    pub poll_timeout_secs: u64,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn batch_time(&self) -> Duration {
        Duration::from_millis(self.batch_time_ms)
    }

    /// Parse the policy fields into a `SubscriptionPolicy`, failing on an
    /// unrecognized offset mode or malformed date offset.
    pub fn subscription_policy(&self) -> Result<SubscriptionPolicy, ConfigError> {
        let date_offset = self
            .date_offset
            .as_deref()
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| ConfigError::DateOffset(format!("{raw}: {e}")))
            })
            .transpose()?;

        Ok(SubscriptionPolicy {
            offset_mode: self.offset_mode.parse()?,
            bias: self.offset_bias,
            time_offset: Duration::from_millis(self.time_offset_ms),
            date_offset,
        })
    }

    /// Build the rdkafka client config for the pipeline consumer.
    pub fn client_config(&self) -> ClientConfig {
        ConsumerConfigBuilder::for_pipeline_consumer(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_tls(self.kafka_tls)
            .build()
    }
}

/// Kafka consumer configuration builder with defaults for pipeline
/// consumers: auto commit and auto offset store disabled (commits are
/// explicit, driven by the pipeline's commit stage), plus conservative
/// session/heartbeat settings.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn for_pipeline_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for the Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_mode_parsing() {
        assert_eq!("begin".parse::<OffsetMode>().unwrap(), OffsetMode::Begin);
        assert_eq!("End".parse::<OffsetMode>().unwrap(), OffsetMode::End);
        assert_eq!("stored".parse::<OffsetMode>().unwrap(), OffsetMode::Stored);
        assert!(matches!(
            "sideways".parse::<OffsetMode>(),
            Err(ConfigError::OffsetMode(_))
        ));
    }

    #[test]
    fn test_policy_timestamp_path_selection() {
        let policy = SubscriptionPolicy::default();
        assert!(!policy.is_timestamp_based());

        let policy = SubscriptionPolicy {
            time_offset: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(policy.is_timestamp_based());

        let policy = SubscriptionPolicy {
            date_offset: Some(Utc::now()),
            ..Default::default()
        };
        assert!(policy.is_timestamp_based());
    }

    #[test]
    fn test_base_timestamp_subtracts_time_offset() {
        let now = Utc::now();
        let anchor = now - chrono::Duration::hours(2);

        // No date offset: base is now - time_offset
        let policy = SubscriptionPolicy {
            time_offset: Duration::from_secs(3600),
            ..Default::default()
        };
        assert_eq!(policy.base_timestamp(now), now - chrono::Duration::hours(1));

        // With date offset set, time_offset still applies on top of it
        let policy = SubscriptionPolicy {
            time_offset: Duration::from_secs(3600),
            date_offset: Some(anchor),
            ..Default::default()
        };
        assert_eq!(
            policy.base_timestamp(now),
            anchor - chrono::Duration::hours(1)
        );
    }

    #[test]
    fn test_pipeline_consumer_defaults() {
        let config =
            ConsumerConfigBuilder::for_pipeline_consumer("localhost:9092", "test-group").build();

        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("group.id"), Some("test-group"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
    }

    #[test]
    fn test_subscription_policy_from_config() {
        let mut env = std::collections::HashMap::new();
        env.insert("OFFSET_MODE".to_string(), "begin".to_string());
        env.insert("OFFSET_BIAS".to_string(), "-100".to_string());
        let config = Config::init_from_hashmap(&env).unwrap();

        let policy = config.subscription_policy().unwrap();
        assert_eq!(policy.offset_mode, OffsetMode::Begin);
        assert_eq!(policy.bias, -100);
        assert!(!policy.is_timestamp_based());

        let mut env = std::collections::HashMap::new();
        env.insert("DATE_OFFSET".to_string(), "not-a-date".to_string());
        let config = Config::init_from_hashmap(&env).unwrap();
        assert!(matches!(
            config.subscription_policy(),
            Err(ConfigError::DateOffset(_))
        ));
    }
}
