//! 运行配置（RelayConfig）
//!
//! 从 TOML 加载，键名为 camelCase，时长以秒为单位（可带小数）：
//!
//! ```toml
//! [broker]
//! endpoints = ["localhost:9092"]
//! publishTimeout = 5.0
//!
//! [outbox]
//! batchSize = 10
//! pollInterval = 5.0
//! leaseDuration = 30.0
//! maxRetries = 10
//! baseBackoff = 1.0
//! maxBackoff = 300.0
//! retention = 604800.0
//! compactionInterval = 3600.0
//!
//! [subscriber]
//! groupId = "user-service"
//! retryBackoff = 1.0
//!
//! [processor]
//! id = "relay-1"
//! ```
//!
//! 缺省的段或键取默认值；加载后须通过 [`RelayConfig::validate`]。
//!
use relay_domain::eventing::{BackoffPolicy, ProcessorConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 任一时长配置的上限（100 年）
pub const MAX_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    pub outbox: OutboxConfig,
    pub subscriber: SubscriberConfig,
    pub processor: ProcessorIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    pub endpoints: Vec<String>,
    #[serde(with = "seconds")]
    pub publish_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["localhost:9092".to_string()],
            publish_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OutboxConfig {
    pub batch_size: usize,
    #[serde(with = "seconds")]
    pub poll_interval: Duration,
    #[serde(with = "seconds")]
    pub lease_duration: Duration,
    pub max_retries: u32,
    #[serde(with = "seconds")]
    pub base_backoff: Duration,
    #[serde(with = "seconds")]
    pub max_backoff: Duration,
    #[serde(with = "seconds")]
    pub retention: Duration,
    #[serde(with = "seconds")]
    pub compaction_interval: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            lease_duration: Duration::from_secs(30),
            max_retries: 10,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            compaction_interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriberConfig {
    pub group_id: String,
    #[serde(with = "seconds")]
    pub retry_backoff: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            group_id: "relay".to_string(),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessorIdentity {
    pub id: String,
}

impl Default for ProcessorIdentity {
    fn default() -> Self {
        Self {
            id: format!("relay-{}", uuid::Uuid::new_v4()),
        }
    }
}

impl RelayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// 解析并校验
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.endpoints.is_empty() {
            return Err(ConfigError::invalid("broker.endpoints must not be empty"));
        }
        if self.outbox.batch_size == 0 {
            return Err(ConfigError::invalid("outbox.batchSize must be at least 1"));
        }
        if self.outbox.max_retries == 0 {
            return Err(ConfigError::invalid("outbox.maxRetries must be at least 1"));
        }
        if self.outbox.base_backoff > self.outbox.max_backoff {
            return Err(ConfigError::invalid(
                "outbox.baseBackoff must not exceed outbox.maxBackoff",
            ));
        }
        if self.outbox.compaction_interval.is_zero() {
            return Err(ConfigError::invalid(
                "outbox.compactionInterval must be positive",
            ));
        }
        if self.subscriber.group_id.trim().is_empty() {
            return Err(ConfigError::invalid("subscriber.groupId must not be empty"));
        }
        if self.processor.id.trim().is_empty() {
            return Err(ConfigError::invalid("processor.id must not be empty"));
        }

        let durations = [
            ("broker.publishTimeout", self.broker.publish_timeout),
            ("outbox.pollInterval", self.outbox.poll_interval),
            ("outbox.leaseDuration", self.outbox.lease_duration),
            ("outbox.baseBackoff", self.outbox.base_backoff),
            ("outbox.maxBackoff", self.outbox.max_backoff),
            ("outbox.retention", self.outbox.retention),
            ("outbox.compactionInterval", self.outbox.compaction_interval),
            ("subscriber.retryBackoff", self.subscriber.retry_backoff),
        ];
        if let Some((key, _)) = durations.iter().find(|(_, d)| *d > MAX_DURATION) {
            return Err(ConfigError::invalid(format!(
                "{key} must not exceed {} seconds",
                MAX_DURATION.as_secs()
            )));
        }
        Ok(())
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            processor_id: self.processor.id.clone(),
            batch_size: self.outbox.batch_size,
            poll_interval: self.outbox.poll_interval,
            lease_duration: self.outbox.lease_duration,
            max_retries: self.outbox.max_retries,
            backoff: BackoffPolicy::new(self.outbox.base_backoff, self.outbox.max_backoff),
            retention: self.outbox.retention,
            ..Default::default()
        }
    }
}

/// 以秒（可带小数）表示的时长
mod seconds {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| D::Error::custom(format!("invalid duration: {secs} seconds")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = RelayConfig::from_toml_str("").unwrap();
        assert_eq!(config.broker.endpoints, vec!["localhost:9092"]);
        assert_eq!(config.outbox.batch_size, 10);
        assert_eq!(config.outbox.max_backoff, Duration::from_secs(300));
        assert_eq!(config.outbox.compaction_interval, Duration::from_secs(3600));
        assert!(config.processor.id.starts_with("relay-"));
    }

    #[test]
    fn camel_case_keys_and_fractional_seconds() {
        let config = RelayConfig::from_toml_str(
            r#"
            [broker]
            endpoints = ["b1:9092", "b2:9092"]
            publishTimeout = 2.5

            [outbox]
            batchSize = 50
            leaseDuration = 45.0
            maxRetries = 3
            baseBackoff = 0.5
            maxBackoff = 60

            [subscriber]
            groupId = "user-service"

            [processor]
            id = "relay-1"
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.endpoints.len(), 2);
        assert_eq!(config.broker.publish_timeout, Duration::from_millis(2500));
        assert_eq!(config.subscriber.group_id, "user-service");
        assert_eq!(config.subscriber.retry_backoff, Duration::from_secs(1));

        let processor = config.processor_config();
        assert_eq!(processor.processor_id, "relay-1");
        assert_eq!(processor.batch_size, 50);
        assert_eq!(processor.lease_duration, Duration::from_secs(45));
        assert_eq!(processor.max_retries, 3);
        assert_eq!(processor.backoff.delay(0), Duration::from_millis(500));
        assert_eq!(processor.backoff.delay(20), Duration::from_secs(60));
        assert_eq!(processor.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases = [
            "[outbox]\nbatchSize = 0",
            "[outbox]\nmaxRetries = 0",
            "[outbox]\nbaseBackoff = 10.0\nmaxBackoff = 5.0",
            "[broker]\nendpoints = []",
            "[subscriber]\ngroupId = \"  \"",
            "[outbox]\nretention = 1e13",
            "[outbox]\nmaxBackoff = 1e13",
            "[broker]\npublishTimeout = 1e12",
        ];
        for case in cases {
            let err = RelayConfig::from_toml_str(case).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{case}: {err}");
        }
    }

    #[test]
    fn malformed_documents_fail_to_parse() {
        assert!(matches!(
            RelayConfig::from_toml_str("[outbox]\nbatchSize = \"ten\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            RelayConfig::from_toml_str("[outbox]\npollInterval = -1.0"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = RelayConfig::load("/nonexistent/relay.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
