use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;
use regex::Regex;
use thiserror::Error;

use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::types::Subscription;
use crate::pipeline::converter::ConverterKind;
use crate::pipeline::tolerance::{ErrorTolerance, ErrorToleranceOperator};
use crate::pipeline::transform::{TopicPrefix, Transformation, TransformationChain};
use crate::pipeline::RecordPipeline;
use crate::status::TargetState;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("topics and topics_regex are mutually exclusive")]
    BothTopicsAndRegex,
    #[error("one of topics or topics_regex must be set")]
    NoTopics,
    #[error("topics contains an empty topic name")]
    EmptyTopic,
    #[error("invalid topics_regex")]
    InvalidRegex(#[from] regex::Error),
    #[error("offset commit interval must be positive")]
    ZeroCommitInterval,
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

/// Settings for a single sink task.
#[derive(Debug, Clone)]
pub struct SinkTaskConfig {
    pub connector: String,
    pub task: u32,
    pub topics: Option<Vec<String>>,
    pub topics_regex: Option<String>,
    pub offset_commit_interval: Duration,
    pub offset_commit_timeout: Duration,
    pub initial_state: TargetState,
    /// Passed through to [`crate::sink::SinkTask::start`].
    pub props: HashMap<String, String>,
}

impl SinkTaskConfig {
    pub fn new(connector: impl Into<String>, task: u32) -> Self {
        Self {
            connector: connector.into(),
            task,
            topics: None,
            topics_regex: None,
            offset_commit_interval: Duration::from_millis(60_000),
            offset_commit_timeout: Duration::from_millis(5_000),
            initial_state: TargetState::Started,
            props: HashMap::new(),
        }
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = Some(topics.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_topics_regex(mut self, pattern: impl Into<String>) -> Self {
        self.topics_regex = Some(pattern.into());
        self
    }

    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.offset_commit_interval = interval;
        self
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.offset_commit_timeout = timeout;
        self
    }

    pub fn with_initial_state(mut self, state: TargetState) -> Self {
        self.initial_state = state;
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn task_id(&self) -> String {
        format!("{}-{}", self.connector, self.task)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.subscription().map(|_| ())?;
        if self.offset_commit_interval.is_zero() {
            return Err(ConfigError::ZeroCommitInterval);
        }
        Ok(())
    }

    pub fn subscription(&self) -> Result<Subscription, ConfigError> {
        match (&self.topics, &self.topics_regex) {
            (Some(_), Some(_)) => Err(ConfigError::BothTopicsAndRegex),
            (None, None) => Err(ConfigError::NoTopics),
            (Some(topics), None) => {
                if topics.is_empty() {
                    return Err(ConfigError::NoTopics);
                }
                if topics.iter().any(|t| t.trim().is_empty()) {
                    return Err(ConfigError::EmptyTopic);
                }
                Ok(Subscription::Topics(topics.clone()))
            }
            (None, Some(pattern)) => {
                Regex::new(pattern)?;
                Ok(Subscription::Pattern(pattern.clone()))
            }
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    // Defaults to "connect-<connector_name>"
    pub kafka_consumer_group: Option<String>,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "500")]
    pub kafka_max_poll_records: usize,

    #[envconfig(default = "45000")]
    pub kafka_session_timeout_ms: u32,

    // Task configuration
    #[envconfig(default = "log-sink")]
    pub connector_name: String,

    #[envconfig(default = "0")]
    pub task_id: u32,

    // Comma separated
    pub topics: Option<String>,

    pub topics_regex: Option<String>,

    #[envconfig(default = "60000")]
    pub offset_commit_interval_ms: u64,

    #[envconfig(default = "5000")]
    pub offset_commit_timeout_ms: u64,

    #[envconfig(default = "false")]
    pub start_paused: bool,

    // Record pipeline
    #[envconfig(default = "none")]
    pub errors_tolerance: String,

    #[envconfig(default = "string")]
    pub key_converter: String,

    #[envconfig(default = "json")]
    pub value_converter: String,

    #[envconfig(default = "simple")]
    pub header_converter: String,

    pub transform_topic_prefix: Option<String>,

    // Logging
    #[envconfig(default = "false")]
    pub log_json: bool,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn consumer_group(&self) -> String {
        self.kafka_consumer_group
            .clone()
            .unwrap_or_else(|| format!("connect-{}", self.connector_name))
    }

    pub fn to_consumer_config(&self) -> ClientConfig {
        ConsumerConfigBuilder::for_sink_task(&self.kafka_hosts, &self.consumer_group())
            .with_tls(self.kafka_tls)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_session_timeout_ms(self.kafka_session_timeout_ms)
            .build()
    }

    pub fn to_task_config(&self) -> Result<SinkTaskConfig, ConfigError> {
        let mut config = SinkTaskConfig::new(self.connector_name.clone(), self.task_id)
            .with_commit_interval(Duration::from_millis(self.offset_commit_interval_ms))
            .with_commit_timeout(Duration::from_millis(self.offset_commit_timeout_ms))
            .with_initial_state(if self.start_paused {
                TargetState::Paused
            } else {
                TargetState::Started
            });
        if let Some(topics) = &self.topics {
            config = config.with_topics(topics.split(',').map(str::trim));
        }
        if let Some(pattern) = &self.topics_regex {
            config = config.with_topics_regex(pattern.clone());
        }
        config.validate()?;
        Ok(config)
    }

    pub fn to_pipeline(&self) -> Result<RecordPipeline, ConfigError> {
        let converter = |name: &'static str, value: &str| {
            value
                .parse::<ConverterKind>()
                .map_err(|reason| ConfigError::InvalidValue { name, reason })
        };
        let key = converter("key_converter", &self.key_converter)?;
        let value = converter("value_converter", &self.value_converter)?;
        let header = converter("header_converter", &self.header_converter)?;
        let tolerance = self
            .errors_tolerance
            .parse::<ErrorTolerance>()
            .map_err(|reason| ConfigError::InvalidValue {
                name: "errors_tolerance",
                reason,
            })?;

        let mut transformations: Vec<Arc<dyn Transformation>> = Vec::new();
        if let Some(prefix) = &self.transform_topic_prefix {
            transformations.push(Arc::new(TopicPrefix::new(prefix.clone())));
        }

        Ok(RecordPipeline::new(
            key.converter(),
            value.converter(),
            header.header_converter(),
            TransformationChain::new(transformations),
            Arc::new(ErrorToleranceOperator::new(tolerance)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_and_regex_are_exclusive() {
        let config = SinkTaskConfig::new("c", 0)
            .with_topics(["test"])
            .with_topics_regex("te.*");
        assert!(matches!(config.validate(), Err(ConfigError::BothTopicsAndRegex)));
    }

    #[test]
    fn one_of_topics_or_regex_is_required() {
        assert!(matches!(
            SinkTaskConfig::new("c", 0).validate(),
            Err(ConfigError::NoTopics)
        ));
        assert!(matches!(
            SinkTaskConfig::new("c", 0)
                .with_topics(Vec::<String>::new())
                .validate(),
            Err(ConfigError::NoTopics)
        ));
    }

    #[test]
    fn blank_topic_names_are_rejected() {
        let config = SinkTaskConfig::new("c", 0).with_topics(["test", " "]);
        assert!(matches!(config.validate(), Err(ConfigError::EmptyTopic)));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let config = SinkTaskConfig::new("c", 0).with_topics_regex("te(");
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRegex(_))));
    }

    #[test]
    fn zero_commit_interval_is_rejected() {
        let config = SinkTaskConfig::new("c", 0)
            .with_topics(["test"])
            .with_commit_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroCommitInterval)));
    }

    #[test]
    fn defaults_match_worker_defaults() {
        let config = SinkTaskConfig::new("c", 3).with_topics(["test"]);
        assert_eq!(config.offset_commit_interval, Duration::from_secs(60));
        assert_eq!(config.offset_commit_timeout, Duration::from_secs(5));
        assert_eq!(config.task_id(), "c-3");
        assert_eq!(
            config.subscription().unwrap(),
            Subscription::Topics(vec!["test".to_string()])
        );
    }

    #[test]
    fn env_config_builds_task_config() {
        let env: HashMap<String, String> = [
            ("TOPICS", "a, b"),
            ("CONNECTOR_NAME", "archive"),
            ("OFFSET_COMMIT_INTERVAL_MS", "1000"),
            ("START_PAUSED", "true"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = Config::init_from_hashmap(&env).unwrap();
        let task = config.to_task_config().unwrap();

        assert_eq!(config.consumer_group(), "connect-archive");
        assert_eq!(task.topics, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(task.offset_commit_interval, Duration::from_secs(1));
        assert_eq!(task.initial_state, TargetState::Paused);
        assert!(config.to_pipeline().is_ok());
    }

    #[test]
    fn env_config_builds_consumer_config() {
        let env: HashMap<String, String> = [
            ("TOPICS", "a"),
            ("KAFKA_HOSTS", "kafka:9092"),
            ("KAFKA_SESSION_TIMEOUT_MS", "10000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let consumer = Config::init_from_hashmap(&env).unwrap().to_consumer_config();

        assert_eq!(consumer.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(consumer.get("group.id"), Some("connect-log-sink"));
        assert_eq!(consumer.get("session.timeout.ms"), Some("10000"));
        assert_eq!(consumer.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn unknown_converter_is_rejected() {
        let env: HashMap<String, String> =
            [("TOPICS".to_string(), "a".to_string()), ("VALUE_CONVERTER".to_string(), "avro".to_string())]
                .into_iter()
                .collect();

        let config = Config::init_from_hashmap(&env).unwrap();
        assert!(matches!(
            config.to_pipeline(),
            Err(ConfigError::InvalidValue {
                name: "value_converter",
                ..
            })
        ));
    }
}
