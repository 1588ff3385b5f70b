// Kafka module - log client abstraction and its rdkafka implementation
pub mod client;
pub mod config;
pub mod consumer;
pub mod context;
pub mod types;

// Public API
pub use client::{ClientError, CommitCallback, LogClient};
pub use config::ConsumerConfigBuilder;
pub use consumer::KafkaLogClient;
pub use types::{OffsetAndMetadata, OffsetMap, Partition};
