use std::collections::HashMap;
use std::fmt;

use rdkafka::topic_partition_list::TopicPartitionListElem;

/// Timestamp value the log uses for records that carry no timestamp.
pub const NO_TIMESTAMP: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// The offset of the next record to consume, plus optional commit metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OffsetAndMetadata {
    offset: i64,
    metadata: Option<String>,
}

impl OffsetAndMetadata {
    pub fn new(offset: i64) -> Self {
        Self {
            offset,
            metadata: None,
        }
    }

    pub fn with_metadata(offset: i64, metadata: impl Into<String>) -> Self {
        Self {
            offset,
            metadata: Some(metadata.into()),
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }
}

pub type OffsetMap = HashMap<Partition, OffsetAndMetadata>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampType {
    NoTimestampType,
    CreateTime,
    LogAppendTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHeader {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// A record as it came off the log, before any conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Milliseconds since epoch, or [`NO_TIMESTAMP`].
    pub timestamp: i64,
    pub timestamp_type: TimestampType,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: Vec<RawHeader>,
}

impl ConsumerRecord {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            timestamp: NO_TIMESTAMP,
            timestamp_type: TimestampType::NoTimestampType,
            key: None,
            value: None,
            headers: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64, timestamp_type: TimestampType) -> Self {
        self.timestamp = timestamp;
        self.timestamp_type = timestamp_type;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: Option<Vec<u8>>) -> Self {
        self.headers.push(RawHeader {
            key: key.into(),
            value,
        });
        self
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }
}

/// Ownership changes reported by a single poll, in the order the group
/// coordinator produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Revoked(Vec<Partition>),
    Assigned(Vec<Partition>),
}

#[derive(Debug, Default)]
pub struct PollResult {
    pub rebalances: Vec<RebalanceEvent>,
    pub records: Vec<ConsumerRecord>,
}

impl PollResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn records(records: Vec<ConsumerRecord>) -> Self {
        Self {
            rebalances: Vec::new(),
            records,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rebalances.is_empty() && self.records.is_empty()
    }
}

/// What the task consumes: an explicit topic list or a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    Topics(Vec<String>),
    Pattern(String),
}
