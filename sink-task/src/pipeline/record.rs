use crate::kafka::types::{Partition, TimestampType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    Boolean,
    Int64,
    Float64,
    String,
    Bytes,
    /// Schemaless structured data.
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaAndValue {
    pub schema: Option<Schema>,
    pub value: Value,
}

impl SchemaAndValue {
    pub fn null() -> Self {
        Self {
            schema: None,
            value: Value::Null,
        }
    }

    pub fn new(schema: Schema, value: Value) -> Self {
        Self {
            schema: Some(schema),
            value,
        }
    }

    pub fn is_null(&self) -> bool {
        self.value == Value::Null
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub key: String,
    pub value: SchemaAndValue,
}

/// A decoded record as handed to the sink.
///
/// Transformations may rewrite the topic, partition, key, value and headers;
/// the `original_*` fields always refer to where the record was read from and
/// are what offsets are tracked against.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkRecord {
    pub topic: String,
    pub kafka_partition: i32,
    pub kafka_offset: i64,
    pub key: SchemaAndValue,
    pub value: SchemaAndValue,
    pub timestamp: Option<i64>,
    pub timestamp_type: TimestampType,
    pub headers: Vec<Header>,
    original_topic: String,
    original_kafka_partition: i32,
    original_kafka_offset: i64,
}

impl SinkRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topic: impl Into<String>,
        kafka_partition: i32,
        kafka_offset: i64,
        key: SchemaAndValue,
        value: SchemaAndValue,
        timestamp: Option<i64>,
        timestamp_type: TimestampType,
        headers: Vec<Header>,
    ) -> Self {
        let topic = topic.into();
        Self {
            original_topic: topic.clone(),
            original_kafka_partition: kafka_partition,
            original_kafka_offset: kafka_offset,
            topic,
            kafka_partition,
            kafka_offset,
            key,
            value,
            timestamp,
            timestamp_type,
            headers,
        }
    }

    /// Copy of this record routed elsewhere. Original coordinates are kept.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.kafka_partition = partition;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: SchemaAndValue) -> Self {
        self.headers.push(Header {
            key: key.into(),
            value,
        });
        self
    }

    pub fn header(&self, key: &str) -> Option<&SchemaAndValue> {
        self.headers.iter().rev().find(|h| h.key == key).map(|h| &h.value)
    }

    pub fn original_topic(&self) -> &str {
        &self.original_topic
    }

    pub fn original_kafka_partition(&self) -> i32 {
        self.original_kafka_partition
    }

    pub fn original_kafka_offset(&self) -> i64 {
        self.original_kafka_offset
    }

    pub fn original_partition(&self) -> Partition {
        Partition::new(self.original_topic.clone(), self.original_kafka_partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SinkRecord {
        SinkRecord::new(
            "test",
            12,
            45,
            SchemaAndValue::null(),
            SchemaAndValue::new(Schema::String, Value::String("v".into())),
            Some(100),
            TimestampType::CreateTime,
            Vec::new(),
        )
    }

    #[test]
    fn rerouting_keeps_original_coordinates() {
        let routed = record().with_topic("newtopic_test").with_partition(3);

        assert_eq!(routed.topic, "newtopic_test");
        assert_eq!(routed.kafka_partition, 3);
        assert_eq!(routed.original_topic(), "test");
        assert_eq!(routed.original_kafka_partition(), 12);
        assert_eq!(routed.original_kafka_offset(), 45);
        assert_eq!(routed.original_partition(), Partition::new("test", 12));
    }

    #[test]
    fn last_header_with_a_key_wins() {
        let record = record()
            .with_header("h", SchemaAndValue::new(Schema::Int64, Value::Int64(1)))
            .with_header("h", SchemaAndValue::new(Schema::Int64, Value::Int64(2)));

        assert_eq!(
            record.header("h"),
            Some(&SchemaAndValue::new(Schema::Int64, Value::Int64(2)))
        );
        assert_eq!(record.header("missing"), None);
    }
}
