use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::context::SinkTaskContext;
use crate::error::SinkError;
use crate::kafka::types::{OffsetMap, Partition};
use crate::pipeline::record::{SchemaAndValue, SinkRecord, Value};
use crate::sink::{RecordBatch, SinkTask};

/// Writes every record as a JSON line to the `sink_task::records` log target.
#[derive(Default)]
pub struct LogSink {
    context: Option<SinkTaskContext>,
    written: u64,
    /// Commit after this many records instead of waiting for the interval.
    commit_every: Option<u64>,
}

#[derive(Serialize)]
struct LoggedRecord<'a> {
    topic: &'a str,
    partition: i32,
    offset: i64,
    timestamp: Option<i64>,
    key: serde_json::Value,
    value: serde_json::Value,
    headers: serde_json::Map<String, serde_json::Value>,
}

impl<'a> From<&'a SinkRecord> for LoggedRecord<'a> {
    fn from(record: &'a SinkRecord) -> Self {
        LoggedRecord {
            topic: &record.topic,
            partition: record.kafka_partition,
            offset: record.kafka_offset,
            timestamp: record.timestamp,
            key: to_json(&record.key),
            value: to_json(&record.value),
            headers: record
                .headers
                .iter()
                .map(|header| (header.key.clone(), to_json(&header.value)))
                .collect(),
        }
    }
}

fn to_json(data: &SchemaAndValue) -> serde_json::Value {
    match &data.value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Int64(n) => serde_json::Value::from(*n),
        Value::Float64(n) => serde_json::Value::from(*n),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        Value::Json(json) => json.clone(),
    }
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

#[async_trait]
impl SinkTask for LogSink {
    fn initialize(&mut self, context: SinkTaskContext) {
        self.context = Some(context);
    }

    async fn start(&mut self, props: &HashMap<String, String>) -> Result<(), SinkError> {
        self.commit_every = props
            .get("log.commit.every")
            .map(|every| every.parse::<u64>())
            .transpose()
            .map_err(SinkError::fatal)?
            .filter(|every| *every > 0);
        info!(commit_every = ?self.commit_every, "Log sink started");
        Ok(())
    }

    async fn put(&mut self, records: RecordBatch) -> Result<(), SinkError> {
        for record in records.iter() {
            let line =
                serde_json::to_string(&LoggedRecord::from(record)).map_err(SinkError::fatal)?;
            info!(target: "sink_task::records", "{line}");
        }

        let before = self.written;
        self.written += records.len() as u64;
        if let (Some(every), Some(context)) = (self.commit_every, &self.context) {
            if before / every != self.written / every {
                context.request_commit();
            }
        }
        Ok(())
    }

    async fn pre_commit(&mut self, current_offsets: &OffsetMap) -> Result<OffsetMap, SinkError> {
        debug!(
            partitions = current_offsets.len(),
            written = self.written,
            "Log sink committing"
        );
        Ok(current_offsets.clone())
    }

    async fn open(&mut self, partitions: &[Partition]) -> Result<(), SinkError> {
        info!(partitions = ?partitions, "Log sink opened partitions");
        Ok(())
    }

    async fn close(&mut self, partitions: &[Partition]) -> Result<(), SinkError> {
        info!(partitions = ?partitions, "Log sink closed partitions");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SinkError> {
        info!(written = self.written, "Log sink stopped");
        Ok(())
    }
}
