//! Record Pipeline: raw consumer record in, sink record (or nothing) out.
//!
//! ```text
//! ConsumerRecord --> key converter --> value converter --> header converter
//!                                                               |
//!                      Option<SinkRecord> <-- transformation chain
//! ```
//!
//! Any stage failure is handed to the [`ToleranceOperator`], which either
//! drops the record or fails the task.

pub mod converter;
pub mod record;
pub mod tolerance;
pub mod transform;

use std::sync::Arc;

use tracing::trace;

use crate::error::TaskError;
use crate::kafka::types::{ConsumerRecord, NO_TIMESTAMP};
use converter::{Converter, HeaderConverter};
use record::{Header, SinkRecord};
use tolerance::{Stage, ToleranceDecision, ToleranceOperator};
use transform::TransformationChain;

pub struct RecordPipeline {
    key_converter: Arc<dyn Converter>,
    value_converter: Arc<dyn Converter>,
    header_converter: Arc<dyn HeaderConverter>,
    transformations: TransformationChain,
    tolerance: Arc<dyn ToleranceOperator>,
}

impl RecordPipeline {
    pub fn new(
        key_converter: Arc<dyn Converter>,
        value_converter: Arc<dyn Converter>,
        header_converter: Arc<dyn HeaderConverter>,
        transformations: TransformationChain,
        tolerance: Arc<dyn ToleranceOperator>,
    ) -> Self {
        Self {
            key_converter,
            value_converter,
            header_converter,
            transformations,
            tolerance,
        }
    }

    pub fn tolerance(&self) -> &Arc<dyn ToleranceOperator> {
        &self.tolerance
    }

    /// `Ok(None)` means the record was filtered or tolerated away; its offset
    /// still counts as consumed.
    pub fn process(&self, record: &ConsumerRecord) -> Result<Option<SinkRecord>, TaskError> {
        let topic = record.topic.as_str();

        let key = self.key_converter.to_connect_data(topic, &record.headers, record.key.as_deref());
        let Some(key) = self.checked(Stage::KeyConverter, record, key)? else {
            return Ok(None);
        };

        let value =
            self.value_converter
                .to_connect_data(topic, &record.headers, record.value.as_deref());
        let Some(value) = self.checked(Stage::ValueConverter, record, value)? else {
            return Ok(None);
        };

        let headers = self.convert_headers(record);
        let Some(headers) = self.checked(Stage::HeaderConverter, record, headers)? else {
            return Ok(None);
        };

        let timestamp = (record.timestamp != NO_TIMESTAMP).then_some(record.timestamp);
        let converted = SinkRecord::new(
            topic,
            record.partition,
            record.offset,
            key,
            value,
            timestamp,
            record.timestamp_type,
            headers,
        );

        let transformed = self.transformations.apply(converted);
        let transformed = self.checked(Stage::Transformation, record, transformed)?.flatten();
        if transformed.is_none() {
            trace!(
                topic = topic,
                partition = record.partition,
                offset = record.offset,
                "Record dropped by transformation chain"
            );
        }
        Ok(transformed)
    }

    fn convert_headers(&self, record: &ConsumerRecord) -> anyhow::Result<Vec<Header>> {
        record
            .headers
            .iter()
            .map(|raw| {
                let value = self.header_converter.to_connect_header(
                    &record.topic,
                    &raw.key,
                    raw.value.as_deref(),
                )?;
                Ok(Header {
                    key: raw.key.clone(),
                    value,
                })
            })
            .collect()
    }

    fn checked<T>(
        &self,
        stage: Stage,
        record: &ConsumerRecord,
        result: anyhow::Result<T>,
    ) -> Result<Option<T>, TaskError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(error) => match self.tolerance.on_failure(stage, record, &error) {
                ToleranceDecision::Tolerate => Ok(None),
                ToleranceDecision::Fail => Err(TaskError::ToleranceExceeded {
                    stage,
                    source: error,
                }),
            },
        }
    }
}
