use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::SinkTaskContext;
use crate::error::SinkError;
use crate::kafka::types::{OffsetMap, Partition};
use crate::pipeline::record::SinkRecord;

/// A batch as handed to [`SinkTask::put`]. A batch that is redelivered after
/// a retriable failure is the same allocation as the first attempt.
pub type RecordBatch = Arc<Vec<SinkRecord>>;

/// The pluggable destination of a sink task.
///
/// Calls are made from the task loop only, one at a time.
#[async_trait]
pub trait SinkTask: Send {
    fn initialize(&mut self, context: SinkTaskContext);

    async fn start(&mut self, props: &HashMap<String, String>) -> Result<(), SinkError>;

    /// Deliver a batch. May be empty. Return [`SinkError::Retriable`] to have
    /// the same batch delivered again with consumption paused.
    async fn put(&mut self, records: RecordBatch) -> Result<(), SinkError>;

    async fn flush(&mut self, _current_offsets: &OffsetMap) -> Result<(), SinkError> {
        Ok(())
    }

    /// Offsets the sink is willing to have committed. Defaults to flushing
    /// and committing everything delivered.
    async fn pre_commit(&mut self, current_offsets: &OffsetMap) -> Result<OffsetMap, SinkError> {
        self.flush(current_offsets).await?;
        Ok(current_offsets.clone())
    }

    async fn open(&mut self, _partitions: &[Partition]) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&mut self, _partitions: &[Partition]) -> Result<(), SinkError> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SinkError>;
}
