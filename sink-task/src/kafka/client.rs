//! The log client boundary.
//!
//! The task loop never talks to rdkafka directly; it drives a [`LogClient`].
//! [`crate::kafka::consumer::KafkaLogClient`] is the production implementation
//! and `test_utils::MockLogClient` the scripted one used by the tests.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::kafka::types::{OffsetMap, Partition, PollResult, Subscription};

#[derive(Error, Debug)]
pub enum ClientError {
    /// A blocking call was interrupted by [`LogClient::wakeup`].
    #[error("consumer was woken up")]
    Wakeup,
    #[error("offset commit failed: {0}")]
    CommitFailed(String),
    #[error("partition {0} is not assigned")]
    NotAssigned(Partition),
    #[error(transparent)]
    Kafka(#[from] KafkaError),
}

impl ClientError {
    pub fn is_wakeup(&self) -> bool {
        matches!(self, ClientError::Wakeup)
    }
}

/// Invoked once an asynchronous commit completes, possibly on another thread.
pub type CommitCallback = Box<dyn FnOnce(Result<(), ClientError>) + Send + 'static>;

#[async_trait]
pub trait LogClient: Send + Sync {
    fn subscribe(&self, subscription: &Subscription) -> Result<(), ClientError>;

    /// Wait up to `timeout` for records. Rebalance events that happened while
    /// polling are returned alongside the records, in order.
    async fn poll(&self, timeout: Duration) -> Result<PollResult, ClientError>;

    fn commit_sync(&self, offsets: &OffsetMap) -> Result<(), ClientError>;

    /// The callback must not run before this call returns.
    fn commit_async(&self, offsets: OffsetMap, callback: CommitCallback);

    fn seek(&self, partition: &Partition, offset: i64) -> Result<(), ClientError>;

    fn position(&self, partition: &Partition) -> Result<i64, ClientError>;

    fn pause(&self, partitions: &[Partition]) -> Result<(), ClientError>;

    fn resume(&self, partitions: &[Partition]) -> Result<(), ClientError>;

    fn assignment(&self) -> Result<BTreeSet<Partition>, ClientError>;

    /// Interrupt the current or next blocking call with [`ClientError::Wakeup`].
    fn wakeup(&self);
}
