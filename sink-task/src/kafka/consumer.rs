use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers, Message, Timestamp};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::kafka::client::{ClientError, CommitCallback, LogClient};
use crate::kafka::context::SinkConsumerContext;
use crate::kafka::types::{
    ConsumerRecord, OffsetMap, Partition, PollResult, RawHeader, Subscription, TimestampType,
    NO_TIMESTAMP,
};
use crate::metrics_consts::KAFKA_CONSUMER_ERRORS;

/// [`LogClient`] over an rdkafka [`StreamConsumer`].
pub struct KafkaLogClient {
    consumer: Arc<StreamConsumer<SinkConsumerContext>>,
    wakeup: Notify,
    woken: AtomicBool,
    max_poll_records: usize,
    linger: Duration,
    request_timeout: Duration,
    reset_to_latest: bool,
}

impl KafkaLogClient {
    pub fn new(config: &ClientConfig, max_poll_records: usize) -> Result<Self, ClientError> {
        let consumer: StreamConsumer<SinkConsumerContext> =
            config.create_with_context(SinkConsumerContext::default())?;
        let reset_to_latest = config
            .get("auto.offset.reset")
            .is_some_and(|reset| reset == "latest");

        Ok(Self {
            consumer: Arc::new(consumer),
            wakeup: Notify::new(),
            woken: AtomicBool::new(false),
            max_poll_records: max_poll_records.max(1),
            linger: Duration::from_millis(50),
            request_timeout: Duration::from_secs(10),
            reset_to_latest,
        })
    }

    fn topic_partition_list(partitions: &[Partition]) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        for partition in partitions {
            tpl.add_partition(partition.topic(), partition.partition_number());
        }
        tpl
    }

    fn offsets_list(offsets: &OffsetMap) -> Result<TopicPartitionList, ClientError> {
        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in offsets {
            let mut elem = tpl.add_partition(partition.topic(), partition.partition_number());
            elem.set_offset(Offset::Offset(offset.offset()))?;
            if let Some(metadata) = offset.metadata() {
                elem.set_metadata(metadata);
            }
        }
        Ok(tpl)
    }

    fn record(message: &BorrowedMessage<'_>) -> ConsumerRecord {
        let (timestamp, timestamp_type) = match message.timestamp() {
            Timestamp::NotAvailable => (NO_TIMESTAMP, TimestampType::NoTimestampType),
            Timestamp::CreateTime(ts) => (ts, TimestampType::CreateTime),
            Timestamp::LogAppendTime(ts) => (ts, TimestampType::LogAppendTime),
        };
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| RawHeader {
                        key: header.key.to_string(),
                        value: header.value.map(<[u8]>::to_vec),
                    })
                    .collect()
            })
            .unwrap_or_default();

        ConsumerRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            timestamp,
            timestamp_type,
            key: message.key().map(<[u8]>::to_vec),
            value: message.payload().map(<[u8]>::to_vec),
            headers,
        }
    }

    /// Transient consumption errors are counted and swallowed, fatal ones
    /// end the poll.
    fn handle_kafka_error(e: KafkaError) -> Result<(), ClientError> {
        match &e {
            KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF) => {
                metrics::counter!(
                    KAFKA_CONSUMER_ERRORS,
                    &[("level", "info"), ("error", "partition_eof")]
                )
                .increment(1);
                Ok(())
            }
            KafkaError::MessageConsumption(code) => {
                warn!("Kafka consumer error: {code:?}");
                metrics::counter!(
                    KAFKA_CONSUMER_ERRORS,
                    &[("level", "warn"), ("error", "consumer")]
                )
                .increment(1);
                Ok(())
            }
            KafkaError::MessageConsumptionFatal(code) => {
                error!("Fatal Kafka consumer error: {code:?}");
                metrics::counter!(
                    KAFKA_CONSUMER_ERRORS,
                    &[("level", "fatal"), ("error", "consumer")]
                )
                .increment(1);
                Err(e.into())
            }
            _ => {
                warn!("Kafka error while polling: {e}");
                metrics::counter!(
                    KAFKA_CONSUMER_ERRORS,
                    &[("level", "warn"), ("error", "other")]
                )
                .increment(1);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl LogClient for KafkaLogClient {
    fn subscribe(&self, subscription: &Subscription) -> Result<(), ClientError> {
        match subscription {
            Subscription::Topics(topics) => {
                let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
                self.consumer.subscribe(&topics)?;
            }
            // librdkafka treats topics starting with '^' as patterns
            Subscription::Pattern(pattern) => {
                let pattern = if pattern.starts_with('^') {
                    pattern.clone()
                } else {
                    format!("^{pattern}")
                };
                self.consumer.subscribe(&[pattern.as_str()])?;
            }
        }
        Ok(())
    }

    /// Revocations returned by the previous call have been committed and
    /// closed by now, so their partitions are handed back to the group first.
    async fn poll(&self, timeout: Duration) -> Result<PollResult, ClientError> {
        let context = self.consumer.context();
        context.release_revoked(self.consumer.as_ref())?;

        let mut records = Vec::new();
        let mut deadline = Instant::now() + timeout;

        loop {
            if self.woken.swap(false, Ordering::SeqCst) {
                if records.is_empty() && !context.has_events() {
                    return Err(ClientError::Wakeup);
                }
                // Hand back what was already consumed, the next call reports the wakeup
                self.woken.store(true, Ordering::SeqCst);
                break;
            }
            if records.len() >= self.max_poll_records || context.has_events() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = self.wakeup.notified() => continue,
                _ = context.rebalanced() => continue,
                message = self.consumer.recv() => match message {
                    Ok(message) => {
                        if records.is_empty() {
                            deadline = deadline.min(Instant::now() + self.linger);
                        }
                        records.push(Self::record(&message));
                    }
                    Err(e) => Self::handle_kafka_error(e)?,
                },
            }
        }

        Ok(PollResult {
            rebalances: context.take_events(),
            records,
        })
    }

    fn commit_sync(&self, offsets: &OffsetMap) -> Result<(), ClientError> {
        if self.woken.swap(false, Ordering::SeqCst) {
            return Err(ClientError::Wakeup);
        }
        let tpl = Self::offsets_list(offsets)?;
        self.consumer.commit(&tpl, CommitMode::Sync)?;
        Ok(())
    }

    fn commit_async(&self, offsets: OffsetMap, callback: CommitCallback) {
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || {
            let result = Self::offsets_list(&offsets).and_then(|tpl| {
                consumer
                    .commit(&tpl, CommitMode::Sync)
                    .map_err(ClientError::from)
            });
            callback(result);
        });
    }

    fn seek(&self, partition: &Partition, offset: i64) -> Result<(), ClientError> {
        self.consumer.seek(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(offset),
            self.request_timeout,
        )?;
        Ok(())
    }

    fn position(&self, partition: &Partition) -> Result<i64, ClientError> {
        let (topic, number) = (partition.topic(), partition.partition_number());

        let positions = self.consumer.position()?;
        if let Some(Offset::Offset(offset)) = positions
            .find_partition(topic, number)
            .map(|elem| elem.offset())
        {
            return Ok(offset);
        }

        let committed = self.consumer.committed_offsets(
            Self::topic_partition_list(std::slice::from_ref(partition)),
            self.request_timeout,
        )?;
        if let Some(Offset::Offset(offset)) = committed
            .find_partition(topic, number)
            .map(|elem| elem.offset())
        {
            return Ok(offset);
        }

        let (low, high) = self
            .consumer
            .fetch_watermarks(topic, number, self.request_timeout)?;
        debug!(
            topic = topic,
            partition = number,
            low = low,
            high = high,
            "No position or committed offset, starting from watermark"
        );
        Ok(if self.reset_to_latest { high } else { low })
    }

    fn pause(&self, partitions: &[Partition]) -> Result<(), ClientError> {
        self.consumer.pause(&Self::topic_partition_list(partitions))?;
        Ok(())
    }

    fn resume(&self, partitions: &[Partition]) -> Result<(), ClientError> {
        self.consumer.resume(&Self::topic_partition_list(partitions))?;
        Ok(())
    }

    fn assignment(&self) -> Result<BTreeSet<Partition>, ClientError> {
        let tpl = self.consumer.assignment()?;
        Ok(tpl.elements().into_iter().map(Partition::from).collect())
    }

    fn wakeup(&self) {
        self.woken.store(true, Ordering::SeqCst);
        self.wakeup.notify_one();
    }
}
