use std::sync::{Mutex, MutexGuard};

use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, RebalanceProtocol};
use rdkafka::error::KafkaResult;
use rdkafka::types::RDKafkaRespErr;
use rdkafka::{ClientContext, TopicPartitionList};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::kafka::types::{Partition, RebalanceEvent};
use crate::metrics_consts::REBALANCE_EVENTS;

#[derive(Default)]
struct RebalanceState {
    events: Vec<RebalanceEvent>,
    /// Revoked partitions librdkafka still considers ours. The group cannot
    /// move on until they are released, which happens once the task has
    /// committed and closed them.
    pending_release: Option<Vec<Partition>>,
}

/// Consumer context that records rebalances instead of acting on them.
///
/// librdkafka runs the rebalance callback while the consumer is being polled.
/// Assignments are applied right away. Revocations are only recorded: the
/// partitions stay assigned until [`SinkConsumerContext::release_revoked`] is
/// called, so the task can still commit their offsets under the current
/// generation.
#[derive(Default)]
pub struct SinkConsumerContext {
    state: Mutex<RebalanceState>,
    rebalanced: Notify,
}

impl SinkConsumerContext {
    fn state(&self) -> MutexGuard<'_, RebalanceState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, event: RebalanceEvent) {
        self.state().events.push(event);
        self.rebalanced.notify_one();
    }

    pub fn has_events(&self) -> bool {
        !self.state().events.is_empty()
    }

    pub fn take_events(&self) -> Vec<RebalanceEvent> {
        std::mem::take(&mut self.state().events)
    }

    /// Resolves once a rebalance event has been recorded.
    pub async fn rebalanced(&self) {
        self.rebalanced.notified().await
    }

    /// Hand revoked partitions back to the group. Call only after the task
    /// has applied the matching [`RebalanceEvent::Revoked`].
    pub fn release_revoked<C: Consumer<Self>>(&self, consumer: &C) -> KafkaResult<()> {
        let Some(partitions) = self.state().pending_release.take() else {
            return Ok(());
        };
        info!("Releasing {} revoked partitions", partitions.len());
        Self::unassign(consumer, &Self::topic_partition_list(&partitions))
    }

    fn unassign<C: Consumer<Self>>(consumer: &C, tpl: &TopicPartitionList) -> KafkaResult<()> {
        match consumer.rebalance_protocol() {
            RebalanceProtocol::Cooperative => consumer.incremental_unassign(tpl),
            _ => consumer.unassign(),
        }
    }

    fn partitions(tpl: &TopicPartitionList) -> Vec<Partition> {
        tpl.elements().into_iter().map(Partition::from).collect()
    }

    fn topic_partition_list(partitions: &[Partition]) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        for partition in partitions {
            tpl.add_partition(partition.topic(), partition.partition_number());
        }
        tpl
    }

    fn on_revoke(&self, partitions: Vec<Partition>) {
        info!("Revoking {} partitions", partitions.len());
        {
            let mut state = self.state();
            state
                .pending_release
                .get_or_insert_with(Vec::new)
                .extend(partitions.iter().cloned());
        }
        self.push(RebalanceEvent::Revoked(partitions));
    }

    fn on_assign(&self, consumer: &BaseConsumer<Self>, tpl: &TopicPartitionList) {
        let assigned = match consumer.rebalance_protocol() {
            RebalanceProtocol::Cooperative => consumer.incremental_assign(tpl),
            _ => consumer.assign(tpl),
        };
        if let Err(e) = assigned {
            error!("Failed to apply partition assignment: {e}");
            return;
        }
        if tpl.count() == 0 {
            debug!("Skipping empty assign rebalance");
            metrics::counter!(REBALANCE_EVENTS, "event_type" => "empty_assign").increment(1);
            return;
        }
        info!("Assigned {} partitions", tpl.count());
        self.push(RebalanceEvent::Assigned(Self::partitions(tpl)));
    }
}

impl ClientContext for SinkConsumerContext {}

impl ConsumerContext for SinkConsumerContext {
    fn rebalance(
        &self,
        base_consumer: &BaseConsumer<Self>,
        err: RDKafkaRespErr,
        tpl: &mut TopicPartitionList,
    ) {
        match err {
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__ASSIGN_PARTITIONS => {
                self.on_assign(base_consumer, tpl);
            }
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__REVOKE_PARTITIONS => {
                // Cooperative-sticky sends these when nothing moves, there is
                // nothing for the task to close
                if tpl.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    metrics::counter!(REBALANCE_EVENTS, "event_type" => "empty_revoke")
                        .increment(1);
                    if let Err(e) = Self::unassign(base_consumer, tpl) {
                        error!("Failed to acknowledge empty revoke: {e}");
                    }
                    return;
                }
                self.on_revoke(Self::partitions(tpl));
            }
            _ => {
                // Ownership is in doubt, give up everything we hold once the
                // task has closed it
                error!("Rebalance error: {err:?}");
                match base_consumer.assignment() {
                    Ok(current) if current.count() > 0 => {
                        self.on_revoke(Self::partitions(&current));
                    }
                    Ok(_) => {}
                    Err(e) => error!("Failed to read assignment after rebalance error: {e}"),
                }
            }
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(_) => debug!("Committed offsets for {} partitions", offsets.count()),
            Err(e) => warn!("Failed to commit offsets: {e}"),
        }
    }
}
