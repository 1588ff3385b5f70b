//! Redelivery Controller - backpressure after a retriable `put` failure
//!
//! On a retriable failure the batch is retained and every assigned partition
//! is paused, so subsequent polls bring no new records while still keeping
//! group membership alive and delivering rebalances. Each iteration then
//! hands the very same batch (same `Arc`) to the sink again until it is
//! accepted, at which point consumption resumes.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::context::SinkTaskContext;
use crate::kafka::client::{ClientError, LogClient};
use crate::kafka::types::{OffsetMap, Partition};
use crate::metrics_consts::REDELIVERY_ARMED;
use crate::pipeline::record::SinkRecord;
use crate::sink::RecordBatch;

/// Converted records plus the next offsets they account for. The offsets
/// also cover records that were filtered out during conversion.
#[derive(Debug, Clone, Default)]
pub struct PendingBatch {
    records: RecordBatch,
    offsets: OffsetMap,
}

impl PendingBatch {
    pub fn new(records: Vec<SinkRecord>, offsets: OffsetMap) -> Self {
        Self {
            records: Arc::new(records),
            offsets,
        }
    }

    pub fn records(&self) -> &RecordBatch {
        &self.records
    }

    pub fn offsets(&self) -> &OffsetMap {
        &self.offsets
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Only reallocates when `other` brings records, so a retained batch
    /// keeps its identity across redeliveries.
    fn append(&mut self, other: PendingBatch) {
        if !other.records.is_empty() {
            let mut records = Vec::with_capacity(self.records.len() + other.records.len());
            records.extend(self.records.iter().cloned());
            records.extend(other.records.iter().cloned());
            self.records = Arc::new(records);
        }
        self.offsets.extend(other.offsets);
    }

    fn drop_partitions(&mut self, revoked: &[Partition]) {
        let revoked: HashSet<&Partition> = revoked.iter().collect();
        let affected = self
            .records
            .iter()
            .any(|r| revoked.contains(&r.original_partition()));
        if affected {
            let kept = self
                .records
                .iter()
                .filter(|r| !revoked.contains(&r.original_partition()))
                .cloned()
                .collect();
            self.records = Arc::new(kept);
        }
        self.offsets.retain(|p, _| !revoked.contains(p));
    }
}

#[derive(Debug, Default)]
pub enum RedeliveryState {
    #[default]
    Idle,
    Armed(PendingBatch),
}

/// A batch on its way to the sink, and whether it is a redelivery.
#[derive(Debug)]
pub struct Delivery {
    pub batch: PendingBatch,
    pub redelivery: bool,
}

#[derive(Debug, Default)]
pub struct RedeliveryController {
    state: RedeliveryState,
}

impl RedeliveryController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, RedeliveryState::Armed(_))
    }

    pub fn retained(&self) -> Option<&PendingBatch> {
        match &self.state {
            RedeliveryState::Armed(batch) => Some(batch),
            RedeliveryState::Idle => None,
        }
    }

    /// The batch to hand to the sink next: the retained one if armed, with
    /// any freshly converted records appended.
    pub fn begin_delivery(&mut self, fresh: PendingBatch) -> Delivery {
        match std::mem::take(&mut self.state) {
            RedeliveryState::Armed(mut retained) => {
                retained.append(fresh);
                Delivery {
                    batch: retained,
                    redelivery: true,
                }
            }
            RedeliveryState::Idle => Delivery {
                batch: fresh,
                redelivery: false,
            },
        }
    }

    pub fn on_retriable_failure(
        &mut self,
        delivery: Delivery,
        client: &dyn LogClient,
        context: &SinkTaskContext,
    ) -> Result<(), ClientError> {
        self.state = RedeliveryState::Armed(delivery.batch);
        context.set_paused_for_redelivery(true);
        if !delivery.redelivery {
            info!("Pausing all assigned partitions until the failed batch is delivered");
            metrics::counter!(REDELIVERY_ARMED).increment(1);
            pause_all(client, context)?;
        }
        Ok(())
    }

    pub fn on_delivered(
        &mut self,
        delivery: &Delivery,
        client: &dyn LogClient,
        context: &SinkTaskContext,
        task_paused: bool,
    ) -> Result<(), ClientError> {
        self.state = RedeliveryState::Idle;
        if delivery.redelivery {
            context.set_paused_for_redelivery(false);
            if task_paused {
                debug!("Redelivered batch accepted, task is paused so partitions stay paused");
            } else {
                info!("Redelivered batch accepted, resuming consumption");
                resume_all(client, context)?;
            }
        }
        Ok(())
    }

    /// Forget retained records of partitions that are no longer ours.
    pub fn on_partitions_revoked(&mut self, revoked: &[Partition]) {
        if let RedeliveryState::Armed(batch) = &mut self.state {
            batch.drop_partitions(revoked);
        }
    }

    /// Re-establish pauses once all rebalance events of a poll are applied.
    pub fn after_rebalance(
        &mut self,
        client: &dyn LogClient,
        context: &SinkTaskContext,
        task_paused: bool,
    ) -> Result<(), ClientError> {
        let was_armed = self.is_armed();
        if matches!(&self.state, RedeliveryState::Armed(batch) if batch.is_empty()) {
            debug!("All retained records were revoked, redelivery no longer needed");
            self.state = RedeliveryState::Idle;
        }

        if self.is_armed() {
            debug!("Re-pausing new assignment until the retained batch is delivered");
            return pause_all(client, context);
        }

        context.set_paused_for_redelivery(false);
        if was_armed && !task_paused {
            resume_all(client, context)?;
        }
        if task_paused {
            return pause_all(client, context);
        }
        let paused: Vec<Partition> = context.paused_partitions().into_iter().collect();
        if !paused.is_empty() {
            client.pause(&paused)?;
        }
        Ok(())
    }
}

pub(crate) fn pause_all(client: &dyn LogClient, context: &SinkTaskContext) -> Result<(), ClientError> {
    let assignment: Vec<Partition> = context.assignment().into_iter().collect();
    if assignment.is_empty() {
        return Ok(());
    }
    client.pause(&assignment)
}

/// Resume everything the sink did not pause itself.
pub(crate) fn resume_all(client: &dyn LogClient, context: &SinkTaskContext) -> Result<(), ClientError> {
    let paused = context.paused_partitions();
    let resumable: Vec<Partition> = context
        .assignment()
        .into_iter()
        .filter(|p| !paused.contains(p))
        .collect();
    if resumable.is_empty() {
        return Ok(());
    }
    client.resume(&resumable)
}
