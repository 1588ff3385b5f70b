//! Rebalance Coordinator - applies partition ownership changes
//!
//! Rebalance events are not callbacks here: the client returns them from
//! `poll` and the task applies them, in order, before touching the records of
//! that poll.
//!
//! ```text
//! Revoked(ps)                         Assigned(ps)
//!   commit ps (sync, closing)           seed ledger from position(p)
//!   sink.close(ps)                      sink.open(ps)
//!   forget ps (ledger, batch, metrics)  apply sink-requested rewinds
//!                 \                     /
//!                  after all events: re-pause for redelivery,
//!                  task pause or sink-requested partition pauses
//! ```

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::commit::CommitCoordinator;
use crate::context::SinkTaskContext;
use crate::error::TaskError;
use crate::handle::TaskControl;
use crate::kafka::client::{ClientError, LogClient};
use crate::kafka::types::{OffsetAndMetadata, OffsetMap, Partition, RebalanceEvent};
use crate::metrics_consts::REBALANCE_EVENTS;
use crate::redelivery::RedeliveryController;
use crate::sink::SinkTask;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RebalanceOutcome {
    /// A sync commit was interrupted by a wakeup that still has to reach the loop.
    pub wakeup: bool,
}

pub struct RebalanceCoordinator<'a> {
    pub client: &'a dyn LogClient,
    pub sink: &'a mut dyn SinkTask,
    pub commits: &'a CommitCoordinator,
    pub redelivery: &'a mut RedeliveryController,
    pub context: &'a SinkTaskContext,
    pub control: &'a TaskControl,
    pub sink_started: bool,
    pub sink_stopped: bool,
}

impl RebalanceCoordinator<'_> {
    pub async fn apply(&mut self, events: Vec<RebalanceEvent>) -> Result<RebalanceOutcome, TaskError> {
        let mut outcome = RebalanceOutcome::default();
        if events.is_empty() {
            return Ok(outcome);
        }

        for event in events {
            match event {
                RebalanceEvent::Revoked(partitions) => {
                    metrics::counter!(REBALANCE_EVENTS, "event_type" => "revoke").increment(1);
                    outcome.wakeup |= self.on_partitions_revoked(&partitions).await?;
                }
                RebalanceEvent::Assigned(partitions) => {
                    metrics::counter!(REBALANCE_EVENTS, "event_type" => "assign").increment(1);
                    self.on_partitions_assigned(&partitions).await?;
                }
            }
        }

        self.redelivery
            .after_rebalance(self.client, self.context, self.control.is_paused())?;
        Ok(outcome)
    }

    /// Commit, close and forget `partitions`. Returns whether the commit was
    /// interrupted by a wakeup.
    pub async fn on_partitions_revoked(&mut self, partitions: &[Partition]) -> Result<bool, TaskError> {
        if self.sink_stopped {
            debug!("Skipping partition revocation as the sink has already been stopped");
            return Ok(false);
        }
        if partitions.is_empty() {
            return Ok(false);
        }
        info!(?partitions, "Partitions revoked");

        let mut wakeup = false;
        let mut commit_error = None;
        match self.commits.commit_offsets(&mut *self.sink, partitions, true).await {
            Ok(()) => {}
            Err(ClientError::Wakeup) => wakeup = true,
            Err(e) => commit_error = Some(e),
        }

        let closed = self.sink.close(partitions).await;

        self.commits.with_state(|state| {
            state.ledger.remove(partitions);
            state.metrics.clear_offsets(partitions);
            state.metrics.record_partition_count(state.ledger.partitions().len());
        });
        self.redelivery.on_partitions_revoked(partitions);
        let mut assignment = self.context.assignment();
        for partition in partitions {
            assignment.remove(partition);
        }
        self.context.set_assignment(assignment);

        closed.map_err(|source| TaskError::SinkCall {
            operation: "close",
            source,
        })?;
        if let Some(e) = commit_error {
            return Err(e.into());
        }
        Ok(wakeup)
    }

    pub async fn on_partitions_assigned(&mut self, partitions: &[Partition]) -> Result<(), TaskError> {
        info!(?partitions, "Partitions assigned");

        let mut seeded = OffsetMap::new();
        for partition in partitions {
            let position = self.client.position(partition)?;
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = position,
                "Assigned partition starts at position"
            );
            seeded.insert(partition.clone(), OffsetAndMetadata::new(position));
        }
        self.commits.with_state(|state| {
            for (partition, offset) in &seeded {
                state.ledger.seed(partition.clone(), offset.offset());
            }
            state.metrics.assigned_offsets(&seeded);
            state.metrics.record_partition_count(state.ledger.partitions().len());
        });

        let mut assignment = self.context.assignment();
        assignment.extend(partitions.iter().cloned());
        self.context.set_assignment(assignment);

        if partitions.is_empty() {
            return Ok(());
        }
        if self.sink_started {
            self.sink
                .open(partitions)
                .await
                .map_err(|source| TaskError::SinkCall {
                    operation: "open",
                    source,
                })?;
        }
        rewind(self.client, self.context, self.commits)?;
        Ok(())
    }
}

/// Seek to offsets the sink asked for through its context and make the
/// ledger agree with the new position.
pub(crate) fn rewind(
    client: &dyn LogClient,
    context: &SinkTaskContext,
    commits: &CommitCoordinator,
) -> Result<(), ClientError> {
    let requested = context.take_offsets();
    if requested.is_empty() {
        return Ok(());
    }
    let assignment: BTreeSet<Partition> = context.assignment();

    for (partition, offset) in requested {
        if !assignment.contains(&partition) {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset,
                "Ignoring offset reset for partition that is not assigned"
            );
            continue;
        }
        debug!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            offset = offset,
            "Rewinding partition at sink's request"
        );
        client.seek(&partition, offset)?;
        commits.with_state(|state| state.ledger.rewind(&partition, OffsetAndMetadata::new(offset)));
    }
    Ok(())
}
