//! Task Loop - drives one sink task from start to shutdown
//!
//! ```text
//!            ┌──────────────────────── iteration() ───────────────────────┐
//!  start ──▶ │ commit due? ─▶ rewind ─▶ poll ─▶ rebalances ─▶ convert ─▶ put │ ──▶ close all ──▶ stop
//!            └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! One iteration runs at a time and `poll` is the only point where
//! rebalances surface. A wakeup (from `stop`, `cancel` or a target state
//! change) interrupts the poll; outside of shutdown it turns into a pause or
//! resume of the whole assignment.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::commit::{CommitCoordinator, CommitPhase, CommitState};
use crate::config::SinkTaskConfig;
use crate::context::SinkTaskContext;
use crate::error::{TaskError, TaskFailure};
use crate::handle::{TaskControl, TaskHandle};
use crate::kafka::client::{ClientError, LogClient};
use crate::kafka::types::{ConsumerRecord, OffsetAndMetadata, OffsetMap, Partition};
use crate::metrics::{SinkTaskMetrics, SinkTaskMetricsSnapshot};
use crate::pipeline::RecordPipeline;
use crate::rebalance::{self, RebalanceCoordinator};
use crate::redelivery::{self, PendingBatch, RedeliveryController};
use crate::sink::SinkTask;
use crate::status::{LoggingStatusListener, TaskStatus, TaskStatusListener};
use crate::time::TimeSource;

pub struct WorkerSinkTask {
    id: String,
    config: SinkTaskConfig,
    client: Arc<dyn LogClient>,
    sink: Box<dyn SinkTask>,
    pipeline: RecordPipeline,
    context: SinkTaskContext,
    commits: CommitCoordinator,
    redelivery: RedeliveryController,
    control: Arc<TaskControl>,
    time: Arc<dyn TimeSource>,
    status_listener: Arc<dyn TaskStatusListener>,
    next_commit_ms: u64,
    commit_interval_ms: u64,
    sink_started: bool,
    sink_stopped: bool,
}

impl WorkerSinkTask {
    pub fn new(
        config: SinkTaskConfig,
        client: Arc<dyn LogClient>,
        sink: Box<dyn SinkTask>,
        pipeline: RecordPipeline,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let id = config.task_id();
        let now = time.milliseconds();
        let control = Arc::new(TaskControl::new(config.initial_state));
        let context = SinkTaskContext::new(Arc::clone(&control), Arc::clone(&client));
        let commits = CommitCoordinator::new(
            CommitState::new(SinkTaskMetrics::new(id.clone(), now)),
            Arc::clone(&client),
            Arc::clone(&time),
            Arc::clone(&control),
            config.offset_commit_timeout,
        );
        let commit_interval_ms =
            u64::try_from(config.offset_commit_interval.as_millis()).unwrap_or(u64::MAX);

        Self {
            id,
            config,
            client,
            sink,
            pipeline,
            context,
            commits,
            redelivery: RedeliveryController::new(),
            control,
            time,
            status_listener: Arc::new(LoggingStatusListener),
            next_commit_ms: now.saturating_add(commit_interval_ms),
            commit_interval_ms,
            sink_started: false,
            sink_stopped: false,
        }
    }

    pub fn with_status_listener(mut self, listener: Arc<dyn TaskStatusListener>) -> Self {
        self.status_listener = listener;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle::new(Arc::clone(&self.control), Arc::clone(&self.client))
    }

    pub fn context(&self) -> SinkTaskContext {
        self.context.clone()
    }

    pub fn metrics(&self) -> SinkTaskMetricsSnapshot {
        let now = self.time.milliseconds();
        self.commits.with_state(|state| state.metrics.snapshot(now))
    }

    pub fn current_offsets(&self) -> OffsetMap {
        self.commits.with_state(|state| state.ledger.current().clone())
    }

    pub fn last_committed_offsets(&self) -> OffsetMap {
        self.commits.with_state(|state| state.ledger.last_committed().clone())
    }

    pub fn commit_failures(&self) -> u32 {
        self.commits.commit_failures()
    }

    pub fn commit_phase(&self) -> CommitPhase {
        self.commits.phase()
    }

    pub fn is_paused_for_redelivery(&self) -> bool {
        self.redelivery.is_armed()
    }

    /// Subscribe, then hand the sink its context and start it.
    pub async fn initialize_and_start(&mut self) -> Result<(), TaskError> {
        let subscription = self.config.subscription()?;
        info!(task = %self.id, ?subscription, "Initializing sink task");
        self.client.subscribe(&subscription)?;

        self.sink.initialize(self.context.clone());
        self.sink
            .start(&self.config.props)
            .await
            .map_err(|source| TaskError::SinkCall {
                operation: "start",
                source,
            })?;
        self.sink_started = true;
        info!(task = %self.id, "Sink task finished initialization and start");

        self.report_status(TaskStatus::Running);
        self.status_listener.on_startup(&self.id);
        if self.control.is_paused() {
            self.report_status(TaskStatus::Paused);
            self.status_listener.on_pause(&self.id);
        }
        Ok(())
    }

    /// Start, run until stopped or failed, then stop the sink.
    pub async fn run(&mut self) -> Result<(), TaskFailure> {
        let mut result = match self.initialize_and_start().await {
            Ok(()) => self.execute().await,
            Err(e) => Err(TaskFailure::new(e)),
        };

        if let Err(e) = self.stop_sink().await {
            result = match result {
                Err(mut failure) => {
                    failure.suppress(e);
                    Err(failure)
                }
                Ok(()) => Err(TaskFailure::new(e)),
            };
        }

        match &result {
            Ok(()) => {
                self.report_status(TaskStatus::Destroyed);
                self.status_listener.on_shutdown(&self.id);
            }
            Err(failure) => {
                self.report_status(TaskStatus::Failed);
                self.status_listener.on_failure(&self.id, failure);
            }
        }
        result
    }

    /// Iterate until stopped, then commit and close whatever is still
    /// assigned. A failure while closing is attached to the failure that
    /// ended the loop, if any.
    pub async fn execute(&mut self) -> Result<(), TaskFailure> {
        info!(task = %self.id, "Executing sink task");
        let mut failure: Option<TaskFailure> = None;

        while !self.control.is_stopping() {
            if let Err(e) = self.iteration().await {
                error!(task = %self.id, error = ?e, "Task threw an uncaught and unrecoverable exception");
                failure = Some(TaskFailure::new(e));
                break;
            }
        }

        if let Err(close_error) = self.close_all_partitions().await {
            failure = Some(match failure {
                Some(mut failure) => {
                    warn!(error = ?close_error, "Failed to close partitions while handling a task failure");
                    failure.suppress(close_error);
                    failure
                }
                None => TaskFailure::new(close_error),
            });
        }

        match failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    /// One poll cycle. A wakeup is handled here and never escapes.
    pub async fn iteration(&mut self) -> Result<(), TaskError> {
        match self.poll_cycle().await {
            Err(e) if e.is_wakeup() => self.on_wakeup(),
            other => other,
        }
    }

    async fn poll_cycle(&mut self) -> Result<(), TaskError> {
        let now = self.time.milliseconds();

        if !self.commits.is_committing()
            && (self.context.is_commit_requested() || now >= self.next_commit_ms)
        {
            let scope = self.commits.with_state(|state| state.ledger.partitions());
            self.commits
                .commit_offsets(self.sink.as_mut(), &scope, false)
                .await?;
            self.next_commit_ms = now.saturating_add(self.commit_interval_ms);
            self.context.clear_commit_request();
        }
        self.commits.check_timeout();

        let timeout = Duration::from_millis(self.next_commit_ms.saturating_sub(now));
        self.poll(timeout).await
    }

    async fn poll(&mut self, timeout: Duration) -> Result<(), TaskError> {
        rebalance::rewind(self.client.as_ref(), &self.context, &self.commits)?;

        let timeout = match self.context.take_timeout() {
            Some(requested) => timeout.min(requested),
            None => timeout,
        };
        trace!(timeout_ms = timeout.as_millis() as u64, "Polling for new records");
        let polled = self.client.poll(timeout).await?;

        let outcome = self.rebalancer().apply(polled.rebalances).await?;

        let records = self.retain_assigned(polled.records);
        if !records.is_empty() {
            debug!(count = records.len(), "Read records from the log");
        }
        self.commits
            .with_state(|state| state.metrics.record_read(records.len()));

        let fresh = self.convert(&records)?;
        self.deliver(fresh).await?;

        if outcome.wakeup {
            return Err(ClientError::Wakeup.into());
        }
        Ok(())
    }

    /// Records fetched before a revocation can come back together with it.
    /// They belong to the new owner now and must not reach the sink.
    fn retain_assigned(&self, mut records: Vec<ConsumerRecord>) -> Vec<ConsumerRecord> {
        let assignment = self.context.assignment();
        let polled = records.len();
        records.retain(|record| assignment.contains(&record.partition()));
        if records.len() < polled {
            debug!(
                dropped = polled - records.len(),
                "Dropping records of partitions that are no longer assigned"
            );
        }
        records
    }

    fn convert(&self, records: &[ConsumerRecord]) -> Result<PendingBatch, TaskError> {
        let mut converted = Vec::with_capacity(records.len());
        let mut offsets = OffsetMap::new();

        for record in records {
            trace!(
                topic = record.topic,
                partition = record.partition,
                offset = record.offset,
                "Converting record"
            );
            if let Some(sink_record) = self.pipeline.process(record)? {
                converted.push(sink_record);
            }
            offsets.insert(record.partition(), OffsetAndMetadata::new(record.offset + 1));
        }

        self.commits
            .with_state(|state| state.metrics.record_consumed_offsets(&offsets));
        Ok(PendingBatch::new(converted, offsets))
    }

    async fn deliver(&mut self, fresh: PendingBatch) -> Result<(), TaskError> {
        let delivery = self.redelivery.begin_delivery(fresh);
        let size = delivery.batch.len();
        if delivery.redelivery {
            debug!(size = size, "Redelivering retained batch");
        }

        match self.sink.put(Arc::clone(delivery.batch.records())).await {
            Ok(()) => {
                self.commits.with_state(|state| {
                    state.metrics.record_batch(size);
                    state.metrics.record_send(size);
                    state.ledger.advance(delivery.batch.offsets());
                });
                self.redelivery.on_delivered(
                    &delivery,
                    self.client.as_ref(),
                    &self.context,
                    self.control.is_paused(),
                )?;
                Ok(())
            }
            Err(e) if e.is_retriable() => {
                error!(size = size, error = ?e, "Retriable exception from sink task, will retry the batch");
                self.redelivery
                    .on_retriable_failure(delivery, self.client.as_ref(), &self.context)?;
                Ok(())
            }
            Err(e) => Err(TaskError::Unrecoverable(e)),
        }
    }

    fn on_wakeup(&mut self) -> Result<(), TaskError> {
        if self.control.is_stopping() {
            trace!("Consumer woken up for shutdown");
            return Ok(());
        }

        if self.control.is_paused() {
            info!(task = %self.id, "Pausing consumption for paused task");
            redelivery::pause_all(self.client.as_ref(), &self.context)?;
            if self.report_status(TaskStatus::Paused) {
                self.status_listener.on_pause(&self.id);
            }
            self.context.request_commit();
        } else if !self.redelivery.is_armed() {
            info!(task = %self.id, "Resuming consumption");
            redelivery::resume_all(self.client.as_ref(), &self.context)?;
            if self.report_status(TaskStatus::Running) {
                self.status_listener.on_resume(&self.id);
            }
        }
        Ok(())
    }

    async fn close_all_partitions(&mut self) -> Result<(), TaskError> {
        let partitions: Vec<Partition> = self.commits.with_state(|state| state.ledger.partitions());
        match self.rebalancer().on_partitions_revoked(&partitions).await {
            Ok(true) => {
                debug!("Ignoring wakeup during final offset commit");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) if e.is_wakeup() => {
                debug!("Ignoring wakeup while closing partitions");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn stop_sink(&mut self) -> Result<(), TaskError> {
        if !self.sink_started || self.sink_stopped {
            return Ok(());
        }
        self.sink_stopped = true;
        self.commits
            .with_state(|state| state.metrics.record_partition_count(0));
        self.sink.stop().await.map_err(|source| TaskError::SinkCall {
            operation: "stop",
            source,
        })
    }

    fn rebalancer(&mut self) -> RebalanceCoordinator<'_> {
        RebalanceCoordinator {
            client: self.client.as_ref(),
            sink: self.sink.as_mut(),
            commits: &self.commits,
            redelivery: &mut self.redelivery,
            context: &self.context,
            control: &self.control,
            sink_started: self.sink_started,
            sink_stopped: self.sink_stopped,
        }
    }

    /// Returns whether the status changed.
    fn report_status(&self, status: TaskStatus) -> bool {
        let now = self.time.milliseconds();
        self.commits.with_state(|state| {
            let changed = state.metrics.status() != status;
            state.metrics.record_status(status, now);
            changed
        })
    }
}
