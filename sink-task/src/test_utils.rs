use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::SinkTaskConfig;
use crate::context::SinkTaskContext;
use crate::error::{SinkError, TaskFailure};
use crate::kafka::client::{ClientError, CommitCallback, LogClient};
use crate::kafka::types::{
    ConsumerRecord, OffsetMap, Partition, PollResult, RebalanceEvent, Subscription,
};
use crate::pipeline::converter::{SimpleHeaderConverter, StringConverter};
use crate::pipeline::tolerance::{ErrorTolerance, ErrorToleranceOperator};
use crate::pipeline::transform::{Transformation, TransformationChain};
use crate::pipeline::RecordPipeline;
use crate::sink::{RecordBatch, SinkTask};
use crate::status::TaskStatusListener;

pub const TOPIC: &str = "test";

pub fn partition(number: i32) -> Partition {
    Partition::new(TOPIC, number)
}

pub fn record(partition: i32, offset: i64) -> ConsumerRecord {
    ConsumerRecord::new(TOPIC, partition, offset)
        .with_key("key")
        .with_value("value")
}

pub fn task_config() -> SinkTaskConfig {
    SinkTaskConfig::new("test-connector", 0).with_topics([TOPIC])
}

/// String keys and values, no transformations, no tolerance.
pub fn string_pipeline() -> RecordPipeline {
    pipeline_with(Vec::new())
}

pub fn pipeline_with(transformations: Vec<Arc<dyn Transformation>>) -> RecordPipeline {
    RecordPipeline::new(
        Arc::new(StringConverter),
        Arc::new(StringConverter),
        Arc::new(SimpleHeaderConverter),
        TransformationChain::new(transformations),
        Arc::new(ErrorToleranceOperator::new(ErrorTolerance::None)),
    )
}

type PollFn = Box<dyn FnOnce() -> Result<PollResult, ClientError> + Send>;

/// One scripted answer to [`LogClient::poll`].
pub enum PollStep {
    Result(PollResult),
    /// Runs when the poll happens, e.g. to stop the task from "another thread".
    Run(PollFn),
}

/// An async commit whose callback has not been invoked yet.
pub struct PendingCommit {
    pub offsets: OffsetMap,
    callback: CommitCallback,
}

impl PendingCommit {
    pub fn complete(self, result: Result<(), ClientError>) {
        (self.callback)(result);
    }
}

#[derive(Default)]
struct MockState {
    polls: VecDeque<PollStep>,
    poll_timeouts: Vec<Duration>,
    subscriptions: Vec<Subscription>,
    commit_sync_results: VecDeque<Result<(), ClientError>>,
    committed_sync: Vec<OffsetMap>,
    committed_async: Vec<OffsetMap>,
    pending_async: VecDeque<PendingCommit>,
    seeks: Vec<(Partition, i64)>,
    seek_errors: VecDeque<ClientError>,
    pause_calls: Vec<Vec<Partition>>,
    resume_calls: Vec<Vec<Partition>>,
    paused: BTreeSet<Partition>,
    assignment: BTreeSet<Partition>,
    positions: HashMap<Partition, i64>,
}

/// Scripted [`LogClient`]. Polls answer from a queue and return nothing once
/// it is drained; everything else is recorded for inspection.
///
/// Like a real consumer, a wakeup is delivered to the next `poll` or
/// `commit_sync`, whichever comes first.
#[derive(Default)]
pub struct MockLogClient {
    state: Mutex<MockState>,
    woken: AtomicBool,
}

impl MockLogClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn expect_poll(&self, result: PollResult) -> &Self {
        self.state().polls.push_back(PollStep::Result(result));
        self
    }

    pub fn expect_records(&self, records: Vec<ConsumerRecord>) -> &Self {
        self.expect_poll(PollResult::records(records))
    }

    pub fn expect_rebalance(&self, events: Vec<RebalanceEvent>) -> &Self {
        self.expect_poll(PollResult {
            rebalances: events,
            records: Vec::new(),
        })
    }

    pub fn expect_poll_with<F>(&self, f: F) -> &Self
    where
        F: FnOnce() -> Result<PollResult, ClientError> + Send + 'static,
    {
        self.state().polls.push_back(PollStep::Run(Box::new(f)));
        self
    }

    pub fn expect_commit_sync(&self, result: Result<(), ClientError>) -> &Self {
        self.state().commit_sync_results.push_back(result);
        self
    }

    /// Make the next `seek` fail with `error`.
    pub fn fail_next_seek(&self, error: ClientError) -> &Self {
        self.state().seek_errors.push_back(error);
        self
    }

    pub fn set_position(&self, partition: Partition, offset: i64) -> &Self {
        self.state().positions.insert(partition, offset);
        self
    }

    pub fn remaining_polls(&self) -> usize {
        self.state().polls.len()
    }

    pub fn poll_timeouts(&self) -> Vec<Duration> {
        self.state().poll_timeouts.clone()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state().subscriptions.clone()
    }

    pub fn committed_sync(&self) -> Vec<OffsetMap> {
        self.state().committed_sync.clone()
    }

    pub fn committed_async(&self) -> Vec<OffsetMap> {
        self.state().committed_async.clone()
    }

    pub fn take_pending_commits(&self) -> Vec<PendingCommit> {
        self.state().pending_async.drain(..).collect()
    }

    /// Complete every outstanding async commit successfully, oldest first.
    pub fn complete_pending_commits(&self) -> usize {
        let pending = self.take_pending_commits();
        let count = pending.len();
        for commit in pending {
            commit.complete(Ok(()));
        }
        count
    }

    pub fn seeks(&self) -> Vec<(Partition, i64)> {
        self.state().seeks.clone()
    }

    pub fn pause_calls(&self) -> Vec<Vec<Partition>> {
        self.state().pause_calls.clone()
    }

    pub fn resume_calls(&self) -> Vec<Vec<Partition>> {
        self.state().resume_calls.clone()
    }

    pub fn paused(&self) -> BTreeSet<Partition> {
        self.state().paused.clone()
    }

    pub fn is_woken(&self) -> bool {
        self.woken.load(Ordering::SeqCst)
    }

    fn apply_rebalances(&self, result: &PollResult) {
        let mut state = self.state();
        for event in &result.rebalances {
            match event {
                RebalanceEvent::Revoked(partitions) => {
                    for p in partitions {
                        state.assignment.remove(p);
                        state.paused.remove(p);
                    }
                }
                RebalanceEvent::Assigned(partitions) => {
                    state.assignment.extend(partitions.iter().cloned());
                }
            }
        }
    }
}

#[async_trait]
impl LogClient for MockLogClient {
    fn subscribe(&self, subscription: &Subscription) -> Result<(), ClientError> {
        self.state().subscriptions.push(subscription.clone());
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<PollResult, ClientError> {
        let step = {
            let mut state = self.state();
            state.poll_timeouts.push(timeout);
            state.polls.pop_front()
        };
        if self.woken.swap(false, Ordering::SeqCst) {
            if let Some(step) = step {
                self.state().polls.push_front(step);
            }
            return Err(ClientError::Wakeup);
        }

        let result = match step {
            Some(PollStep::Result(result)) => Ok(result),
            Some(PollStep::Run(f)) => f(),
            None => Ok(PollResult::empty()),
        };
        if let Ok(result) = &result {
            self.apply_rebalances(result);
        }
        result
    }

    fn commit_sync(&self, offsets: &OffsetMap) -> Result<(), ClientError> {
        if self.woken.swap(false, Ordering::SeqCst) {
            return Err(ClientError::Wakeup);
        }
        let mut state = self.state();
        let result = state.commit_sync_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            state.committed_sync.push(offsets.clone());
        }
        result
    }

    fn commit_async(&self, offsets: OffsetMap, callback: CommitCallback) {
        let mut state = self.state();
        state.committed_async.push(offsets.clone());
        state
            .pending_async
            .push_back(PendingCommit { offsets, callback });
    }

    fn seek(&self, partition: &Partition, offset: i64) -> Result<(), ClientError> {
        let mut state = self.state();
        if let Some(error) = state.seek_errors.pop_front() {
            return Err(error);
        }
        state.seeks.push((partition.clone(), offset));
        Ok(())
    }

    fn position(&self, partition: &Partition) -> Result<i64, ClientError> {
        Ok(self.state().positions.get(partition).copied().unwrap_or(0))
    }

    fn pause(&self, partitions: &[Partition]) -> Result<(), ClientError> {
        let mut state = self.state();
        state.pause_calls.push(partitions.to_vec());
        state.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&self, partitions: &[Partition]) -> Result<(), ClientError> {
        let mut state = self.state();
        state.resume_calls.push(partitions.to_vec());
        for p in partitions {
            state.paused.remove(p);
        }
        Ok(())
    }

    fn assignment(&self) -> Result<BTreeSet<Partition>, ClientError> {
        Ok(self.state().assignment.clone())
    }

    fn wakeup(&self) {
        self.woken.store(true, Ordering::SeqCst);
    }
}

type PreCommitFn = Box<dyn FnMut(&OffsetMap) -> Result<OffsetMap, SinkError> + Send>;
type PutFn = Box<dyn FnMut(&SinkTaskContext, &RecordBatch) + Send>;

#[derive(Default)]
struct SinkState {
    context: Option<SinkTaskContext>,
    started: bool,
    stopped: bool,
    puts: Vec<RecordBatch>,
    pre_commits: Vec<OffsetMap>,
    opened: Vec<Vec<Partition>>,
    closed: Vec<Vec<Partition>>,
    put_results: VecDeque<Result<(), SinkError>>,
    on_put: Option<PutFn>,
    pre_commit: Option<PreCommitFn>,
    close_error: Option<SinkError>,
    stop_error: Option<SinkError>,
}

/// [`SinkTask`] that records every call. Behavior is scripted and calls are
/// inspected through the [`SinkSpy`] returned alongside it.
pub struct RecordingSink {
    state: Arc<Mutex<SinkState>>,
}

impl RecordingSink {
    pub fn new() -> (Self, SinkSpy) {
        let state = Arc::new(Mutex::new(SinkState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            SinkSpy { state },
        )
    }

    fn state(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SinkTask for RecordingSink {
    fn initialize(&mut self, context: SinkTaskContext) {
        self.state().context = Some(context);
    }

    async fn start(&mut self, _props: &HashMap<String, String>) -> Result<(), SinkError> {
        self.state().started = true;
        Ok(())
    }

    async fn put(&mut self, records: RecordBatch) -> Result<(), SinkError> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.puts.push(Arc::clone(&records));
        if let (Some(on_put), Some(context)) = (state.on_put.as_mut(), state.context.as_ref()) {
            on_put(context, &records);
        }
        state.put_results.pop_front().unwrap_or(Ok(()))
    }

    async fn pre_commit(&mut self, current_offsets: &OffsetMap) -> Result<OffsetMap, SinkError> {
        let mut state = self.state();
        state.pre_commits.push(current_offsets.clone());
        match state.pre_commit.as_mut() {
            Some(f) => f(current_offsets),
            None => Ok(current_offsets.clone()),
        }
    }

    async fn open(&mut self, partitions: &[Partition]) -> Result<(), SinkError> {
        self.state().opened.push(partitions.to_vec());
        Ok(())
    }

    async fn close(&mut self, partitions: &[Partition]) -> Result<(), SinkError> {
        let mut state = self.state();
        state.closed.push(partitions.to_vec());
        match state.close_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn stop(&mut self) -> Result<(), SinkError> {
        let mut state = self.state();
        state.stopped = true;
        match state.stop_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct SinkSpy {
    state: Arc<Mutex<SinkState>>,
}

impl SinkSpy {
    fn state(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_put(&self, error: SinkError) -> &Self {
        self.state().put_results.push_back(Err(error));
        self
    }

    pub fn succeed_put(&self) -> &Self {
        self.state().put_results.push_back(Ok(()));
        self
    }

    pub fn on_put<F>(&self, f: F) -> &Self
    where
        F: FnMut(&SinkTaskContext, &RecordBatch) + Send + 'static,
    {
        self.state().on_put = Some(Box::new(f));
        self
    }

    pub fn on_pre_commit<F>(&self, f: F) -> &Self
    where
        F: FnMut(&OffsetMap) -> Result<OffsetMap, SinkError> + Send + 'static,
    {
        self.state().pre_commit = Some(Box::new(f));
        self
    }

    pub fn fail_close(&self, error: SinkError) -> &Self {
        self.state().close_error = Some(error);
        self
    }

    pub fn fail_stop(&self, error: SinkError) -> &Self {
        self.state().stop_error = Some(error);
        self
    }

    pub fn context(&self) -> Option<SinkTaskContext> {
        self.state().context.clone()
    }

    pub fn is_started(&self) -> bool {
        self.state().started
    }

    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    pub fn puts(&self) -> Vec<RecordBatch> {
        self.state().puts.clone()
    }

    pub fn last_put(&self) -> Option<RecordBatch> {
        self.state().puts.last().cloned()
    }

    pub fn pre_commits(&self) -> Vec<OffsetMap> {
        self.state().pre_commits.clone()
    }

    pub fn opened(&self) -> Vec<Vec<Partition>> {
        self.state().opened.clone()
    }

    pub fn closed(&self) -> Vec<Vec<Partition>> {
        self.state().closed.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Startup,
    Pause,
    Resume,
    Failure(String),
    Shutdown,
}

#[derive(Default)]
pub struct RecordingStatusListener {
    events: Mutex<Vec<StatusEvent>>,
}

impl RecordingStatusListener {
    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn push(&self, event: StatusEvent) {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(event);
    }
}

impl TaskStatusListener for RecordingStatusListener {
    fn on_startup(&self, _task: &str) {
        self.push(StatusEvent::Startup);
    }

    fn on_pause(&self, _task: &str) {
        self.push(StatusEvent::Pause);
    }

    fn on_resume(&self, _task: &str) {
        self.push(StatusEvent::Resume);
    }

    fn on_failure(&self, _task: &str, failure: &TaskFailure) {
        self.push(StatusEvent::Failure(failure.to_string()));
    }

    fn on_shutdown(&self, _task: &str) {
        self.push(StatusEvent::Shutdown);
    }
}
