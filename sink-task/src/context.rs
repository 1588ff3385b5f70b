use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::handle::TaskControl;
use crate::kafka::client::{ClientError, LogClient};
use crate::kafka::types::Partition;

#[derive(Default)]
struct ContextState {
    offsets: HashMap<Partition, i64>,
    timeout: Option<Duration>,
    paused: BTreeSet<Partition>,
    assignment: BTreeSet<Partition>,
    paused_for_redelivery: bool,
}

struct ContextInner {
    commit_requested: AtomicBool,
    state: Mutex<ContextState>,
    control: Arc<TaskControl>,
    client: Arc<dyn LogClient>,
}

/// The sink's window back into the runtime. Cheap to clone and safe to use
/// from any thread.
#[derive(Clone)]
pub struct SinkTaskContext {
    inner: Arc<ContextInner>,
}

impl SinkTaskContext {
    pub(crate) fn new(control: Arc<TaskControl>, client: Arc<dyn LogClient>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                commit_requested: AtomicBool::new(false),
                state: Mutex::new(ContextState::default()),
                control,
                client,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ContextState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Commit on the next iteration regardless of the commit interval.
    pub fn request_commit(&self) {
        self.inner.commit_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_commit_requested(&self) -> bool {
        self.inner.commit_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_commit_request(&self) {
        self.inner.commit_requested.store(false, Ordering::SeqCst);
    }

    /// Reset consumption of the given partitions to these offsets before the
    /// next poll.
    pub fn offset(&self, offsets: HashMap<Partition, i64>) {
        self.state().offsets.extend(offsets);
    }

    pub fn offset_for(&self, partition: Partition, offset: i64) {
        self.state().offsets.insert(partition, offset);
    }

    pub(crate) fn take_offsets(&self) -> HashMap<Partition, i64> {
        std::mem::take(&mut self.state().offsets)
    }

    /// Cap the next poll at `timeout`, e.g. to retry a flush sooner.
    pub fn timeout(&self, timeout: Duration) {
        self.state().timeout = Some(timeout);
    }

    pub(crate) fn take_timeout(&self) -> Option<Duration> {
        self.state().timeout.take()
    }

    pub fn assignment(&self) -> BTreeSet<Partition> {
        self.state().assignment.clone()
    }

    pub(crate) fn set_assignment(&self, assignment: BTreeSet<Partition>) {
        let mut state = self.state();
        state.paused.retain(|p| assignment.contains(p));
        state.assignment = assignment;
    }

    pub fn paused_partitions(&self) -> BTreeSet<Partition> {
        self.state().paused.clone()
    }

    pub(crate) fn set_paused_for_redelivery(&self, paused: bool) {
        self.state().paused_for_redelivery = paused;
    }

    /// Stop fetching from `partitions` until [`Self::resume`] is called.
    pub fn pause(&self, partitions: &[Partition]) -> Result<(), ClientError> {
        let suppressed = {
            let mut state = self.state();
            Self::check_assigned(&state.assignment, partitions)?;
            state.paused.extend(partitions.iter().cloned());
            state.paused_for_redelivery || self.inner.control.is_paused()
        };
        if suppressed {
            debug!(?partitions, "Partitions already paused by the task, recording pause only");
            return Ok(());
        }
        self.inner.client.pause(partitions)
    }

    pub fn resume(&self, partitions: &[Partition]) -> Result<(), ClientError> {
        let suppressed = {
            let mut state = self.state();
            Self::check_assigned(&state.assignment, partitions)?;
            for partition in partitions {
                state.paused.remove(partition);
            }
            state.paused_for_redelivery || self.inner.control.is_paused()
        };
        if suppressed {
            debug!(?partitions, "Task is paused, partitions will resume with it");
            return Ok(());
        }
        self.inner.client.resume(partitions)
    }

    fn check_assigned(
        assignment: &BTreeSet<Partition>,
        partitions: &[Partition],
    ) -> Result<(), ClientError> {
        match partitions.iter().find(|p| !assignment.contains(p)) {
            Some(partition) => Err(ClientError::NotAssigned(partition.clone())),
            None => Ok(()),
        }
    }
}
