//! Commit Coordinator - turns delivered offsets into acknowledged commits
//!
//! ```text
//!   Idle ──commit_offsets()──▶ InFlight { seqno, started_ms }
//!     ▲                              │
//!     └── completion (latest seqno) ─┤
//!     └── timeout ───────────────────┘
//! ```
//!
//! Every attempt takes a new sequence number. Completions, which for async
//! commits arrive on a client thread, are applied under the same lock that
//! guards the ledger, and only if their sequence number is still the latest
//! one issued. A slow async completion can therefore never overwrite the
//! result of a later commit, e.g. the sync commit made while revoking.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::handle::TaskControl;
use crate::kafka::client::{ClientError, LogClient};
use crate::kafka::types::{OffsetMap, Partition};
use crate::metrics::SinkTaskMetrics;
use crate::offset_ledger::OffsetLedger;
use crate::sink::SinkTask;
use crate::time::TimeSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    Idle,
    InFlight { seqno: u64, started_ms: u64 },
}

enum Completion<'a> {
    Committed(&'a OffsetMap),
    Skipped,
    Failed,
}

/// Everything the loop and the async commit callback both touch.
#[derive(Debug)]
pub struct CommitState {
    pub ledger: OffsetLedger,
    pub metrics: SinkTaskMetrics,
    seqno: u64,
    phase: CommitPhase,
    failures: u32,
}

impl CommitState {
    pub fn new(metrics: SinkTaskMetrics) -> Self {
        Self {
            ledger: OffsetLedger::new(),
            metrics,
            seqno: 0,
            phase: CommitPhase::Idle,
            failures: 0,
        }
    }

    fn begin(&mut self, now_ms: u64) -> u64 {
        self.seqno += 1;
        self.phase = CommitPhase::InFlight {
            seqno: self.seqno,
            started_ms: now_ms,
        };
        self.metrics.record_commit_seqno(self.seqno);
        self.seqno
    }

    fn complete(&mut self, seqno: u64, completion: Completion<'_>, now_ms: u64) {
        if seqno != self.seqno {
            debug!(
                seqno = seqno,
                latest_seqno = self.seqno,
                "Received out of order commit callback, ignoring"
            );
            self.metrics.record_commit_skip();
            return;
        }

        let started_ms = match self.phase {
            CommitPhase::InFlight { started_ms, .. } => started_ms,
            CommitPhase::Idle => now_ms,
        };
        let duration_ms = now_ms.saturating_sub(started_ms);

        match completion {
            Completion::Committed(offsets) => {
                debug!(
                    seqno = seqno,
                    duration_ms = duration_ms,
                    partitions = offsets.len(),
                    "Finished offset commit successfully"
                );
                self.ledger.mark_committed(offsets);
                self.metrics.record_committed_offsets(offsets);
                self.metrics.record_commit_success(duration_ms);
                self.failures = 0;
            }
            Completion::Skipped => {
                self.metrics.record_commit_skip();
                self.failures = 0;
            }
            Completion::Failed => {
                self.failures += 1;
                self.metrics.record_commit_failure(duration_ms);
            }
        }
        self.phase = CommitPhase::Idle;
    }
}

pub struct CommitCoordinator {
    state: Arc<Mutex<CommitState>>,
    client: Arc<dyn LogClient>,
    time: Arc<dyn TimeSource>,
    control: Arc<TaskControl>,
    timeout_ms: u64,
}

impl CommitCoordinator {
    pub fn new(
        state: CommitState,
        client: Arc<dyn LogClient>,
        time: Arc<dyn TimeSource>,
        control: Arc<TaskControl>,
        timeout: Duration,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            client,
            time,
            control,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn lock(state: &Mutex<CommitState>) -> MutexGuard<'_, CommitState> {
        state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` inside the commit critical section.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut CommitState) -> R) -> R {
        f(&mut Self::lock(&self.state))
    }

    pub fn is_committing(&self) -> bool {
        self.with_state(|state| state.phase != CommitPhase::Idle)
    }

    pub fn phase(&self) -> CommitPhase {
        self.with_state(|state| state.phase)
    }

    /// Consecutive failed commits since the last success.
    pub fn commit_failures(&self) -> u32 {
        self.with_state(|state| state.failures)
    }

    /// Give up on an in-flight commit that has been running for too long.
    /// Its completion is still applied if it is the latest when it arrives.
    pub fn check_timeout(&self) {
        let now = self.time.milliseconds();
        self.with_state(|state| {
            if let CommitPhase::InFlight { seqno, started_ms } = state.phase {
                let elapsed = now.saturating_sub(started_ms);
                if elapsed >= self.timeout_ms {
                    warn!(
                        seqno = seqno,
                        elapsed_ms = elapsed,
                        "Commit of offsets timed out"
                    );
                    state.failures += 1;
                    state.metrics.record_commit_failure(elapsed);
                    state.phase = CommitPhase::Idle;
                }
            }
        });
    }

    /// Commit what the sink agrees to for the partitions in `scope`.
    ///
    /// With `closing` set the commit is synchronous and a `preCommit` failure
    /// does not rewind. Commit failures are counted, not returned. Errors
    /// that do come back are a [`ClientError::Wakeup`] from a sync commit
    /// that was already retried once, or a failed seek while rewinding.
    pub async fn commit_offsets(
        &self,
        sink: &mut dyn SinkTask,
        scope: &[Partition],
        closing: bool,
    ) -> Result<(), ClientError> {
        let now = self.time.milliseconds();
        let prepared = self.with_state(|state| {
            let to_commit = state.ledger.snapshot_committable(scope);
            if to_commit.is_empty() {
                return None;
            }
            let seqno = state.begin(now);
            let assigned: BTreeSet<Partition> = state.ledger.partitions().into_iter().collect();
            Some((seqno, to_commit, state.ledger.committed_snapshot(scope), assigned))
        });
        let Some((seqno, to_commit, last_committed, assigned)) = prepared else {
            debug!("No offsets to commit");
            return Ok(());
        };

        let candidate = match sink.pre_commit(&to_commit).await {
            Ok(candidate) => candidate,
            Err(e) => {
                if closing {
                    warn!(seqno = seqno, error = ?e, "Offset commit failed during close");
                } else {
                    error!(
                        seqno = seqno,
                        error = ?e,
                        "Offset commit failed, rewinding to last committed offsets"
                    );
                    let rewound = self.rewind(&last_committed);
                    self.complete(seqno, Completion::Failed);
                    return rewound;
                }
                self.complete(seqno, Completion::Failed);
                return Ok(());
            }
        };

        let clamped = self.with_state(|state| state.ledger.clamp_against(scope, &candidate, &assigned));
        let Some(offsets) = clamped else {
            debug!(seqno = seqno, "Skipping offset commit, nothing new to commit");
            self.complete(seqno, Completion::Skipped);
            return Ok(());
        };

        if self.control.is_cancelled() {
            info!(seqno = seqno, "Skipping final offset commit as task has been cancelled");
            self.complete(seqno, Completion::Skipped);
            return Ok(());
        }

        if closing {
            self.commit_sync(seqno, offsets)
        } else {
            self.commit_async(seqno, offsets);
            Ok(())
        }
    }

    fn rewind(&self, last_committed: &OffsetMap) -> Result<(), ClientError> {
        for (partition, offset) in last_committed {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset.offset(),
                "Rewinding partition to last committed offset"
            );
            self.client.seek(partition, offset.offset())?;
        }
        self.with_state(|state| {
            for (partition, offset) in last_committed {
                state.ledger.rewind(partition, offset.clone());
            }
        });
        Ok(())
    }

    fn commit_sync(&self, seqno: u64, offsets: OffsetMap) -> Result<(), ClientError> {
        debug!(seqno = seqno, partitions = offsets.len(), "Committing offsets synchronously");
        match self.client.commit_sync(&offsets) {
            Ok(()) => {
                self.complete(seqno, Completion::Committed(&offsets));
                Ok(())
            }
            Err(ClientError::Wakeup) => {
                debug!(seqno = seqno, "Woken up during synchronous commit, retrying once");
                match self.client.commit_sync(&offsets) {
                    Ok(()) => self.complete(seqno, Completion::Committed(&offsets)),
                    Err(e) => {
                        error!(seqno = seqno, error = ?e, "Synchronous commit retry failed");
                        self.complete(seqno, Completion::Failed);
                    }
                }
                Err(ClientError::Wakeup)
            }
            Err(e) => {
                error!(seqno = seqno, error = ?e, "Synchronous offset commit failed");
                self.complete(seqno, Completion::Failed);
                Ok(())
            }
        }
    }

    fn commit_async(&self, seqno: u64, offsets: OffsetMap) {
        debug!(seqno = seqno, partitions = offsets.len(), "Committing offsets asynchronously");
        let state = Arc::clone(&self.state);
        let time = Arc::clone(&self.time);
        let committed = offsets.clone();
        self.client.commit_async(
            offsets,
            Box::new(move |result| {
                let now = time.milliseconds();
                let mut state = Self::lock(&state);
                match result {
                    Ok(()) => state.complete(seqno, Completion::Committed(&committed), now),
                    Err(e) => {
                        error!(seqno = seqno, error = ?e, "Asynchronous offset commit failed");
                        state.complete(seqno, Completion::Failed, now);
                    }
                }
            }),
        );
    }

    fn complete(&self, seqno: u64, completion: Completion<'_>) {
        let now = self.time.milliseconds();
        self.with_state(|state| state.complete(seqno, completion, now));
    }
}
