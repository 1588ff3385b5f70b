use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::kafka::client::LogClient;
use crate::status::TargetState;

/// Flags shared between the task loop and whoever controls it.
#[derive(Debug, Default)]
pub struct TaskControl {
    stopping: AtomicBool,
    cancelled: AtomicBool,
    paused: AtomicBool,
}

impl TaskControl {
    pub fn new(initial: TargetState) -> Self {
        Self {
            stopping: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(initial == TargetState::Paused),
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Cloneable, thread-safe control surface for a running task.
#[derive(Clone)]
pub struct TaskHandle {
    control: Arc<TaskControl>,
    client: Arc<dyn LogClient>,
}

impl TaskHandle {
    pub(crate) fn new(control: Arc<TaskControl>, client: Arc<dyn LogClient>) -> Self {
        Self { control, client }
    }

    /// Ask the loop to exit after its current iteration. Partitions are still
    /// committed and closed on the way out.
    pub fn stop(&self) {
        info!("Stopping sink task");
        self.control.stopping.store(true, Ordering::SeqCst);
        self.client.wakeup();
    }

    /// Stop without committing offsets on the way out.
    pub fn cancel(&self) {
        info!("Cancelling sink task, final offset commit will be skipped");
        self.control.cancelled.store(true, Ordering::SeqCst);
        self.stop();
    }

    pub fn pause(&self) {
        self.transition_to(TargetState::Paused);
    }

    pub fn resume(&self) {
        self.transition_to(TargetState::Started);
    }

    pub fn transition_to(&self, state: TargetState) {
        let paused = state == TargetState::Paused;
        if self.control.paused.swap(paused, Ordering::SeqCst) != paused {
            self.client.wakeup();
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.control.is_stopping()
    }
}
