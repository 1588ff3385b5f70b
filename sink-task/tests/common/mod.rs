//! Shared harness for driving a `WorkerSinkTask` against the scripted client
//! and the recording sink.
#![allow(dead_code)]

use std::sync::Arc;

use sink_task::config::SinkTaskConfig;
use sink_task::kafka::types::{OffsetAndMetadata, OffsetMap, RebalanceEvent};
use sink_task::pipeline::RecordPipeline;
use sink_task::test_utils::{
    partition, string_pipeline, task_config, MockLogClient, RecordingSink,
    RecordingStatusListener, SinkSpy,
};
use sink_task::time::MockTime;
use sink_task::WorkerSinkTask;

pub const FIRST_OFFSET: i64 = 45;

pub struct Harness {
    pub client: Arc<MockLogClient>,
    pub spy: SinkSpy,
    pub time: Arc<MockTime>,
    pub listener: Arc<RecordingStatusListener>,
    pub task: WorkerSinkTask,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(task_config(), string_pipeline())
    }

    pub fn with(config: SinkTaskConfig, pipeline: RecordPipeline) -> Self {
        let client = Arc::new(MockLogClient::new());
        let (sink, spy) = RecordingSink::new();
        let time = Arc::new(MockTime::new(1_000));
        let listener = Arc::new(RecordingStatusListener::default());
        let task = WorkerSinkTask::new(
            config,
            client.clone(),
            Box::new(sink),
            pipeline,
            time.clone(),
        )
        .with_status_listener(listener.clone());

        Self {
            client,
            spy,
            time,
            listener,
            task,
        }
    }

    /// Start the sink and script an assignment of `partitions`, all at
    /// [`FIRST_OFFSET`], for the next poll.
    pub async fn start_with_assignment(&mut self, partitions: &[i32]) {
        self.task.initialize_and_start().await.unwrap();
        self.expect_assignment(partitions);
        self.task.iteration().await.unwrap();
    }

    pub fn expect_assignment(&self, partitions: &[i32]) {
        for p in partitions {
            self.client.set_position(partition(*p), FIRST_OFFSET);
        }
        self.client.expect_rebalance(vec![RebalanceEvent::Assigned(
            partitions.iter().map(|p| partition(*p)).collect(),
        )]);
    }
}

pub fn offsets(entries: &[(i32, i64)]) -> OffsetMap {
    entries
        .iter()
        .map(|(p, o)| (partition(*p), OffsetAndMetadata::new(*o)))
        .collect()
}
