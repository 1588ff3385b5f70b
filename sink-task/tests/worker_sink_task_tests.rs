mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{offsets, Harness, FIRST_OFFSET};
use sink_task::config::SinkTaskConfig;
use sink_task::error::{SinkError, TaskError};
use sink_task::kafka::client::ClientError;
use sink_task::kafka::types::{PollResult, RebalanceEvent, Subscription};
use sink_task::pipeline::transform::{TopicPrefix, Transformation};
use sink_task::status::{TargetState, TaskStatus};
use sink_task::test_utils::{
    partition, pipeline_with, record, string_pipeline, task_config, StatusEvent,
};
use tokio_test::{assert_err, assert_ok};

fn retriable() -> SinkError {
    SinkError::retriable(anyhow::anyhow!("downstream unavailable"))
}

fn fatal() -> SinkError {
    SinkError::fatal(anyhow::anyhow!("bad record"))
}

#[tokio::test]
async fn delivers_records_and_advances_offsets() {
    let mut h = Harness::new();
    h.start_with_assignment(&[12, 13]).await;

    h.client
        .expect_records(vec![record(12, 45), record(12, 46), record(13, 45)]);
    assert_ok!(h.task.iteration().await);

    let batch = h.spy.last_put().unwrap();
    assert_eq!(batch.len(), 3);
    assert_eq!(h.task.current_offsets(), offsets(&[(12, 47), (13, 46)]));
    assert_eq!(
        h.task.last_committed_offsets(),
        offsets(&[(12, FIRST_OFFSET), (13, FIRST_OFFSET)])
    );

    let metrics = h.task.metrics();
    assert_eq!(metrics.sink_record_read_total, 3);
    assert_eq!(metrics.sink_record_send_total, 3);
    assert_eq!(metrics.partition_count, 2);
    assert_eq!(metrics.sink_record_active_count, 3);
}

#[tokio::test]
async fn put_is_called_for_empty_polls() {
    let mut h = Harness::new();
    h.start_with_assignment(&[12]).await;
    assert_ok!(h.task.iteration().await);

    let puts = h.spy.puts();
    assert_eq!(puts.len(), 2);
    assert!(puts.iter().all(|batch| batch.is_empty()));
    assert_eq!(h.spy.opened(), vec![vec![partition(12)]]);
}

#[tokio::test]
async fn retriable_failure_redelivers_the_same_batch() {
    let mut h = Harness::new();
    h.start_with_assignment(&[12, 13]).await;

    h.client.expect_records(vec![record(12, 45), record(13, 45)]);
    h.spy.fail_put(retriable()).fail_put(retriable());

    assert_ok!(h.task.iteration().await);
    assert!(h.task.is_paused_for_redelivery());
    assert_eq!(h.client.pause_calls(), vec![vec![partition(12), partition(13)]]);
    // Nothing delivered, nothing to commit
    assert_eq!(
        h.task.current_offsets(),
        offsets(&[(12, FIRST_OFFSET), (13, FIRST_OFFSET)])
    );

    assert_ok!(h.task.iteration().await);
    assert!(h.task.is_paused_for_redelivery());
    // Pausing happens once, on the first failure
    assert_eq!(h.client.pause_calls().len(), 1);

    assert_ok!(h.task.iteration().await);
    assert!(!h.task.is_paused_for_redelivery());
    assert_eq!(h.client.resume_calls(), vec![vec![partition(12), partition(13)]]);

    let puts = h.spy.puts();
    assert_eq!(puts.len(), 4);
    assert!(Arc::ptr_eq(&puts[1], &puts[2]));
    assert!(Arc::ptr_eq(&puts[2], &puts[3]));
    assert_eq!(h.task.current_offsets(), offsets(&[(12, 46), (13, 46)]));
}

#[tokio::test]
async fn revocation_during_redelivery_drops_revoked_records() {
    let mut h = Harness::new();
    h.start_with_assignment(&[12, 13]).await;

    h.client.expect_records(vec![record(12, 45), record(13, 45)]);
    h.spy.fail_put(retriable());
    assert_ok!(h.task.iteration().await);

    h.client
        .expect_rebalance(vec![RebalanceEvent::Revoked(vec![partition(12)])]);
    assert_ok!(h.task.iteration().await);

    assert_eq!(h.spy.closed(), vec![vec![partition(12)]]);
    // Nothing was delivered for the revoked partition, so nothing was committed
    assert!(h.client.committed_sync().is_empty());

    let redelivered = h.spy.last_put().unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].original_kafka_partition(), 13);
    assert!(!h.task.is_paused_for_redelivery());
    assert_eq!(h.client.resume_calls().last(), Some(&vec![partition(13)]));
    assert_eq!(h.task.current_offsets(), offsets(&[(13, 46)]));
    assert_eq!(h.task.metrics().partition_count, 1);
}

#[tokio::test]
async fn revoking_every_retained_partition_disarms_redelivery() {
    let mut h = Harness::new();
    h.start_with_assignment(&[12, 13]).await;

    h.client.expect_records(vec![record(12, 45)]);
    h.spy.fail_put(retriable());
    assert_ok!(h.task.iteration().await);

    h.client
        .expect_rebalance(vec![RebalanceEvent::Revoked(vec![partition(12)])]);
    assert_ok!(h.task.iteration().await);

    assert!(!h.task.is_paused_for_redelivery());
    assert!(h.spy.last_put().unwrap().is_empty());
    assert!(!h.client.paused().contains(&partition(13)));
}

#[tokio::test]
async fn new_assignment_is_paused_while_redelivering() {
    let mut h = Harness::new();
    h.start_with_assignment(&[12]).await;

    h.client.expect_records(vec![record(12, 45)]);
    h.spy.fail_put(retriable()).fail_put(retriable());
    assert_ok!(h.task.iteration().await);

    h.expect_assignment(&[13]);
    assert_ok!(h.task.iteration().await);

    assert!(h.task.is_paused_for_redelivery());
    assert!(h.client.paused().contains(&partition(13)));
    assert_eq!(h.spy.opened().last(), Some(&vec![partition(13)]));
}

#[tokio::test]
async fn fatal_put_failure_fails_the_task() {
    let mut h = Harness::new();
    h.start_with_assignment(&[12]).await;

    h.client.expect_records(vec![record(12, 45)]);
    h.spy.fail_put(fatal());

    let error = assert_err!(h.task.iteration().await);
    assert!(matches!(error, TaskError::Unrecoverable(SinkError::Fatal(_))));
}

#[tokio::test]
async fn fatal_failure_keeps_close_error_as_suppressed() {
    let mut h = Harness::new();
    h.expect_assignment(&[12]);
    h.client.expect_records(vec![record(12, 45)]);
    h.spy.fail_put(fatal()).fail_close(fatal());

    let failure = assert_err!(h.task.run().await);

    assert!(matches!(failure.cause, TaskError::Unrecoverable(_)));
    assert_eq!(failure.suppressed.len(), 1);
    assert!(matches!(
        failure.suppressed[0],
        TaskError::SinkCall {
            operation: "close",
            ..
        }
    ));
    assert!(h.spy.is_stopped());
    assert_eq!(h.task.metrics().status, TaskStatus::Failed);
    assert!(matches!(
        h.listener.events().last(),
        Some(StatusEvent::Failure(_))
    ));
}

#[tokio::test]
async fn close_error_on_shutdown_fails_the_task() {
    let mut h = Harness::new();
    let handle = h.task.handle();
    h.expect_assignment(&[12]);
    h.client.expect_poll_with(move || {
        handle.stop();
        Ok(PollResult::empty())
    });
    h.spy.fail_close(fatal());

    let failure = assert_err!(h.task.run().await);

    assert!(matches!(
        failure.cause,
        TaskError::SinkCall {
            operation: "close",
            ..
        }
    ));
    assert!(failure.suppressed.is_empty());
    assert!(h.spy.is_stopped());
}

#[tokio::test]
async fn wakeup_during_shutdown_is_not_an_error() {
    let mut h = Harness::new();
    let handle = h.task.handle();
    h.expect_assignment(&[12]);
    h.client.expect_records(vec![record(12, 45)]);
    h.client.expect_poll_with(move || {
        handle.stop();
        Ok(PollResult::empty())
    });

    assert_ok!(h.task.run().await);

    // The wakeup from stop interrupts the final commit, which is retried once
    assert_eq!(h.client.committed_sync(), vec![offsets(&[(12, 46)])]);
    assert_eq!(h.spy.closed(), vec![vec![partition(12)]]);
    assert!(h.spy.is_stopped());
    assert_eq!(
        h.listener.events(),
        vec![StatusEvent::Startup, StatusEvent::Shutdown]
    );
    assert_eq!(h.task.metrics().status, TaskStatus::Destroyed);
}

#[tokio::test]
async fn cancel_skips_the_final_commit() {
    let mut h = Harness::new();
    let handle = h.task.handle();
    h.expect_assignment(&[12]);
    h.client.expect_records(vec![record(12, 45)]);
    h.client.expect_poll_with(move || {
        handle.cancel();
        Ok(PollResult::empty())
    });

    assert_ok!(h.task.run().await);

    assert_eq!(h.spy.pre_commits(), vec![offsets(&[(12, 46)])]);
    assert!(h.client.committed_sync().is_empty());
    assert_eq!(h.spy.closed(), vec![vec![partition(12)]]);
}

#[tokio::test]
async fn pause_and_resume_through_the_handle() {
    let mut h = Harness::new();
    h.start_with_assignment(&[12, 13]).await;
    let handle = h.task.handle();

    handle.pause();
    assert_ok!(h.task.iteration().await);
    assert_eq!(h.client.pause_calls(), vec![vec![partition(12), partition(13)]]);
    assert_eq!(h.task.metrics().status, TaskStatus::Paused);

    // Pausing asks for a commit on the next iteration
    assert_ok!(h.task.iteration().await);
    assert_eq!(h.spy.pre_commits().len(), 1);

    handle.resume();
    assert_ok!(h.task.iteration().await);
    assert_eq!(h.client.resume_calls(), vec![vec![partition(12), partition(13)]]);
    assert_eq!(h.task.metrics().status, TaskStatus::Running);
    assert_eq!(
        h.listener.events(),
        vec![StatusEvent::Startup, StatusEvent::Pause, StatusEvent::Resume]
    );
}

#[tokio::test]
async fn paused_start_with_topic_pattern() {
    let config = task_config().with_initial_state(TargetState::Paused);
    let config = SinkTaskConfig {
        topics: None,
        ..config
    }
    .with_topics_regex("te.*");
    let mut h = Harness::with(config, string_pipeline());

    h.start_with_assignment(&[12]).await;

    assert_eq!(
        h.client.subscriptions(),
        vec![Subscription::Pattern("te.*".to_string())]
    );
    assert_eq!(
        h.listener.events(),
        vec![StatusEvent::Startup, StatusEvent::Pause]
    );
    assert!(h.client.paused().contains(&partition(12)));
    assert_eq!(h.task.metrics().status, TaskStatus::Paused);
}

#[tokio::test]
async fn sink_pauses_survive_task_resume() {
    let mut h = Harness::new();
    h.start_with_assignment(&[12, 13]).await;
    let context = h.spy.context().unwrap();

    assert_ok!(context.pause(&[partition(12)]));
    assert!(matches!(
        context.pause(&[partition(99)]),
        Err(ClientError::NotAssigned(_))
    ));

    let handle = h.task.handle();
    handle.pause();
    assert_ok!(h.task.iteration().await);
    handle.resume();
    assert_ok!(h.task.iteration().await);

    assert_eq!(h.client.resume_calls().last(), Some(&vec![partition(13)]));
    assert!(h.client.paused().contains(&partition(12)));
    assert_eq!(context.paused_partitions().len(), 1);
}

#[tokio::test]
async fn sink_requested_offsets_rewind_the_ledger() {
    let mut h = Harness::new();
    h.start_with_assignment(&[12]).await;

    h.client.expect_records(vec![record(12, 45), record(12, 46)]);
    h.spy.on_put(|context, records| {
        if !records.is_empty() {
            context.offset_for(partition(12), 40);
            context.timeout(Duration::from_millis(100));
        }
    });
    assert_ok!(h.task.iteration().await);
    assert_eq!(h.task.current_offsets(), offsets(&[(12, 47)]));

    assert_ok!(h.task.iteration().await);

    assert_eq!(h.client.seeks(), vec![(partition(12), 40)]);
    assert_eq!(h.task.current_offsets(), offsets(&[(12, 40)]));
    assert_eq!(h.task.last_committed_offsets(), offsets(&[(12, 40)]));
    assert_eq!(h.client.poll_timeouts().last(), Some(&Duration::from_millis(100)));
}

#[tokio::test]
async fn transformed_records_are_tracked_by_original_partition() {
    let prefix: Arc<dyn Transformation> = Arc::new(TopicPrefix::new("archived-"));
    let pipeline = pipeline_with(vec![prefix]);
    let mut h = Harness::with(task_config(), pipeline);
    h.start_with_assignment(&[12]).await;

    h.client.expect_records(vec![record(12, 45)]);
    assert_ok!(h.task.iteration().await);

    let batch = h.spy.last_put().unwrap();
    assert_eq!(batch[0].topic, "archived-test");
    assert_eq!(batch[0].original_topic(), "test");
    assert_eq!(batch[0].timestamp, None);
    assert_eq!(h.task.current_offsets(), offsets(&[(12, 46)]));
}

#[tokio::test]
async fn revocation_updates_partition_count() {
    let mut h = Harness::new();
    h.start_with_assignment(&[12, 13]).await;
    assert_eq!(h.task.metrics().partition_count, 2);

    h.client
        .expect_rebalance(vec![RebalanceEvent::Revoked(vec![partition(12)])]);
    assert_ok!(h.task.iteration().await);

    assert_eq!(h.task.metrics().partition_count, 1);
    assert_eq!(h.spy.context().unwrap().assignment().len(), 1);
}

#[tokio::test]
async fn records_of_a_partition_revoked_in_the_same_poll_are_not_delivered() {
    let mut h = Harness::new();
    h.start_with_assignment(&[12, 13]).await;

    h.client.expect_poll(PollResult {
        rebalances: vec![RebalanceEvent::Revoked(vec![partition(12)])],
        records: vec![record(12, 45), record(13, 45)],
    });
    assert_ok!(h.task.iteration().await);

    assert_eq!(h.spy.closed(), vec![vec![partition(12)]]);
    let batch = h.spy.last_put().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].original_kafka_partition(), 13);
    assert_eq!(h.task.current_offsets(), offsets(&[(13, 46)]));
    assert_eq!(h.task.metrics().sink_record_read_total, 1);
}

#[tokio::test]
async fn empty_deliveries_are_sampled_in_batch_and_active_metrics() {
    let mut h = Harness::new();
    h.start_with_assignment(&[12, 13]).await;
    h.client.expect_records(vec![record(12, 45)]);
    assert_ok!(h.task.iteration().await);

    // The assignment poll delivered an empty batch before this one
    let metrics = h.task.metrics();
    assert_eq!(metrics.batch_size_max, 1.0);
    assert_eq!(metrics.batch_size_avg, 0.5);
    assert_eq!(metrics.sink_record_active_count, 1);
    assert_eq!(metrics.sink_record_active_count_max, 1.0);
    assert!((metrics.sink_record_active_count_avg - 1.0 / 3.0).abs() < 1e-9);
}
