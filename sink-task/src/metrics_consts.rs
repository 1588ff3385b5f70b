// ==== Partition metrics ====
/// Gauge for the number of partitions currently assigned to the task
pub const PARTITION_COUNT: &str = "sink_task_partition_count";

// ==== Record metrics ====
/// Counter for records read from the log
pub const SINK_RECORD_READ_TOTAL: &str = "sink_task_record_read_total";

/// Counter for records handed to the sink that it accepted
pub const SINK_RECORD_SEND_TOTAL: &str = "sink_task_record_send_total";

/// Gauge for records read but not yet committed
pub const SINK_RECORD_ACTIVE_COUNT: &str = "sink_task_record_active_count";

/// Histogram of batch sizes delivered to the sink
pub const BATCH_SIZE: &str = "sink_task_batch_size";

/// Counter for records dropped by the tolerance operator, labelled by stage
pub const RECORDS_TOLERATED: &str = "sink_task_records_tolerated_total";

// ==== Offset commit metrics ====
/// Gauge for the latest commit sequence number issued
pub const OFFSET_COMMIT_SEQ_NO: &str = "sink_task_offset_commit_seq_no";

/// Counter for acknowledged commits
pub const OFFSET_COMMIT_COMPLETION_TOTAL: &str = "sink_task_offset_commit_completion_total";

/// Counter for commits that were skipped (nothing to commit, or stale completions)
pub const OFFSET_COMMIT_SKIP_TOTAL: &str = "sink_task_offset_commit_skip_total";

/// Counter for failed or timed out commits
pub const OFFSET_COMMIT_FAILURE_TOTAL: &str = "sink_task_offset_commit_failure_total";

/// Histogram of commit latency in milliseconds
pub const OFFSET_COMMIT_TIME_MS: &str = "sink_task_offset_commit_time_ms";

// ==== Task state metrics ====
/// Gauge set to 1 for the current status label and 0 for the previous one
pub const TASK_STATUS: &str = "sink_task_status";

/// Counter for redelivery pauses armed after a retriable failure
pub const REDELIVERY_ARMED: &str = "sink_task_redelivery_armed_total";

/// Counter for rebalance events applied, labelled by event type
pub const REBALANCE_EVENTS: &str = "sink_task_rebalance_events_total";

/// Counter for consumer errors seen by the rdkafka client
pub const KAFKA_CONSUMER_ERRORS: &str = "sink_task_kafka_consumer_errors_total";
