//! Per-task metrics group.
//!
//! Every recorded value is published through the `metrics` facade (and from
//! there to the prometheus exporter) and is also kept locally so callers can
//! read a consistent [`SinkTaskMetricsSnapshot`] without scraping.

use std::collections::HashMap;

use serde::Serialize;

use crate::kafka::types::{OffsetAndMetadata, Partition};
use crate::metrics_consts::{
    BATCH_SIZE, OFFSET_COMMIT_COMPLETION_TOTAL, OFFSET_COMMIT_FAILURE_TOTAL,
    OFFSET_COMMIT_SEQ_NO, OFFSET_COMMIT_SKIP_TOTAL, OFFSET_COMMIT_TIME_MS, PARTITION_COUNT,
    SINK_RECORD_ACTIVE_COUNT, SINK_RECORD_READ_TOTAL, SINK_RECORD_SEND_TOTAL, TASK_STATUS,
};
use crate::status::TaskStatus;

/// Running max/avg over recorded samples.
#[derive(Debug, Default, Clone, Copy)]
struct Sample {
    count: u64,
    sum: f64,
    max: Option<f64>,
}

impl Sample {
    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    fn max(&self) -> f64 {
        self.max.unwrap_or(f64::NAN)
    }

    fn avg(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkTaskMetricsSnapshot {
    pub partition_count: usize,
    pub sink_record_read_total: u64,
    pub sink_record_send_total: u64,
    pub sink_record_active_count: i64,
    pub sink_record_active_count_max: f64,
    pub sink_record_active_count_avg: f64,
    pub batch_size_max: f64,
    pub batch_size_avg: f64,
    pub offset_commit_seq_no: u64,
    pub offset_commit_completion_total: u64,
    pub offset_commit_completion_rate: f64,
    pub offset_commit_skip_total: u64,
    pub offset_commit_skip_rate: f64,
    pub offset_commit_max_time_ms: f64,
    pub offset_commit_avg_time_ms: f64,
    pub offset_commit_success_percentage: f64,
    pub offset_commit_failure_percentage: f64,
    pub running_ratio: f64,
    pub pause_ratio: f64,
    pub status: TaskStatus,
}

#[derive(Debug)]
pub struct SinkTaskMetrics {
    task: String,
    created_ms: u64,
    partition_count: usize,
    records_read: u64,
    records_sent: u64,
    consumed: HashMap<Partition, i64>,
    committed: HashMap<Partition, i64>,
    active_count: i64,
    active: Sample,
    batch_size: Sample,
    commit_seqno: u64,
    commit_completions: u64,
    commit_skips: u64,
    commit_failures: u64,
    commit_time: Sample,
    status: TaskStatus,
    status_since_ms: u64,
    running_ms: u64,
    paused_ms: u64,
}

impl SinkTaskMetrics {
    pub fn new(task: impl Into<String>, now_ms: u64) -> Self {
        Self {
            task: task.into(),
            created_ms: now_ms,
            partition_count: 0,
            records_read: 0,
            records_sent: 0,
            consumed: HashMap::new(),
            committed: HashMap::new(),
            active_count: 0,
            active: Sample::default(),
            batch_size: Sample::default(),
            commit_seqno: 0,
            commit_completions: 0,
            commit_skips: 0,
            commit_failures: 0,
            commit_time: Sample::default(),
            status: TaskStatus::Unassigned,
            status_since_ms: now_ms,
            running_ms: 0,
            paused_ms: 0,
        }
    }

    pub fn record_partition_count(&mut self, count: usize) {
        self.partition_count = count;
        metrics::gauge!(PARTITION_COUNT, "task" => self.task.clone()).set(count as f64);
    }

    pub fn record_read(&mut self, count: usize) {
        self.records_read += count as u64;
        metrics::counter!(SINK_RECORD_READ_TOTAL, "task" => self.task.clone())
            .increment(count as u64);
    }

    pub fn record_send(&mut self, count: usize) {
        self.records_sent += count as u64;
        metrics::counter!(SINK_RECORD_SEND_TOTAL, "task" => self.task.clone())
            .increment(count as u64);
    }

    pub fn record_batch(&mut self, size: usize) {
        self.batch_size.record(size as f64);
        metrics::histogram!(BATCH_SIZE, "task" => self.task.clone()).record(size as f64);
    }

    pub fn record_consumed_offsets(&mut self, offsets: &HashMap<Partition, OffsetAndMetadata>) {
        for (partition, offset) in offsets {
            self.consumed.insert(partition.clone(), offset.offset());
        }
        self.update_active();
    }

    pub fn record_committed_offsets(&mut self, offsets: &HashMap<Partition, OffsetAndMetadata>) {
        for (partition, offset) in offsets {
            self.committed.insert(partition.clone(), offset.offset());
        }
        self.update_active();
    }

    /// Newly assigned partitions start with nothing outstanding.
    pub fn assigned_offsets(&mut self, offsets: &HashMap<Partition, OffsetAndMetadata>) {
        for (partition, offset) in offsets {
            self.consumed.insert(partition.clone(), offset.offset());
            self.committed.insert(partition.clone(), offset.offset());
        }
        self.update_active();
    }

    pub fn clear_offsets(&mut self, partitions: &[Partition]) {
        for partition in partitions {
            self.consumed.remove(partition);
            self.committed.remove(partition);
        }
        self.update_active();
    }

    fn update_active(&mut self) {
        self.active_count = self
            .consumed
            .iter()
            .filter_map(|(partition, consumed)| {
                self.committed
                    .get(partition)
                    .map(|committed| consumed - committed)
            })
            .sum();
        self.active.record(self.active_count as f64);
        metrics::gauge!(SINK_RECORD_ACTIVE_COUNT, "task" => self.task.clone())
            .set(self.active_count as f64);
    }

    pub fn record_commit_seqno(&mut self, seqno: u64) {
        self.commit_seqno = seqno;
        metrics::gauge!(OFFSET_COMMIT_SEQ_NO, "task" => self.task.clone()).set(seqno as f64);
    }

    pub fn record_commit_success(&mut self, duration_ms: u64) {
        self.commit_completions += 1;
        self.commit_time.record(duration_ms as f64);
        metrics::counter!(OFFSET_COMMIT_COMPLETION_TOTAL, "task" => self.task.clone())
            .increment(1);
        metrics::histogram!(OFFSET_COMMIT_TIME_MS, "task" => self.task.clone())
            .record(duration_ms as f64);
    }

    pub fn record_commit_failure(&mut self, duration_ms: u64) {
        self.commit_failures += 1;
        self.commit_time.record(duration_ms as f64);
        metrics::counter!(OFFSET_COMMIT_FAILURE_TOTAL, "task" => self.task.clone()).increment(1);
        metrics::histogram!(OFFSET_COMMIT_TIME_MS, "task" => self.task.clone())
            .record(duration_ms as f64);
    }

    pub fn record_commit_skip(&mut self) {
        self.commit_skips += 1;
        metrics::counter!(OFFSET_COMMIT_SKIP_TOTAL, "task" => self.task.clone()).increment(1);
    }

    pub fn record_status(&mut self, status: TaskStatus, now_ms: u64) {
        self.accumulate_state_time(now_ms);
        metrics::gauge!(TASK_STATUS, "task" => self.task.clone(), "status" => self.status.as_str())
            .set(0.0);
        metrics::gauge!(TASK_STATUS, "task" => self.task.clone(), "status" => status.as_str())
            .set(1.0);
        self.status = status;
    }

    fn accumulate_state_time(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.status_since_ms);
        match self.status {
            TaskStatus::Running => self.running_ms += elapsed,
            TaskStatus::Paused => self.paused_ms += elapsed,
            _ => {}
        }
        self.status_since_ms = now_ms;
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn snapshot(&self, now_ms: u64) -> SinkTaskMetricsSnapshot {
        let lifetime_ms = now_ms.saturating_sub(self.created_ms);
        let in_current = now_ms.saturating_sub(self.status_since_ms);
        let (running_ms, paused_ms) = match self.status {
            TaskStatus::Running => (self.running_ms + in_current, self.paused_ms),
            TaskStatus::Paused => (self.running_ms, self.paused_ms + in_current),
            _ => (self.running_ms, self.paused_ms),
        };
        let ratio = |part: u64| {
            if lifetime_ms == 0 {
                0.0
            } else {
                part as f64 / lifetime_ms as f64
            }
        };
        let per_second = |total: u64| {
            if lifetime_ms == 0 {
                0.0
            } else {
                total as f64 * 1000.0 / lifetime_ms as f64
            }
        };
        let attempts = self.commit_completions + self.commit_failures;
        let percentage = |part: u64| {
            if attempts == 0 {
                0.0
            } else {
                part as f64 / attempts as f64
            }
        };

        SinkTaskMetricsSnapshot {
            partition_count: self.partition_count,
            sink_record_read_total: self.records_read,
            sink_record_send_total: self.records_sent,
            sink_record_active_count: self.active_count,
            sink_record_active_count_max: self.active.max(),
            sink_record_active_count_avg: self.active.avg(),
            batch_size_max: self.batch_size.max(),
            batch_size_avg: self.batch_size.avg(),
            offset_commit_seq_no: self.commit_seqno,
            offset_commit_completion_total: self.commit_completions,
            offset_commit_completion_rate: per_second(self.commit_completions),
            offset_commit_skip_total: self.commit_skips,
            offset_commit_skip_rate: per_second(self.commit_skips),
            offset_commit_max_time_ms: self.commit_time.max(),
            offset_commit_avg_time_ms: self.commit_time.avg(),
            offset_commit_success_percentage: percentage(self.commit_completions),
            offset_commit_failure_percentage: percentage(self.commit_failures),
            running_ratio: ratio(running_ms),
            pause_ratio: ratio(paused_ms),
            status: self.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offsets(entries: &[(i32, i64)]) -> HashMap<Partition, OffsetAndMetadata> {
        entries
            .iter()
            .map(|(p, o)| (Partition::new("test", *p), OffsetAndMetadata::new(*o)))
            .collect()
    }

    #[test]
    fn active_count_tracks_consumed_minus_committed() {
        let mut metrics = SinkTaskMetrics::new("connector-0", 0);
        metrics.assigned_offsets(&offsets(&[(12, 45), (13, 45)]));
        assert_eq!(metrics.snapshot(0).sink_record_active_count, 0);

        metrics.record_consumed_offsets(&offsets(&[(12, 46)]));
        assert_eq!(metrics.snapshot(0).sink_record_active_count, 1);

        metrics.record_committed_offsets(&offsets(&[(12, 46)]));
        let snapshot = metrics.snapshot(0);
        assert_eq!(snapshot.sink_record_active_count, 0);
        assert_eq!(snapshot.sink_record_active_count_max, 1.0);
    }

    #[test]
    fn commit_latency_and_percentages() {
        let mut metrics = SinkTaskMetrics::new("connector-0", 0);
        let empty = metrics.snapshot(0);
        assert!(empty.offset_commit_max_time_ms.is_nan());
        assert!(empty.offset_commit_avg_time_ms.is_nan());

        metrics.record_commit_success(10);
        metrics.record_commit_failure(30);
        metrics.record_commit_skip();

        let snapshot = metrics.snapshot(1_000);
        assert_eq!(snapshot.offset_commit_max_time_ms, 30.0);
        assert_eq!(snapshot.offset_commit_avg_time_ms, 20.0);
        assert_eq!(snapshot.offset_commit_success_percentage, 0.5);
        assert_eq!(snapshot.offset_commit_failure_percentage, 0.5);
        assert_eq!(snapshot.offset_commit_completion_total, 1);
        assert_eq!(snapshot.offset_commit_skip_total, 1);
        assert_eq!(snapshot.offset_commit_skip_rate, 1.0);
    }

    #[test]
    fn running_and_pause_ratios_follow_status_time() {
        let mut metrics = SinkTaskMetrics::new("connector-0", 0);
        metrics.record_status(TaskStatus::Running, 0);
        metrics.record_status(TaskStatus::Paused, 3_000);

        let snapshot = metrics.snapshot(4_000);
        assert_eq!(snapshot.status, TaskStatus::Paused);
        assert_eq!(snapshot.running_ratio, 0.75);
        assert_eq!(snapshot.pause_ratio, 0.25);
    }

    #[test]
    fn clearing_offsets_removes_outstanding_records() {
        let mut metrics = SinkTaskMetrics::new("connector-0", 0);
        metrics.assigned_offsets(&offsets(&[(12, 45)]));
        metrics.record_consumed_offsets(&offsets(&[(12, 50)]));
        assert_eq!(metrics.snapshot(0).sink_record_active_count, 5);

        metrics.clear_offsets(&[Partition::new("test", 12)]);
        assert_eq!(metrics.snapshot(0).sink_record_active_count, 0);
    }
}
