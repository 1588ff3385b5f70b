//! Offset Ledger - what has been delivered versus what has been committed
//!
//! `current` is the next offset to commit per partition and only moves after
//! the sink accepted a batch. `last_committed` is the last acknowledged commit
//! and only moves on acknowledgement or rewind. For every tracked partition
//! `current >= last_committed` holds, except right after a sink-requested
//! rewind, which resets both together.
//!
//! The ledger does no I/O and holds no lock of its own; it lives inside the
//! task's shared commit state.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::kafka::types::{OffsetAndMetadata, OffsetMap, Partition};

#[derive(Debug, Default, Clone)]
pub struct OffsetLedger {
    current: OffsetMap,
    last_committed: OffsetMap,
}

impl OffsetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a partition at `offset`, as both delivered and committed.
    pub fn seed(&mut self, partition: Partition, offset: i64) {
        let offset = OffsetAndMetadata::new(offset);
        self.current.insert(partition.clone(), offset.clone());
        self.last_committed.insert(partition, offset);
    }

    /// Record that a batch was delivered. `offsets` holds next offsets
    /// (last delivered offset + 1). Untracked partitions are ignored.
    pub fn advance(&mut self, offsets: &OffsetMap) {
        for (partition, offset) in offsets {
            match self.current.get_mut(partition) {
                Some(current) => *current = offset.clone(),
                None => debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "Ignoring delivered offset for partition that is no longer assigned"
                ),
            }
        }
    }

    /// Merge acknowledged offsets into `last_committed`.
    pub fn mark_committed(&mut self, offsets: &OffsetMap) {
        for (partition, offset) in offsets {
            if self.current.contains_key(partition) {
                self.last_committed.insert(partition.clone(), offset.clone());
            }
        }
    }

    /// Move a partition back (or forward) to `offset`, forgetting anything
    /// delivered past it.
    pub fn rewind(&mut self, partition: &Partition, offset: OffsetAndMetadata) {
        self.current.insert(partition.clone(), offset.clone());
        self.last_committed.insert(partition.clone(), offset);
    }

    pub fn remove(&mut self, partitions: &[Partition]) {
        for partition in partitions {
            self.current.remove(partition);
            self.last_committed.remove(partition);
        }
    }

    pub fn clear(&mut self) {
        self.current.clear();
        self.last_committed.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn current(&self) -> &OffsetMap {
        &self.current
    }

    pub fn last_committed(&self) -> &OffsetMap {
        &self.last_committed
    }

    pub fn current_offset(&self, partition: &Partition) -> Option<i64> {
        self.current.get(partition).map(OffsetAndMetadata::offset)
    }

    pub fn committed_offset(&self, partition: &Partition) -> Option<i64> {
        self.last_committed.get(partition).map(OffsetAndMetadata::offset)
    }

    /// Tracked partitions, in order.
    pub fn partitions(&self) -> Vec<Partition> {
        let mut partitions: Vec<Partition> = self.current.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Copy of `current` restricted to `scope`.
    pub fn snapshot_committable(&self, scope: &[Partition]) -> OffsetMap {
        Self::restrict(&self.current, scope)
    }

    pub fn committed_snapshot(&self, scope: &[Partition]) -> OffsetMap {
        Self::restrict(&self.last_committed, scope)
    }

    fn restrict(map: &OffsetMap, scope: &[Partition]) -> OffsetMap {
        scope
            .iter()
            .filter_map(|p| map.get(p).map(|o| (p.clone(), o.clone())))
            .collect()
    }

    /// Reconcile the offsets a sink asked to commit with what was actually
    /// delivered.
    ///
    /// Starting from the last committed offsets of `scope`, each candidate
    /// partition is:
    /// - taken as-is when `last_committed <= candidate <= current`
    /// - lowered to `current` when above it
    /// - ignored when below `last_committed`
    /// - dropped when outside `assignment` or `scope`
    ///
    /// Partitions the sink left out keep their last committed offset. Returns
    /// `None` when there is nothing new to commit.
    pub fn clamp_against(
        &self,
        scope: &[Partition],
        candidate: &OffsetMap,
        assignment: &BTreeSet<Partition>,
    ) -> Option<OffsetMap> {
        if candidate.is_empty() {
            debug!("Sink returned no offsets to commit");
            return None;
        }

        let baseline = self.committed_snapshot(scope);
        let mut clamped = baseline.clone();

        for (partition, requested) in candidate {
            let topic = partition.topic();
            let partition_number = partition.partition_number();

            let (Some(committed), Some(current)) =
                (baseline.get(partition), self.current.get(partition))
            else {
                if assignment.contains(partition) {
                    debug!(
                        topic = topic,
                        partition = partition_number,
                        "Ignoring offset for partition outside of this commit"
                    );
                } else {
                    warn!(
                        topic = topic,
                        partition = partition_number,
                        offset = requested.offset(),
                        "Ignoring offset for partition that is not assigned"
                    );
                }
                continue;
            };

            if requested.offset() > current.offset() {
                warn!(
                    topic = topic,
                    partition = partition_number,
                    requested = requested.offset(),
                    current = current.offset(),
                    "Sink requested commit past delivered offset, clamping to delivered offset"
                );
                clamped.insert(partition.clone(), current.clone());
            } else if requested.offset() < committed.offset() {
                warn!(
                    topic = topic,
                    partition = partition_number,
                    requested = requested.offset(),
                    committed = committed.offset(),
                    "Ignoring requested commit behind last committed offset"
                );
            } else {
                clamped.insert(partition.clone(), requested.clone());
            }
        }

        if clamped == baseline {
            debug!("Requested offsets match last committed offsets, nothing to commit");
            None
        } else {
            Some(clamped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn tp(n: i32) -> Partition {
        Partition::new("test", n)
    }

    fn map(entries: &[(i32, i64)]) -> OffsetMap {
        entries
            .iter()
            .map(|(p, o)| (tp(*p), OffsetAndMetadata::new(*o)))
            .collect()
    }

    fn assignment(parts: &[i32]) -> BTreeSet<Partition> {
        parts.iter().map(|p| tp(*p)).collect()
    }

    /// p12 delivered 45 -> 50, p13 untouched at 45.
    fn ledger() -> OffsetLedger {
        let mut ledger = OffsetLedger::new();
        ledger.seed(tp(12), 45);
        ledger.seed(tp(13), 45);
        ledger.advance(&map(&[(12, 50)]));
        ledger
    }

    #[test]
    fn seed_sets_both_sides() {
        let ledger = ledger();
        assert_eq!(ledger.current_offset(&tp(13)), Some(45));
        assert_eq!(ledger.committed_offset(&tp(13)), Some(45));
        assert_eq!(ledger.current_offset(&tp(12)), Some(50));
        assert_eq!(ledger.committed_offset(&tp(12)), Some(45));
    }

    #[test]
    fn advance_ignores_untracked_partitions() {
        let mut ledger = ledger();
        ledger.advance(&map(&[(14, 10)]));
        assert_eq!(ledger.current_offset(&tp(14)), None);
        assert_eq!(ledger.partitions(), vec![tp(12), tp(13)]);
    }

    #[test]
    fn mark_committed_ignores_removed_partitions() {
        let mut ledger = ledger();
        ledger.remove(&[tp(12)]);
        ledger.mark_committed(&map(&[(12, 50), (13, 45)]));
        assert_eq!(ledger.committed_offset(&tp(12)), None);
        assert_eq!(ledger.committed_offset(&tp(13)), Some(45));
    }

    #[test]
    fn snapshot_is_restricted_to_scope() {
        let ledger = ledger();
        assert_eq!(ledger.snapshot_committable(&[tp(12)]), map(&[(12, 50)]));
        assert_eq!(
            ledger.snapshot_committable(&[tp(12), tp(13), tp(14)]),
            map(&[(12, 50), (13, 45)])
        );
    }

    #[test_case(&[(12, 48)], Some(&[(12, 48), (13, 45)]); "within range is kept")]
    #[test_case(&[(12, 60)], Some(&[(12, 50), (13, 45)]); "above current is clamped")]
    #[test_case(&[(12, 40)], None; "below committed is ignored")]
    #[test_case(&[(12, 45), (13, 45)], None; "unchanged is skipped")]
    #[test_case(&[(14, 99)], None; "unassigned partition is dropped")]
    #[test_case(&[], None; "empty candidate is skipped")]
    #[test_case(&[(12, 50), (14, 99)], Some(&[(12, 50), (13, 45)]); "unassigned dropped alongside valid")]
    fn clamp(candidate: &[(i32, i64)], expected: Option<&[(i32, i64)]>) {
        let ledger = ledger();
        let clamped = ledger.clamp_against(&[tp(12), tp(13)], &map(candidate), &assignment(&[12, 13]));
        assert_eq!(clamped, expected.map(map));
    }

    #[test]
    fn clamp_ignores_assigned_partition_outside_scope() {
        let mut ledger = ledger();
        ledger.advance(&map(&[(13, 47)]));

        let clamped = ledger.clamp_against(
            &[tp(12)],
            &map(&[(12, 50), (13, 47)]),
            &assignment(&[12, 13]),
        );

        assert_eq!(clamped, Some(map(&[(12, 50)])));
    }

    #[test]
    fn rewind_resets_both_sides() {
        let mut ledger = ledger();
        ledger.rewind(&tp(12), OffsetAndMetadata::new(20));
        assert_eq!(ledger.current_offset(&tp(12)), Some(20));
        assert_eq!(ledger.committed_offset(&tp(12)), Some(20));
    }
}
