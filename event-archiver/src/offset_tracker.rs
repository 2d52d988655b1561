//! Offset Tracker - tracks, per partition, the last offset durably persisted
//! to storage and the highest offset read but not yet persisted.
//!
//! Only the ingestion loop updates the tracker, after the sink confirmed a
//! write. Committed offsets never move backwards. The tracker keeps no state
//! of its own across restarts: it is seeded from the positions the queue
//! reports, and positions handed back to the queue are `offset + 1`.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::kafka::types::Partition;
use crate::metrics_consts::{OFFSET_TRACKER_COMMITTED_OFFSET, OFFSET_TRACKER_REDELIVERED};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct PartitionState {
    /// Last offset whose batch was durably written
    committed: Option<i64>,
    /// Highest offset read since the last commit
    pending: Option<i64>,
}

#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<Partition, PartitionState>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize a partition from the queue position to resume from (the next
    /// offset to consume). Position 0 means nothing has been persisted yet.
    pub fn seed(&mut self, partition: &Partition, position: i64) {
        let committed = (position > 0).then_some(position - 1);
        let state = self.partitions.entry(partition.clone()).or_default();

        if committed > state.committed {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                position = position,
                "Seeding partition offset"
            );
            state.committed = committed;
        }
    }

    /// Record that `offset` has been read but is not yet persisted.
    pub fn mark_pending(&mut self, partition: &Partition, offset: i64) {
        let state = self.partitions.entry(partition.clone()).or_default();

        if state.committed.is_some_and(|committed| offset <= committed) {
            // replay after a crash or rebalance, allowed under at-least-once
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset,
                committed = state.committed,
                "Re-delivered offset at or below committed offset"
            );
            metrics::counter!(
                OFFSET_TRACKER_REDELIVERED,
                "partition" => partition.partition_number().to_string()
            )
            .increment(1);
        }

        if state.pending.map_or(true, |pending| offset > pending) {
            state.pending = Some(offset);
        }
    }

    /// Advance the committed offset of a partition to its highest pending offset.
    ///
    /// Returns the new committed offset when it moved, `None` otherwise. Must
    /// only be called after the sink confirmed the write covering the pending
    /// offsets.
    pub fn commit(&mut self, partition: &Partition) -> Option<i64> {
        let state = self.partitions.get_mut(partition)?;
        let pending = state.pending.take()?;

        match state.committed {
            Some(committed) if pending <= committed => {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    pending = pending,
                    committed = committed,
                    "Pending offset does not advance committed offset"
                );
                None
            }
            _ => {
                state.committed = Some(pending);
                metrics::gauge!(
                    OFFSET_TRACKER_COMMITTED_OFFSET,
                    "partition" => partition.partition_number().to_string()
                )
                .set(pending as f64);
                Some(pending)
            }
        }
    }

    /// Commit every partition with pending offsets and return the queue
    /// positions (`offset + 1`) to acknowledge.
    pub fn commit_all(&mut self) -> HashMap<Partition, i64> {
        let with_pending: Vec<Partition> = self
            .partitions
            .iter()
            .filter(|(_, state)| state.pending.is_some())
            .map(|(partition, _)| partition.clone())
            .collect();

        with_pending
            .into_iter()
            .filter_map(|partition| {
                let committed = self.commit(&partition)?;
                Some((partition, committed + 1))
            })
            .collect()
    }

    pub fn committed(&self, partition: &Partition) -> Option<i64> {
        self.partitions.get(partition)?.committed
    }

    pub fn pending(&self, partition: &Partition) -> Option<i64> {
        self.partitions.get(partition)?.pending
    }

    pub fn has_pending(&self) -> bool {
        self.partitions.values().any(|state| state.pending.is_some())
    }

    /// Get the number of partitions being tracked
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Forget a partition this consumer no longer owns, pending offsets
    /// included. Returns whether it was tracked.
    pub fn release(&mut self, partition: &Partition) -> bool {
        let released = self.partitions.remove(partition).is_some();
        if released {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Released partition"
            );
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_partition(num: i32) -> Partition {
        Partition::new("test-topic", num)
    }

    #[test]
    fn test_seed_from_queue_position() {
        let mut tracker = OffsetTracker::new();
        let p0 = test_partition(0);
        let p1 = test_partition(1);

        tracker.seed(&p0, 100);
        tracker.seed(&p1, 0);

        assert_eq!(tracker.committed(&p0), Some(99));
        assert_eq!(tracker.committed(&p1), None);
        assert_eq!(tracker.partition_count(), 2);
    }

    #[test]
    fn test_seed_never_goes_backwards() {
        let mut tracker = OffsetTracker::new();
        let partition = test_partition(0);

        tracker.seed(&partition, 100);
        tracker.seed(&partition, 50);

        assert_eq!(tracker.committed(&partition), Some(99));
    }

    #[test]
    fn test_pending_does_not_move_committed() {
        let mut tracker = OffsetTracker::new();
        let partition = test_partition(0);

        tracker.mark_pending(&partition, 0);
        tracker.mark_pending(&partition, 1);

        assert_eq!(tracker.pending(&partition), Some(1));
        assert_eq!(tracker.committed(&partition), None);
        assert!(tracker.has_pending());
    }

    #[test]
    fn test_commit_advances_to_highest_pending() {
        let mut tracker = OffsetTracker::new();
        let partition = test_partition(0);

        tracker.mark_pending(&partition, 5);
        tracker.mark_pending(&partition, 7);
        tracker.mark_pending(&partition, 6);

        assert_eq!(tracker.commit(&partition), Some(7));
        assert_eq!(tracker.committed(&partition), Some(7));
        assert_eq!(tracker.pending(&partition), None);
        assert!(!tracker.has_pending());

        // nothing new read
        assert_eq!(tracker.commit(&partition), None);
        assert_eq!(tracker.committed(&partition), Some(7));
    }

    #[test]
    fn test_commit_never_goes_backwards() {
        let mut tracker = OffsetTracker::new();
        let partition = test_partition(0);

        tracker.seed(&partition, 101);
        tracker.mark_pending(&partition, 40);

        assert_eq!(tracker.commit(&partition), None);
        assert_eq!(tracker.committed(&partition), Some(100));
    }

    #[test]
    fn test_commit_unknown_partition() {
        let mut tracker = OffsetTracker::new();
        assert_eq!(tracker.commit(&test_partition(9)), None);
    }

    #[test]
    fn test_released_partition_is_not_committed() {
        let mut tracker = OffsetTracker::new();
        let p0 = test_partition(0);
        let p1 = test_partition(1);

        tracker.seed(&p0, 100);
        tracker.mark_pending(&p0, 149);
        tracker.mark_pending(&p1, 9);

        assert!(tracker.release(&p0));
        assert!(!tracker.release(&p0));

        let positions = tracker.commit_all();
        assert_eq!(positions.get(&p0), None);
        assert_eq!(positions.get(&p1), Some(&10));
        assert_eq!(tracker.committed(&p0), None);
        assert_eq!(tracker.partition_count(), 1);
    }

    #[test]
    fn test_commit_all_returns_positions() {
        let mut tracker = OffsetTracker::new();
        let p0 = test_partition(0);
        let p1 = test_partition(1);
        let p2 = test_partition(2);

        tracker.seed(&p2, 10);
        tracker.mark_pending(&p0, 99);
        tracker.mark_pending(&p1, 199);

        let positions = tracker.commit_all();

        assert_eq!(positions.len(), 2);
        assert_eq!(positions.get(&p0), Some(&100));
        assert_eq!(positions.get(&p1), Some(&200));
        assert_eq!(positions.get(&p2), None);
        assert!(tracker.commit_all().is_empty());
    }

    #[test]
    fn test_committed_is_monotonic_across_batches() {
        let mut tracker = OffsetTracker::new();
        let partition = test_partition(0);
        let mut last = None;

        for batch in 0..5i64 {
            for offset in batch * 10..batch * 10 + 10 {
                tracker.mark_pending(&partition, offset);
            }
            tracker.commit_all();
            let committed = tracker.committed(&partition);
            assert!(committed > last);
            last = committed;
        }

        assert_eq!(last, Some(49));
    }
}
