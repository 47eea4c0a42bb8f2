//! Commit watermark tracking across partitions.
//!
//! Every accepted event is registered with its partition before it is
//! enqueued and completed once its worker is done with it (written or
//! dead-lettered). The watermark is the highest completed offset that lies
//! below every partition's oldest outstanding event, so committing it never
//! skips an event that is still queued or in flight. A partition with
//! nothing outstanding does not hold the watermark back.

use cdcflow_core::{PartitionId, SourceOffset};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};

struct Inner {
    outstanding: Vec<VecDeque<SourceOffset>>,
    completed: BTreeMap<u64, SourceOffset>,
    committable: Option<SourceOffset>,
}

/// Outstanding and completed positions of all partitions.
pub struct ProgressTracker {
    inner: Mutex<Inner>,
}

impl ProgressTracker {
    /// Creates a tracker for `partitions` partitions.
    pub fn new(partitions: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                outstanding: (0..partitions.max(1)).map(|_| VecDeque::new()).collect(),
                completed: BTreeMap::new(),
                committable: None,
            }),
        }
    }

    /// Records that `offset` was handed to `partition`. Positions must be
    /// registered in increasing order.
    pub fn register(&self, partition: PartitionId, offset: SourceOffset) {
        self.inner.lock().outstanding[partition.0].push_back(offset);
    }

    /// Withdraws the most recent registration of `partition` after the
    /// event could not be enqueued.
    pub fn abandon(&self, partition: PartitionId, offset: &SourceOffset) {
        let mut inner = self.inner.lock();
        let queue = &mut inner.outstanding[partition.0];
        if queue.back().map(|o| o.position) == Some(offset.position) {
            queue.pop_back();
        } else {
            queue.retain(|o| o.position != offset.position);
        }
    }

    /// Marks the event at `offset` done. Workers finish their partition's
    /// events in order, so this is normally the front entry.
    pub fn complete(&self, partition: PartitionId, offset: &SourceOffset) {
        let mut inner = self.inner.lock();
        let queue = &mut inner.outstanding[partition.0];
        if queue.front().map(|o| o.position) == Some(offset.position) {
            queue.pop_front();
        } else {
            queue.retain(|o| o.position != offset.position);
        }
        inner
            .completed
            .insert(offset.position.as_u64(), offset.clone());
    }

    /// Marks an event done that never entered a partition (a filtered
    /// table).
    pub fn acknowledge(&self, offset: SourceOffset) {
        self.inner
            .lock()
            .completed
            .insert(offset.position.as_u64(), offset);
    }

    /// The highest offset that is safe to commit, if any event completed.
    pub fn watermark(&self) -> Option<SourceOffset> {
        let mut inner = self.inner.lock();
        let floor = inner
            .outstanding
            .iter()
            .filter_map(|q| q.front().map(|o| o.position.as_u64()))
            .min();

        let ready = match floor {
            Some(floor) => {
                let pending = inner.completed.split_off(&floor);
                std::mem::replace(&mut inner.completed, pending)
            }
            None => std::mem::take(&mut inner.completed),
        };
        if let Some((_, offset)) = ready.into_iter().next_back() {
            let advances = inner
                .committable
                .as_ref()
                .map_or(true, |c| offset.position > c.position);
            if advances {
                inner.committable = Some(offset);
            }
        }
        inner.committable.clone()
    }

    /// Events registered and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding.iter().map(VecDeque::len).sum()
    }

    /// Outstanding events of one partition.
    pub fn outstanding_in(&self, partition: PartitionId) -> usize {
        self.inner.lock().outstanding[partition.0].len()
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdcflow_core::SequencePosition;
    use proptest::prelude::*;

    fn off(pos: u64) -> SourceOffset {
        SourceOffset::new(SequencePosition::new(pos), pos.to_string())
    }

    const P0: PartitionId = PartitionId(0);
    const P1: PartitionId = PartitionId(1);

    #[test]
    fn nothing_completed_means_no_watermark() {
        let tracker = ProgressTracker::new(2);
        tracker.register(P0, off(1));
        assert_eq!(tracker.watermark(), None);
    }

    #[test]
    fn slow_partition_holds_back_watermark() {
        let tracker = ProgressTracker::new(2);
        tracker.register(P0, off(1));
        tracker.register(P1, off(2));
        tracker.register(P1, off(3));

        tracker.complete(P1, &off(2));
        tracker.complete(P1, &off(3));
        assert_eq!(tracker.watermark(), None);

        tracker.complete(P0, &off(1));
        assert_eq!(tracker.watermark(), Some(off(3)));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn idle_partition_does_not_block() {
        let tracker = ProgressTracker::new(4);
        tracker.register(P1, off(10));
        tracker.complete(P1, &off(10));
        assert_eq!(tracker.watermark(), Some(off(10)));
    }

    #[test]
    fn watermark_stops_below_oldest_outstanding() {
        let tracker = ProgressTracker::new(2);
        tracker.register(P0, off(1));
        tracker.register(P1, off(2));
        tracker.register(P0, off(3));
        tracker.register(P1, off(4));

        tracker.complete(P0, &off(1));
        tracker.complete(P0, &off(3));
        tracker.complete(P1, &off(2));
        // 4 is still outstanding on P1
        assert_eq!(tracker.watermark(), Some(off(3)));

        tracker.complete(P1, &off(4));
        assert_eq!(tracker.watermark(), Some(off(4)));
    }

    #[test]
    fn abandoned_registration_does_not_block() {
        let tracker = ProgressTracker::new(1);
        tracker.register(P0, off(1));
        tracker.complete(P0, &off(1));
        tracker.register(P0, off(2));
        tracker.abandon(P0, &off(2));
        assert_eq!(tracker.watermark(), Some(off(1)));
        assert_eq!(tracker.outstanding_in(P0), 0);
    }

    #[test]
    fn acknowledged_filtered_event_advances() {
        let tracker = ProgressTracker::new(2);
        tracker.acknowledge(off(5));
        assert_eq!(tracker.watermark(), Some(off(5)));

        tracker.register(P0, off(6));
        tracker.acknowledge(off(7));
        assert_eq!(tracker.watermark(), Some(off(5)));
    }

    proptest! {
        #[test]
        fn watermark_never_passes_an_outstanding_event(
            assignments in prop::collection::vec(0usize..3, 1..40),
            completions in prop::collection::vec(0usize..3, 0..60),
        ) {
            let tracker = ProgressTracker::new(3);
            let mut pending: Vec<VecDeque<u64>> = vec![VecDeque::new(); 3];
            for (i, partition) in assignments.iter().enumerate() {
                let pos = i as u64 + 1;
                tracker.register(PartitionId(*partition), off(pos));
                pending[*partition].push_back(pos);
            }

            let mut last = 0u64;
            for partition in completions {
                if let Some(pos) = pending[partition].pop_front() {
                    tracker.complete(PartitionId(partition), &off(pos));
                }
                if let Some(mark) = tracker.watermark() {
                    let mark = mark.position.as_u64();
                    prop_assert!(mark >= last);
                    last = mark;
                    for queue in &pending {
                        if let Some(front) = queue.front() {
                            prop_assert!(mark < *front);
                        }
                    }
                }
            }
        }
    }
}
