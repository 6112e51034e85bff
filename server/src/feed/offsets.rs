//! In-flight offset tracking.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct PartitionState {
    /// Delivered offsets that are not yet acknowledged
    in_flight: BTreeSet<i64>,
    /// Highest offset handed out on this partition
    last_delivered: Option<i64>,
}

impl PartitionState {
    fn committed(&self) -> Option<i64> {
        self.in_flight
            .first()
            .copied()
            .or_else(|| self.last_delivered.map(|last| last + 1))
    }
}

/// Tracks, per topic partition, the offset below which everything is acked.
///
/// Workers may finish out of order; the committed position is the oldest
/// offset still in flight, or one past the last delivered offset once
/// nothing is outstanding. Offsets the feed never delivered, such as
/// compacted or transaction-marker gaps, do not hold it back.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: Mutex<HashMap<(String, i32), PartitionState>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<(String, i32), PartitionState>) -> R) -> R {
        match self.partitions.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Register an offset handed to the pipeline.
    pub fn observe(&self, topic: &str, partition: i32, offset: i64) {
        self.with(|partitions| {
            let state = partitions.entry((topic.to_string(), partition)).or_default();
            state.in_flight.insert(offset);
            state.last_delivered = Some(state.last_delivered.map_or(offset, |last| last.max(offset)));
        });
    }

    /// Acks for offsets that were never observed are ignored.
    pub fn ack(&self, topic: &str, partition: i32, offset: i64) {
        self.with(|partitions| {
            if let Some(state) = partitions.get_mut(&(topic.to_string(), partition)) {
                state.in_flight.remove(&offset);
            }
        });
    }

    /// Forget partitions for which `keep` returns false, e.g. after a
    /// rebalance took them away.
    pub fn retain(&self, mut keep: impl FnMut(&str, i32) -> bool) {
        self.with(|partitions| {
            partitions.retain(|(topic, partition), _| keep(topic, *partition));
        });
    }

    /// The next offset to read after a restart.
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.with(|partitions| {
            partitions
                .get(&(topic.to_string(), partition))
                .and_then(PartitionState::committed)
        })
    }

    /// Committed positions of every known partition.
    pub fn positions(&self) -> Vec<(String, i32, i64)> {
        let mut positions = self.with(|partitions| {
            partitions
                .iter()
                .filter_map(|((topic, partition), state)| {
                    state.committed().map(|next| (topic.clone(), *partition, next))
                })
                .collect::<Vec<_>>()
        });
        positions.sort();
        positions
    }
}
