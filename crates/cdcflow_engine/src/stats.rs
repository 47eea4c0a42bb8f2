//! Processing statistics.
//!
//! All counters are atomic and can be read while the engine runs. The
//! committer thread logs a snapshot every `stats.log.interval.ms`.

use cdcflow_core::OperationKind;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    received: AtomicU64,
    malformed: AtomicU64,
    filtered: AtomicU64,
    enqueued: AtomicU64,
    backpressure_waits: AtomicU64,
    backpressure_timeouts: AtomicU64,

    snapshot_reads: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    deletes_skipped: AtomicU64,
    schema_changes: AtomicU64,
    schema_duplicates: AtomicU64,

    retries: AtomicU64,
    dead_lettered: AtomicU64,
    commits: AtomicU64,
}

impl EngineStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backpressure_wait(&self) {
        self.backpressure_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backpressure_timeout(&self) {
        self.backpressure_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one applied data change of `kind`.
    pub(crate) fn record_applied(&self, kind: OperationKind) {
        let counter = match kind {
            OperationKind::SnapshotRead => &self.snapshot_reads,
            OperationKind::Insert => &self.inserts,
            OperationKind::Update => &self.updates,
            OperationKind::Delete => &self.deletes,
            OperationKind::SchemaChange => &self.schema_changes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delete_skipped(&self) {
        self.deletes_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_schema_duplicate(&self) {
        self.schema_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            received: load(&self.received),
            malformed: load(&self.malformed),
            filtered: load(&self.filtered),
            enqueued: load(&self.enqueued),
            backpressure_waits: load(&self.backpressure_waits),
            backpressure_timeouts: load(&self.backpressure_timeouts),
            snapshot_reads: load(&self.snapshot_reads),
            inserts: load(&self.inserts),
            updates: load(&self.updates),
            deletes: load(&self.deletes),
            deletes_skipped: load(&self.deletes_skipped),
            schema_changes: load(&self.schema_changes),
            schema_duplicates: load(&self.schema_duplicates),
            retries: load(&self.retries),
            dead_lettered: load(&self.dead_lettered),
            commits: load(&self.commits),
        }
    }

    /// Logs the current counters at info level.
    pub fn log(&self) {
        let s = self.snapshot();
        info!(
            received = s.received,
            malformed = s.malformed,
            filtered = s.filtered,
            snapshot_reads = s.snapshot_reads,
            inserts = s.inserts,
            updates = s.updates,
            deletes = s.deletes,
            deletes_skipped = s.deletes_skipped,
            schema_changes = s.schema_changes,
            retries = s.retries,
            dead_lettered = s.dead_lettered,
            commits = s.commits,
            backpressure_waits = s.backpressure_waits,
            "engine statistics"
        );
    }
}

/// A point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Raw notifications offered to the bridge.
    pub received: u64,
    /// Notifications skipped as malformed or out of order.
    pub malformed: u64,
    /// Events of filtered-out tables.
    pub filtered: u64,
    /// Events handed to a partition queue.
    pub enqueued: u64,
    /// Times the bridge found a queue full.
    pub backpressure_waits: u64,
    /// Times the bridge gave up waiting.
    pub backpressure_timeouts: u64,
    /// Snapshot rows written.
    pub snapshot_reads: u64,
    /// Inserts written.
    pub inserts: u64,
    /// Updates written.
    pub updates: u64,
    /// Deletes written.
    pub deletes: u64,
    /// Deletes acknowledged without writing.
    pub deletes_skipped: u64,
    /// Schema versions logged.
    pub schema_changes: u64,
    /// Schema changes already logged (redelivery).
    pub schema_duplicates: u64,
    /// Retried attempts.
    pub retries: u64,
    /// Events dead-lettered.
    pub dead_lettered: u64,
    /// Offset commits persisted.
    pub commits: u64,
}

impl StatsSnapshot {
    /// Data changes written to the sink.
    #[must_use]
    pub fn data_changes(&self) -> u64 {
        self.snapshot_reads + self.inserts + self.updates + self.deletes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        assert_eq!(EngineStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn applied_counts_by_kind() {
        let stats = EngineStats::new();
        stats.record_applied(OperationKind::Insert);
        stats.record_applied(OperationKind::Insert);
        stats.record_applied(OperationKind::Update);
        stats.record_applied(OperationKind::Delete);
        stats.record_applied(OperationKind::SchemaChange);
        stats.record_delete_skipped();

        let s = stats.snapshot();
        assert_eq!(s.inserts, 2);
        assert_eq!(s.updates, 1);
        assert_eq!(s.schema_changes, 1);
        assert_eq!(s.deletes_skipped, 1);
        assert_eq!(s.data_changes(), 4);
    }
}
