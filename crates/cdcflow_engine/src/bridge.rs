//! The capture bridge: entry point for change notifications.
//!
//! The capture source calls [`CaptureBridge::on_raw_change`] on its own
//! thread, in source order. The bridge decodes, filters and routes each
//! event to its partition queue. It never touches the sink; a full queue
//! blocks the caller, which is how backpressure reaches the source.
//!
//! A paused source is resumed by whoever frees room first: the bridge when
//! its blocked enqueue goes through, or the partition worker when it
//! dequeues after the bridge gave up waiting.

use crate::decode::decode_change;
use crate::error::{CdcError, CdcResult};
use crate::progress::ProgressTracker;
use crate::state::EngineStatus;
use crate::stats::EngineStats;
use cdcflow_core::log::compute_crc32;
use cdcflow_core::{
    BoundedQueue, ChangeEvent, CoreError, EnqueueError, PartitionId, QueueEntry, SequencePosition,
    SourceOffset, TableFilter, TableId,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The external change source feeding the engine.
///
/// The source pushes notifications into the bridge returned by
/// `CaptureEngine::start`. If the bridge returns
/// [`CdcError::BackpressureTimeout`], the notification was not accepted and
/// must be offered again after the engine calls [`CaptureSource::resume`].
pub trait CaptureSource: Send + Sync {
    /// Positions the source after `offset`, or at the beginning if `None`.
    /// Events at or below the offset may be delivered again.
    fn resume_from(&self, offset: Option<&SourceOffset>) -> CdcResult<()>;

    /// Asks the source to stop producing for now.
    fn pause(&self);

    /// Lets the source produce again after [`CaptureSource::pause`].
    ///
    /// May be called from an engine worker thread. Implementations signal
    /// the capture thread and return; they must not call into the bridge.
    fn resume(&self);
}

/// Maps a table onto one of `partitions` partitions.
///
/// The mapping depends only on the table name, so every event of a table
/// lands on the same worker across restarts.
pub fn partition_for(table: &TableId, partitions: usize) -> PartitionId {
    let partitions = partitions.max(1) as u64;
    PartitionId((u64::from(compute_crc32(table.as_str().as_bytes())) % partitions) as usize)
}

/// Pause bookkeeping shared by the bridge and the partition workers.
pub(crate) struct Backpressure {
    source: Arc<dyn CaptureSource>,
    status: Arc<EngineStatus>,
    /// Partition the source was paused for. Held while pausing or resuming
    /// the source so the two never interleave.
    blocked: Mutex<Option<PartitionId>>,
}

impl Backpressure {
    pub(crate) fn new(source: Arc<dyn CaptureSource>, status: Arc<EngineStatus>) -> Self {
        Self {
            source,
            status,
            blocked: Mutex::new(None),
        }
    }

    /// Pauses the engine and, unless already paused, the source.
    fn engage(&self, partition: PartitionId) {
        let mut blocked = self.blocked.lock();
        self.status.pause_for_backpressure();
        if blocked.replace(partition).is_none() {
            self.source.pause();
        }
    }

    /// Lifts backpressure whatever partition caused it.
    fn release(&self) -> bool {
        let mut blocked = self.blocked.lock();
        if blocked.take().is_none() {
            return false;
        }
        self.lift();
        true
    }

    /// Lifts backpressure if it was caused by `partition`. Called by the
    /// partition's worker after each dequeue.
    pub(crate) fn release_partition(&self, partition: PartitionId) -> bool {
        let mut blocked = self.blocked.lock();
        if *blocked != Some(partition) {
            return false;
        }
        *blocked = None;
        self.lift();
        debug!(%partition, "queue drained, capture resumed");
        true
    }

    /// Drops the pause without resuming the source; the queues are closed.
    fn abort(&self) {
        if self.blocked.lock().take().is_some() {
            self.status.clear_backpressure();
        }
    }

    fn lift(&self) {
        self.status.clear_backpressure();
        if self.status.state().is_accepting() {
            self.source.resume();
        }
    }

    pub(crate) fn is_engaged(&self) -> bool {
        self.blocked.lock().is_some()
    }
}

/// Handle given to the capture source; cheap to clone.
#[derive(Clone)]
pub struct CaptureBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    queues: Vec<Arc<BoundedQueue<QueueEntry>>>,
    progress: Arc<ProgressTracker>,
    status: Arc<EngineStatus>,
    stats: Arc<EngineStats>,
    backpressure: Arc<Backpressure>,
    filter: TableFilter,
    max_block: Duration,
    last_position: Mutex<Option<SequencePosition>>,
}

impl CaptureBridge {
    pub(crate) fn new(
        queues: Vec<Arc<BoundedQueue<QueueEntry>>>,
        progress: Arc<ProgressTracker>,
        status: Arc<EngineStatus>,
        stats: Arc<EngineStats>,
        backpressure: Arc<Backpressure>,
        filter: TableFilter,
        max_block: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                queues,
                progress,
                status,
                stats,
                backpressure,
                filter,
                max_block,
                last_position: Mutex::new(None),
            }),
        }
    }

    /// Accepts one raw notification.
    ///
    /// Malformed and out-of-order notifications are logged, counted and
    /// skipped; they return `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`CdcError::EngineNotStreaming`] if the engine does not accept
    /// input, [`CdcError::BackpressureTimeout`] if the queue stayed full for
    /// `backpressure.max.block.ms`, or [`CoreError::QueueClosed`] if the
    /// engine stopped while the call was blocked.
    pub fn on_raw_change(&self, raw: &[u8]) -> CdcResult<()> {
        self.inner.stats.record_received();
        self.inner.status.ensure_accepting()?;
        match decode_change(raw) {
            Ok(event) => self.accept(event),
            Err(err) => {
                warn!(error = %err, bytes = raw.len(), "skipping malformed change");
                self.inner.stats.record_malformed();
                Ok(())
            }
        }
    }

    /// Accepts an already decoded event. Same contract as
    /// [`CaptureBridge::on_raw_change`].
    ///
    /// # Errors
    ///
    /// See [`CaptureBridge::on_raw_change`].
    pub fn on_change(&self, event: ChangeEvent) -> CdcResult<()> {
        self.inner.stats.record_received();
        self.inner.status.ensure_accepting()?;
        if let Err(err) = event.validate() {
            warn!(error = %err, "skipping invalid change");
            self.inner.stats.record_malformed();
            return Ok(());
        }
        self.accept(event)
    }

    fn accept(&self, event: ChangeEvent) -> CdcResult<()> {
        let inner = &self.inner;
        let mut last = inner.last_position.lock();

        if let Some(previous) = *last {
            if event.position <= previous {
                warn!(
                    position = %event.position,
                    previous = %previous,
                    table = %event.table,
                    "skipping out-of-order change"
                );
                inner.stats.record_malformed();
                return Ok(());
            }
        }
        let position = event.position;

        if !inner.filter.admits(&event.table) {
            debug!(table = %event.table, %position, "table filtered out");
            inner.progress.acknowledge(event.offset());
            inner.stats.record_filtered();
            *last = Some(position);
            return Ok(());
        }

        let partition = partition_for(&event.table, inner.queues.len());
        let queue = &inner.queues[partition.0];
        let offset = event.offset();
        inner.progress.register(partition, offset.clone());

        match queue.try_enqueue(QueueEntry::new(event)) {
            Ok(()) => {}
            Err(EnqueueError::Closed(_)) => {
                inner.progress.abandon(partition, &offset);
                return Err(CoreError::QueueClosed.into());
            }
            Err(EnqueueError::Full(entry)) => self.block_on_full(queue, partition, &offset, entry)?,
        }

        if inner.backpressure.release() {
            debug!(%partition, "queue space available, capture resumed");
        }
        *last = Some(position);
        inner.stats.record_enqueued();
        Ok(())
    }

    fn block_on_full(
        &self,
        queue: &BoundedQueue<QueueEntry>,
        partition: PartitionId,
        offset: &SourceOffset,
        entry: QueueEntry,
    ) -> CdcResult<()> {
        let inner = &self.inner;
        inner.stats.record_backpressure_wait();
        inner.backpressure.engage(partition);
        debug!(%partition, position = %offset.position, "queue full, pausing capture");

        let started = Instant::now();
        match queue.enqueue_timeout(entry, inner.max_block) {
            Ok(()) => {
                debug!(
                    %partition,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "blocked change accepted"
                );
                Ok(())
            }
            Err(EnqueueError::Full(_)) => {
                inner.progress.abandon(partition, offset);
                inner.stats.record_backpressure_timeout();
                let err = CdcError::BackpressureTimeout {
                    partition,
                    waited_ms: started.elapsed().as_millis() as u64,
                };
                warn!(error = %err, position = %offset.position, "change not accepted");
                inner.status.record_error(&err);
                Err(err)
            }
            Err(EnqueueError::Closed(_)) => {
                inner.progress.abandon(partition, offset);
                inner.backpressure.abort();
                Err(CoreError::QueueClosed.into())
            }
        }
    }

    /// Number of partitions.
    #[must_use]
    pub fn partitions(&self) -> usize {
        self.inner.queues.len()
    }

    /// Events currently queued across all partitions.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queues.iter().map(|q| q.len()).sum()
    }
}

impl std::fmt::Debug for CaptureBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureBridge")
            .field("partitions", &self.partitions())
            .field("queued", &self.queued())
            .field("backpressure", &self.inner.backpressure.is_engaged())
            .finish_non_exhaustive()
    }
}
