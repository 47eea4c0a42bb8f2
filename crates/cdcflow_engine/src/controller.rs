//! The capture engine controller.
//!
//! Owns the durable stores and the sink, starts one worker thread per
//! partition plus an offset committer, and coordinates shutdown.

use crate::bridge::{Backpressure, CaptureBridge, CaptureSource};
use crate::error::{CdcError, CdcResult};
use crate::handler::HandlerSet;
use crate::progress::ProgressTracker;
use crate::sink::SinkConnector;
use crate::state::{EngineState, EngineStatus, Signal};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::worker::Worker;
use cdcflow_core::{
    BoundedQueue, DeadLetterLog, DeadLetterRecord, DurableStores, EngineConfig, OffsetStore,
    PartitionId, QueueEntry, SchemaCatalog, SchemaHistoryLog, SessionId, SourceOffset, StateDir,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Poll interval while waiting for workers to drain.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Flushes the sink and commits the progress watermark.
struct Committer {
    session: SessionId,
    progress: Arc<ProgressTracker>,
    sink: Arc<dyn SinkConnector>,
    offsets: Arc<OffsetStore>,
    stats: Arc<EngineStats>,
}

impl Committer {
    /// Commits the current watermark if it advances past the last commit.
    ///
    /// A failed flush skips the round; the watermark is offered again on the
    /// next one.
    fn commit(&self) -> CdcResult<Option<SourceOffset>> {
        let Some(mark) = self.progress.watermark() else {
            return Ok(None);
        };
        if let Some(committed) = self.offsets.load() {
            if mark.position <= committed.position {
                return Ok(None);
            }
        }

        if let Err(err) = self.sink.flush() {
            warn!(error = %err, offset = %mark, "sink flush failed, skipping offset commit");
            return Ok(None);
        }
        if self.offsets.commit(self.session, mark.clone())? {
            self.stats.record_commit();
            debug!(offset = %mark, "watermark committed");
            Ok(Some(mark))
        } else {
            Ok(None)
        }
    }

    fn run(
        &self,
        stop: &Signal,
        status: &EngineStatus,
        interval: Duration,
        stats_interval: Duration,
    ) {
        let mut stats_logged = Instant::now();
        while stop.sleep(interval) {
            if status.is_halted() {
                break;
            }
            if let Err(err) = self.commit() {
                status.fail(&err);
                break;
            }
            if !stats_interval.is_zero() && stats_logged.elapsed() >= stats_interval {
                self.stats.log();
                stats_logged = Instant::now();
            }
        }
        debug!("committer stopped");
    }
}

/// Threads and queues of one engine run.
struct Running {
    session: SessionId,
    queues: Vec<Arc<BoundedQueue<QueueEntry>>>,
    progress: Arc<ProgressTracker>,
    committer: Arc<Committer>,
    committer_stop: Arc<Signal>,
    committer_thread: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Running {
    fn close_queues(&self) {
        for queue in &self.queues {
            queue.close();
        }
    }

    fn workers_finished(&self) -> bool {
        self.workers.iter().all(JoinHandle::is_finished)
    }

    fn join_workers(&mut self) {
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "worker panicked");
            }
        }
    }

    fn stop_committer(&mut self) {
        self.committer_stop.raise();
        if let Some(handle) = self.committer_thread.take() {
            if handle.join().is_err() {
                error!("committer panicked");
            }
        }
    }
}

/// A change-data-capture engine.
///
/// ```no_run
/// use cdcflow_core::EngineConfig;
/// use cdcflow_engine::{CaptureEngine, MemorySink};
/// use std::sync::Arc;
///
/// let sink = Arc::new(MemorySink::new());
/// let engine = CaptureEngine::open("/var/lib/cdcflow", EngineConfig::default(), sink)?;
/// # Ok::<(), cdcflow_engine::CdcError>(())
/// ```
pub struct CaptureEngine {
    config: EngineConfig,
    offsets: Arc<OffsetStore>,
    history: Arc<SchemaHistoryLog>,
    dead_letters: Arc<DeadLetterLog>,
    sink: Arc<dyn SinkConnector>,
    status: Arc<EngineStatus>,
    stats: Arc<EngineStats>,
    run: Mutex<Option<Running>>,
    // Held for the lock; dropped last.
    _dir: Option<StateDir>,
}

impl CaptureEngine {
    /// Creates an engine over already opened stores.
    pub fn new(stores: DurableStores, config: EngineConfig, sink: Arc<dyn SinkConnector>) -> Self {
        Self::with_dir(stores, config, sink, None)
    }

    /// Opens (creating if needed) and locks the state directory at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`cdcflow_core::CoreError::StateDirLocked`] if another engine
    /// holds the directory, or an error if a log is corrupted.
    pub fn open(
        path: impl AsRef<Path>,
        config: EngineConfig,
        sink: Arc<dyn SinkConnector>,
    ) -> CdcResult<Self> {
        let dir = StateDir::open(path.as_ref(), true)?;
        let stores = dir.open_stores()?;
        Ok(Self::with_dir(stores, config, sink, Some(dir)))
    }

    fn with_dir(
        stores: DurableStores,
        config: EngineConfig,
        sink: Arc<dyn SinkConnector>,
        dir: Option<StateDir>,
    ) -> Self {
        Self {
            config,
            offsets: Arc::new(stores.offsets),
            history: Arc::new(stores.schema_history),
            dead_letters: Arc::new(stores.dead_letters),
            sink,
            status: Arc::new(EngineStatus::new()),
            stats: Arc::new(EngineStats::new()),
            run: Mutex::new(None),
            _dir: dir,
        }
    }

    /// Starts streaming and returns the bridge the source pushes into.
    ///
    /// Connects the sink, loads the committed offset, starts the workers and
    /// the committer, and finally asks `source` to resume after the
    /// committed offset.
    ///
    /// # Errors
    ///
    /// Returns [`CdcError::InvalidStateTransition`] unless the engine is
    /// STOPPED, or [`cdcflow_core::CoreError::InvalidConfig`] if the
    /// configuration is inconsistent; both leave the state unchanged. Any
    /// other start failure leaves the engine FAILED.
    pub fn start(&self, source: Arc<dyn CaptureSource>) -> CdcResult<CaptureBridge> {
        let mut run = self.run.lock();
        self.config.validate()?;
        self.status.transition(EngineState::Starting)?;
        self.status.reset_for_start();

        let (running, bridge, resume_at) = match self.launch(Arc::clone(&source)) {
            Ok(launched) => launched,
            Err(err) => {
                self.status.fail(&err);
                return Err(err);
            }
        };
        let session = running.session;
        *run = Some(running);

        if let Err(err) = self
            .status
            .transition(EngineState::Streaming)
            .and_then(|()| source.resume_from(resume_at.as_ref()))
        {
            error!(error = %err, "engine start failed");
            self.status.fail(&err);
            if let Some(running) = run.take() {
                self.teardown(running);
            }
            return Err(err);
        }

        info!(
            %session,
            resume_at = ?resume_at.map(|o| o.to_string()),
            workers = bridge.partitions(),
            "engine streaming"
        );
        Ok(bridge)
    }

    fn launch(
        &self,
        source: Arc<dyn CaptureSource>,
    ) -> CdcResult<(Running, CaptureBridge, Option<SourceOffset>)> {
        self.sink.connect()?;
        let resume_at = self.offsets.load();
        let session = SessionId::generate();

        let partitions = self.config.worker_count.max(1);
        let capacity = self.config.partition_capacity();
        let queues: Vec<_> = (0..partitions)
            .map(|_| Arc::new(BoundedQueue::new(capacity)))
            .collect();
        let progress = Arc::new(ProgressTracker::new(partitions));
        let handlers = Arc::new(HandlerSet::new(
            Arc::clone(&self.history),
            Arc::clone(&self.stats),
            &self.config,
        ));
        let committer = Arc::new(Committer {
            session,
            progress: Arc::clone(&progress),
            sink: Arc::clone(&self.sink),
            offsets: Arc::clone(&self.offsets),
            stats: Arc::clone(&self.stats),
        });

        let mut running = Running {
            session,
            queues,
            progress,
            committer,
            committer_stop: Arc::new(Signal::default()),
            committer_thread: None,
            workers: Vec::with_capacity(partitions),
        };

        let backpressure = Arc::new(Backpressure::new(source, Arc::clone(&self.status)));
        if let Err(err) = self.spawn_threads(&mut running, &handlers, &backpressure) {
            self.status.halt().raise();
            self.teardown(running);
            return Err(err);
        }

        let bridge = CaptureBridge::new(
            running.queues.clone(),
            Arc::clone(&running.progress),
            Arc::clone(&self.status),
            Arc::clone(&self.stats),
            backpressure,
            self.config.table_filter.clone(),
            self.config.backpressure_max_block,
        );
        Ok((running, bridge, resume_at))
    }

    fn spawn_threads(
        &self,
        running: &mut Running,
        handlers: &Arc<HandlerSet>,
        backpressure: &Arc<Backpressure>,
    ) -> CdcResult<()> {
        for (index, queue) in running.queues.iter().enumerate() {
            let worker = Worker {
                partition: PartitionId(index),
                queue: Arc::clone(queue),
                handlers: Arc::clone(handlers),
                sink: Arc::clone(&self.sink),
                progress: Arc::clone(&running.progress),
                dead_letters: Arc::clone(&self.dead_letters),
                stats: Arc::clone(&self.stats),
                status: Arc::clone(&self.status),
                backpressure: Arc::clone(backpressure),
                retry: self.config.retry.clone(),
                sink_write_timeout: self.config.sink_write_timeout,
                sink_unavailable_max: self.config.sink_unavailable_max,
            };
            let handle = thread::Builder::new()
                .name(format!("cdcflow-worker-{index}"))
                .spawn(move || worker.run())
                .map_err(cdcflow_core::CoreError::from)?;
            running.workers.push(handle);
        }

        let committer = Arc::clone(&running.committer);
        let stop = Arc::clone(&running.committer_stop);
        let status = Arc::clone(&self.status);
        let interval = self.config.offset_commit_interval;
        let stats_interval = self.config.stats_log_interval;
        let handle = thread::Builder::new()
            .name("cdcflow-committer".into())
            .spawn(move || committer.run(&stop, &status, interval, stats_interval))
            .map_err(cdcflow_core::CoreError::from)?;
        running.committer_thread = Some(handle);
        Ok(())
    }

    /// Stops streaming.
    ///
    /// Queued events get `shutdown.grace.ms` to drain; whatever is left is
    /// abandoned uncommitted and redelivered after the next start. The final
    /// watermark is committed and the sink closed.
    ///
    /// Stopping a FAILED engine releases its threads and returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`CdcError::InvalidStateTransition`] if the engine is not
    /// running, or the commit error if the final commit fails.
    pub fn stop(&self) -> CdcResult<()> {
        let mut run = self.run.lock();
        let Some(mut running) = run.take() else {
            let state = self.status.state();
            if state == EngineState::Failed {
                return Ok(());
            }
            return Err(CdcError::InvalidStateTransition {
                from: state.to_string(),
                to: EngineState::Stopped.to_string(),
            });
        };

        if let Err(err) = self.status.transition(EngineState::Stopping) {
            if self.status.state() == EngineState::Failed {
                self.teardown(running);
                return Ok(());
            }
            *run = Some(running);
            return Err(err);
        }

        running.close_queues();
        let deadline = Instant::now() + self.config.shutdown_grace;
        while !running.workers_finished() && Instant::now() < deadline {
            thread::sleep(DRAIN_POLL);
        }
        if !running.workers_finished() {
            warn!(
                outstanding = running.progress.outstanding(),
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "shutdown grace elapsed, abandoning queued events"
            );
            self.status.halt().raise();
        }
        running.join_workers();
        running.stop_committer();

        if self.status.state() == EngineState::Failed {
            self.close_sink();
            return Ok(());
        }

        let committed = match running.committer.commit() {
            Ok(committed) => committed,
            Err(err) => {
                self.status.fail(&err);
                self.close_sink();
                return Err(err);
            }
        };
        self.close_sink();
        self.status.transition(EngineState::Stopped)?;
        self.stats.log();
        info!(
            session = %running.session,
            committed = ?committed.map(|o| o.to_string()),
            "engine stopped"
        );
        Ok(())
    }

    /// Stops all threads without draining or committing.
    fn teardown(&self, mut running: Running) {
        running.close_queues();
        self.status.halt().raise();
        running.join_workers();
        running.stop_committer();
        self.close_sink();
    }

    fn close_sink(&self) {
        if let Err(err) = self.sink.close() {
            warn!(error = %err, "sink close failed");
        }
    }

    /// Commits the current watermark immediately.
    ///
    /// Returns the committed offset, or `None` if nothing new was committable.
    ///
    /// # Errors
    ///
    /// Returns [`CdcError::EngineNotStreaming`] if the engine is not running,
    /// or the offset persistence error (which also fails the engine).
    pub fn commit_now(&self) -> CdcResult<Option<SourceOffset>> {
        let run = self.run.lock();
        let Some(running) = run.as_ref() else {
            return Err(CdcError::EngineNotStreaming {
                state: self.status.state().to_string(),
            });
        };
        running.committer.commit().inspect_err(|err| self.status.fail(err))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.status.state()
    }

    /// The most recent error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.status.last_error()
    }

    /// Counters since the engine was created.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Last durably committed offset.
    pub fn committed_offset(&self) -> Option<SourceOffset> {
        self.offsets.load()
    }

    /// Session id of the current run.
    pub fn session_id(&self) -> Option<SessionId> {
        self.run.lock().as_ref().map(|r| r.session)
    }

    /// Events accepted and not yet finished.
    pub fn outstanding(&self) -> usize {
        self.run
            .lock()
            .as_ref()
            .map_or(0, |r| r.progress.outstanding())
    }

    /// Every dead-lettered event, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the dead-letter log cannot be read.
    pub fn dead_letters(&self) -> CdcResult<Vec<DeadLetterRecord>> {
        Ok(self.dead_letters.read_all()?)
    }

    /// The current schema of every known table.
    pub fn schema_catalog(&self) -> Arc<SchemaCatalog> {
        self.history.catalog()
    }

    /// The configuration the engine runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        if let Some(running) = self.run.get_mut().take() {
            warn!("engine dropped while running, stopping without commit");
            self.teardown(running);
        }
    }
}

impl std::fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureEngine")
            .field("state", &self.status.state())
            .field("committed", &self.offsets.load())
            .finish_non_exhaustive()
    }
}
