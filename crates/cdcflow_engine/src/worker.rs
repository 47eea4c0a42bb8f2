//! Partition workers.
//!
//! Each worker owns one partition queue and handles its events strictly in
//! order. A failing event is retried, dead-lettered, or escalated; the next
//! event of the partition is never started before the current one is
//! resolved.

use crate::bridge::Backpressure;
use crate::error::CdcError;
use crate::handler::HandlerSet;
use crate::progress::ProgressTracker;
use crate::sink::SinkConnector;
use crate::state::EngineStatus;
use crate::stats::EngineStats;
use cdcflow_core::{
    BoundedQueue, ChangeEvent, DeadLetterLog, DeadLetterRecord, PartitionId, QueueEntry,
    RetryConfig,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often an idle worker re-checks the halt signal.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// The worker stopped processing its partition.
#[derive(Debug)]
struct Halted;

/// Everything one worker needs; moved into its thread.
pub(crate) struct Worker {
    pub(crate) partition: PartitionId,
    pub(crate) queue: Arc<BoundedQueue<QueueEntry>>,
    pub(crate) handlers: Arc<HandlerSet>,
    pub(crate) sink: Arc<dyn SinkConnector>,
    pub(crate) progress: Arc<ProgressTracker>,
    pub(crate) dead_letters: Arc<DeadLetterLog>,
    pub(crate) stats: Arc<EngineStats>,
    pub(crate) status: Arc<EngineStatus>,
    pub(crate) backpressure: Arc<Backpressure>,
    pub(crate) retry: RetryConfig,
    pub(crate) sink_write_timeout: Duration,
    pub(crate) sink_unavailable_max: Duration,
}

impl Worker {
    /// Processes the partition until end of stream, failure or forced stop.
    pub(crate) fn run(self) {
        info!(partition = %self.partition, "worker started");
        loop {
            if self.status.is_halted() {
                debug!(partition = %self.partition, "worker halted");
                break;
            }
            let Some(entry) = self.queue.dequeue_timeout(IDLE_POLL) else {
                if self.queue.is_drained() {
                    break;
                }
                continue;
            };
            self.backpressure.release_partition(self.partition);
            debug!(
                partition = %self.partition,
                position = %entry.event.position,
                queued_ms = entry.queued_for().as_millis() as u64,
                "processing event"
            );
            if self.process(&entry.event).is_err() {
                break;
            }
        }
        info!(partition = %self.partition, remaining = self.queue.len(), "worker stopped");
    }

    fn process(&self, event: &ChangeEvent) -> Result<(), Halted> {
        let mut attempts = 0u32;
        let mut failing_since: Option<Instant> = None;
        let mut unavailable_since: Option<Instant> = None;

        let result = loop {
            attempts += 1;
            let err = match self.handlers.handle(event, self.sink.as_ref()) {
                Ok(outcome) => {
                    debug!(position = %event.position, ?outcome, attempts, "event handled");
                    self.progress.complete(self.partition, &event.offset());
                    break Ok(());
                }
                Err(err) => err,
            };

            if err.is_retryable() {
                let since = *failing_since.get_or_insert_with(Instant::now);

                if unavailable_since.is_none() && since.elapsed() >= self.sink_write_timeout {
                    unavailable_since = Some(Instant::now());
                    let stall = CdcError::SinkUnavailable {
                        partition: self.partition,
                        unavailable_ms: since.elapsed().as_millis() as u64,
                    };
                    self.status.stall(self.partition, &stall);
                }

                if let Some(down_since) = unavailable_since {
                    if down_since.elapsed() >= self.sink_unavailable_max {
                        self.status.fail(&CdcError::SinkUnavailable {
                            partition: self.partition,
                            unavailable_ms: since.elapsed().as_millis() as u64,
                        });
                        break Err(Halted);
                    }
                } else if attempts >= self.retry.max_attempts {
                    break self.dead_letter(event, &err, attempts);
                }

                let delay = self.retry.delay_for_attempt(attempts);
                warn!(
                    partition = %self.partition,
                    position = %event.position,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                self.stats.record_retry();
                if !self.status.sleep(delay) {
                    break Err(Halted);
                }
                continue;
            }

            if err.is_dead_letter() {
                break self.dead_letter(event, &err, attempts);
            }

            if err.is_schema_sequence() {
                error!(
                    partition = %self.partition,
                    position = %event.position,
                    error = %err,
                    "schema sequence violation, halting partition"
                );
            }
            self.status.fail(&err);
            break Err(Halted);
        };

        if unavailable_since.is_some() {
            self.status.unstall(self.partition);
        }
        result
    }

    fn dead_letter(&self, event: &ChangeEvent, err: &CdcError, attempts: u32) -> Result<(), Halted> {
        let record = DeadLetterRecord::new(event.clone(), err.to_string(), attempts);
        match self.dead_letters.append(&record) {
            Ok(()) => {
                self.stats.record_dead_letter();
                self.progress.complete(self.partition, &event.offset());
                Ok(())
            }
            Err(persist) => {
                self.status.fail(&CdcError::from(persist));
                Err(Halted)
            }
        }
    }
}
