//! Engine state machine.
//!
//! ```text
//! STOPPED → STARTING → STREAMING ⇄ PAUSED → STOPPING → STOPPED
//!                 ↘          ↘        ↘         ↘
//!                                 FAILED (terminal)
//! ```
//!
//! PAUSED has two causes that may overlap: the bridge blocking on a full
//! queue, and partitions stalled on an unavailable sink. The engine returns
//! to STREAMING only when both are cleared.

use crate::error::{CdcError, CdcResult};
use cdcflow_core::PartitionId;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Lifecycle state of a capture engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not running.
    Stopped,
    /// Loading state and connecting the sink.
    Starting,
    /// Accepting and processing events.
    Streaming,
    /// Accepting input but held back by backpressure or a stalled sink.
    Paused,
    /// Draining queues for shutdown.
    Stopping,
    /// Stopped by an unrecoverable error.
    Failed,
}

impl EngineState {
    /// Returns true if the bridge accepts new events.
    pub fn is_accepting(self) -> bool {
        matches!(self, EngineState::Streaming | EngineState::Paused)
    }

    /// Returns true if the engine can never run again.
    pub fn is_terminal(self) -> bool {
        self == EngineState::Failed
    }

    fn can_transition_to(self, to: EngineState) -> bool {
        use EngineState::*;
        match (self, to) {
            (Failed, _) => false,
            (_, Failed) => true,
            (Stopped, Starting)
            | (Starting, Streaming)
            | (Streaming, Paused)
            | (Paused, Streaming)
            | (Streaming, Stopping)
            | (Paused, Stopping)
            | (Stopping, Stopped) => true,
            _ => false,
        }
    }

    /// Upper-case name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Stopped => "STOPPED",
            EngineState::Starting => "STARTING",
            EngineState::Streaming => "STREAMING",
            EngineState::Paused => "PAUSED",
            EngineState::Stopping => "STOPPING",
            EngineState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A one-shot flag threads can sleep on.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn raise(&self) {
        *self.raised.lock() = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_raised(&self) -> bool {
        *self.raised.lock()
    }

    pub(crate) fn reset(&self) {
        *self.raised.lock() = false;
    }

    /// Sleeps for `duration` unless raised first. Returns false if raised.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut raised = self.raised.lock();
        while !*raised {
            if self.cond.wait_until(&mut raised, deadline).timed_out() {
                return !*raised;
            }
        }
        false
    }
}

#[derive(Debug, Default)]
struct PauseCauses {
    backpressure: bool,
    stalled: BTreeSet<PartitionId>,
}

impl PauseCauses {
    fn any(&self) -> bool {
        self.backpressure || !self.stalled.is_empty()
    }
}

/// State shared by the controller, the bridge, the workers and the
/// committer of one engine.
#[derive(Debug)]
pub(crate) struct EngineStatus {
    state: RwLock<EngineState>,
    causes: Mutex<PauseCauses>,
    last_error: RwLock<Option<String>>,
    halt: Signal,
}

impl EngineStatus {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(EngineState::Stopped),
            causes: Mutex::new(PauseCauses::default()),
            last_error: RwLock::new(None),
            halt: Signal::default(),
        }
    }

    pub(crate) fn state(&self) -> EngineState {
        *self.state.read()
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Moves to `to` if the state machine allows it.
    pub(crate) fn transition(&self, to: EngineState) -> CdcResult<()> {
        let mut state = self.state.write();
        if !state.can_transition_to(to) {
            return Err(CdcError::InvalidStateTransition {
                from: state.to_string(),
                to: to.to_string(),
            });
        }
        info!(from = %*state, to = %to, "engine state change");
        *state = to;
        Ok(())
    }

    /// Rejects input unless the engine is streaming or paused.
    pub(crate) fn ensure_accepting(&self) -> CdcResult<()> {
        let state = self.state();
        if state.is_accepting() {
            Ok(())
        } else {
            Err(CdcError::EngineNotStreaming {
                state: state.to_string(),
            })
        }
    }

    pub(crate) fn record_error(&self, err: &CdcError) {
        *self.last_error.write() = Some(err.to_string());
    }

    /// Enters FAILED and stops every engine thread. Idempotent.
    pub(crate) fn fail(&self, err: &CdcError) {
        {
            let mut state = self.state.write();
            if *state == EngineState::Failed {
                return;
            }
            error!(from = %*state, error = %err, "engine failed");
            *state = EngineState::Failed;
        }
        self.record_error(err);
        self.halt.raise();
    }

    /// Signal raised on failure or forced shutdown.
    pub(crate) fn halt(&self) -> &Signal {
        &self.halt
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halt.is_raised()
    }

    /// Sleeps unless the engine halts first. Returns false if halted.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        self.halt.sleep(duration)
    }

    pub(crate) fn pause_for_backpressure(&self) {
        let mut causes = self.causes.lock();
        causes.backpressure = true;
        self.set_paused(true);
    }

    pub(crate) fn clear_backpressure(&self) {
        let mut causes = self.causes.lock();
        causes.backpressure = false;
        if !causes.any() {
            self.set_paused(false);
        }
    }

    pub(crate) fn stall(&self, partition: PartitionId, err: &CdcError) {
        let mut causes = self.causes.lock();
        causes.stalled.insert(partition);
        warn!(%partition, error = %err, "partition stalled");
        self.record_error(err);
        self.set_paused(true);
    }

    pub(crate) fn unstall(&self, partition: PartitionId) {
        let mut causes = self.causes.lock();
        if causes.stalled.remove(&partition) {
            info!(%partition, "partition resumed");
        }
        if !causes.any() {
            self.set_paused(false);
        }
    }

    /// Flips between STREAMING and PAUSED; other states are left alone.
    fn set_paused(&self, paused: bool) {
        let mut state = self.state.write();
        let to = match (*state, paused) {
            (EngineState::Streaming, true) => EngineState::Paused,
            (EngineState::Paused, false) => EngineState::Streaming,
            _ => return,
        };
        info!(from = %*state, to = %to, "engine state change");
        *state = to;
    }

    /// Clears pause causes and the halt signal left by a previous run.
    pub(crate) fn reset_for_start(&self) {
        *self.causes.lock() = PauseCauses::default();
        self.halt.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lifecycle_transitions() {
        let status = EngineStatus::new();
        assert_eq!(status.state(), EngineState::Stopped);
        status.transition(EngineState::Starting).unwrap();
        status.transition(EngineState::Streaming).unwrap();
        status.ensure_accepting().unwrap();
        status.transition(EngineState::Stopping).unwrap();
        assert!(matches!(
            status.ensure_accepting(),
            Err(CdcError::EngineNotStreaming { .. })
        ));
        status.transition(EngineState::Stopped).unwrap();
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let status = EngineStatus::new();
        let err = status.transition(EngineState::Streaming).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid state transition from STOPPED to STREAMING"
        );
    }

    #[test]
    fn failed_is_terminal() {
        let status = EngineStatus::new();
        status.transition(EngineState::Starting).unwrap();
        status.fail(&CdcError::transient("boom"));
        assert_eq!(status.state(), EngineState::Failed);
        assert!(status.is_halted());
        assert!(status.transition(EngineState::Stopped).is_err());
        assert_eq!(status.last_error().unwrap(), "transient sink error: boom");
    }

    #[test]
    fn pause_needs_all_causes_cleared() {
        let status = EngineStatus::new();
        status.transition(EngineState::Starting).unwrap();
        status.transition(EngineState::Streaming).unwrap();

        status.pause_for_backpressure();
        status.stall(PartitionId(1), &CdcError::transient("down"));
        assert_eq!(status.state(), EngineState::Paused);

        status.clear_backpressure();
        assert_eq!(status.state(), EngineState::Paused);
        status.unstall(PartitionId(1));
        assert_eq!(status.state(), EngineState::Streaming);
    }

    #[test]
    fn pause_does_not_touch_stopping() {
        let status = EngineStatus::new();
        status.transition(EngineState::Starting).unwrap();
        status.transition(EngineState::Streaming).unwrap();
        status.transition(EngineState::Stopping).unwrap();
        status.pause_for_backpressure();
        assert_eq!(status.state(), EngineState::Stopping);
    }

    #[test]
    fn signal_interrupts_sleep() {
        let signal = Arc::new(Signal::default());
        assert!(signal.sleep(Duration::from_millis(1)));

        let sleeper = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.sleep(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        signal.raise();
        assert!(!sleeper.join().unwrap());
    }
}
