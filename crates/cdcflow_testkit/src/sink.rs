//! A sink with scripted failures.
//!
//! [`ScriptedSink`] wraps a [`MemorySink`] and fails writes or flushes on
//! demand. Writes can also be held at a gate, which keeps a worker busy so
//! tests can fill partition queues deterministically.

use cdcflow_core::{SchemaVersion, TableId};
use cdcflow_engine::{CdcError, CdcResult, MemorySink, SinkConnector, WriteRequest};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A failure the sink should report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// Report a retryable error.
    Transient(String),
    /// Report a non-retryable error.
    Permanent(String),
}

impl ScriptedFailure {
    fn to_error(&self) -> CdcError {
        match self {
            ScriptedFailure::Transient(m) => CdcError::transient(m.clone()),
            ScriptedFailure::Permanent(m) => CdcError::permanent(m.clone()),
        }
    }
}

#[derive(Default)]
struct Gate {
    held: bool,
    waiting: usize,
}

/// Memory sink with failure injection.
#[derive(Default)]
pub struct ScriptedSink {
    inner: MemorySink,
    write_script: Mutex<VecDeque<ScriptedFailure>>,
    flush_script: Mutex<VecDeque<ScriptedFailure>>,
    rejected_tables: Mutex<HashSet<TableId>>,
    unavailable: AtomicBool,
    gate: Mutex<Gate>,
    gate_cond: Condvar,
    write_attempts: AtomicU64,
    flush_attempts: AtomicU64,
}

impl ScriptedSink {
    /// Creates a sink that succeeds until told otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` writes with a transient error.
    pub fn fail_writes_transiently(&self, count: usize) {
        let mut script = self.write_script.lock();
        for i in 0..count {
            script.push_back(ScriptedFailure::Transient(format!("scripted timeout #{}", i + 1)));
        }
    }

    /// Queues a failure for the next write.
    pub fn push_write_failure(&self, failure: ScriptedFailure) {
        self.write_script.lock().push_back(failure);
    }

    /// Fails the next `count` flushes with a transient error.
    pub fn fail_flushes(&self, count: usize) {
        let mut script = self.flush_script.lock();
        for _ in 0..count {
            script.push_back(ScriptedFailure::Transient("scripted flush failure".into()));
        }
    }

    /// Rejects every write to `table` with a permanent error.
    pub fn reject_table(&self, table: impl Into<TableId>) {
        self.rejected_tables.lock().insert(table.into());
    }

    /// Makes every write fail transiently until set back to false.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Holds every write at the gate until [`ScriptedSink::release`].
    pub fn hold(&self) {
        self.gate.lock().held = true;
    }

    /// Opens the gate.
    pub fn release(&self) {
        self.gate.lock().held = false;
        self.gate_cond.notify_all();
    }

    /// Writers currently waiting at the gate.
    pub fn held_writers(&self) -> usize {
        self.gate.lock().waiting
    }

    /// Every write call, including failed ones.
    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Every flush call, including failed ones.
    pub fn flush_attempts(&self) -> u64 {
        self.flush_attempts.load(Ordering::SeqCst)
    }

    /// The underlying memory sink.
    pub fn memory(&self) -> &MemorySink {
        &self.inner
    }

    fn wait_at_gate(&self) {
        let mut gate = self.gate.lock();
        if !gate.held {
            return;
        }
        gate.waiting += 1;
        while gate.held {
            self.gate_cond.wait(&mut gate);
        }
        gate.waiting -= 1;
    }
}

impl SinkConnector for ScriptedSink {
    fn connect(&self) -> CdcResult<()> {
        self.inner.connect()
    }

    fn write(&self, request: &WriteRequest) -> CdcResult<()> {
        self.wait_at_gate();
        self.write_attempts.fetch_add(1, Ordering::SeqCst);

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CdcError::transient("scripted sink unavailable"));
        }
        if self.rejected_tables.lock().contains(request.table()) {
            return Err(CdcError::permanent(format!(
                "constraint violation on {}",
                request.table()
            )));
        }
        if let Some(failure) = self.write_script.lock().pop_front() {
            return Err(failure.to_error());
        }
        self.inner.write(request)
    }

    fn flush(&self) -> CdcResult<()> {
        self.flush_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.flush_script.lock().pop_front() {
            return Err(failure.to_error());
        }
        self.inner.flush()
    }

    fn close(&self) -> CdcResult<()> {
        self.release();
        self.inner.close()
    }

    fn apply_schema(&self, schema: &SchemaVersion) -> CdcResult<()> {
        self.inner.apply_schema(schema)
    }

    fn target_schema(&self, schema: &SchemaVersion) -> SchemaVersion {
        self.inner.target_schema(schema)
    }
}
