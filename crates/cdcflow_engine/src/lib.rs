//! # cdcflow engine
//!
//! The streaming half of cdcflow. A capture source pushes change
//! notifications into a [`CaptureBridge`]; the bridge routes them by table
//! into bounded partition queues; one worker per partition applies them to a
//! [`SinkConnector`] in order; a committer periodically flushes the sink and
//! persists the highest offset below which every event is done.
//!
//! Delivery is at-least-once. After a crash or restart the source resumes
//! after the committed offset, and every sink write is a keyed upsert or
//! delete, so replaying already applied events leaves the sink unchanged.
//!
//! ```no_run
//! use cdcflow_core::{EngineConfig, SourceOffset};
//! use cdcflow_engine::{CaptureEngine, CaptureSource, CdcResult, MemorySink};
//! use std::sync::Arc;
//!
//! struct Replication;
//!
//! impl CaptureSource for Replication {
//!     fn resume_from(&self, _offset: Option<&SourceOffset>) -> CdcResult<()> { Ok(()) }
//!     fn pause(&self) {}
//!     fn resume(&self) {}
//! }
//!
//! let engine = CaptureEngine::open("./state", EngineConfig::default(), Arc::new(MemorySink::new()))?;
//! let bridge = engine.start(Arc::new(Replication))?;
//! bridge.on_raw_change(br#"{"op":"r","source":{"table":"t","pos":1},"after":{"id":1}}"#)?;
//! engine.stop()?;
//! # Ok::<(), cdcflow_engine::CdcError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bridge;
mod controller;
mod decode;
mod error;
mod handler;
mod progress;
mod sink;
mod state;
mod stats;
mod type_map;
mod worker;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use bridge::{partition_for, CaptureBridge, CaptureSource};
pub use controller::CaptureEngine;
pub use decode::decode_change;
pub use error::{CdcError, CdcResult};
pub use handler::{HandlerOutcome, HandlerSet};
pub use progress::ProgressTracker;
pub use sink::{MemorySink, SinkConnector, TableRows, WriteRequest};
pub use state::EngineState;
pub use stats::{EngineStats, StatsSnapshot};
pub use type_map::TypeMap;
