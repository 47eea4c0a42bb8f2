//! # cdcflow testkit
//!
//! Test utilities for cdcflow.
//!
//! This crate provides:
//! - Temporary state directories and fast engine configurations
//! - A sink with scripted failures and a write gate
//! - A capture source that records what the engine asked of it
//! - Builders for raw change envelopes
//! - proptest strategies for row-level change sequences
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cdcflow_testkit::prelude::*;
//!
//! #[test]
//! fn streams_into_sink() {
//!     let dir = TestStateDir::new();
//!     let sink = Arc::new(ScriptedSink::new());
//!     let engine = dir.open_engine(fast_config(), sink.clone());
//!     let bridge = engine.start(Arc::new(RecordingSource::new())).unwrap();
//!     // ... push payloads
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod payload;
pub mod sink;
pub mod source;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::payload::*;
    pub use crate::sink::*;
    pub use crate::source::*;
    pub use cdcflow_core::{
        ChangeEvent, ColumnDefinition, EngineConfig, RetryConfig, Row, SchemaVersion,
        SourceOffset, TableId,
    };
    pub use cdcflow_engine::{CaptureEngine, CdcError, EngineState, MemorySink, SinkConnector};
    pub use std::sync::Arc;
    pub use std::time::Duration;
}

pub use fixtures::*;
pub use generators::*;
pub use payload::*;
pub use sink::*;
pub use source::*;
