//! Test fixtures and engine helpers.

use cdcflow_core::{
    ColumnDefinition, DurableStores, EngineConfig, RetryConfig, Row, SchemaVersion, StateDir,
};
use cdcflow_engine::{CaptureEngine, SinkConnector};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A temporary state directory, removed on drop.
pub struct TestStateDir {
    dir: TempDir,
}

impl TestStateDir {
    /// Creates an empty temporary directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Path of the directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of a file inside the directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Opens an engine over this directory.
    pub fn open_engine(&self, config: EngineConfig, sink: Arc<dyn SinkConnector>) -> CaptureEngine {
        CaptureEngine::open(self.path(), config, sink).expect("Failed to open engine")
    }

    /// Locks the directory and opens its stores directly.
    pub fn open_stores(&self) -> (StateDir, DurableStores) {
        let dir = StateDir::open(self.path(), true).expect("Failed to lock state directory");
        let stores = dir.open_stores().expect("Failed to open stores");
        (dir, stores)
    }
}

impl Default for TestStateDir {
    fn default() -> Self {
        Self::new()
    }
}

/// An engine configuration with short intervals, suitable for tests.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_worker_count(2)
        .with_queue_capacity(64)
        .with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5))
                .with_jitter(false),
        )
        .with_offset_commit_interval(Duration::from_millis(20))
        .with_shutdown_grace(Duration::from_secs(10))
        .with_stats_log_interval(Duration::ZERO)
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// `public.items (id int8 primary key, name text, price numeric)` at
/// `version`.
pub fn items_schema(version: u32) -> SchemaVersion {
    let mut columns = vec![
        ColumnDefinition::new("id", "int8").primary_key(),
        ColumnDefinition::new("name", "text"),
        ColumnDefinition::new("price", "numeric"),
    ];
    if version > 1 {
        columns.push(ColumnDefinition::new("stock", "int4"));
    }
    SchemaVersion::new("public.items", version, columns)
}

/// An `items` row.
pub fn item(id: i64, price: i64) -> Row {
    Row::from([
        ("id".to_string(), json!(id)),
        ("name".to_string(), json!(format!("item-{id}"))),
        ("price".to_string(), json!(price)),
    ])
}

/// The primary key of an `items` row.
pub fn item_key(id: i64) -> Row {
    Row::from([("id".to_string(), json!(id))])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_versions_grow() {
        assert_eq!(items_schema(1).columns.len(), 3);
        assert!(items_schema(2).has_column("stock"));
        assert_eq!(items_schema(1).primary_keys, vec!["id".to_string()]);
    }

    #[test]
    fn wait_until_times_out() {
        assert!(wait_until(Duration::from_millis(5), || true));
        assert!(!wait_until(Duration::from_millis(5), || false));
    }
}
