//! Core identifiers shared across the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Source-assigned position of a change event.
///
/// Positions are strictly increasing within one capture session and are the
/// ordering key for offset commits.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequencePosition(pub u64);

impl SequencePosition {
    /// Creates a new position.
    #[must_use]
    pub const fn new(pos: u64) -> Self {
        Self(pos)
    }

    /// Returns the raw position value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequencePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pos:{}", self.0)
    }
}

/// Identifier of a source table, rendered `schema.table`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(String);

impl TableId {
    /// Creates a table identifier from its full name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Creates `schema.table`, or just `table` when `schema` is empty.
    pub fn qualified(schema: &str, table: &str) -> Self {
        if schema.is_empty() {
            Self(table.to_string())
        } else {
            Self(format!("{schema}.{table}"))
        }
    }

    /// Returns the full name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the table name without its schema prefix.
    #[must_use]
    pub fn table_name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    /// Returns true if `pattern` names this table, either fully qualified
    /// or by bare table name.
    #[must_use]
    pub fn matches(&self, pattern: &str) -> bool {
        self.0 == pattern || self.table_name() == pattern
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TableId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of one capture session (one engine start).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generates a fresh random session id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A resumable position in the source stream.
///
/// `token` is opaque to the engine (an LSN, a binlog coordinate, ...) and is
/// handed back to the capture source on restart. `position` orders offsets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceOffset {
    /// Sequence position of the event this offset points at.
    pub position: SequencePosition,
    /// Source-defined resume token.
    pub token: String,
}

impl SourceOffset {
    /// Creates a new offset.
    pub fn new(position: SequencePosition, token: impl Into<String>) -> Self {
        Self {
            position,
            token: token.into(),
        }
    }
}

impl fmt::Display for SourceOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.position, self.token)
    }
}

/// Index of a worker partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId(pub usize);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

/// Milliseconds since the Unix epoch, for persisted timestamps.
#[must_use]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_ordering() {
        assert!(SequencePosition::new(1) < SequencePosition::new(2));
        assert_eq!(format!("{}", SequencePosition::new(7)), "pos:7");
    }

    #[test]
    fn qualified_table_ids() {
        let t = TableId::qualified("public", "orders");
        assert_eq!(t.as_str(), "public.orders");
        assert_eq!(t.table_name(), "orders");
        assert_eq!(TableId::qualified("", "orders").as_str(), "orders");
    }

    #[test]
    fn table_pattern_matching() {
        let t = TableId::qualified("public", "orders");
        assert!(t.matches("public.orders"));
        assert!(t.matches("orders"));
        assert!(!t.matches("order"));
        assert!(!t.matches("other.orders"));
    }

    #[test]
    fn sessions_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
