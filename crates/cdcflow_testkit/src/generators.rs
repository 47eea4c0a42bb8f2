//! Property-based test generators using proptest.
//!
//! Generated streams are well formed: a table's schema change comes first,
//! updates carry the row's previous image and positions strictly increase.

use crate::fixtures::{item, items_schema};
use cdcflow_core::{ChangeEvent, Row};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// A row-level change to `public.items`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOp {
    /// Insert the row, or update it if it exists.
    Upsert {
        /// Primary key.
        id: i64,
        /// New price.
        price: i64,
    },
    /// Delete the row (a no-op write if it does not exist).
    Delete {
        /// Primary key.
        id: i64,
    },
}

/// Strategy for one row operation over a small key space, so that keys
/// collide often.
pub fn row_op_strategy() -> impl Strategy<Value = RowOp> {
    prop_oneof![
        3 => (0i64..6, 0i64..1000).prop_map(|(id, price)| RowOp::Upsert { id, price }),
        1 => (0i64..6).prop_map(|id| RowOp::Delete { id }),
    ]
}

/// Strategy for a sequence of row operations.
pub fn row_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<RowOp>> {
    prop::collection::vec(row_op_strategy(), 1..=max_len.max(1))
}

/// Turns `ops` into change events: a v1 schema change at position 1
/// followed by one event per op.
pub fn items_stream(ops: &[RowOp]) -> Vec<ChangeEvent> {
    let mut rows: BTreeMap<i64, Row> = BTreeMap::new();
    let mut events = vec![ChangeEvent::schema_change(1, items_schema(1))];
    for (i, op) in ops.iter().enumerate() {
        let pos = i as u64 + 2;
        let event = match *op {
            RowOp::Upsert { id, price } => {
                let after = item(id, price);
                match rows.insert(id, after.clone()) {
                    Some(before) => ChangeEvent::update(pos, "public.items", before, after),
                    None => ChangeEvent::insert(pos, "public.items", after),
                }
            }
            RowOp::Delete { id } => {
                let before = rows.remove(&id).unwrap_or_else(|| item(id, 0));
                ChangeEvent::delete(pos, "public.items", before)
            }
        };
        events.push(event);
    }
    events
}

/// The `items` rows `ops` should leave behind, keyed by id.
pub fn expected_items(ops: &[RowOp]) -> BTreeMap<i64, Row> {
    let mut rows = BTreeMap::new();
    for op in ops {
        match *op {
            RowOp::Upsert { id, price } => {
                rows.insert(id, item(id, price));
            }
            RowOp::Delete { id } => {
                rows.remove(&id);
            }
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdcflow_core::OperationKind;

    #[test]
    fn stream_starts_with_schema() {
        let events = items_stream(&[
            RowOp::Upsert { id: 1, price: 5 },
            RowOp::Upsert { id: 1, price: 6 },
            RowOp::Delete { id: 1 },
        ]);
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                OperationKind::SchemaChange,
                OperationKind::Insert,
                OperationKind::Update,
                OperationKind::Delete,
            ]
        );
        assert_eq!(events[2].before, Some(item(1, 5)));
    }

    proptest! {
        #[test]
        fn streams_are_valid_and_ordered(ops in row_ops_strategy(30)) {
            let events = items_stream(&ops);
            prop_assert_eq!(events.len(), ops.len() + 1);
            for pair in events.windows(2) {
                prop_assert!(pair[0].position < pair[1].position);
            }
            for event in &events {
                prop_assert!(event.validate().is_ok());
            }
        }
    }
}
