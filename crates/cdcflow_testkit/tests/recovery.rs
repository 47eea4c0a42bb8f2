//! Crash, restart and replay.
//!
//! A crash is simulated by dropping a running engine: nothing is drained or
//! committed. Its stores are reopened over the same in-memory backends, the
//! source replays everything after the committed offset, and the sink must
//! end up as if nothing had happened.

use cdcflow_core::{DurableStores, EngineConfig};
use cdcflow_engine::{EngineStats, HandlerSet, MemorySink};
use cdcflow_storage::InMemoryBackend;
use cdcflow_testkit::prelude::*;
use proptest::prelude::*;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct Backends {
    offsets: InMemoryBackend,
    history: InMemoryBackend,
    dead_letters: InMemoryBackend,
}

impl Backends {
    fn new() -> Self {
        Self {
            offsets: InMemoryBackend::new(),
            history: InMemoryBackend::new(),
            dead_letters: InMemoryBackend::new(),
        }
    }

    fn stores(&self) -> DurableStores {
        DurableStores::from_backends(
            self.offsets.clone(),
            self.history.clone(),
            self.dead_letters.clone(),
        )
        .unwrap()
    }
}

fn assert_items(sink: &MemorySink, expected: &std::collections::BTreeMap<i64, Row>) {
    let table = TableId::new("public.items");
    for id in 0..6 {
        assert_eq!(
            sink.get(&table, &item_key(id)),
            expected.get(&id).cloned(),
            "row {id}"
        );
    }
    assert_eq!(sink.row_count(&table), expected.len());
}

/// Streams `events`, commits after the first `committed` of them are done,
/// then crashes. Returns the committed position.
fn run_until_crash(
    backends: &Backends,
    sink: &Arc<ScriptedSink>,
    events: &[ChangeEvent],
    committed: usize,
) -> Option<u64> {
    let engine = CaptureEngine::new(
        backends.stores(),
        fast_config().with_offset_commit_interval(Duration::from_secs(60)),
        Arc::clone(sink) as Arc<dyn SinkConnector>,
    );
    let bridge = engine.start(Arc::new(RecordingSource::new())).unwrap();

    for event in &events[..committed] {
        bridge.on_change(event.clone()).unwrap();
    }
    assert!(wait_until(WAIT, || engine.outstanding() == 0));
    engine.commit_now().unwrap();

    for event in &events[committed..] {
        bridge.on_change(event.clone()).unwrap();
    }
    let position = engine.committed_offset().map(|o| o.position.as_u64());
    drop(engine);
    position
}

/// Restarts over the same state and replays what the source would resend.
fn restart_and_replay(backends: &Backends, sink: &Arc<ScriptedSink>, events: &[ChangeEvent]) -> CaptureEngine {
    let engine = CaptureEngine::new(
        backends.stores(),
        fast_config(),
        Arc::clone(sink) as Arc<dyn SinkConnector>,
    );
    let source = Arc::new(RecordingSource::new());
    let bridge = engine.start(Arc::clone(&source) as Arc<dyn cdcflow_engine::CaptureSource>).unwrap();

    let resume_after = source
        .last_resume()
        .flatten()
        .map_or(0, |o| o.position.as_u64());
    for event in events.iter().filter(|e| e.position.as_u64() > resume_after) {
        bridge.on_change(event.clone()).unwrap();
    }
    engine.stop().unwrap();
    engine
}

#[test]
fn restart_resumes_after_committed_offset() {
    let ops = [
        RowOp::Upsert { id: 1, price: 5 },
        RowOp::Upsert { id: 2, price: 7 },
        RowOp::Upsert { id: 1, price: 6 },
        RowOp::Delete { id: 2 },
        RowOp::Upsert { id: 3, price: 1 },
    ];
    let events = items_stream(&ops);
    let backends = Backends::new();
    let sink = Arc::new(ScriptedSink::new());

    let committed = run_until_crash(&backends, &sink, &events, 3);
    assert_eq!(committed, Some(3));

    let engine = restart_and_replay(&backends, &sink, &events);
    assert_eq!(engine.committed_offset().unwrap().position.as_u64(), 6);
    assert_items(sink.memory(), &expected_items(&ops));
    assert_eq!(engine.schema_catalog().current_version(&TableId::new("public.items")), 1);
}

#[test]
fn crash_before_first_commit_replays_everything() {
    let ops = [RowOp::Upsert { id: 4, price: 40 }, RowOp::Delete { id: 4 }];
    let events = items_stream(&ops);
    let backends = Backends::new();
    let sink = Arc::new(ScriptedSink::new());

    assert_eq!(run_until_crash(&backends, &sink, &events, 0), None);

    let engine = restart_and_replay(&backends, &sink, &events);
    assert_items(sink.memory(), &expected_items(&ops));
    // the schema change may have been logged before the crash
    assert_eq!(
        engine.stats().schema_changes + engine.stats().schema_duplicates,
        1
    );
}

#[test]
fn dead_letters_survive_restart() {
    let backends = Backends::new();
    let sink = Arc::new(ScriptedSink::new());
    let events = items_stream(&[RowOp::Upsert { id: 1, price: 5 }]);

    {
        let engine = CaptureEngine::new(
            backends.stores(),
            fast_config(),
            Arc::clone(&sink) as Arc<dyn SinkConnector>,
        );
        let bridge = engine.start(Arc::new(RecordingSource::new())).unwrap();
        sink.push_write_failure(ScriptedFailure::Permanent("duplicate key".into()));
        for event in &events {
            bridge.on_change(event.clone()).unwrap();
        }
        engine.stop().unwrap();
    }

    let engine = CaptureEngine::new(
        backends.stores(),
        EngineConfig::default(),
        Arc::clone(&sink) as Arc<dyn SinkConnector>,
    );
    let dead = engine.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event, events[1]);
    assert_eq!(engine.committed_offset().unwrap().position.as_u64(), 2);
}

fn apply_all(handlers: &HandlerSet, sink: &MemorySink, events: &[ChangeEvent]) {
    for event in events {
        handlers.handle(event, sink).unwrap();
    }
}

fn handlers() -> HandlerSet {
    let stores = DurableStores::in_memory().unwrap();
    HandlerSet::new(
        Arc::new(stores.schema_history),
        Arc::new(EngineStats::new()),
        &EngineConfig::default(),
    )
}

proptest! {
    #[test]
    fn redelivered_prefix_does_not_change_end_state(
        ops in row_ops_strategy(25),
        cut in any::<prop::sample::Index>(),
        back in any::<prop::sample::Index>(),
    ) {
        let events = items_stream(&ops);
        // processed through `crash`, resumed from `resume` <= `crash`
        let crash = cut.index(events.len() + 1);
        let resume = back.index(crash + 1);

        let handlers = handlers();
        let sink = MemorySink::new();
        sink.connect().unwrap();
        apply_all(&handlers, &sink, &events[..crash]);
        apply_all(&handlers, &sink, &events[resume..]);

        let table = TableId::new("public.items");
        let expected = expected_items(&ops);
        for id in 0..6 {
            prop_assert_eq!(sink.get(&table, &item_key(id)), expected.get(&id).cloned());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn crash_and_replay_matches_uninterrupted_run(
        ops in row_ops_strategy(12),
        cut in any::<prop::sample::Index>(),
    ) {
        let events = items_stream(&ops);
        let committed = cut.index(events.len() + 1);
        let backends = Backends::new();
        let sink = Arc::new(ScriptedSink::new());

        run_until_crash(&backends, &sink, &events, committed);
        restart_and_replay(&backends, &sink, &events);

        let table = TableId::new("public.items");
        let expected = expected_items(&ops);
        for id in 0..6 {
            prop_assert_eq!(sink.memory().get(&table, &item_key(id)), expected.get(&id).cloned());
        }
    }
}
