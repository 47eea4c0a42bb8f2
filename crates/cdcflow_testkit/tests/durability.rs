//! Durable state on disk: locking, reopen, torn tails and corruption.

use cdcflow_core::CoreError;
use cdcflow_testkit::prelude::*;
use std::fs::{self, OpenOptions};
use std::io::Write;

fn stream_items(dir: &TestStateDir, sink: &Arc<ScriptedSink>, ops: &[RowOp]) {
    let engine = dir.open_engine(fast_config(), Arc::clone(sink) as Arc<dyn SinkConnector>);
    let bridge = engine.start(Arc::new(RecordingSource::new())).unwrap();
    for event in items_stream(ops) {
        bridge.on_change(event).unwrap();
    }
    engine.stop().unwrap();
}

#[test]
fn state_dir_admits_one_engine() {
    let dir = TestStateDir::new();
    let sink: Arc<dyn SinkConnector> = Arc::new(MemorySink::new());
    let first = dir.open_engine(fast_config(), Arc::clone(&sink));

    let second = CaptureEngine::open(dir.path(), fast_config(), Arc::clone(&sink));
    assert!(matches!(
        second,
        Err(CdcError::Core(CoreError::StateDirLocked))
    ));

    drop(first);
    CaptureEngine::open(dir.path(), fast_config(), sink).unwrap();
}

#[test]
fn committed_offset_and_schema_survive_reopen() {
    let dir = TestStateDir::new();
    let sink = Arc::new(ScriptedSink::new());
    stream_items(
        &dir,
        &sink,
        &[RowOp::Upsert { id: 1, price: 5 }, RowOp::Upsert { id: 2, price: 6 }],
    );

    let engine = dir.open_engine(fast_config(), Arc::clone(&sink) as Arc<dyn SinkConnector>);
    assert_eq!(engine.committed_offset().unwrap().position.as_u64(), 3);
    let catalog = engine.schema_catalog();
    assert_eq!(catalog.current(&TableId::new("public.items")).unwrap().version, 1);

    let source = Arc::new(RecordingSource::new());
    let _bridge = engine.start(Arc::clone(&source) as Arc<dyn cdcflow_engine::CaptureSource>).unwrap();
    assert_eq!(
        source.last_resume().flatten().map(|o| o.position.as_u64()),
        Some(3)
    );
    engine.stop().unwrap();
}

#[test]
fn torn_tail_is_dropped_on_open() {
    let dir = TestStateDir::new();
    let sink = Arc::new(ScriptedSink::new());
    stream_items(&dir, &sink, &[RowOp::Upsert { id: 1, price: 5 }]);

    let offsets = dir.file("offsets.log");
    let clean_len = fs::metadata(&offsets).unwrap().len();
    {
        // a header promising more bytes than were written
        let mut file = OpenOptions::new().append(true).open(&offsets).unwrap();
        file.write_all(b"CDCL\x01\x00\x01\xff\x00\x00\x00partial").unwrap();
    }

    let (_lock, stores) = dir.open_stores();
    assert_eq!(stores.offsets.load().unwrap().position.as_u64(), 2);
    drop(stores);
    assert_eq!(fs::metadata(&offsets).unwrap().len(), clean_len);
}

#[test]
fn corrupted_record_refuses_to_open() {
    let dir = TestStateDir::new();
    let sink = Arc::new(ScriptedSink::new());
    stream_items(&dir, &sink, &[RowOp::Upsert { id: 1, price: 5 }]);

    let offsets = dir.file("offsets.log");
    let mut bytes = fs::read(&offsets).unwrap();
    // first payload byte of the first record
    bytes[11] ^= 0xff;
    fs::write(&offsets, bytes).unwrap();

    let err = CaptureEngine::open(dir.path(), fast_config(), Arc::new(MemorySink::new()))
        .unwrap_err();
    match err {
        CdcError::Core(core) => assert!(core.is_corruption(), "{core}"),
        other => panic!("expected corruption, got {other}"),
    }
}

#[test]
fn dead_letters_are_readable_after_reopen() {
    let dir = TestStateDir::new();
    let sink = Arc::new(ScriptedSink::new());
    sink.reject_table("public.items");
    stream_items(
        &dir,
        &sink,
        &[RowOp::Upsert { id: 1, price: 5 }, RowOp::Delete { id: 1 }],
    );

    let (_lock, stores) = dir.open_stores();
    let dead = stores.dead_letters.read_all().unwrap();
    assert_eq!(dead.len(), 2);
    assert!(dead.iter().all(|d| d.failure_reason.contains("constraint violation")));
    assert_eq!(stores.offsets.load().unwrap().position.as_u64(), 3);
}
