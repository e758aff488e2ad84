// SPDX-License-Identifier: Apache-2.0

use super::*;

fn config(pack_size: usize, per_file: usize) -> StorageConfig {
    let mut config = StorageConfig::default();
    config.read_records_count = pack_size;
    config.max_records_per_file = per_file;
    config
}

#[test]
fn events_survive_reopen_until_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    {
        let storage = FileEventStorage::open(dir.path().to_path_buf(), &config(10, 100)).unwrap();
        for event in ["a", "b", "c"] {
            assert!(storage.put(event));
        }
        storage.stop();
    }

    let storage = FileEventStorage::open(dir.path().to_path_buf(), &config(10, 100)).unwrap();
    assert_eq!(storage.len(), 3);
    assert_eq!(storage.get_event_pack(), vec!["a", "b", "c"]);

    storage.event_pack_processing_done();
    assert!(storage.is_empty());
    assert!(storage.get_event_pack().is_empty());
}

#[test]
fn acknowledged_events_do_not_replay_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let storage = FileEventStorage::open(dir.path().to_path_buf(), &config(2, 100)).unwrap();
        for event in ["a", "b", "c"] {
            storage.put(event);
        }
        assert_eq!(storage.get_event_pack(), vec!["a", "b"]);
        storage.event_pack_processing_done();
        storage.stop();
    }

    let storage = FileEventStorage::open(dir.path().to_path_buf(), &config(2, 100)).unwrap();
    assert_eq!(storage.len(), 1);
    assert_eq!(storage.get_event_pack(), vec!["c"]);
}

#[test]
fn pack_is_stable_until_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileEventStorage::open(dir.path().to_path_buf(), &config(2, 100)).unwrap();
    storage.put("a");
    storage.put("b");
    storage.put("c");

    assert_eq!(storage.get_event_pack(), vec!["a", "b"]);
    storage.put("d");
    assert_eq!(storage.get_event_pack(), vec!["a", "b"]);

    storage.event_pack_processing_done();
    assert_eq!(storage.get_event_pack(), vec!["c", "d"]);
}

#[test]
fn segments_rotate_and_consumed_ones_are_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileEventStorage::open(dir.path().to_path_buf(), &config(100, 2)).unwrap();
    for i in 0..6 {
        storage.put(&format!("e{i}"));
    }
    assert!(list_segments(dir.path()).unwrap().len() >= 3);

    let pack = storage.get_event_pack();
    assert_eq!(pack.len(), 6);
    storage.event_pack_processing_done();

    // Only the write segment may remain.
    assert!(list_segments(dir.path()).unwrap().len() <= 1);
    assert!(storage.is_empty());
}

#[test]
fn pack_spans_segment_boundaries_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileEventStorage::open(dir.path().to_path_buf(), &config(4, 2)).unwrap();
    for i in 0..5 {
        storage.put(&format!("e{i}"));
    }

    assert_eq!(storage.get_event_pack(), vec!["e0", "e1", "e2", "e3"]);
    storage.event_pack_processing_done();
    assert_eq!(storage.get_event_pack(), vec!["e4"]);
}

#[test]
fn thousand_events_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileEventStorage::open(dir.path().to_path_buf(), &config(100, 250)).unwrap();
    for i in 0..1_000 {
        assert!(storage.put(&format!("{{\"n\":{i}}}")));
    }
    assert_eq!(storage.len(), 1_000);

    let mut seen = Vec::new();
    loop {
        let pack = storage.get_event_pack();
        if pack.is_empty() {
            break;
        }
        seen.extend(pack);
        storage.event_pack_processing_done();
    }
    assert_eq!(seen.len(), 1_000);
    assert_eq!(seen[0], "{\"n\":0}");
    assert_eq!(seen[999], "{\"n\":999}");
}
