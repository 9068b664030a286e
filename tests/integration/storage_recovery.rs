//! Durability scenarios: rollback, crash recovery and clean close at the
//! storage-manager level.

use std::fs;

use strata::config::Config;
use strata::storage::manager::DiskStorageManager;
use strata::storage::StorageManager;
use tempfile::tempdir;

fn config() -> Config {
    Config {
        record_size: 256,
        max_file_size: 8192,
        trans_log_threshold: 3,
        ..Config::default()
    }
}

#[test]
fn rollback_keeps_flushed_and_drops_unflushed() {
    let dir = tempdir().expect("tmpdir");
    let mut sm = DiskStorageManager::open("data", dir.path(), &config()).expect("open");

    let first = sm.insert(b"first object").expect("insert first");
    sm.flush().expect("flush");

    let second = sm.insert(b"second object").expect("insert second");
    sm.rollback().expect("rollback");

    assert_eq!(sm.fetch(first).expect("first survives"), b"first object");
    assert!(sm.fetch(second).is_err(), "unflushed object must be gone");
}

#[test]
fn crash_before_data_file_apply_recovers_from_log() {
    let dir = tempdir().expect("tmpdir");
    let loc = {
        let mut sm = DiskStorageManager::open("data", dir.path(), &config()).expect("open");
        let loc = sm.insert(b"committed payload").expect("insert");
        sm.flush().expect("flush");
        loc
        // Dropped without close: the commit frame is only in the log.
    };

    // The transaction log holds the frame; the data files do not.
    let log_len = fs::metadata(dir.path().join("data.tlg")).expect("log exists").len();
    assert!(log_len > 2, "log must hold a committed frame");

    let mut sm = DiskStorageManager::open("data", dir.path(), &config()).expect("reopen");
    assert_eq!(sm.fetch(loc).expect("recovered"), b"committed payload");

    // Recovery truncated the log back to its header.
    let log_len = fs::metadata(dir.path().join("data.tlg")).expect("log exists").len();
    assert_eq!(log_len, 2);
}

#[test]
fn rolling_threshold_bounds_log_length() {
    let dir = tempdir().expect("tmpdir");
    let mut sm = DiskStorageManager::open("data", dir.path(), &config()).expect("open");

    let mut locations = Vec::new();
    for i in 0..8u8 {
        locations.push(sm.insert(&[i; 32]).expect("insert"));
        sm.flush().expect("flush");
    }
    sm.close().expect("close");

    let mut sm = DiskStorageManager::open("data", dir.path(), &config()).expect("reopen");
    for (i, &loc) in locations.iter().enumerate() {
        assert_eq!(sm.fetch(loc).expect("fetch"), vec![i as u8; 32]);
    }
}

#[test]
fn open_close_without_operations_is_byte_identical() {
    let dir = tempdir().expect("tmpdir");

    {
        let mut sm = DiskStorageManager::open("data", dir.path(), &config()).expect("open");
        sm.insert(b"settle some state").expect("insert");
        sm.close().expect("close");
    }
    let snapshot = read_all_files(dir.path());

    {
        let mut sm = DiskStorageManager::open("data", dir.path(), &config()).expect("reopen");
        sm.close().expect("close again");
    }
    assert_eq!(read_all_files(dir.path()), snapshot);
}

fn read_all_files(dir: &std::path::Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<(String, Vec<u8>)> = fs::read_dir(dir)
        .expect("read dir")
        .map(|entry| {
            let entry = entry.expect("dir entry");
            let name = entry.file_name().to_string_lossy().into_owned();
            let bytes = fs::read(entry.path()).expect("read file");
            (name, bytes)
        })
        .collect();
    files.sort();
    files
}

#[test]
fn update_in_place_and_relocation_survive_restart() {
    let dir = tempdir().expect("tmpdir");
    let config = config();
    let (small, relocated) = {
        let mut sm = DiskStorageManager::open("data", dir.path(), &config).expect("open");
        let small = sm.insert(b"small").expect("insert");
        let same = sm.update(small, b"size!").expect("update in place");
        assert_eq!(same, small);

        let big = vec![7u8; 700];
        let relocated = sm.update(small, &big).expect("relocating update");
        assert_ne!(relocated, small);
        sm.close().expect("close");
        (small, relocated)
    };

    let mut sm = DiskStorageManager::open("data", dir.path(), &config).expect("reopen");
    assert_eq!(sm.fetch(relocated).expect("fetch"), vec![7u8; 700]);
    assert!(sm.fetch(small).is_err(), "old location was freed");
}
