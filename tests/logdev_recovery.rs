mod common;

use chert::{LogDev, LogDevKey, LogFoundEntry, LogStoreSettings};
use common::{current_dev_dir, manual_flush_settings, TestEnv};
use std::collections::HashMap;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};

fn setup_test_env() -> TestEnv {
    TestEnv::new()
}

fn open_logdev(env: &TestEnv, settings: LogStoreSettings) -> Arc<LogDev> {
    LogDev::new_for_key(env.namespace_key(), 0, settings)
}

/// Collects (store_id, seq_num, key) for every durable record.
type KeyMap = Arc<Mutex<HashMap<(u32, i64), LogDevKey>>>;

fn register_key_collector(logdev: &Arc<LogDev>) -> KeyMap {
    let keys: KeyMap = Arc::new(Mutex::new(HashMap::new()));
    let keys_cb = keys.clone();
    logdev.register_append_cb(move |c| {
        assert!(c.error.is_none(), "append failed");
        keys_cb.lock().unwrap().insert((c.store_id, c.seq_num), c.ld_key);
    });
    keys
}

/// Collects (store_id, seq_num, payload, idx) replayed for one store.
type FoundLog = Arc<Mutex<Vec<(u32, i64, Vec<u8>, i64)>>>;

fn found_collector() -> (FoundLog, chert::LogFoundCb) {
    let found: FoundLog = Arc::new(Mutex::new(Vec::new()));
    let found_cb = found.clone();
    let cb: chert::LogFoundCb = Arc::new(move |e: &LogFoundEntry<'_>| {
        found_cb
            .lock()
            .unwrap()
            .push((e.store_id, e.seq_num, e.data.to_vec(), e.ld_key.idx));
    });
    (found, cb)
}

// Header field offsets in the on-disk group image (48-byte header):
// group_size at 20..24, prev_grp_crc at 36..40, cur_grp_crc at 40..44
const HDR_GROUP_SIZE_OFF: u64 = 20;
const HDR_PREV_CRC_OFF: u64 = 36;
const HDR_CUR_CRC_OFF: u64 = 40;

fn read_u32_at(path: &std::path::Path, offset: u64) -> u32 {
    let file = std::fs::File::open(path).unwrap();
    let mut buf = [0u8; 4];
    file.read_exact_at(&mut buf, offset).unwrap();
    u32::from_le_bytes(buf)
}

#[test]
fn single_append_survives_restart() {
    let env = setup_test_env();

    {
        let logdev = open_logdev(&env, manual_flush_settings());
        register_key_collector(&logdev);
        logdev.start(true).unwrap();

        let idx = logdev.append_async(7, 0, b"hello", None).unwrap();
        assert_eq!(idx, 0);
        assert!(logdev.flush_if_necessary(Some(0)));
        logdev.stop().unwrap();
    }

    {
        let logdev = open_logdev(&env, manual_flush_settings());
        logdev.register_append_cb(|_| {});
        let (found, cb) = found_collector();
        logdev.open_log_store(7, true, Some(cb), None).unwrap();
        logdev.start(false).unwrap();

        let entries = found.lock().unwrap();
        assert_eq!(entries.len(), 1, "exactly one record must be replayed");
        let (store_id, seq, data, idx) = &entries[0];
        assert_eq!(*store_id, 7);
        assert_eq!(*seq, 0);
        assert_eq!(data, b"hello");
        assert_eq!(*idx, 0);
        drop(entries);

        let status = logdev.get_status();
        assert_eq!(status.log_idx, 1);
        assert_eq!(status.last_flush_idx, 0);
        logdev.stop().unwrap();
    }
}

#[test]
fn two_groups_chain_prev_crc() {
    let env = setup_test_env();

    {
        let logdev = open_logdev(&env, manual_flush_settings());
        register_key_collector(&logdev);
        logdev.start(true).unwrap();

        for i in 0..20 {
            let payload = format!("first-batch-{}", i);
            logdev.append_async(1, i, payload.as_bytes(), None).unwrap();
        }
        assert!(logdev.flush_if_necessary(Some(0)));

        for i in 0..20 {
            let payload = format!("second-batch-{}", i);
            logdev.append_async(1, 20 + i, payload.as_bytes(), None).unwrap();
        }
        assert!(logdev.flush_if_necessary(Some(0)));
        logdev.stop().unwrap();
    }

    // Inspect the raw journal: group 2 must chain group 1's CRC
    let journal = current_dev_dir().join("journal_0.jrnl");
    let group1_size = read_u32_at(&journal, HDR_GROUP_SIZE_OFF) as u64;
    assert_eq!(group1_size % 512, 0);
    let group1_crc = read_u32_at(&journal, HDR_CUR_CRC_OFF);
    let group1_prev = read_u32_at(&journal, HDR_PREV_CRC_OFF);
    let group2_prev = read_u32_at(&journal, group1_size + HDR_PREV_CRC_OFF);
    assert_eq!(group1_prev, 0, "first group after format chains from zero");
    assert_eq!(group2_prev, group1_crc);

    // And recovery walks both groups
    {
        let logdev = open_logdev(&env, manual_flush_settings());
        logdev.register_append_cb(|_| {});
        let (found, cb) = found_collector();
        logdev.open_log_store(1, true, Some(cb), None).unwrap();
        logdev.start(false).unwrap();

        assert_eq!(found.lock().unwrap().len(), 40);
        assert_eq!(logdev.get_status().log_idx, 40);
        logdev.stop().unwrap();
    }
}

#[test]
fn append_read_roundtrip_various_sizes() {
    let env = setup_test_env();
    let logdev = open_logdev(&env, manual_flush_settings());
    let keys = register_key_collector(&logdev);
    logdev.start(true).unwrap();

    let sizes = [1usize, 511, 512, 513, 4096, 65536];
    let mut payloads = Vec::new();
    for (i, &size) in sizes.iter().enumerate() {
        let payload: Vec<u8> = (0..size).map(|j| (i * 31 + j) as u8).collect();
        logdev.append_async(2, i as i64, &payload, None).unwrap();
        payloads.push(payload);
    }
    assert!(logdev.flush_if_necessary(Some(0)));

    for (i, payload) in payloads.iter().enumerate() {
        let key = keys.lock().unwrap()[&(2, i as i64)];
        let read_back = logdev.read(key).unwrap();
        assert_eq!(&read_back, payload, "payload mismatch for size {}", sizes[i]);

        let header = logdev.read_record_header(key).unwrap();
        assert_eq!(header.size as usize, payload.len());
        assert_eq!(header.store_id, 2);
        assert_eq!(header.store_seq_num, i as i64);
    }

    logdev.stop().unwrap();
}

#[test]
fn flush_is_idempotent() {
    let env = setup_test_env();
    let logdev = open_logdev(&env, manual_flush_settings());
    let keys = register_key_collector(&logdev);
    logdev.start(true).unwrap();

    logdev.append_async(3, 0, b"only-once", None).unwrap();
    assert!(logdev.flush_if_necessary(Some(0)));
    // Nothing pending: the second call must be a no-op
    assert!(!logdev.flush_if_necessary(Some(0)));
    assert_eq!(keys.lock().unwrap().len(), 1);
    assert_eq!(logdev.get_status().pending_flush_size, 0);

    logdev.stop().unwrap();

    // No duplicate group was written after the first one
    let journal = current_dev_dir().join("journal_0.jrnl");
    let group1_size = read_u32_at(&journal, HDR_GROUP_SIZE_OFF) as u64;
    let next_magic = read_u32_at(&journal, group1_size);
    assert_eq!(next_magic, 0, "no second group expected");
}

#[test]
fn torn_tail_stops_recovery_cleanly() {
    let env = setup_test_env();

    {
        let logdev = open_logdev(&env, manual_flush_settings());
        register_key_collector(&logdev);
        logdev.start(true).unwrap();
        for i in 0..20 {
            logdev.append_async(4, i, format!("keep-{}", i).as_bytes(), None).unwrap();
        }
        assert!(logdev.flush_if_necessary(Some(0)));
        for i in 0..5 {
            logdev.append_async(4, 20 + i, format!("torn-{}", i).as_bytes(), None).unwrap();
        }
        assert!(logdev.flush_if_necessary(Some(0)));
        logdev.stop().unwrap();
    }

    // Corrupt the second group's body while leaving its header intact,
    // simulating a half-written tail
    let journal = current_dev_dir().join("journal_0.jrnl");
    let group1_size = read_u32_at(&journal, HDR_GROUP_SIZE_OFF) as u64;
    {
        let file = std::fs::OpenOptions::new().write(true).open(&journal).unwrap();
        file.write_at(&[0xFF; 8], group1_size + 100).unwrap();
        file.sync_all().unwrap();
    }

    {
        let logdev = open_logdev(&env, manual_flush_settings());
        let keys = register_key_collector(&logdev);
        let (found, cb) = found_collector();
        logdev.open_log_store(4, true, Some(cb), None).unwrap();
        logdev.start(false).unwrap();

        // Only the intact first group is replayed; the probe of the pages
        // past the torn group finds no future log idx, so no assertion
        assert_eq!(found.lock().unwrap().len(), 20);
        assert_eq!(logdev.get_status().log_idx, 20);

        // The logdev keeps working past the torn tail
        logdev.append_async(4, 100, b"after-recovery", None).unwrap();
        assert!(logdev.flush_if_necessary(Some(0)));
        let key = keys.lock().unwrap()[&(4, 100)];
        assert_eq!(logdev.read(key).unwrap(), b"after-recovery");
        logdev.stop().unwrap();
    }
}

#[test]
fn recovery_is_deterministic() {
    let env = setup_test_env();

    {
        let logdev = open_logdev(&env, manual_flush_settings());
        register_key_collector(&logdev);
        logdev.start(true).unwrap();
        for i in 0..30 {
            logdev
                .append_async(5, i, format!("det-{}", i).as_bytes(), None)
                .unwrap();
            if i % 10 == 9 {
                assert!(logdev.flush_if_necessary(Some(0)));
            }
        }
        logdev.stop().unwrap();
    }

    let mut runs = Vec::new();
    for _ in 0..2 {
        let logdev = open_logdev(&env, manual_flush_settings());
        logdev.register_append_cb(|_| {});
        let (found, cb) = found_collector();
        logdev.open_log_store(5, true, Some(cb), None).unwrap();
        logdev.start(false).unwrap();
        logdev.stop().unwrap();
        runs.push(found.lock().unwrap().clone());
    }
    assert_eq!(runs[0].len(), 30);
    assert_eq!(runs[0], runs[1], "two scans of the same bytes must agree");
}

#[test]
fn empty_logdev_restarts_clean() {
    let env = setup_test_env();
    {
        let logdev = open_logdev(&env, manual_flush_settings());
        logdev.register_append_cb(|_| {});
        logdev.start(true).unwrap();
        logdev.stop().unwrap();
    }
    {
        let logdev = open_logdev(&env, manual_flush_settings());
        logdev.register_append_cb(|_| {});
        logdev.start(false).unwrap();
        let status = logdev.get_status();
        assert_eq!(status.log_idx, 0);
        assert_eq!(status.last_flush_idx, -1);
        logdev.stop().unwrap();
    }
}
