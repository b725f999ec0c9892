mod common;

use chert::{LogDev, LogFoundEntry, LogStoreSettings};
use common::{manual_flush_settings, TestEnv};
use std::sync::{Arc, Mutex};

fn open_logdev(env: &TestEnv, settings: LogStoreSettings) -> Arc<LogDev> {
    LogDev::new_for_key(env.namespace_key(), 0, settings)
}

type Replayed = Arc<Mutex<Vec<i64>>>;

fn seq_collector() -> (Replayed, chert::LogFoundCb) {
    let seqs: Replayed = Arc::new(Mutex::new(Vec::new()));
    let seqs_cb = seqs.clone();
    let cb: chert::LogFoundCb = Arc::new(move |e: &LogFoundEntry<'_>| {
        seqs_cb.lock().unwrap().push(e.seq_num);
    });
    (seqs, cb)
}

fn write_hundred_records(env: &TestEnv, store_id: u32) {
    let logdev = open_logdev(env, manual_flush_settings());
    logdev.register_append_cb(|c| assert!(c.error.is_none()));
    logdev.start(true).unwrap();

    // log_idx tracks seq 1:1 because this is the only stream
    for i in 0..100i64 {
        let idx = logdev
            .append_async(store_id, i, format!("rec-{}", i).as_bytes(), None)
            .unwrap();
        assert_eq!(idx, i);
        if i % 25 == 24 {
            assert!(logdev.flush_if_necessary(Some(0)));
        }
    }
    logdev.stop().unwrap();
}

#[test]
fn rollback_range_skipped_on_recovery() {
    let env = TestEnv::new();
    write_hundred_records(&env, 3);

    // Roll back the middle of the stream and restart
    {
        let logdev = open_logdev(&env, manual_flush_settings());
        logdev.register_append_cb(|_| {});
        logdev.start(false).unwrap();
        assert!(logdev.rollback(3, (50, 79)));
        logdev.stop().unwrap();
    }

    {
        let logdev = open_logdev(&env, manual_flush_settings());
        logdev.register_append_cb(|_| {});
        let (seqs, cb) = seq_collector();
        logdev.open_log_store(3, true, Some(cb), None).unwrap();
        logdev.start(false).unwrap();

        let replayed = seqs.lock().unwrap().clone();
        let expected: Vec<i64> = (0..50).chain(80..100).collect();
        assert_eq!(replayed, expected);

        // The rolled back indexes still consumed their log idx slots
        assert_eq!(logdev.get_status().log_idx, 100);
        logdev.stop().unwrap();
    }
}

#[test]
fn rollback_is_idempotent() {
    let env = TestEnv::new();
    write_hundred_records(&env, 3);

    {
        let logdev = open_logdev(&env, manual_flush_settings());
        logdev.register_append_cb(|_| {});
        logdev.start(false).unwrap();
        assert!(logdev.rollback(3, (50, 79)));
        assert!(logdev.rollback(3, (50, 79)));
        logdev.stop().unwrap();
    }

    {
        let logdev = open_logdev(&env, manual_flush_settings());
        logdev.register_append_cb(|_| {});
        let (seqs, cb) = seq_collector();
        logdev.open_log_store(3, true, Some(cb), None).unwrap();
        logdev.start(false).unwrap();
        let expected: Vec<i64> = (0..50).chain(80..100).collect();
        assert_eq!(*seqs.lock().unwrap(), expected);
        logdev.stop().unwrap();
    }
}

#[test]
fn rollback_only_hits_named_stream() {
    let env = TestEnv::new();

    {
        let logdev = open_logdev(&env, manual_flush_settings());
        logdev.register_append_cb(|c| assert!(c.error.is_none()));
        logdev.start(true).unwrap();
        // Interleave two streams; log idx alternates between them
        for i in 0..20i64 {
            logdev.append_async(3, i, b"stream-3", None).unwrap();
            logdev.append_async(9, i, b"stream-9", None).unwrap();
        }
        assert!(logdev.flush_if_necessary(Some(0)));
        // Idx range 10..29 holds stream-3 seqs 5..=14; stream 9 records in
        // the same range are not named and must survive
        assert!(logdev.rollback(3, (10, 29)));
        logdev.stop().unwrap();
    }

    {
        let logdev = open_logdev(&env, manual_flush_settings());
        logdev.register_append_cb(|_| {});
        let (seqs3, cb3) = seq_collector();
        let (seqs9, cb9) = seq_collector();
        logdev.open_log_store(3, true, Some(cb3), None).unwrap();
        logdev.open_log_store(9, true, Some(cb9), None).unwrap();
        logdev.start(false).unwrap();

        let expected3: Vec<i64> = (0..5).chain(15..20).collect();
        assert_eq!(*seqs3.lock().unwrap(), expected3);
        assert_eq!(*seqs9.lock().unwrap(), (0..20).collect::<Vec<i64>>());
        logdev.stop().unwrap();
    }
}

#[test]
fn rollback_survives_multiple_restarts() {
    let env = TestEnv::new();
    write_hundred_records(&env, 3);

    {
        let logdev = open_logdev(&env, manual_flush_settings());
        logdev.register_append_cb(|_| {});
        logdev.start(false).unwrap();
        assert!(logdev.rollback(3, (90, 99)));
        logdev.stop().unwrap();
    }

    for _ in 0..2 {
        let logdev = open_logdev(&env, manual_flush_settings());
        logdev.register_append_cb(|_| {});
        let (seqs, cb) = seq_collector();
        logdev.open_log_store(3, true, Some(cb), None).unwrap();
        logdev.start(false).unwrap();
        assert_eq!(*seqs.lock().unwrap(), (0..90).collect::<Vec<i64>>());
        logdev.stop().unwrap();
    }
}
