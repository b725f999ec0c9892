mod common;

use chert::{FlushMode, LogDev, LogDevKey, LogStoreSettings};
use common::{manual_flush_settings, TestEnv};
use std::collections::HashMap;
use std::sync::{Arc, Barrier, Mutex};
use std::time::{Duration, Instant};

#[test]
fn concurrent_appends_complete_in_log_idx_order() {
    let env = TestEnv::new();
    let logdev = LogDev::new_for_key(env.namespace_key(), 0, manual_flush_settings());

    let completions: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let keys: Arc<Mutex<HashMap<(u32, i64), LogDevKey>>> =
        Arc::new(Mutex::new(HashMap::new()));
    {
        let completions = completions.clone();
        let keys = keys.clone();
        logdev.register_append_cb(move |c| {
            assert!(c.error.is_none());
            completions.lock().unwrap().push(c.ld_key.idx);
            keys.lock().unwrap().insert((c.store_id, c.seq_num), c.ld_key);
        });
    }
    logdev.start(true).unwrap();

    let num_threads = 4u32;
    let per_thread = 50i64;
    let barrier = Arc::new(Barrier::new(num_threads as usize));
    let mut handles = Vec::new();
    for t in 0..num_threads {
        let logdev = logdev.clone();
        let barrier = barrier.clone();
        handles.push(std::thread::spawn(move || {
            barrier.wait();
            for i in 0..per_thread {
                let payload = format!("thread-{}-rec-{}", t, i);
                logdev.append_async(t, i, payload.as_bytes(), None).unwrap();
            }
        }));
    }

    // Keep flushing while the appenders run
    let total = (num_threads as i64 * per_thread) as usize;
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        logdev.flush_if_necessary(Some(0));
        if completions.lock().unwrap().len() == total {
            break;
        }
        assert!(Instant::now() < deadline, "appends never drained");
        std::thread::sleep(Duration::from_millis(1));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Single-flush-in-flight plus in-group ordering makes the completion
    // stream strictly ascending across the whole run
    let seen = completions.lock().unwrap().clone();
    assert_eq!(seen.len(), total);
    for window in seen.windows(2) {
        assert!(window[0] < window[1], "completion order regressed: {:?}", window);
    }
    assert_eq!(logdev.get_status().log_idx, total as i64);

    // Every record reads back byte for byte
    for t in 0..num_threads {
        for i in 0..per_thread {
            let key = keys.lock().unwrap()[&(t, i)];
            let expected = format!("thread-{}-rec-{}", t, i);
            assert_eq!(logdev.read(key).unwrap(), expected.as_bytes());
        }
    }

    logdev.stop().unwrap();
}

#[test]
fn timer_mode_flushes_without_explicit_calls() {
    let env = TestEnv::new();
    let settings = LogStoreSettings {
        flush_threshold_size: 1 << 20,
        flush_mode: FlushMode::TIMER,
        max_time_between_flush_us: 2_000,
        ..LogStoreSettings::default()
    };
    let logdev = LogDev::new_for_key(env.namespace_key(), 0, settings);

    let keys: Arc<Mutex<HashMap<i64, LogDevKey>>> = Arc::new(Mutex::new(HashMap::new()));
    {
        let keys = keys.clone();
        logdev.register_append_cb(move |c| {
            keys.lock().unwrap().insert(c.seq_num, c.ld_key);
        });
    }
    logdev.start(true).unwrap();

    logdev.append_async(1, 0, b"timer-flushed", None).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while keys.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "timer flush never fired");
        std::thread::sleep(Duration::from_millis(5));
    }
    let key = keys.lock().unwrap()[&0];
    assert_eq!(logdev.read(key).unwrap(), b"timer-flushed");

    logdev.stop().unwrap();
}

#[test]
fn inline_mode_flushes_on_threshold() {
    let env = TestEnv::new();
    let settings = LogStoreSettings {
        // Threshold small enough that a handful of records trips it
        flush_threshold_size: 2048,
        flush_mode: FlushMode::INLINE,
        max_time_between_flush_us: 3_600_000_000,
        ..LogStoreSettings::default()
    };
    let logdev = LogDev::new_for_key(env.namespace_key(), 0, settings);

    let count = Arc::new(Mutex::new(0usize));
    {
        let count = count.clone();
        logdev.register_append_cb(move |_| {
            *count.lock().unwrap() += 1;
        });
    }
    logdev.start(true).unwrap();

    // Well past the 2048-byte threshold; the appending thread itself
    // performs the flush
    for i in 0..10 {
        logdev.append_async(1, i, &[i as u8; 400], None).unwrap();
    }
    assert!(*count.lock().unwrap() > 0, "inline flush should have fired");

    logdev.stop().unwrap();
}
