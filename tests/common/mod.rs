use chert::{FlushMode, LogStoreSettings};
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

#[macro_export]
macro_rules! test_println {
    ($($arg:tt)*) => {
        if std::env::var("CHERT_QUIET").is_err() {
            println!($($arg)*);
        }
    };
}

static BASE_DIR: OnceLock<PathBuf> = OnceLock::new();
static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Default)]
struct ThreadKeyState {
    active: Option<String>,
    last: Option<String>,
}

thread_local! {
    static THREAD_KEYS: RefCell<ThreadKeyState> = RefCell::new(ThreadKeyState::default());
}

fn ensure_base_dir() -> PathBuf {
    BASE_DIR
        .get_or_init(|| {
            let unique = format!(
                "chert-test-run-{}-{}",
                std::process::id(),
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos()
            );
            let dir = std::env::temp_dir().join(unique);
            let _ = fs::remove_dir_all(&dir);
            fs::create_dir_all(&dir).expect("failed to create chert test root");
            std::env::set_var("CHERT_QUIET", "1");
            std::env::set_var("CHERT_DATA_DIR", &dir);
            dir
        })
        .clone()
}

fn next_namespace_key(counter: u64) -> String {
    format!(
        "test-key-{:x}-{:x}-{:x}",
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
        counter
    )
}

#[allow(dead_code)]
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub struct TestEnv {
    key: String,
    dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let counter = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let base = ensure_base_dir();
        let key = next_namespace_key(counter);
        let dir = base.join(sanitize_key(&key));

        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("failed to create per-test chert dir");

        THREAD_KEYS.with(|state| {
            let mut st = state.borrow_mut();
            st.active = Some(key.clone());
            st.last = Some(key.clone());
        });
        chert::__set_thread_namespace_for_tests(&key);

        Self { key, dir }
    }

    pub fn namespace_key(&self) -> &str {
        &self.key
    }

    #[allow(dead_code)]
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
        THREAD_KEYS.with(|state| {
            let mut st = state.borrow_mut();
            if st.active.as_deref() == Some(self.key.as_str()) {
                st.active = None;
            }
            st.last = Some(self.key.clone());
        });
        chert::__clear_thread_namespace_for_tests();
    }
}

#[allow(dead_code)]
pub fn current_dev_dir() -> PathBuf {
    let mut base = ensure_base_dir();
    let key = THREAD_KEYS.with(|state| {
        let st = state.borrow();
        st.active
            .as_ref()
            .or(st.last.as_ref())
            .cloned()
            .unwrap_or_else(|| "default".to_string())
    });
    base.push(sanitize_key(&key));
    base
}

/// Settings with every automatic flush trigger parked, so tests decide
/// exactly when groups are written.
#[allow(dead_code)]
pub fn manual_flush_settings() -> LogStoreSettings {
    LogStoreSettings {
        flush_threshold_size: 1 << 20,
        optimal_inline_data_size: 512,
        flush_mode: FlushMode::INLINE | FlushMode::EXPLICIT,
        cache_flush_threads: 1,
        repl_req_timeout_sec: 300,
        max_time_between_flush_us: 3_600_000_000,
    }
}
