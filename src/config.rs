use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Magic stamped at the start of every log group header.
pub(crate) const LOG_GROUP_HDR_MAGIC: u32 = 0x00F0_0D1E;
/// Magic stamped in every log group footer.
pub(crate) const LOG_GROUP_FOOTER_MAGIC: u32 = 0x00B0_0D1E;

pub(crate) const LOG_GROUP_HDR_VERSION: u32 = 0;
pub(crate) const LOG_GROUP_FOOTER_VERSION: u8 = 0;

/// Minimum alignment for device writes. Flush offsets and sizes are a
/// multiple of this.
pub(crate) const DMA_ADDRESS_BOUNDARY: u64 = 512;

/// First read issued for any group: enough for the header, the record slot
/// array and most small groups in one aligned I/O.
pub(crate) const INITIAL_READ_SIZE: u64 = 4096;

/// The journal never has more than one flush in flight, so two groups are
/// enough: one flushing, one being filled.
pub(crate) const MAX_LOG_GROUP: usize = 2;

/// How many subsequent pages are probed after end-of-stream to tell a torn
/// tail apart from corruption.
pub(crate) const MAX_BLKS_READ_FOR_ADDITIONAL_CHECK: usize = 4;

static USE_FD_BACKEND: AtomicBool = AtomicBool::new(true);

/// Route device I/O through pread/pwrite file descriptors (the default).
pub fn enable_fd_backend() {
    USE_FD_BACKEND.store(true, Ordering::Relaxed);
}

/// Route device I/O through a shared mmap of the journal file.
pub fn disable_fd_backend() {
    USE_FD_BACKEND.store(false, Ordering::Relaxed);
}

pub(crate) fn fd_backend_enabled() -> bool {
    USE_FD_BACKEND.load(Ordering::Relaxed)
}

/// Bitmask of the situations in which the logdev is allowed to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushMode(u32);

impl FlushMode {
    /// Flush inline on the appending thread once the threshold is crossed.
    pub const INLINE: FlushMode = FlushMode(1);
    /// Flush from the background timer thread.
    pub const TIMER: FlushMode = FlushMode(2);
    /// Flush only on an explicit `flush_if_necessary` call.
    pub const EXPLICIT: FlushMode = FlushMode(4);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> FlushMode {
        FlushMode(bits & 0x7)
    }

    pub fn contains(self, other: FlushMode) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for FlushMode {
    type Output = FlushMode;
    fn bitor(self, rhs: FlushMode) -> FlushMode {
        FlushMode(self.0 | rhs.0)
    }
}

impl Default for FlushMode {
    fn default() -> Self {
        FlushMode::INLINE | FlushMode::TIMER
    }
}

/// Tunables for the logdev and the write-back cache. Every field can be
/// overridden from the environment; tests construct them directly.
#[derive(Debug, Clone)]
pub struct LogStoreSettings {
    /// Pending bytes after which a flush is triggered.
    pub flush_threshold_size: usize,
    /// Payloads below this size are always packed into the inline area.
    pub optimal_inline_data_size: usize,
    pub flush_mode: FlushMode,
    /// Number of write-back cache flusher threads.
    pub cache_flush_threads: usize,
    /// Upper-layer request timeout, observed by `is_expired`.
    pub repl_req_timeout_sec: u64,
    /// A non-empty pending set older than this is flushed by the timer.
    pub max_time_between_flush_us: u64,
}

impl Default for LogStoreSettings {
    fn default() -> Self {
        Self {
            flush_threshold_size: 64 * 1024,
            optimal_inline_data_size: 512,
            flush_mode: FlushMode::default(),
            cache_flush_threads: 1,
            repl_req_timeout_sec: 300,
            max_time_between_flush_us: 300,
        }
    }
}

impl LogStoreSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            flush_threshold_size: env_parse("CHERT_FLUSH_THRESHOLD_SIZE")
                .unwrap_or(defaults.flush_threshold_size),
            optimal_inline_data_size: env_parse("CHERT_OPTIMAL_INLINE_DATA_SIZE")
                .unwrap_or(defaults.optimal_inline_data_size),
            flush_mode: env_parse::<u32>("CHERT_FLUSH_MODE")
                .map(FlushMode::from_bits)
                .unwrap_or(defaults.flush_mode),
            cache_flush_threads: env_parse("CHERT_CACHE_FLUSH_THREADS")
                .unwrap_or(defaults.cache_flush_threads)
                .max(1),
            repl_req_timeout_sec: env_parse("CHERT_REPL_REQ_TIMEOUT_SEC")
                .unwrap_or(defaults.repl_req_timeout_sec),
            max_time_between_flush_us: env_parse("CHERT_MAX_TIME_BETWEEN_FLUSH_US")
                .unwrap_or(defaults.max_time_between_flush_us),
        }
    }

    /// Threshold on record payload bytes; the header rides along for free.
    pub fn flush_data_threshold_size(&self) -> i64 {
        self.flush_threshold_size as i64 - crate::logdev::group::LOG_GROUP_HDR_SIZE as i64
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

pub(crate) fn chert_data_dir() -> std::path::PathBuf {
    std::env::var("CHERT_DATA_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("chert_files"))
}

pub(crate) fn sanitize_namespace(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.trim_matches('_').is_empty() {
        format!("ns_{:x}", crc32fast::hash(key.as_bytes()))
    } else {
        sanitized
    }
}

pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

pub(crate) fn debug_enabled() -> bool {
    static DEBUG: OnceLock<bool> = OnceLock::new();
    *DEBUG.get_or_init(|| std::env::var("CHERT_DEBUG").is_ok())
}

macro_rules! debug_print {
    ($($arg:tt)*) => {
        if $crate::config::debug_enabled() {
            eprintln!($($arg)*);
        }
    };
}
pub(crate) use debug_print;
