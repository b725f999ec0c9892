//! # chert
//!
//! The on-device persistence core of a block-addressable storage engine:
//! a group-committed write-ahead journal ([`LogDev`]), the append block
//! allocator that backs it, and a checkpointed write-back cache for
//! copy-on-write tree nodes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chert::{LogDev, LogStoreSettings};
//!
//! # fn main() -> std::io::Result<()> {
//! // Format a fresh logdev in the data directory
//! let logdev = LogDev::new_for_key("demo", 0, LogStoreSettings::default());
//! logdev.register_append_cb(|completion| {
//!     println!("record {} is durable at {}", completion.seq_num, completion.ld_key);
//! });
//! logdev.start(true)?;
//!
//! // Create a stream and append a record; durability is reported through
//! // the append completion callback
//! let store = logdev.create_new_log_store(true)?;
//! store.append_async(b"hello chert", None)?;
//!
//! logdev.flush_if_necessary(Some(0));
//! logdev.stop()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Flush modes
//!
//! The journal flushes inline on the appending thread, from a background
//! timer, on explicit request, or any combination:
//!
//! ```rust,no_run
//! use chert::{FlushMode, LogStoreSettings};
//!
//! let mut settings = LogStoreSettings::default();
//! settings.flush_mode = FlushMode::EXPLICIT;
//! ```

pub mod blkalloc;
pub mod config;
pub mod logdev;
pub mod logstore;
mod paths;
mod storage;
mod superblock;
pub mod wbcache;

pub use blkalloc::{
    AppendBlkAllocator, BlkAllocCheckpoint, BlkAllocConfig, BlkAllocHints, BlkAllocStatus, BlkId,
    SharedBlkList,
};
pub use config::{disable_fd_backend, enable_fd_backend, FlushMode, LogStoreSettings};
pub use logdev::{
    AppendCompletion, AppendCompletionCb, AppendContext, FlushGuard, LogDev, LogDevKey,
    LogDevStatus, LogFoundCb, LogFoundEntry, ReplayDoneCb, SerializedLogRecord, StoreFoundCb,
};
pub use logstore::{LogStore, LogStoreFuture};
pub use wbcache::{
    CacheStatus, Checkpoint, CpCompleteCb, NodeBlkStore, NodeBuffer, WbReqState, WriteBackCache,
    WriteBackReq, MAX_CP_CNT,
};

#[doc(hidden)]
pub fn __set_thread_namespace_for_tests(key: &str) {
    paths::set_thread_namespace(key);
}

#[doc(hidden)]
pub fn __clear_thread_namespace_for_tests() {
    paths::clear_thread_namespace();
}
