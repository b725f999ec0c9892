//! Per-stream handle over a shared logdev: seq-num allocation, reads by
//! seq, replay dispatch and the stream's safe truncation point.

use crate::config::debug_print;
use crate::logdev::{
    AppendContext, LogDev, LogDevKey, LogFoundCb, LogFoundEntry, ReplayDoneCb,
};
use crate::logdev::metadata::LogStoreSuperblk;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

pub struct LogStore {
    store_id: u32,
    append_mode: bool,
    logdev: Weak<LogDev>,

    next_seq: AtomicI64,
    truncated_upto_seq: AtomicI64,
    /// Highest logdev idx this stream allows the device to truncate.
    safe_trunc_idx: AtomicI64,
    seq_to_key: Mutex<BTreeMap<i64, LogDevKey>>,

    log_found_cb: Mutex<Option<LogFoundCb>>,
    replay_done_cb: Mutex<Option<ReplayDoneCb>>,
}

impl LogStore {
    pub(crate) fn new(
        store_id: u32,
        append_mode: bool,
        logdev: Weak<LogDev>,
        log_found_cb: Option<LogFoundCb>,
        replay_done_cb: Option<ReplayDoneCb>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store_id,
            append_mode,
            logdev,
            next_seq: AtomicI64::new(0),
            truncated_upto_seq: AtomicI64::new(-1),
            safe_trunc_idx: AtomicI64::new(-1),
            seq_to_key: Mutex::new(BTreeMap::new()),
            log_found_cb: Mutex::new(log_found_cb),
            replay_done_cb: Mutex::new(replay_done_cb),
        })
    }

    pub fn store_id(&self) -> u32 {
        self.store_id
    }

    pub fn is_append_mode(&self) -> bool {
        self.append_mode
    }

    fn logdev(&self) -> io::Result<Arc<LogDev>> {
        self.logdev
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "logdev is gone"))
    }

    /// Append with the next stream seq num. Only valid on append-mode
    /// stores.
    pub fn append_async(&self, data: &[u8], context: Option<AppendContext>) -> io::Result<i64> {
        if !self.append_mode {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "append_async on a non append-mode store",
            ));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        self.logdev()?.append_async(self.store_id, seq, data, context)?;
        Ok(seq)
    }

    /// Write at a caller-chosen seq num. Only valid on non-append stores.
    pub fn write_async(
        &self,
        seq_num: i64,
        data: &[u8],
        context: Option<AppendContext>,
    ) -> io::Result<()> {
        if self.append_mode {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "write_async on an append-mode store",
            ));
        }
        self.next_seq.fetch_max(seq_num + 1, Ordering::AcqRel);
        self.logdev()?.append_async(self.store_id, seq_num, data, context)?;
        Ok(())
    }

    /// Read a flushed record back by seq num.
    pub fn read_sync(&self, seq_num: i64) -> io::Result<Vec<u8>> {
        let key = self
            .seq_to_key
            .lock()
            .unwrap()
            .get(&seq_num)
            .copied()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!(
                        "seq {} of store {} is not readable (never flushed or truncated)",
                        seq_num, self.store_id
                    ),
                )
            })?;
        self.logdev()?.read(key)
    }

    /// Publish the stream's safe truncation point: everything at or below
    /// `upto_seq` may go when the device next truncates.
    pub fn truncate(&self, upto_seq: i64) {
        let mut keys = self.seq_to_key.lock().unwrap();
        let mut max_idx = self.safe_trunc_idx.load(Ordering::Acquire);
        let drained: Vec<i64> = keys
            .range(..=upto_seq)
            .map(|(seq, key)| {
                max_idx = max_idx.max(key.idx);
                *seq
            })
            .collect();
        for seq in drained {
            keys.remove(&seq);
        }
        drop(keys);
        self.safe_trunc_idx.fetch_max(max_idx, Ordering::AcqRel);
        self.truncated_upto_seq.fetch_max(upto_seq, Ordering::AcqRel);
        debug_print!(
            "[logstore {}] truncation point seq={} logdev_idx={}",
            self.store_id,
            upto_seq,
            max_idx
        );
    }

    pub fn truncated_upto_seq(&self) -> i64 {
        self.truncated_upto_seq.load(Ordering::Acquire)
    }

    /// Next seq num this stream would assign.
    pub fn tail_seq(&self) -> i64 {
        self.next_seq.load(Ordering::Acquire)
    }

    pub(crate) fn truncation_point(&self) -> i64 {
        self.safe_trunc_idx.load(Ordering::Acquire)
    }

    pub(crate) fn seed_from_superblk(&self, sb: LogStoreSuperblk) {
        self.truncated_upto_seq.store(sb.truncated_upto_seq, Ordering::Release);
        self.next_seq.fetch_max(sb.truncated_upto_seq + 1, Ordering::AcqRel);
    }

    pub(crate) fn on_append_completed(&self, seq_num: i64, ld_key: LogDevKey) {
        if seq_num > self.truncated_upto_seq.load(Ordering::Acquire) {
            self.seq_to_key.lock().unwrap().insert(seq_num, ld_key);
        }
    }

    pub(crate) fn on_log_found(&self, entry: &LogFoundEntry<'_>) {
        if entry.seq_num <= self.truncated_upto_seq.load(Ordering::Acquire) {
            return;
        }
        self.seq_to_key.lock().unwrap().insert(entry.seq_num, entry.ld_key);
        self.next_seq.fetch_max(entry.seq_num + 1, Ordering::AcqRel);
        if let Some(cb) = self.log_found_cb.lock().unwrap().clone() {
            cb(entry);
        }
    }

    pub(crate) fn finish_replay(self: &Arc<Self>) {
        if let Some(cb) = self.replay_done_cb.lock().unwrap().clone() {
            cb(self);
        }
    }
}

/// Waitable handle returned by `open_log_store`, armed when replay for
/// the stream has finished.
#[derive(Clone)]
pub struct LogStoreFuture {
    inner: Arc<(Mutex<Option<Arc<LogStore>>>, Condvar)>,
}

impl LogStoreFuture {
    pub(crate) fn new() -> Self {
        Self { inner: Arc::new((Mutex::new(None), Condvar::new())) }
    }

    pub(crate) fn fulfill(&self, store: Arc<LogStore>) {
        let (slot, cv) = &*self.inner;
        *slot.lock().unwrap() = Some(store);
        cv.notify_all();
    }

    /// Block until replay finished and the store is usable.
    pub fn wait(&self) -> Arc<LogStore> {
        let (slot, cv) = &*self.inner;
        let mut guard = slot.lock().unwrap();
        while guard.is_none() {
            guard = cv.wait(guard).unwrap();
        }
        guard.as_ref().unwrap().clone()
    }

    pub fn try_get(&self) -> Option<Arc<LogStore>> {
        self.inner.0.lock().unwrap().clone()
    }
}
