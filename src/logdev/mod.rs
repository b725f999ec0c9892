//! The log device: multiplexes per-stream records onto one journal,
//! batches them into checksum-sealed groups, and replays them on restart.

pub(crate) mod device;
mod flush;
pub(crate) mod group;
pub(crate) mod metadata;
mod recovery;
pub(crate) mod stream;
pub(crate) mod tracker;

pub use flush::FlushGuard;
pub use group::{AppendContext, SerializedLogRecord};

use crate::blkalloc::{AppendBlkAllocator, BlkAllocConfig};
use crate::config::{
    debug_print, now_micros, FlushMode, LogStoreSettings, DMA_ADDRESS_BOUNDARY, INITIAL_READ_SIZE,
};
use crate::logstore::{LogStore, LogStoreFuture};
use crate::paths::DevPathManager;
use crate::storage::Storage;
use crate::superblock::SuperblockStore;
use device::JournalDevice;
use flush::{FlushState, ReentrantFlushMutex};
use group::{round_down, round_up, LogGroupHeader, LogRecord, INVALID_CRC32, LOG_GROUP_HDR_SIZE};
use metadata::{LogDevMetadata, LogStoreSuperblk};
use tracker::RecordTracker;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};

/// Size the journal file is preallocated to at format time.
const JOURNAL_DEV_SIZE: u64 = 32 * 1024 * 1024;

/// Address of one record: its global log idx and the device offset of the
/// group that carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogDevKey {
    pub idx: i64,
    pub dev_offset: u64,
}

impl LogDevKey {
    pub fn new(idx: i64, dev_offset: u64) -> Self {
        Self { idx, dev_offset }
    }
}

impl std::fmt::Display for LogDevKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[idx={} dev_offset={}]", self.idx, self.dev_offset)
    }
}

/// Arguments of the per-record append completion callback.
pub struct AppendCompletion<'a> {
    pub store_id: u32,
    pub seq_num: i64,
    pub ld_key: LogDevKey,
    /// Key of the last record in the same flushed group.
    pub flush_ld_key: LogDevKey,
    /// Records after this one in the same group.
    pub nremaining_in_batch: u32,
    pub context: Option<&'a (dyn std::any::Any + Send + Sync)>,
    /// Set when the group flush failed at the device.
    pub error: Option<&'a io::Error>,
}

/// Arguments of the per-record replay callback.
pub struct LogFoundEntry<'a> {
    pub store_id: u32,
    pub seq_num: i64,
    pub ld_key: LogDevKey,
    pub flush_ld_key: LogDevKey,
    pub data: &'a [u8],
    pub nremaining_in_batch: u32,
}

pub type AppendCompletionCb = Arc<dyn Fn(&AppendCompletion<'_>) + Send + Sync>;
pub type LogFoundCb = Arc<dyn Fn(&LogFoundEntry<'_>) + Send + Sync>;
pub type ReplayDoneCb = Arc<dyn Fn(&Arc<LogStore>) + Send + Sync>;
pub type StoreFoundCb = Arc<dyn Fn(u32) + Send + Sync>;
pub(crate) type FlushBlockedCb = Box<dyn FnOnce() + Send>;

/// Point-in-time view for tests and debugging.
#[derive(Debug, Clone)]
pub struct LogDevStatus {
    pub log_idx: i64,
    pub last_flush_idx: i64,
    pub last_truncate_idx: i64,
    pub pending_flush_size: i64,
    pub journal_head_offset: u64,
    pub journal_tail_offset: u64,
    pub registered_store_ids: Vec<u32>,
}

struct TimerHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: std::thread::JoinHandle<()>,
}

pub struct LogDev {
    logdev_id: u32,
    settings: LogStoreSettings,
    paths: DevPathManager,
    sb_store: Arc<SuperblockStore>,
    flush_size_multiple: u64,

    meta: Mutex<LogDevMetadata>,
    vdev: Mutex<Option<Arc<JournalDevice>>>,

    tracker: Mutex<RecordTracker>,
    log_idx: AtomicI64,
    pending_flush_size: AtomicI64,
    is_flushing: AtomicBool,
    last_flush_idx: AtomicI64,
    last_truncate_idx: AtomicI64,
    last_flush_time_us: AtomicU64,
    last_crc: AtomicU32,
    /// Group start idx -> device offset, for truncation boundaries.
    group_boundaries: Mutex<BTreeMap<i64, u64>>,

    flush_state: Mutex<FlushState>,
    block_flush_q: Mutex<Vec<FlushBlockedCb>>,
    flush_guard_mtx: ReentrantFlushMutex,

    stores: RwLock<HashMap<u32, Arc<LogStore>>>,
    pending_opens: Mutex<Vec<(Arc<LogStore>, LogStoreFuture)>>,
    unopened_store_ids: Mutex<HashSet<u32>>,
    unopened_store_io: Mutex<HashMap<u32, u64>>,
    garbage_store_ids: Mutex<BTreeMap<i64, Vec<u32>>>,

    append_comp_cb: Mutex<Option<AppendCompletionCb>>,
    store_found_cb: Mutex<Option<StoreFoundCb>>,

    timer: Mutex<Option<TimerHandle>>,
    started: AtomicBool,
    stopping: AtomicBool,
    pending_request_num: AtomicU64,
}

struct PendingReqGuard<'a>(&'a AtomicU64);

impl<'a> PendingReqGuard<'a> {
    fn new(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for PendingReqGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl LogDev {
    /// Build a logdev rooted in the default data directory. Nothing
    /// touches the device until [`start`](Self::start).
    pub fn new(logdev_id: u32, settings: LogStoreSettings) -> Arc<Self> {
        Self::with_paths(DevPathManager::default(), logdev_id, settings)
    }

    /// Build a logdev under a namespaced subdirectory of the data dir.
    pub fn new_for_key(key: &str, logdev_id: u32, settings: LogStoreSettings) -> Arc<Self> {
        Self::with_paths(DevPathManager::for_key(key), logdev_id, settings)
    }

    fn with_paths(paths: DevPathManager, logdev_id: u32, settings: LogStoreSettings) -> Arc<Self> {
        let sb_store = Arc::new(SuperblockStore::new(paths.clone()));
        Arc::new(Self {
            logdev_id,
            settings,
            paths,
            sb_store: sb_store.clone(),
            flush_size_multiple: DMA_ADDRESS_BOUNDARY,
            meta: Mutex::new(LogDevMetadata::new(logdev_id, sb_store)),
            vdev: Mutex::new(None),
            tracker: Mutex::new(RecordTracker::new()),
            log_idx: AtomicI64::new(0),
            pending_flush_size: AtomicI64::new(0),
            is_flushing: AtomicBool::new(false),
            last_flush_idx: AtomicI64::new(-1),
            last_truncate_idx: AtomicI64::new(-1),
            last_flush_time_us: AtomicU64::new(0),
            last_crc: AtomicU32::new(INVALID_CRC32),
            group_boundaries: Mutex::new(BTreeMap::new()),
            flush_state: Mutex::new(FlushState::new()),
            block_flush_q: Mutex::new(Vec::new()),
            flush_guard_mtx: ReentrantFlushMutex::new(),
            stores: RwLock::new(HashMap::new()),
            pending_opens: Mutex::new(Vec::new()),
            unopened_store_ids: Mutex::new(HashSet::new()),
            unopened_store_io: Mutex::new(HashMap::new()),
            garbage_store_ids: Mutex::new(BTreeMap::new()),
            append_comp_cb: Mutex::new(None),
            store_found_cb: Mutex::new(None),
            timer: Mutex::new(None),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            pending_request_num: AtomicU64::new(0),
        })
    }

    /// Per-record durability callback; must be registered before `start`.
    pub fn register_append_cb(&self, cb: impl Fn(&AppendCompletion<'_>) + Send + Sync + 'static) {
        *self.append_comp_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Called once per stream id found in the superblock during load.
    pub fn register_store_found_cb(&self, cb: impl Fn(u32) + Send + Sync + 'static) {
        *self.store_found_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Start the logdev: open (or format) the journal, load the
    /// superblocks, replay the log and arm the flush timer. Stores to be
    /// replayed must have been opened before this call.
    pub fn start(self: &Arc<Self>, format: bool) -> io::Result<()> {
        assert!(
            self.append_comp_cb.lock().unwrap().is_some(),
            "append completion callback must be registered before start"
        );

        let journal_path = self.paths.journal_path(self.logdev_id);
        if format || !journal_path.exists() {
            self.paths.create_journal_file(self.logdev_id, JOURNAL_DEV_SIZE)?;
        }
        let storage = Storage::open(&journal_path)?;
        let total_blks = storage.len() / self.flush_size_multiple;
        let allocator = Arc::new(AppendBlkAllocator::new(
            BlkAllocConfig { total_blks, chunk_id: 0, allocator_id: self.logdev_id },
            self.sb_store.clone(),
            format,
        )?);
        let vdev = Arc::new(JournalDevice::new(storage, allocator));
        *self.vdev.lock().unwrap() = Some(vdev);

        self.flush_state
            .lock()
            .unwrap()
            .start(self.flush_size_multiple, self.settings.optimal_inline_data_size);

        if format {
            self.meta.lock().unwrap().create(self.settings.flush_mode)?;
            self.log_idx.store(0, Ordering::Release);
            self.last_flush_idx.store(-1, Ordering::Release);
            self.last_truncate_idx.store(-1, Ordering::Release);
            self.last_crc.store(INVALID_CRC32, Ordering::Release);
            self.tracker.lock().unwrap().reinit(0);
            self.group_boundaries.lock().unwrap().clear();
        } else {
            let found = self.meta.lock().unwrap().load()?;
            for (store_id, sb) in found {
                self.on_log_store_found(store_id, sb);
            }
            let start_offset = self.meta.lock().unwrap().get_start_dev_offset();
            self.do_load(start_offset)?;
            let log_idx = self.log_idx.load(Ordering::Acquire);
            self.tracker.lock().unwrap().reinit(log_idx);
            self.last_flush_idx.store(log_idx - 1, Ordering::Release);
        }

        self.handle_unopened_log_stores(format)?;

        self.stopping.store(false, Ordering::Release);
        self.started.store(true, Ordering::Release);
        self.last_flush_time_us.store(now_micros(), Ordering::Release);

        // Replay is over: arm the open futures and fire replay-done hooks
        let opens = std::mem::take(&mut *self.pending_opens.lock().unwrap());
        for (store, future) in opens {
            store.finish_replay();
            future.fulfill(store);
        }

        if self.allow_timer_flush() {
            self.start_flush_timer();
        }
        Ok(())
    }

    /// Reject new work, drain pending appends, flush the tail and tear
    /// the device state down.
    pub fn stop(&self) -> io::Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        self.stopping.store(true, Ordering::Release);
        while self.pending_request_num.load(Ordering::Acquire) > 0 {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        // Flush whatever is still pending; the CAS may lose to an
        // in-flight flush, in which case wait and retry.
        let mut idle_rounds = 0;
        while self.pending_flush_size.load(Ordering::Acquire) > 0 {
            if self.try_flush_once(-1) {
                idle_rounds = 0;
                continue;
            }
            idle_rounds += 1;
            if idle_rounds > 1000 {
                // Nothing flushable despite pending bytes: accounting
                // would be broken, bail out rather than spin forever
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(
            self.pending_flush_size.load(Ordering::Acquire) == 0,
            "logdev stopped while writes are pending"
        );

        self.stop_flush_timer();

        if let Some(vdev) = self.vdev.lock().unwrap().as_ref() {
            vdev.allocator().cp_flush()?;
        }
        self.meta.lock().unwrap().persist()?;
        self.started.store(false, Ordering::Release);
        Ok(())
    }

    /// Remove every on-disk trace of this logdev.
    pub fn destroy(&self) -> io::Result<()> {
        self.stop()?;
        self.meta.lock().unwrap().destroy()?;
        if let Some(vdev) = self.vdev.lock().unwrap().take() {
            vdev.allocator().destroy()?;
        }
        let journal_path = self.paths.journal_path(self.logdev_id);
        match std::fs::remove_file(journal_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Append one record. Returns its log idx immediately; durability is
    /// reported through the append completion callback.
    pub fn append_async(
        &self,
        store_id: u32,
        seq_num: i64,
        data: &[u8],
        context: Option<AppendContext>,
    ) -> io::Result<i64> {
        if self.is_stopping() {
            return Err(io::Error::new(io::ErrorKind::Other, "logdev is stopping"));
        }
        if !self.started.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "logdev not started"));
        }
        let _guard = PendingReqGuard::new(&self.pending_request_num);

        let idx = self.log_idx.fetch_add(1, Ordering::AcqRel);
        let rec = Arc::new(LogRecord::new(store_id, seq_num, data, context));
        let size = rec.data.len() as i64;
        self.tracker.lock().unwrap().create(idx, rec);
        self.flush_if_needed(size, idx);
        Ok(idx)
    }

    /// Read one record's payload back from the device.
    pub fn read(&self, key: LogDevKey) -> io::Result<Vec<u8>> {
        let (buf, header, rec) = self.read_group_window(key)?;
        let data_off = rec.data_offset(&header);
        let size = rec.size as usize;
        if data_off + size <= buf.len() {
            return Ok(buf[data_off..data_off + size].to_vec());
        }

        // Payload lies outside the initial window: one more aligned read
        let vdev = self.vdev();
        let rounded_off = round_down(data_off as u64, self.flush_size_multiple);
        let rounded_size =
            round_up(data_off as u64 - rounded_off + size as u64, self.flush_size_multiple);
        let mut rbuf = vec![0u8; rounded_size as usize];
        vdev.pread(key.dev_offset + rounded_off, &mut rbuf)?;
        let start = (data_off as u64 - rounded_off) as usize;
        Ok(rbuf[start..start + size].to_vec())
    }

    /// Read just the record slot for `key`.
    pub fn read_record_header(&self, key: LogDevKey) -> io::Result<SerializedLogRecord> {
        let (_, _, rec) = self.read_group_window(key)?;
        Ok(rec)
    }

    fn read_group_window(
        &self,
        key: LogDevKey,
    ) -> io::Result<(Vec<u8>, LogGroupHeader, SerializedLogRecord)> {
        let vdev = self.vdev();
        let window = INITIAL_READ_SIZE.min(vdev.size() - key.dev_offset);
        let mut buf = vec![0u8; window as usize];
        vdev.pread(key.dev_offset, &mut buf)?;

        let header = LogGroupHeader::decode(&buf[..LOG_GROUP_HDR_SIZE]);
        assert!(
            header.magic_ok(),
            "log group header corrupted with magic mismatch at dev offset {}",
            key.dev_offset
        );
        assert!(
            header.start_log_idx <= key.idx
                && key.idx < header.start_log_idx + header.n_records as i64,
            "log key {} does not address group starting at idx {} with {} records",
            key,
            header.start_log_idx,
            header.n_records
        );

        // Full CRC validation only when the whole group is already in the
        // window; larger groups are validated during recovery instead.
        if header.group_size as u64 <= window {
            let crc = header.compute_crc_of(&buf[..header.group_size as usize]);
            assert_eq!(crc, header.cur_grp_crc, "crc mismatch on read at {}", key);
        }

        let rec =
            LogGroupHeader::nth_record(&buf, (key.idx - header.start_log_idx) as usize);
        Ok((buf, header, rec))
    }

    /// Invalidate `[range.0, range.1]` for one stream. Persisted
    /// synchronously; replay skips the range from then on.
    pub fn rollback(&self, store_id: u32, range: (i64, i64)) -> bool {
        match self.meta.lock().unwrap().add_rollback_record(store_id, range, true) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(store_id, ?range, "rollback record persist failed: {}", e);
                false
            }
        }
    }

    /// Find the safest truncation point across every open store, drop the
    /// tracker prefix and advance the journal head. Returns how many
    /// records were truncated.
    pub fn truncate(self: &Arc<Self>) -> io::Result<u64> {
        if !self.started.load(Ordering::Acquire) {
            return Ok(0);
        }
        let (tx, rx) = mpsc::channel();
        let me = self.clone();
        self.try_lock_flush(Box::new(move || {
            let _ = tx.send(me.truncate_locked());
        }));
        rx.recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "truncation callback dropped"))?
    }

    fn truncate_locked(&self) -> io::Result<u64> {
        let trunc_idx = {
            let stores = self.stores.read().unwrap();
            if stores.is_empty() {
                self.last_flush_idx.load(Ordering::Acquire)
            } else {
                stores.values().map(|s| s.truncation_point()).min().unwrap()
            }
        };
        if trunc_idx <= self.last_truncate_idx.load(Ordering::Acquire) {
            return Ok(0);
        }

        let count = self.tracker.lock().unwrap().truncate(trunc_idx);

        // The new scan start is the group containing the first live idx
        {
            let mut boundaries = self.group_boundaries.lock().unwrap();
            if let Some((&start_idx, &offset)) =
                boundaries.range(..=trunc_idx + 1).next_back()
            {
                let mut meta = self.meta.lock().unwrap();
                meta.set_start_dev_offset(offset, start_idx, true)?;
                drop(meta);
                self.vdev().truncate(offset)?;
                boundaries.retain(|&idx, _| idx >= start_idx);
            }
        }

        self.last_truncate_idx.store(trunc_idx, Ordering::Release);

        let mut meta = self.meta.lock().unwrap();
        meta.remove_rollback_record_upto(trunc_idx, true)?;

        // Stores removed earlier are finally unreserved once the log has
        // moved past them
        {
            let mut garbage = self.garbage_store_ids.lock().unwrap();
            let expired: Vec<i64> =
                garbage.range(..=trunc_idx).map(|(idx, _)| *idx).collect();
            for idx in expired {
                if let Some(ids) = garbage.remove(&idx) {
                    for id in ids {
                        meta.unreserve_store(id, false)?;
                    }
                }
            }
        }

        // Capture each store's truncation cursor in its superblock
        for (id, store) in self.stores.read().unwrap().iter() {
            meta.update_store_superblk(
                *id,
                LogStoreSuperblk { truncated_upto_seq: store.truncated_upto_seq() },
                false,
            )?;
        }
        meta.persist()?;

        tracing::info!(
            logdev_id = self.logdev_id,
            trunc_idx,
            count,
            "logdev truncated"
        );
        Ok(count)
    }

    ///////////////// Logstore management ///////////////////////

    /// Create a brand-new stream on this logdev.
    pub fn create_new_log_store(self: &Arc<Self>, append_mode: bool) -> io::Result<Arc<LogStore>> {
        if !self.started.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "logdev not started"));
        }
        let store_id = self.meta.lock().unwrap().reserve_store(true)?;
        let store = LogStore::new(store_id, append_mode, Arc::downgrade(self), None, None);
        self.stores.write().unwrap().insert(store_id, store.clone());
        debug_print!("[logdev] created log store {}", store_id);
        Ok(store)
    }

    /// Open a stream that exists in the superblock. Call before `start`;
    /// the returned future is armed once replay has finished.
    pub fn open_log_store(
        self: &Arc<Self>,
        store_id: u32,
        append_mode: bool,
        log_found_cb: Option<LogFoundCb>,
        replay_done_cb: Option<ReplayDoneCb>,
    ) -> io::Result<LogStoreFuture> {
        let store = LogStore::new(
            store_id,
            append_mode,
            Arc::downgrade(self),
            log_found_cb,
            replay_done_cb,
        );
        let future = LogStoreFuture::new();
        if self.started.load(Ordering::Acquire) {
            let sb = {
                let meta = self.meta.lock().unwrap();
                if !meta.is_store_reserved(store_id) {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("log store {} was never created", store_id),
                    ));
                }
                meta.store_superblk(store_id)
            };
            store.seed_from_superblk(sb);
            self.stores.write().unwrap().insert(store_id, store.clone());
            store.finish_replay();
            future.fulfill(store);
        } else {
            self.stores.write().unwrap().insert(store_id, store.clone());
            self.pending_opens.lock().unwrap().push((store, future.clone()));
        }
        Ok(future)
    }

    /// Drop a stream. Its id is garbage until the next truncation moves
    /// past everything it wrote.
    pub fn remove_log_store(&self, store_id: u32) -> bool {
        let removed = self.stores.write().unwrap().remove(&store_id);
        if removed.is_none() {
            return false;
        }
        let at_idx = self.log_idx.load(Ordering::Acquire);
        self.garbage_store_ids.lock().unwrap().entry(at_idx).or_default().push(store_id);
        debug_print!("[logdev] removed log store {} at idx {}", store_id, at_idx);
        true
    }

    /// All ids currently reserved, and the subset waiting for garbage
    /// collection at the next truncation.
    pub fn get_registered_store_ids(&self, registered: &mut Vec<u32>, garbage: &mut Vec<u32>) {
        registered.clear();
        registered.extend(self.meta.lock().unwrap().reserved_store_ids());
        garbage.clear();
        for ids in self.garbage_store_ids.lock().unwrap().values() {
            garbage.extend(ids.iter().copied());
        }
    }

    pub fn get_status(&self) -> LogDevStatus {
        let (head, tail) = match self.vdev.lock().unwrap().as_ref() {
            Some(vdev) => (vdev.head_offset(), vdev.tail_offset()),
            None => (0, 0),
        };
        LogDevStatus {
            log_idx: self.log_idx.load(Ordering::Acquire),
            last_flush_idx: self.last_flush_idx.load(Ordering::Acquire),
            last_truncate_idx: self.last_truncate_idx.load(Ordering::Acquire),
            pending_flush_size: self.pending_flush_size.load(Ordering::Acquire),
            journal_head_offset: head,
            journal_tail_offset: tail,
            registered_store_ids: self.meta.lock().unwrap().reserved_store_ids(),
        }
    }

    pub fn get_id(&self) -> u32 {
        self.logdev_id
    }

    pub fn get_flush_size_multiple(&self) -> u64 {
        self.flush_size_multiple
    }

    ///////////////// internal ///////////////////////

    fn on_log_store_found(&self, store_id: u32, sb: LogStoreSuperblk) {
        if let Some(cb) = self.store_found_cb.lock().unwrap().clone() {
            cb(store_id);
        }
        let stores = self.stores.read().unwrap();
        match stores.get(&store_id) {
            Some(store) => store.seed_from_superblk(sb),
            None => {
                self.unopened_store_ids.lock().unwrap().insert(store_id);
            }
        }
    }

    /// Stores present in the superblock but never opened are dropped and
    /// their ids released.
    fn handle_unopened_log_stores(&self, _format: bool) -> io::Result<()> {
        let unopened: Vec<u32> =
            self.unopened_store_ids.lock().unwrap().drain().collect();
        if unopened.is_empty() {
            return Ok(());
        }
        let io_counts = std::mem::take(&mut *self.unopened_store_io.lock().unwrap());
        let mut meta = self.meta.lock().unwrap();
        for id in unopened {
            tracing::info!(
                store_id = id,
                replayed_records = io_counts.get(&id).copied().unwrap_or(0),
                "removing log store that was not opened before start"
            );
            meta.unreserve_store(id, false)?;
        }
        meta.persist()
    }

    pub(crate) fn vdev(&self) -> Arc<JournalDevice> {
        self.vdev
            .lock()
            .unwrap()
            .as_ref()
            .expect("logdev not started")
            .clone()
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn allow_inline_flush(&self) -> bool {
        self.settings.flush_mode.contains(FlushMode::INLINE)
    }

    fn allow_timer_flush(&self) -> bool {
        self.settings.flush_mode.contains(FlushMode::TIMER)
    }
}

impl Drop for LogDev {
    fn drop(&mut self) {
        self.stop_flush_timer();
    }
}
