//! Flush scheduling: threshold and timer triggers, the single-flush-in-
//! flight CAS, group preparation and submission, completion callbacks and
//! the blocked-flush queue.

use super::group::LogGroup;
use super::{AppendCompletion, FlushBlockedCb, LogDev, LogDevKey};
use crate::config::{debug_print, now_micros, MAX_LOG_GROUP};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// The double-buffered group pool. Only the thread that won the flush CAS
/// touches it.
pub(crate) struct FlushState {
    groups: [LogGroup; MAX_LOG_GROUP],
    cur: usize,
}

impl FlushState {
    pub(crate) fn new() -> Self {
        Self { groups: [LogGroup::new(), LogGroup::new()], cur: 0 }
    }

    pub(crate) fn start(&mut self, flush_size_multiple: u64, optimal_inline_data_size: usize) {
        for lg in &mut self.groups {
            lg.start(flush_size_multiple, optimal_inline_data_size);
        }
    }
}

/// Recursive lock for the flush path: inline flush completion callbacks
/// may append, which may flush again on the same thread.
pub(crate) struct ReentrantFlushMutex {
    state: Mutex<OwnerState>,
    cv: Condvar,
}

struct OwnerState {
    owner: Option<thread::ThreadId>,
    depth: usize,
}

/// RAII guard for [`LogDev::flush_guard`]; while held, no other thread
/// can enter a guarded flush section.
pub struct FlushGuard<'a> {
    mtx: &'a ReentrantFlushMutex,
}

impl ReentrantFlushMutex {
    pub(crate) fn new() -> Self {
        Self { state: Mutex::new(OwnerState { owner: None, depth: 0 }), cv: Condvar::new() }
    }

    pub(crate) fn lock(&self) -> FlushGuard<'_> {
        let me = thread::current().id();
        let mut st = self.state.lock().unwrap();
        loop {
            match st.owner {
                None => {
                    st.owner = Some(me);
                    st.depth = 1;
                    break;
                }
                Some(owner) if owner == me => {
                    st.depth += 1;
                    break;
                }
                Some(_) => st = self.cv.wait(st).unwrap(),
            }
        }
        FlushGuard { mtx: self }
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.mtx.state.lock().unwrap();
        st.depth -= 1;
        if st.depth == 0 {
            st.owner = None;
            self.mtx.cv.notify_one();
        }
    }
}

impl LogDev {
    /// Account `new_record_size` and flush inline when the pending bytes
    /// cross the threshold (or have been waiting too long).
    pub(crate) fn flush_if_needed(&self, new_record_size: i64, new_idx: i64) {
        let pending =
            self.pending_flush_size.fetch_add(new_record_size, Ordering::Relaxed) + new_record_size;
        if !self.allow_inline_flush() {
            return;
        }
        let threshold = self.settings.flush_data_threshold_size().max(1);
        let elapsed =
            now_micros().saturating_sub(self.last_flush_time_us.load(Ordering::Relaxed));
        if pending >= threshold
            || (pending > 0 && elapsed > self.settings.max_time_between_flush_us)
        {
            self.try_flush_once(new_idx);
        }
    }

    /// Explicit flush request. With `threshold_size = Some(0)` anything
    /// pending goes out. Returns whether a flush was performed.
    pub fn flush_if_necessary(&self, threshold_size: Option<i64>) -> bool {
        if !self.started.load(Ordering::Acquire) {
            return false;
        }
        let threshold =
            threshold_size.unwrap_or_else(|| self.settings.flush_data_threshold_size());
        let pending = self.pending_flush_size.load(Ordering::Acquire);
        if pending > 0 && pending >= threshold {
            self.try_flush_once(-1)
        } else {
            false
        }
    }

    /// Externally visible lock excluding any guarded flush section.
    pub fn flush_guard(&self) -> FlushGuard<'_> {
        self.flush_guard_mtx.lock()
    }

    /// Flush while holding the reentrant guard. The guard allows the same
    /// thread to re-enter when an append inside a completion callback
    /// triggers another flush.
    pub fn flush_under_guard(&self) -> bool {
        let _guard = self.flush_guard();
        self.try_flush_once(-1)
    }

    /// Compete for the flush lock; the loser returns immediately and the
    /// in-flight flush chains any remainder.
    pub(crate) fn try_flush_once(&self, idx_hint: i64) -> bool {
        if self
            .is_flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug_print!("[logdev] back to back flush, letting the current flush chain");
            return false;
        }
        let flushed = self.flush_with_lock_held(idx_hint);
        self.unlock_flush();
        flushed
    }

    fn flush_with_lock_held(&self, idx_hint: i64) -> bool {
        let vdev = self.vdev();
        let mut state = self.flush_state.lock().unwrap();
        let last_flush_idx = self.last_flush_idx.load(Ordering::Acquire);
        let upto_hint = if idx_hint == -1 {
            self.log_idx.load(Ordering::Acquire) - 1
        } else {
            idx_hint
        };
        // A few extra slots in case of parallel appends landing meanwhile
        let estimated = (upto_hint - last_flush_idx + 4).max(1) as usize;

        let cur = state.cur;
        let (from, upto, group_size, offset) = {
            let lg = &mut state.groups[cur];
            lg.reset(estimated);
            {
                let tracker = self.tracker.lock().unwrap();
                for (idx, rec) in tracker.active_from(last_flush_idx + 1) {
                    if !lg.add_record(&rec, idx) {
                        break;
                    }
                }
            }
            if lg.nrecords() == 0 {
                return false;
            }
            let group_size = lg.finish(self.logdev_id, self.last_crc.load(Ordering::Acquire));
            let offset = match vdev.alloc_next_append_blk(group_size as u64) {
                Ok(off) => off,
                Err(e) => {
                    // Records stay in the tracker; the next flush retries
                    tracing::error!("journal allocation failed during flush: {}", e);
                    return false;
                }
            };
            lg.log_dev_offset = offset;
            (lg.flush_log_idx_from, lg.flush_log_idx_upto, group_size, offset)
        };

        self.pending_flush_size
            .fetch_sub(state.groups[cur].actual_data_size() as i64, Ordering::Relaxed);
        self.last_flush_time_us.store(now_micros(), Ordering::Relaxed);
        debug_print!(
            "[logdev] flushing log_idx [{} - {}] ({} bytes) at dev offset {}",
            from,
            upto,
            group_size,
            offset
        );

        let write_res = {
            let lg = &state.groups[cur];
            let iovs = lg.iovecs();
            vdev.pwritev(offset, &iovs).and_then(|_| vdev.sync())
        };

        match write_res {
            Ok(()) => {
                vdev.commit_blk(offset, group_size as u64);
                self.on_flush_completion(&mut state);
                true
            }
            Err(e) => {
                self.on_flush_failure(&mut state, &e);
                false
            }
        }
    }

    fn on_flush_completion(&self, state: &mut FlushState) {
        let lg = &state.groups[state.cur];
        let from = lg.flush_log_idx_from;
        let upto = lg.flush_log_idx_upto;
        let offset = lg.log_dev_offset;
        let cur_crc = lg.header().cur_grp_crc;

        let records = self.tracker.lock().unwrap().complete_range(from, upto);
        self.last_flush_idx.store(upto, Ordering::Release);
        self.group_boundaries.lock().unwrap().insert(from, offset);

        let flush_ld_key = LogDevKey::new(upto, offset);
        let cb = self.append_comp_cb.lock().unwrap().clone();
        for (i, rec) in records.iter().enumerate() {
            let idx = from + i as i64;
            let ld_key = LogDevKey::new(idx, offset);
            if let Some(store) = self.stores.read().unwrap().get(&rec.store_id).cloned() {
                store.on_append_completed(rec.seq_num, ld_key);
            }
            if let Some(cb) = &cb {
                cb(&AppendCompletion {
                    store_id: rec.store_id,
                    seq_num: rec.seq_num,
                    ld_key,
                    flush_ld_key,
                    nremaining_in_batch: (upto - idx) as u32,
                    context: rec.context.as_deref(),
                    error: None,
                });
            }
        }

        self.last_crc.store(cur_crc, Ordering::Release);
        state.cur = (state.cur + 1) % MAX_LOG_GROUP;
    }

    /// A failed group write: nothing is marked complete, the pending size
    /// is restored for retry, and the error surfaces through the append
    /// callback of every record in the group.
    fn on_flush_failure(&self, state: &mut FlushState, err: &io::Error) {
        let lg = &state.groups[state.cur];
        let from = lg.flush_log_idx_from;
        let upto = lg.flush_log_idx_upto;
        let offset = lg.log_dev_offset;
        self.pending_flush_size
            .fetch_add(lg.actual_data_size() as i64, Ordering::Relaxed);
        tracing::error!("flush of log_idx [{} - {}] failed: {}", from, upto, err);

        let records = self.tracker.lock().unwrap().active_from(from);
        let flush_ld_key = LogDevKey::new(upto, offset);
        let cb = self.append_comp_cb.lock().unwrap().clone();
        if let Some(cb) = &cb {
            for (idx, rec) in records.iter().filter(|(idx, _)| *idx <= upto) {
                cb(&AppendCompletion {
                    store_id: rec.store_id,
                    seq_num: rec.seq_num,
                    ld_key: LogDevKey::new(*idx, offset),
                    flush_ld_key,
                    nremaining_in_batch: (upto - idx) as u32,
                    context: rec.context.as_deref(),
                    error: Some(err),
                });
            }
        }
    }

    /// Run `cb` holding the flush lock. If a flush is in flight the
    /// callback queues and runs right before the lock is released.
    pub(crate) fn try_lock_flush(&self, cb: FlushBlockedCb) -> bool {
        let mut q = self.block_flush_q.lock().unwrap();
        if self
            .is_flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            drop(q);
            cb();
            self.unlock_flush();
            true
        } else {
            q.push(cb);
            false
        }
    }

    /// Drain the blocked-flush queue, release the flush lock and chain
    /// another flush if enough accumulated meanwhile.
    pub(crate) fn unlock_flush(&self) {
        loop {
            let cbs: Vec<FlushBlockedCb> = {
                let mut q = self.block_flush_q.lock().unwrap();
                if q.is_empty() {
                    // Clearing under the queue lock closes the race with
                    // try_lock_flush enqueueing concurrently
                    self.is_flushing.store(false, Ordering::Release);
                    break;
                }
                std::mem::take(&mut *q)
            };
            for cb in cbs {
                cb();
            }
        }

        if self.allow_inline_flush() {
            let pending = self.pending_flush_size.load(Ordering::Relaxed);
            let threshold = self.settings.flush_data_threshold_size().max(1);
            if pending >= threshold {
                self.try_flush_once(-1);
            }
        }
    }

    ///////////////// flush timer ///////////////////////

    pub(crate) fn start_flush_timer(self: &std::sync::Arc<Self>) {
        let (tx, rx) = mpsc::channel::<()>();
        let weak = std::sync::Arc::downgrade(self);
        let period =
            Duration::from_micros(self.settings.max_time_between_flush_us.max(1000));
        let join = thread::spawn(move || loop {
            match rx.recv_timeout(period) {
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                // Shutdown message or sender dropped
                _ => break,
            }
            match weak.upgrade() {
                Some(logdev) => logdev.timer_flush(),
                None => break,
            }
        });
        *self.timer.lock().unwrap() = Some(super::TimerHandle { shutdown_tx: tx, join });
    }

    fn timer_flush(&self) {
        if !self.started.load(Ordering::Acquire) || self.is_stopping() {
            return;
        }
        let pending = self.pending_flush_size.load(Ordering::Acquire);
        let elapsed =
            now_micros().saturating_sub(self.last_flush_time_us.load(Ordering::Relaxed));
        if pending > 0 && elapsed > self.settings.max_time_between_flush_us {
            self.try_flush_once(-1);
        }
    }

    pub(crate) fn stop_flush_timer(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            let _ = handle.shutdown_tx.send(());
            // The last Arc can be dropped by the timer thread itself
            if handle.join.thread().id() != thread::current().id() {
                let _ = handle.join.join();
            }
        }
    }
}
