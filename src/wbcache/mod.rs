//! Write-back cache for copy-on-write tree nodes: groups dirty node
//! buffers per checkpoint generation, enforces write-ordering dependencies
//! between them with per-request successor queues and atomic predecessor
//! counters, and reports checkpoint completion once every buffer of a
//! generation is durable.

mod checkpoint;

pub use checkpoint::{Checkpoint, MAX_CP_CNT};

use crate::blkalloc::{BlkId, SharedBlkList};
use crate::config::debug_print;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Success,
    /// The mutator's checkpoint is older than the node's last writer;
    /// retry at a higher layer.
    CpMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WbReqState {
    Init = 0,
    /// Created, waiting for its checkpoint to start.
    Waiting = 1,
    /// Submitted to the block store.
    Sent = 2,
    /// Durable.
    Compl = 3,
}

impl WbReqState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WbReqState::Init,
            1 => WbReqState::Waiting,
            2 => WbReqState::Sent,
            3 => WbReqState::Compl,
            _ => unreachable!("invalid writeback req state"),
        }
    }
}

/// One pending node write pinned to a checkpoint generation.
pub struct WriteBackReq {
    state: AtomicU8,
    bid: BlkId,
    cp: Arc<Checkpoint>,
    node: Arc<NodeBuffer>,
    /// Byte image this request will write; a coalescing re-write within
    /// the same checkpoint swaps it.
    mem: Mutex<Arc<Vec<u8>>>,
    /// Submission trigger: decremented to zero by the flush loop and by
    /// each completing predecessor.
    dependent_cnt: AtomicU32,
    /// Requests that must only be submitted after this one completes.
    req_q: Mutex<VecDeque<Arc<WriteBackReq>>>,
    start_time: Instant,
}

impl WriteBackReq {
    fn new(node: &Arc<NodeBuffer>, cp: &Arc<Checkpoint>) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(WbReqState::Waiting as u8),
            bid: BlkId::new(node.node_id, 1, 0),
            cp: cp.clone(),
            node: node.clone(),
            mem: Mutex::new(node.current_image()),
            dependent_cnt: AtomicU32::new(1),
            req_q: Mutex::new(VecDeque::new()),
            start_time: Instant::now(),
        })
    }

    pub fn state(&self) -> WbReqState {
        WbReqState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WbReqState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn bid(&self) -> BlkId {
        self.bid
    }

    pub fn cp(&self) -> &Arc<Checkpoint> {
        &self.cp
    }

    pub fn node(&self) -> &Arc<NodeBuffer> {
        &self.node
    }

    /// The byte image the block store should persist.
    pub fn mem_image(&self) -> Arc<Vec<u8>> {
        self.mem.lock().unwrap().clone()
    }

    /// Observed by the upper layer against its request timeout.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.start_time.elapsed() > timeout
    }
}

impl Drop for WriteBackReq {
    fn drop(&mut self) {
        let st = self.state();
        debug_assert!(
            st == WbReqState::Compl || st == WbReqState::Init || st == WbReqState::Waiting,
            "writeback req dropped while in flight"
        );
    }
}

/// In-memory buffer of one tree node, shared by the cache, in-flight
/// writes and the tree layer. Holds at most one pending request per
/// checkpoint slot.
pub struct NodeBuffer {
    node_id: u64,
    /// cp_id of the last checkpoint that wrote this node, -1 for none.
    cp_id: AtomicI64,
    buf: Mutex<Arc<Vec<u8>>>,
    req: [Mutex<Option<Arc<WriteBackReq>>>; MAX_CP_CNT],
}

impl NodeBuffer {
    pub fn new(node_id: u64, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            cp_id: AtomicI64::new(-1),
            buf: Mutex::new(Arc::new(data)),
            req: [Mutex::new(None), Mutex::new(None)],
        })
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn last_writer_cp(&self) -> i64 {
        self.cp_id.load(Ordering::Acquire)
    }

    pub fn current_image(&self) -> Arc<Vec<u8>> {
        self.buf.lock().unwrap().clone()
    }

    /// Mutate the node in place (the tree layer's write path). The image
    /// Arc is shared with any in-flight request, so mutation must follow
    /// a successful `refresh_buf`.
    pub fn update(&self, data: Vec<u8>) {
        *self.buf.lock().unwrap() = Arc::new(data);
    }

    pub fn pending_req(&self, slot: usize) -> Option<Arc<WriteBackReq>> {
        self.req[slot].lock().unwrap().clone()
    }
}

/// Block-store seam: submits one node write and reports it back through
/// [`WriteBackCache::write_completion`]. Implementations must not block
/// the completion path.
pub trait NodeBlkStore: Send + Sync {
    fn write_node(&self, req: Arc<WriteBackReq>, cache: Arc<WriteBackCache>);
}

pub type CpCompleteCb = Arc<dyn Fn(&Arc<Checkpoint>) + Send + Sync>;

enum FlushTask {
    Flush(Arc<WriteBackCache>, Arc<Checkpoint>),
    Stop,
}

pub struct WriteBackCache {
    req_list: [Mutex<Vec<Arc<WriteBackReq>>>; MAX_CP_CNT],
    free_list: [Arc<SharedBlkList>; MAX_CP_CNT],
    dirty_buf_cnt: [AtomicU64; MAX_CP_CNT],
    cp_comp_cb: CpCompleteCb,
    blkstore: Arc<dyn NodeBlkStore>,
    flushers: Vec<mpsc::Sender<FlushTask>>,
    flusher_joins: Mutex<Vec<std::thread::JoinHandle<()>>>,
    next_flusher: AtomicUsize,
}

impl WriteBackCache {
    pub fn new(
        blkstore: Arc<dyn NodeBlkStore>,
        cp_comp_cb: CpCompleteCb,
        num_flush_threads: usize,
    ) -> Arc<Self> {
        let mut flushers = Vec::new();
        let mut joins = Vec::new();
        for i in 0..num_flush_threads.max(1) {
            let (tx, rx) = mpsc::channel::<FlushTask>();
            let join = std::thread::Builder::new()
                .name(format!("wbcache_flusher_{}", i))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        match task {
                            FlushTask::Flush(cache, cp) => cache.flush_buffers(&cp),
                            FlushTask::Stop => break,
                        }
                    }
                })
                .expect("failed to spawn wbcache flusher");
            flushers.push(tx);
            joins.push(join);
        }

        Arc::new(Self {
            req_list: [Mutex::new(Vec::new()), Mutex::new(Vec::new())],
            free_list: [SharedBlkList::new(), SharedBlkList::new()],
            dirty_buf_cnt: [AtomicU64::new(0), AtomicU64::new(0)],
            cp_comp_cb,
            blkstore,
            flushers,
            flusher_joins: Mutex::new(joins),
            next_flusher: AtomicUsize::new(0),
        })
    }

    /// Open a new checkpoint generation. Its slot must be fully drained
    /// by the previous generation, and it either gets a fresh free-block
    /// list (when a block-allocator checkpoint is also taken) or inherits
    /// the current one to keep accumulating.
    pub fn prepare_cp(
        &self,
        new_cp: &Arc<Checkpoint>,
        cur_cp: Option<&Arc<Checkpoint>>,
        blkalloc_checkpoint: bool,
    ) {
        let slot = new_cp.slot();
        assert_eq!(
            self.dirty_buf_cnt[slot].load(Ordering::Acquire),
            0,
            "checkpoint slot {} still has dirty buffers",
            slot
        );
        assert!(
            self.req_list[slot].lock().unwrap().is_empty(),
            "checkpoint slot {} still has pending requests",
            slot
        );

        let free_list = match (blkalloc_checkpoint, cur_cp) {
            (false, Some(cur)) => cur
                .free_blkid_list()
                .expect("current checkpoint carries no free list"),
            _ => {
                // The slot's own list; drained by the allocator checkpoint
                // of the generation that used it two cps ago
                let list = self.free_list[slot].clone();
                assert!(list.is_empty(), "free list of slot {} not yet consumed", slot);
                list
            }
        };
        new_cp.set_free_blkid_list(free_list);
    }

    /// Register a dirty node in `cp`, optionally ordered after
    /// `dependent_node`'s write of the same generation.
    pub fn write(
        &self,
        node: &Arc<NodeBuffer>,
        dependent_node: Option<&Arc<NodeBuffer>>,
        cp: &Arc<Checkpoint>,
    ) {
        let slot = cp.slot();
        let wbd_req = dependent_node.map(|dep| {
            dep.req[slot]
                .lock()
                .unwrap()
                .clone()
                .expect("dependent node has no pending request in this checkpoint")
        });

        let req = {
            let mut node_req = node.req[slot].lock().unwrap();
            if let Some(req) = node_req.clone() {
                debug_assert_eq!(req.bid.blk_num, node.node_id);
                // Re-write within the same checkpoint coalesces into the
                // existing request
                *req.mem.lock().unwrap() = node.current_image();
                req
            } else {
                let req = WriteBackReq::new(node, cp);
                *node_req = Some(req.clone());
                node.cp_id.store(cp.cp_id() as i64, Ordering::Release);
                self.req_list[slot].lock().unwrap().push(req.clone());
                self.dirty_buf_cnt[slot].fetch_add(1, Ordering::AcqRel);
                req
            }
        };
        debug_assert_eq!(req.state(), WbReqState::Waiting);

        if let Some(wbd_req) = wbd_req {
            let mut q = wbd_req.req_q.lock().unwrap();
            if wbd_req.state() != WbReqState::Compl {
                req.dependent_cnt.fetch_add(1, Ordering::AcqRel);
                q.push_back(req);
            }
            // A predecessor that already completed imposes no ordering
        }
    }

    /// Called by the tree layer before mutating `node` under `cp`. When
    /// the previous generation still has this node's write in flight, the
    /// live buffer is deep-copied so the in-flight write keeps reading a
    /// stable image.
    pub fn refresh_buf(
        &self,
        node: &Arc<NodeBuffer>,
        is_write_modifiable: bool,
        cp: &Arc<Checkpoint>,
    ) -> CacheStatus {
        let node_cp = node.cp_id.load(Ordering::Acquire);
        if node_cp < 0 {
            return CacheStatus::Success;
        }
        let cp_id = cp.cp_id() as i64;

        if !is_write_modifiable {
            if node_cp > cp_id {
                return CacheStatus::CpMismatch;
            }
            return CacheStatus::Success;
        }
        if node_cp == cp_id {
            // Modifying the buffer multiple times in the same cp
            return CacheStatus::Success;
        }
        if node_cp > cp_id {
            return CacheStatus::CpMismatch;
        }

        let prev_slot = ((cp.cp_id() + (MAX_CP_CNT as u64) - 1) % MAX_CP_CNT as u64) as usize;
        let prev_req = node.req[prev_slot].lock().unwrap().clone();
        match prev_req {
            Some(req) if req.state() != WbReqState::Compl => {
                // Copy-on-write: the in-flight request keeps its Arc to
                // the old bytes while the mutator gets a fresh image
                let mut buf = node.buf.lock().unwrap();
                let copy: Vec<u8> = buf.as_ref().clone();
                *buf = Arc::new(copy);
                debug_print!(
                    "[wbcache] node {} copied for cp {} while cp {} write in flight",
                    node.node_id,
                    cp_id,
                    node_cp
                );
                CacheStatus::Success
            }
            _ => CacheStatus::Success,
        }
    }

    /// Free a node's block. The cache-level free is immediate; the
    /// allocator-level release is deferred through the checkpoint free
    /// list when one is supplied.
    pub fn free_blk(&self, node_id: u64, free_list: Option<&Arc<SharedBlkList>>, nblks: u32) {
        let bid = BlkId::new(node_id, nblks, 0);
        if let Some(list) = free_list {
            list.push(bid);
        }
    }

    /// Kick the checkpoint's flush on one of the flusher threads,
    /// round-robin.
    pub fn cp_start(self: &Arc<Self>, cp: Arc<Checkpoint>) {
        let n = self.flushers.len();
        let which = self.next_flusher.fetch_add(1, Ordering::AcqRel) % n;
        self.flushers[which]
            .send(FlushTask::Flush(self.clone(), cp))
            .expect("wbcache flusher thread is gone");
    }

    /// Drop every request's self-reference; requests with no outstanding
    /// predecessors are submitted. Runs on a flusher thread.
    pub fn flush_buffers(self: &Arc<Self>, cp: &Arc<Checkpoint>) {
        let slot = cp.slot();
        // Pseudo-request representing the running flush loop, so an empty
        // or fast-completing set cannot fire the callback early
        self.dirty_buf_cnt[slot].fetch_add(1, Ordering::AcqRel);

        let reqs = std::mem::take(&mut *self.req_list[slot].lock().unwrap());
        for req in reqs {
            if req.dependent_cnt.fetch_sub(1, Ordering::AcqRel) == 1 {
                req.set_state(WbReqState::Sent);
                self.blkstore.write_node(req, self.clone());
            }
        }

        if self.dirty_buf_cnt[slot].fetch_sub(1, Ordering::AcqRel) == 1 {
            (self.cp_comp_cb)(cp);
        }
    }

    /// I/O completion for one node write. Releases the node slot,
    /// submits any successors whose predecessor count drained, and fires
    /// the checkpoint callback when the generation's dirty count hits
    /// zero. Must stay non-blocking.
    pub fn write_completion(self: &Arc<Self>, req: Arc<WriteBackReq>) {
        let slot = req.cp.slot();
        req.set_state(WbReqState::Compl);

        {
            let mut q = req.req_q.lock().unwrap();
            while let Some(dep) = q.pop_front() {
                if dep.dependent_cnt.fetch_sub(1, Ordering::AcqRel) == 1 {
                    dep.set_state(WbReqState::Sent);
                    self.blkstore.write_node(dep, self.clone());
                }
            }
        }

        *req.node.req[slot].lock().unwrap() = None;

        if self.dirty_buf_cnt[slot].fetch_sub(1, Ordering::AcqRel) == 1 {
            (self.cp_comp_cb)(&req.cp);
        }
    }

    pub fn dirty_buf_count(&self, slot: usize) -> u64 {
        self.dirty_buf_cnt[slot].load(Ordering::Acquire)
    }
}

impl Drop for WriteBackCache {
    fn drop(&mut self) {
        for slot in 0..MAX_CP_CNT {
            debug_assert_eq!(self.dirty_buf_cnt[slot].load(Ordering::Acquire), 0);
            debug_assert!(self.req_list[slot].lock().unwrap().is_empty());
        }
        for tx in &self.flushers {
            let _ = tx.send(FlushTask::Stop);
        }
        let me = std::thread::current().id();
        for join in self.flusher_joins.lock().unwrap().drain(..) {
            if join.thread().id() != me {
                let _ = join.join();
            }
        }
    }
}
