//! Append block allocator: monotonically increasing offsets within one
//! chunk, with a cache-side offset for the current run and a disk-side
//! commit offset that is the only thing checkpointed. Space freed through
//! [`free`](AppendBlkAllocator::free) is accounted, never reused.

use crate::config::debug_print;
use crate::superblock::SuperblockStore;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) const APPEND_BLKALLOC_SB_MAGIC: u32 = 0xBA1C_F00D;
pub(crate) const APPEND_BLKALLOC_SB_VERSION: u32 = 1;
const APPEND_BLKALLOC_SB_SIZE: usize = 28;

/// Most blocks a single `BlkId` can carry, limited by its on-wire count
/// field.
pub const MAX_BLKS_PER_BLKID: u32 = (1 << 16) - 1;

/// Address of a contiguous run of blocks within a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkId {
    pub blk_num: u64,
    pub nblks: u32,
    pub chunk_id: u16,
}

impl BlkId {
    pub fn new(blk_num: u64, nblks: u32, chunk_id: u16) -> Self {
        Self { blk_num, nblks, chunk_id }
    }

    /// First block past this run.
    pub fn end_blk_num(&self) -> u64 {
        self.blk_num + self.nblks as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkAllocStatus {
    /// Capacity minus the caller's reservation cannot fit the request.
    SpaceFull,
    /// The request exceeds the per-BlkId encoding limit.
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BlkAllocHints {
    /// Blocks the caller wants kept aside; allocation fails with
    /// `SpaceFull` rather than eat into them.
    pub reserved_blks: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BlkAllocConfig {
    pub total_blks: u64,
    pub chunk_id: u16,
    pub allocator_id: u32,
}

/// Thread-safe list of block ids, shared between a checkpoint and the
/// write-back cache that fills it.
#[derive(Debug, Default)]
pub struct SharedBlkList {
    inner: Mutex<Vec<BlkId>>,
}

impl SharedBlkList {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, bid: BlkId) {
        self.inner.lock().unwrap().push(bid);
    }

    pub fn drain(&self) -> Vec<BlkId> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The allocator itself. `last_append_offset` tracks what this run has
/// handed out; `commit_offset` trails it and only ever moves forward when
/// a caller confirms the blocks reached disk.
#[derive(Debug)]
pub struct AppendBlkAllocator {
    total_blks: u64,
    chunk_id: u16,
    allocator_id: u32,
    last_append_offset: AtomicU64,
    commit_offset: AtomicU64,
    sb_commit_offset: AtomicU64,
    freeable_nblks: AtomicU64,
    is_dirty: AtomicBool,
    sb_store: Arc<SuperblockStore>,
}

impl AppendBlkAllocator {
    /// Stand-alone allocator rooted in `dir`, persisting its superblock
    /// there.
    pub fn open(
        cfg: BlkAllocConfig,
        dir: impl Into<std::path::PathBuf>,
        need_format: bool,
    ) -> io::Result<Arc<Self>> {
        let sb_store = Arc::new(SuperblockStore::new(crate::paths::DevPathManager::new(dir.into())));
        Ok(Arc::new(Self::new(cfg, sb_store, need_format)?))
    }

    /// Create the allocator. With `need_format` the offsets start at zero;
    /// otherwise the superblock, if present, seeds both offsets from the
    /// persisted commit offset.
    pub(crate) fn new(
        cfg: BlkAllocConfig,
        sb_store: Arc<SuperblockStore>,
        need_format: bool,
    ) -> io::Result<Self> {
        let alloc = Self {
            total_blks: cfg.total_blks,
            chunk_id: cfg.chunk_id,
            allocator_id: cfg.allocator_id,
            last_append_offset: AtomicU64::new(0),
            commit_offset: AtomicU64::new(0),
            sb_commit_offset: AtomicU64::new(0),
            freeable_nblks: AtomicU64::new(0),
            is_dirty: AtomicBool::new(false),
            sb_store,
        };

        if need_format {
            alloc.persist_superblock()?;
        } else if let Some(bytes) = alloc.sb_store.load(&alloc.sb_name())? {
            alloc.on_superblock_found(&bytes)?;
        }
        Ok(alloc)
    }

    fn sb_name(&self) -> String {
        format!("append_blkalloc_{}", self.allocator_id)
    }

    fn on_superblock_found(&self, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() < APPEND_BLKALLOC_SB_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "append blkalloc superblock too short",
            ));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(magic, APPEND_BLKALLOC_SB_MAGIC, "append blkalloc superblock magic mismatch");
        assert_eq!(version, APPEND_BLKALLOC_SB_VERSION, "append blkalloc superblock version mismatch");

        let commit_offset = u64::from_le_bytes(bytes[12..20].try_into().unwrap());
        let freeable_nblks = u64::from_le_bytes(bytes[20..28].try_into().unwrap());

        // Both offsets start at the durable high-water mark; allocations
        // that never reached durability before the crash are collapsed.
        self.last_append_offset.store(commit_offset, Ordering::Release);
        self.commit_offset.store(commit_offset, Ordering::Release);
        self.sb_commit_offset.store(commit_offset, Ordering::Release);
        self.freeable_nblks.store(freeable_nblks, Ordering::Release);
        Ok(())
    }

    fn pack_superblock(&self) -> [u8; APPEND_BLKALLOC_SB_SIZE] {
        let mut buf = [0u8; APPEND_BLKALLOC_SB_SIZE];
        buf[0..4].copy_from_slice(&APPEND_BLKALLOC_SB_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&APPEND_BLKALLOC_SB_VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&self.allocator_id.to_le_bytes());
        buf[12..20].copy_from_slice(&self.commit_offset.load(Ordering::Acquire).to_le_bytes());
        buf[20..28].copy_from_slice(&self.freeable_nblks.load(Ordering::Acquire).to_le_bytes());
        buf
    }

    fn persist_superblock(&self) -> io::Result<()> {
        let buf = self.pack_superblock();
        self.sb_store.write(&self.sb_name(), &buf)?;
        self.sb_commit_offset
            .store(self.commit_offset.load(Ordering::Acquire), Ordering::Release);
        Ok(())
    }

    /// Hand out the next `nblks` contiguous blocks.
    pub fn alloc(&self, nblks: u32, hints: &BlkAllocHints) -> Result<BlkId, BlkAllocStatus> {
        let mut avail = self.available_blks();
        if let Some(reserved) = hints.reserved_blks {
            avail = avail.saturating_sub(reserved);
        }
        if avail < nblks as u64 {
            debug_print!(
                "[blkalloc] chunk {} out of space: want={} avail={} (reserved={:?})",
                self.chunk_id,
                nblks,
                avail,
                hints.reserved_blks
            );
            return Err(BlkAllocStatus::SpaceFull);
        }
        if nblks > MAX_BLKS_PER_BLKID {
            debug_print!(
                "[blkalloc] chunk {} request nblks={} above encoding limit {}",
                self.chunk_id,
                nblks,
                MAX_BLKS_PER_BLKID
            );
            return Err(BlkAllocStatus::Failed);
        }

        let offset = self.last_append_offset.fetch_add(nblks as u64, Ordering::AcqRel);
        Ok(BlkId::new(offset, nblks, self.chunk_id))
    }

    pub fn alloc_contiguous(&self) -> Result<BlkId, BlkAllocStatus> {
        self.alloc(1, &BlkAllocHints::default())
    }

    /// Ratchet the disk commit offset up to cover `bid`. Idempotent; marks
    /// the allocator dirty only when the offset actually moved.
    pub fn reserve_on_disk(&self, bid: BlkId) {
        debug_assert!(self.is_blk_alloced(bid), "reserve_on_disk for unallocated blkid");
        let new_offset = bid.end_blk_num();
        let mut cur = self.commit_offset.load(Ordering::Acquire);
        let mut modified = true;
        loop {
            if cur >= new_offset {
                modified = false;
                break;
            }
            match self.commit_offset.compare_exchange_weak(
                cur,
                new_offset,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        if modified {
            self.is_dirty.store(true, Ordering::Release);
        }
    }

    /// Ratchet the in-memory append offset up to cover `bid`; recovery uses
    /// this to fast-forward past every observed allocation.
    pub fn reserve_on_cache(&self, bid: BlkId) {
        let new_offset = bid.end_blk_num();
        let mut cur = self.last_append_offset.load(Ordering::Acquire);
        loop {
            if cur >= new_offset {
                break;
            }
            match self.last_append_offset.compare_exchange_weak(
                cur,
                new_offset,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Accounting only; this allocator never reuses space.
    pub fn free(&self, bid: BlkId) {
        self.freeable_nblks.fetch_add(bid.nblks as u64, Ordering::AcqRel);
        self.is_dirty.store(true, Ordering::Release);
    }

    /// Persist the superblock if anything changed since the last flush.
    pub fn cp_flush(&self) -> io::Result<()> {
        if self.is_dirty.swap(false, Ordering::AcqRel) {
            self.persist_superblock()?;
        }
        Ok(())
    }

    pub fn reset(&self) {
        self.last_append_offset.store(0, Ordering::Release);
        self.commit_offset.store(0, Ordering::Release);
        self.freeable_nblks.store(0, Ordering::Release);
        self.is_dirty.store(true, Ordering::Release);
    }

    pub fn is_blk_alloced(&self, bid: BlkId) -> bool {
        bid.blk_num < self.get_used_blks()
    }

    /// Allocated as far as the durable superblock is concerned.
    pub fn is_blk_alloced_on_disk(&self, bid: BlkId) -> bool {
        bid.blk_num < self.sb_commit_offset.load(Ordering::Acquire)
    }

    pub fn available_blks(&self) -> u64 {
        self.total_blks - self.get_used_blks()
    }

    pub fn get_used_blks(&self) -> u64 {
        self.last_append_offset.load(Ordering::Acquire)
    }

    pub fn get_freeable_nblks(&self) -> u64 {
        self.freeable_nblks.load(Ordering::Acquire)
    }

    pub fn get_commit_offset(&self) -> u64 {
        self.commit_offset.load(Ordering::Acquire)
    }

    pub fn total_blks(&self) -> u64 {
        self.total_blks
    }

    pub(crate) fn destroy(&self) -> io::Result<()> {
        self.sb_store.remove(&self.sb_name())
    }
}

/// Per-checkpoint view of the allocator: free lists parked here are only
/// applied once the owning checkpoint is durable.
#[derive(Debug)]
pub struct BlkAllocCheckpoint {
    allocator: Arc<AppendBlkAllocator>,
    free_lists: Mutex<Vec<Arc<SharedBlkList>>>,
}

impl BlkAllocCheckpoint {
    pub fn new(allocator: Arc<AppendBlkAllocator>) -> Self {
        Self { allocator, free_lists: Mutex::new(Vec::new()) }
    }

    /// Park a checkpoint's free-block list for release at flush time.
    pub fn free_blks(&self, list: Arc<SharedBlkList>) {
        self.free_lists.lock().unwrap().push(list);
    }

    /// Apply every parked free list to the allocator and checkpoint it.
    pub fn flush(&self) -> io::Result<()> {
        let lists = std::mem::take(&mut *self.free_lists.lock().unwrap());
        for list in lists {
            for bid in list.drain() {
                self.allocator.free(bid);
            }
        }
        self.allocator.cp_flush()
    }

    pub fn allocator(&self) -> &Arc<AppendBlkAllocator> {
        &self.allocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::DevPathManager;

    fn temp_sb_store() -> (Arc<SuperblockStore>, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "chert-blkalloc-test-{}-{}",
            std::process::id(),
            rand::random::<u64>()
        ));
        (
            Arc::new(SuperblockStore::new(DevPathManager::new(dir.clone()))),
            dir,
        )
    }

    fn cfg(total: u64) -> BlkAllocConfig {
        BlkAllocConfig { total_blks: total, chunk_id: 3, allocator_id: 7 }
    }

    #[test]
    fn alloc_advances_monotonically() {
        let (sb, dir) = temp_sb_store();
        let alloc = AppendBlkAllocator::new(cfg(100), sb, true).unwrap();

        let a = alloc.alloc(10, &BlkAllocHints::default()).unwrap();
        let b = alloc.alloc(5, &BlkAllocHints::default()).unwrap();
        assert_eq!(a.blk_num, 0);
        assert_eq!(b.blk_num, 10);
        assert_eq!(alloc.get_used_blks(), 15);
        assert_eq!(alloc.available_blks(), 85);
        assert!(alloc.is_blk_alloced(a));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn alloc_respects_capacity_and_reservation() {
        let (sb, dir) = temp_sb_store();
        let alloc = AppendBlkAllocator::new(cfg(20), sb, true).unwrap();

        alloc.alloc(15, &BlkAllocHints::default()).unwrap();
        assert_eq!(
            alloc.alloc(6, &BlkAllocHints::default()).unwrap_err(),
            BlkAllocStatus::SpaceFull
        );
        // 5 remain but 3 are reserved by the caller
        assert_eq!(
            alloc
                .alloc(4, &BlkAllocHints { reserved_blks: Some(3) })
                .unwrap_err(),
            BlkAllocStatus::SpaceFull
        );
        alloc.alloc(2, &BlkAllocHints { reserved_blks: Some(3) }).unwrap();

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn alloc_rejects_oversized_blkid() {
        let (sb, dir) = temp_sb_store();
        let alloc =
            AppendBlkAllocator::new(cfg(u32::MAX as u64 * 4), sb, true).unwrap();
        assert_eq!(
            alloc
                .alloc(MAX_BLKS_PER_BLKID + 1, &BlkAllocHints::default())
                .unwrap_err(),
            BlkAllocStatus::Failed
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn reserve_on_disk_ratchets_forward_only() {
        let (sb, dir) = temp_sb_store();
        let alloc = AppendBlkAllocator::new(cfg(100), sb, true).unwrap();

        let a = alloc.alloc(10, &BlkAllocHints::default()).unwrap();
        let b = alloc.alloc(10, &BlkAllocHints::default()).unwrap();
        alloc.reserve_on_disk(b);
        assert_eq!(alloc.get_commit_offset(), 20);
        // Completing the earlier write must not move the offset back
        alloc.reserve_on_disk(a);
        assert_eq!(alloc.get_commit_offset(), 20);
        assert!(alloc.get_used_blks() >= alloc.get_commit_offset());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn superblock_roundtrip_restores_offsets() {
        let (sb, dir) = temp_sb_store();
        {
            let alloc = AppendBlkAllocator::new(cfg(100), sb.clone(), true).unwrap();
            let a = alloc.alloc(12, &BlkAllocHints::default()).unwrap();
            // Allocated but never committed: must collapse after reboot
            let _uncommitted = alloc.alloc(30, &BlkAllocHints::default()).unwrap();
            alloc.reserve_on_disk(a);
            alloc.free(BlkId::new(0, 4, 3));
            alloc.cp_flush().unwrap();
        }
        {
            let alloc = AppendBlkAllocator::new(cfg(100), sb, false).unwrap();
            assert_eq!(alloc.get_used_blks(), 12);
            assert_eq!(alloc.get_commit_offset(), 12);
            assert_eq!(alloc.get_freeable_nblks(), 4);
            assert!(alloc.is_blk_alloced_on_disk(BlkId::new(11, 1, 3)));
            assert!(!alloc.is_blk_alloced_on_disk(BlkId::new(12, 1, 3)));
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn checkpoint_defers_free_accounting() {
        let (sb, dir) = temp_sb_store();
        let alloc = Arc::new(AppendBlkAllocator::new(cfg(100), sb, true).unwrap());
        let ba_cp = BlkAllocCheckpoint::new(alloc.clone());

        let list = SharedBlkList::new();
        list.push(BlkId::new(0, 3, 3));
        list.push(BlkId::new(3, 2, 3));
        ba_cp.free_blks(list.clone());

        assert_eq!(alloc.get_freeable_nblks(), 0);
        ba_cp.flush().unwrap();
        assert_eq!(alloc.get_freeable_nblks(), 5);
        assert!(list.is_empty());

        let _ = std::fs::remove_dir_all(dir);
    }
}
