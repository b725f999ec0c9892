//! Journal device stand-in: positioned I/O over the preallocated journal
//! file plus the append allocator that hands out group offsets. Tracks the
//! head (truncation) and tail (append) cursors the way the journal vdev
//! does for the logdev.

use crate::blkalloc::{AppendBlkAllocator, BlkAllocHints, BlkAllocStatus, BlkId};
use crate::config::debug_print;
use crate::storage::Storage;
use std::io::{self, IoSlice};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct JournalDevice {
    storage: Arc<Storage>,
    allocator: Arc<AppendBlkAllocator>,
    flush_size_multiple: u64,
    head_offset: AtomicU64,
    tail_offset: AtomicU64,
}

impl JournalDevice {
    pub(crate) fn new(storage: Arc<Storage>, allocator: Arc<AppendBlkAllocator>) -> Self {
        let flush_size_multiple = crate::config::DMA_ADDRESS_BOUNDARY;
        Self {
            storage,
            allocator,
            flush_size_multiple,
            head_offset: AtomicU64::new(0),
            tail_offset: AtomicU64::new(0),
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.storage.len()
    }

    fn to_blkid(&self, offset: u64, len: u64) -> BlkId {
        BlkId::new(
            offset / self.flush_size_multiple,
            (len.div_ceil(self.flush_size_multiple)) as u32,
            0,
        )
    }

    /// Reserve the next `size` bytes of the journal (rounded up to the
    /// flush boundary) and return their device offset.
    pub(crate) fn alloc_next_append_blk(&self, size: u64) -> io::Result<u64> {
        let nblks = size.div_ceil(self.flush_size_multiple) as u32;
        match self.allocator.alloc(nblks, &BlkAllocHints::default()) {
            Ok(bid) => Ok(bid.blk_num * self.flush_size_multiple),
            Err(BlkAllocStatus::SpaceFull) => Err(io::Error::new(
                io::ErrorKind::Other,
                "journal device out of space",
            )),
            Err(BlkAllocStatus::Failed) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "journal allocation larger than a single blkid can carry",
            )),
        }
    }

    pub(crate) fn pwritev(&self, offset: u64, bufs: &[IoSlice]) -> io::Result<()> {
        self.storage.write_vectored(offset, bufs)
    }

    pub(crate) fn pread(&self, offset: u64, dest: &mut [u8]) -> io::Result<()> {
        self.storage.read(offset, dest)
    }

    pub(crate) fn sync(&self) -> io::Result<()> {
        self.storage.sync()
    }

    /// Record that the group at `[offset, offset+len)` is durable.
    pub(crate) fn commit_blk(&self, offset: u64, len: u64) {
        self.allocator.reserve_on_disk(self.to_blkid(offset, len));
    }

    /// Move the head past truncated groups. Space behind the head is
    /// reclaimable; the allocator checkpoint records the new state.
    pub(crate) fn truncate(&self, offset: u64) -> io::Result<()> {
        self.head_offset.store(offset, Ordering::Release);
        debug_print!("[journal_vdev] head advanced to {}", offset);
        self.allocator.cp_flush()
    }

    /// Set the append cursor after recovery: the allocator fast-forwards
    /// past every byte the scan observed.
    pub(crate) fn update_tail_offset(&self, offset: u64) {
        self.tail_offset.store(offset, Ordering::Release);
        if offset > 0 {
            let bid = self.to_blkid(0, offset);
            self.allocator.reserve_on_cache(bid);
            self.allocator.reserve_on_disk(bid);
        }
    }

    pub(crate) fn head_offset(&self) -> u64 {
        self.head_offset.load(Ordering::Acquire)
    }

    pub(crate) fn tail_offset(&self) -> u64 {
        self.tail_offset.load(Ordering::Acquire)
    }

    pub(crate) fn allocator(&self) -> &Arc<AppendBlkAllocator> {
        &self.allocator
    }
}
