//! Checkpoint objects handed between the tree layer, the write-back
//! cache and the block allocator. A checkpoint owns the free-block list
//! whose release is deferred until the checkpoint is durable.

use crate::blkalloc::{BlkAllocCheckpoint, SharedBlkList};
use std::sync::{Arc, Mutex};

/// At most two checkpoint generations are ever active: one flushing, one
/// accumulating.
pub const MAX_CP_CNT: usize = 2;

#[derive(Debug)]
pub struct Checkpoint {
    cp_id: u64,
    free_blkid_list: Mutex<Option<Arc<SharedBlkList>>>,
}

impl Checkpoint {
    pub fn new(cp_id: u64) -> Arc<Self> {
        Arc::new(Self { cp_id, free_blkid_list: Mutex::new(None) })
    }

    pub fn cp_id(&self) -> u64 {
        self.cp_id
    }

    /// Cache slot this checkpoint generation maps to.
    pub fn slot(&self) -> usize {
        (self.cp_id % MAX_CP_CNT as u64) as usize
    }

    pub(crate) fn set_free_blkid_list(&self, list: Arc<SharedBlkList>) {
        *self.free_blkid_list.lock().unwrap() = Some(list);
    }

    pub fn free_blkid_list(&self) -> Option<Arc<SharedBlkList>> {
        self.free_blkid_list.lock().unwrap().clone()
    }

    /// Hand this checkpoint's free blocks to the allocator checkpoint once
    /// the checkpoint is durable; only then does the space become
    /// physically reclaimable.
    pub fn flush_free_blks(&self, ba_cp: &BlkAllocCheckpoint) {
        if let Some(list) = self.free_blkid_list() {
            ba_cp.free_blks(list);
        }
    }
}
