//! Logdev metadata: the stream registry superblock (reserved ids, per
//! stream cursors, scan start offset) and the rollback superblock (ranges
//! of log indexes invalidated per stream). Both are packed little-endian
//! and persisted through the superblock store.

use crate::config::{debug_print, FlushMode};
use crate::superblock::SuperblockStore;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

pub(crate) const LOGDEV_SB_MAGIC: u32 = 0xDABA_F00D;
pub(crate) const LOGDEV_SB_VERSION: u32 = 1;
pub(crate) const ROLLBACK_SB_MAGIC: u32 = 0xDABA_F00D;
pub(crate) const ROLLBACK_SB_VERSION: u32 = 1;

const LOGDEV_SB_FIXED_SIZE: usize = 36;
const LOGSTORE_SB_ENTRY_SIZE: usize = 12;
const ROLLBACK_SB_FIXED_SIZE: usize = 16;
const ROLLBACK_RECORD_SIZE: usize = 20;
/// The rollback block grows in batches of this many records.
const ROLLBACK_RECORD_INCREMENT: usize = 8;

const INITIAL_ID_CAPACITY: u32 = 128;

/// Per-stream metadata carried inside the logdev superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LogStoreSuperblk {
    /// Highest seq num the stream has truncated away; replay drops
    /// anything at or below it.
    pub(crate) truncated_upto_seq: i64,
}

impl Default for LogStoreSuperblk {
    fn default() -> Self {
        Self { truncated_upto_seq: -1 }
    }
}

/// First-free id reserver over a byte-backed bitmap.
#[derive(Debug)]
pub(crate) struct IdReserver {
    bits: Vec<u8>,
}

impl IdReserver {
    pub(crate) fn new(capacity: u32) -> Self {
        Self { bits: vec![0u8; (capacity as usize).div_ceil(8)] }
    }

    pub(crate) fn from_serialized(bytes: &[u8]) -> Self {
        Self { bits: bytes.to_vec() }
    }

    pub(crate) fn serialize(&self) -> &[u8] {
        &self.bits
    }

    pub(crate) fn reserve(&mut self) -> u32 {
        for (byte_idx, byte) in self.bits.iter_mut().enumerate() {
            if *byte != 0xFF {
                let bit = (!*byte).trailing_zeros();
                *byte |= 1 << bit;
                return (byte_idx * 8) as u32 + bit;
            }
        }
        // Bitmap full: grow by another capacity increment
        let id = (self.bits.len() * 8) as u32;
        self.bits
            .resize(self.bits.len() + (INITIAL_ID_CAPACITY as usize) / 8, 0);
        self.bits[(id / 8) as usize] |= 1 << (id % 8);
        id
    }

    pub(crate) fn reserve_id(&mut self, id: u32) {
        let byte_idx = (id / 8) as usize;
        if byte_idx >= self.bits.len() {
            self.bits.resize(byte_idx + 1, 0);
        }
        self.bits[byte_idx] |= 1 << (id % 8);
    }

    pub(crate) fn unreserve(&mut self, id: u32) {
        let byte_idx = (id / 8) as usize;
        if byte_idx < self.bits.len() {
            self.bits[byte_idx] &= !(1 << (id % 8));
        }
    }

    pub(crate) fn is_reserved(&self, id: u32) -> bool {
        let byte_idx = (id / 8) as usize;
        byte_idx < self.bits.len() && (self.bits[byte_idx] & (1 << (id % 8))) != 0
    }

    pub(crate) fn reserved_ids(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (byte_idx, byte) in self.bits.iter().enumerate() {
            let mut b = *byte;
            while b != 0 {
                let bit = b.trailing_zeros();
                out.push((byte_idx * 8) as u32 + bit);
                b &= b - 1;
            }
        }
        out
    }
}

/// Owns the two superblocks and every piece of logdev state that must
/// survive restart. All mutations run under the logdev's meta mutex.
#[derive(Debug)]
pub(crate) struct LogDevMetadata {
    logdev_id: u32,
    sb_store: Arc<SuperblockStore>,
    id_reserver: IdReserver,
    store_info: BTreeMap<u32, LogStoreSuperblk>,
    rollback_info: BTreeMap<u32, Vec<(i64, i64)>>,
    rollback_dirty: bool,
    start_dev_offset: u64,
    key_idx: i64,
    flush_mode: FlushMode,
}

impl LogDevMetadata {
    pub(crate) fn new(logdev_id: u32, sb_store: Arc<SuperblockStore>) -> Self {
        Self {
            logdev_id,
            sb_store,
            id_reserver: IdReserver::new(INITIAL_ID_CAPACITY),
            store_info: BTreeMap::new(),
            rollback_info: BTreeMap::new(),
            rollback_dirty: false,
            start_dev_offset: 0,
            key_idx: 0,
            flush_mode: FlushMode::default(),
        }
    }

    fn sb_name(&self) -> String {
        format!("logdev_sb_{}", self.logdev_id)
    }

    fn rollback_sb_name(&self) -> String {
        format!("logdev_rollback_sb_{}", self.logdev_id)
    }

    /// Fresh-format initialization; writes both superblocks.
    pub(crate) fn create(&mut self, flush_mode: FlushMode) -> io::Result<()> {
        self.id_reserver = IdReserver::new(INITIAL_ID_CAPACITY);
        self.store_info.clear();
        self.rollback_info.clear();
        self.start_dev_offset = 0;
        self.key_idx = 0;
        self.flush_mode = flush_mode;
        self.persist()?;
        self.persist_rollback_sb()
    }

    /// Load both superblocks. Returns the per-stream superblocks found so
    /// the logdev can notify the store layer.
    pub(crate) fn load(&mut self) -> io::Result<Vec<(u32, LogStoreSuperblk)>> {
        if let Some(bytes) = self.sb_store.load(&self.sb_name())? {
            self.unpack_logdev_sb(&bytes)?;
        }
        if let Some(bytes) = self.sb_store.load(&self.rollback_sb_name())? {
            self.unpack_rollback_sb(&bytes)?;
        }
        Ok(self.store_info.iter().map(|(id, sb)| (*id, *sb)).collect())
    }

    pub(crate) fn persist(&mut self) -> io::Result<()> {
        let bytes = self.pack_logdev_sb();
        self.sb_store.write(&self.sb_name(), &bytes)
    }

    fn persist_rollback_sb(&mut self) -> io::Result<()> {
        let bytes = self.pack_rollback_sb();
        self.sb_store.write(&self.rollback_sb_name(), &bytes)?;
        self.rollback_dirty = false;
        Ok(())
    }

    fn pack_logdev_sb(&self) -> Vec<u8> {
        let num_stores = self.store_info.len() as u32;
        let bitmap = self.id_reserver.serialize();
        let mut buf = Vec::with_capacity(
            LOGDEV_SB_FIXED_SIZE
                + num_stores as usize * LOGSTORE_SB_ENTRY_SIZE
                + 4
                + bitmap.len(),
        );
        buf.extend_from_slice(&LOGDEV_SB_MAGIC.to_le_bytes());
        buf.extend_from_slice(&LOGDEV_SB_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.logdev_id.to_le_bytes());
        buf.extend_from_slice(&num_stores.to_le_bytes());
        buf.extend_from_slice(&self.start_dev_offset.to_le_bytes());
        buf.extend_from_slice(&self.key_idx.to_le_bytes());
        buf.extend_from_slice(&self.flush_mode.bits().to_le_bytes());
        for (store_id, sb) in &self.store_info {
            buf.extend_from_slice(&store_id.to_le_bytes());
            buf.extend_from_slice(&sb.truncated_upto_seq.to_le_bytes());
        }
        buf.extend_from_slice(&(bitmap.len() as u32).to_le_bytes());
        buf.extend_from_slice(bitmap);
        buf
    }

    fn unpack_logdev_sb(&mut self, buf: &[u8]) -> io::Result<()> {
        if buf.len() < LOGDEV_SB_FIXED_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "logdev superblock too short"));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        assert_eq!(magic, LOGDEV_SB_MAGIC, "logdev superblock magic mismatch");
        assert_eq!(version, LOGDEV_SB_VERSION, "logdev superblock version mismatch");

        self.logdev_id = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let num_stores = u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;
        self.start_dev_offset = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        self.key_idx = i64::from_le_bytes(buf[24..32].try_into().unwrap());
        self.flush_mode =
            FlushMode::from_bits(u32::from_le_bytes(buf[32..36].try_into().unwrap()));

        let mut pos = LOGDEV_SB_FIXED_SIZE;
        self.store_info.clear();
        for _ in 0..num_stores {
            let store_id = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
            let truncated =
                i64::from_le_bytes(buf[pos + 4..pos + 12].try_into().unwrap());
            self.store_info
                .insert(store_id, LogStoreSuperblk { truncated_upto_seq: truncated });
            pos += LOGSTORE_SB_ENTRY_SIZE;
        }

        let bitmap_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        self.id_reserver = IdReserver::from_serialized(&buf[pos..pos + bitmap_len]);
        Ok(())
    }

    fn pack_rollback_sb(&self) -> Vec<u8> {
        let records: Vec<(u32, i64, i64)> = self
            .rollback_info
            .iter()
            .flat_map(|(id, ranges)| ranges.iter().map(move |(lo, hi)| (*id, *lo, *hi)))
            .collect();
        let capacity = records.len().div_ceil(ROLLBACK_RECORD_INCREMENT) * ROLLBACK_RECORD_INCREMENT;
        let mut buf =
            Vec::with_capacity(ROLLBACK_SB_FIXED_SIZE + capacity * ROLLBACK_RECORD_SIZE);
        buf.extend_from_slice(&ROLLBACK_SB_MAGIC.to_le_bytes());
        buf.extend_from_slice(&ROLLBACK_SB_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.logdev_id.to_le_bytes());
        buf.extend_from_slice(&(records.len() as u32).to_le_bytes());
        for (store_id, lo, hi) in &records {
            buf.extend_from_slice(&store_id.to_le_bytes());
            buf.extend_from_slice(&lo.to_le_bytes());
            buf.extend_from_slice(&hi.to_le_bytes());
        }
        buf.resize(ROLLBACK_SB_FIXED_SIZE + capacity * ROLLBACK_RECORD_SIZE, 0);
        buf
    }

    fn unpack_rollback_sb(&mut self, buf: &[u8]) -> io::Result<()> {
        if buf.len() < ROLLBACK_SB_FIXED_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "rollback superblock too short"));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        assert_eq!(magic, ROLLBACK_SB_MAGIC, "rollback superblock magic mismatch");
        assert_eq!(version, ROLLBACK_SB_VERSION, "rollback superblock version mismatch");

        let num_records = u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;
        self.rollback_info.clear();
        let mut pos = ROLLBACK_SB_FIXED_SIZE;
        for _ in 0..num_records {
            let store_id = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
            let lo = i64::from_le_bytes(buf[pos + 4..pos + 12].try_into().unwrap());
            let hi = i64::from_le_bytes(buf[pos + 12..pos + 20].try_into().unwrap());
            self.rollback_info.entry(store_id).or_default().push((lo, hi));
            pos += ROLLBACK_RECORD_SIZE;
        }
        Ok(())
    }

    pub(crate) fn reserve_store(&mut self, persist_now: bool) -> io::Result<u32> {
        let id = self.id_reserver.reserve();
        self.store_info.insert(id, LogStoreSuperblk::default());
        if persist_now {
            self.persist()?;
        }
        Ok(id)
    }

    pub(crate) fn unreserve_store(&mut self, id: u32, persist_now: bool) -> io::Result<()> {
        self.id_reserver.unreserve(id);
        self.store_info.remove(&id);
        self.remove_all_rollback_records(id, persist_now)?;
        if persist_now {
            self.persist()?;
        }
        Ok(())
    }

    pub(crate) fn is_store_reserved(&self, id: u32) -> bool {
        self.id_reserver.is_reserved(id)
    }

    pub(crate) fn reserved_store_ids(&self) -> Vec<u32> {
        self.id_reserver.reserved_ids()
    }

    pub(crate) fn update_store_superblk(
        &mut self,
        id: u32,
        sb: LogStoreSuperblk,
        persist_now: bool,
    ) -> io::Result<()> {
        self.store_info.insert(id, sb);
        if persist_now {
            self.persist()?;
        }
        Ok(())
    }

    pub(crate) fn store_superblk(&self, id: u32) -> LogStoreSuperblk {
        self.store_info.get(&id).copied().unwrap_or_default()
    }

    pub(crate) fn set_start_dev_offset(
        &mut self,
        offset: u64,
        key_idx: i64,
        persist_now: bool,
    ) -> io::Result<()> {
        self.start_dev_offset = offset;
        self.key_idx = key_idx;
        if persist_now {
            self.persist()?;
        }
        Ok(())
    }

    pub(crate) fn get_start_dev_offset(&self) -> u64 {
        self.start_dev_offset
    }

    pub(crate) fn get_start_log_idx(&self) -> i64 {
        self.key_idx
    }

    /// Add one rollback range. Re-adding an identical range is a no-op so
    /// a retried rollback stays a single durable record.
    pub(crate) fn add_rollback_record(
        &mut self,
        store_id: u32,
        range: (i64, i64),
        persist_now: bool,
    ) -> io::Result<()> {
        let ranges = self.rollback_info.entry(store_id).or_default();
        if !ranges.contains(&range) {
            ranges.push(range);
            self.rollback_dirty = true;
        }
        if persist_now && self.rollback_dirty {
            self.persist_rollback_sb()?;
        }
        Ok(())
    }

    /// Drop every rollback record whose range lies entirely at or below
    /// `upto_idx` (they can no longer match a live log).
    pub(crate) fn remove_rollback_record_upto(
        &mut self,
        upto_idx: i64,
        persist_now: bool,
    ) -> io::Result<()> {
        let mut removed = false;
        self.rollback_info.retain(|_, ranges| {
            let before = ranges.len();
            ranges.retain(|(_, hi)| *hi > upto_idx);
            removed |= ranges.len() != before;
            !ranges.is_empty()
        });
        if removed {
            self.rollback_dirty = true;
            debug_print!("[logdev_meta] dropped rollback records upto idx {}", upto_idx);
        }
        if persist_now && self.rollback_dirty {
            self.persist_rollback_sb()?;
        }
        Ok(())
    }

    pub(crate) fn remove_all_rollback_records(
        &mut self,
        store_id: u32,
        persist_now: bool,
    ) -> io::Result<()> {
        if self.rollback_info.remove(&store_id).is_some() {
            self.rollback_dirty = true;
        }
        if persist_now && self.rollback_dirty {
            self.persist_rollback_sb()?;
        }
        Ok(())
    }

    pub(crate) fn num_rollback_records(&self, store_id: u32) -> usize {
        self.rollback_info.get(&store_id).map_or(0, |r| r.len())
    }

    pub(crate) fn is_rolled_back(&self, store_id: u32, log_idx: i64) -> bool {
        self.rollback_info
            .get(&store_id)
            .is_some_and(|ranges| ranges.iter().any(|(lo, hi)| *lo <= log_idx && log_idx <= *hi))
    }

    pub(crate) fn destroy(&mut self) -> io::Result<()> {
        self.sb_store.remove(&self.sb_name())?;
        self.sb_store.remove(&self.rollback_sb_name())
    }
}
