//! On-disk layout of the journal and in-memory assembly of log groups.
//!
//! A group is written as one vectored I/O:
//!
//! ```text
//! | header | record slots | inline data ... pad | OOB data (aligned) | footer pad |
//! ```
//!
//! Small or unaligned payloads are copied into the inline area; large
//! aligned payloads ride along by reference in their own iovec. The group
//! CRC covers everything between the header and the footer and is chained
//! into the next group's header.

use crate::config::{
    debug_print, DMA_ADDRESS_BOUNDARY, INITIAL_READ_SIZE, LOG_GROUP_FOOTER_MAGIC,
    LOG_GROUP_FOOTER_VERSION, LOG_GROUP_HDR_MAGIC, LOG_GROUP_HDR_VERSION,
};
use crate::storage::AlignedBuf;
use std::io::IoSlice;
use std::sync::Arc;

pub(crate) const LOG_GROUP_HDR_SIZE: usize = 48;
pub(crate) const SERIALIZED_RECORD_SIZE: usize = 20;
pub(crate) const LOG_GROUP_FOOTER_SIZE: usize = 24;

/// CRC seed for every group checksum.
pub(crate) const INIT_CRC32: u32 = 0x1234_5678;
/// `prev_group_crc` of the first group written after a format.
pub(crate) const INVALID_CRC32: u32 = 0;

const OPTIMAL_NUM_RECORDS: usize = 16;
const INLINE_LOG_BUF_SIZE: usize = 512 * OPTIMAL_NUM_RECORDS;

/// Slot capacity is bounded so the whole slot array always fits inside the
/// initial read window.
pub(crate) const MAX_RECORDS_IN_A_BATCH: usize =
    (INITIAL_READ_SIZE as usize - LOG_GROUP_HDR_SIZE) / SERIALIZED_RECORD_SIZE;

pub(crate) fn round_up(val: u64, multiple: u64) -> u64 {
    val.div_ceil(multiple) * multiple
}

pub(crate) fn round_down(val: u64, multiple: u64) -> u64 {
    (val / multiple) * multiple
}

/// Opaque per-append payload handed back through the completion callback.
pub type AppendContext = Box<dyn std::any::Any + Send + Sync>;

/// In-memory record, owned by the tracker from append until its group's
/// flush completion callback has run.
pub(crate) struct LogRecord {
    pub(crate) store_id: u32,
    pub(crate) seq_num: i64,
    pub(crate) data: AlignedBuf,
    pub(crate) context: Option<AppendContext>,
}

impl LogRecord {
    pub(crate) fn new(
        store_id: u32,
        seq_num: i64,
        data: &[u8],
        context: Option<AppendContext>,
    ) -> Self {
        Self { store_id, seq_num, data: AlignedBuf::from_slice(data), context }
    }

    pub(crate) fn is_inlineable(&self, flush_size_multiple: u64, optimal_inline: usize) -> bool {
        is_record_inlineable(self.data.as_slice(), flush_size_multiple, optimal_inline)
    }
}

pub(crate) fn is_size_inlineable(size: usize, flush_size_multiple: u64, optimal_inline: usize) -> bool {
    size < optimal_inline || (size as u64 % flush_size_multiple) != 0
}

/// A record goes out-of-band only when it is large, a whole multiple of
/// the flush boundary and its buffer base is DMA aligned; everything else
/// is packed inline.
pub(crate) fn is_record_inlineable(
    data: &[u8],
    flush_size_multiple: u64,
    optimal_inline: usize,
) -> bool {
    is_size_inlineable(data.len(), flush_size_multiple, optimal_inline)
        || (data.as_ptr() as usize as u64 % flush_size_multiple) != 0
}

/// One slot in the on-disk record array. `offset` is 31 bits; the top bit
/// carries the inline flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializedLogRecord {
    pub size: u32,
    /// Within the group for inlined records, within the OOB area otherwise.
    pub offset: u32,
    pub is_inlined: bool,
    pub store_seq_num: i64,
    pub store_id: u32,
}

impl SerializedLogRecord {
    pub(crate) fn encode(&self, buf: &mut [u8]) {
        debug_assert!(self.offset < (1 << 31));
        let packed = (self.offset & 0x7FFF_FFFF) | ((self.is_inlined as u32) << 31);
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..8].copy_from_slice(&packed.to_le_bytes());
        buf[8..16].copy_from_slice(&self.store_seq_num.to_le_bytes());
        buf[16..20].copy_from_slice(&self.store_id.to_le_bytes());
    }

    pub(crate) fn decode(buf: &[u8]) -> Self {
        let packed = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        Self {
            size: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            offset: packed & 0x7FFF_FFFF,
            is_inlined: (packed >> 31) != 0,
            store_seq_num: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
            store_id: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        }
    }

    /// Offset of the payload from the start of the group.
    pub(crate) fn data_offset(&self, header: &LogGroupHeader) -> usize {
        self.offset as usize + if self.is_inlined { 0 } else { header.oob_data_offset as usize }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LogGroupHeader {
    pub(crate) magic: u32,
    pub(crate) version: u32,
    pub(crate) n_records: u32,
    pub(crate) start_log_idx: i64,
    pub(crate) group_size: u32,
    pub(crate) inline_data_offset: u32,
    pub(crate) oob_data_offset: u32,
    pub(crate) footer_offset: u32,
    pub(crate) prev_grp_crc: u32,
    pub(crate) cur_grp_crc: u32,
    pub(crate) logdev_id: u32,
}

impl LogGroupHeader {
    pub(crate) fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.n_records.to_le_bytes());
        buf[12..20].copy_from_slice(&self.start_log_idx.to_le_bytes());
        buf[20..24].copy_from_slice(&self.group_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.inline_data_offset.to_le_bytes());
        buf[28..32].copy_from_slice(&self.oob_data_offset.to_le_bytes());
        buf[32..36].copy_from_slice(&self.footer_offset.to_le_bytes());
        buf[36..40].copy_from_slice(&self.prev_grp_crc.to_le_bytes());
        buf[40..44].copy_from_slice(&self.cur_grp_crc.to_le_bytes());
        buf[44..48].copy_from_slice(&self.logdev_id.to_le_bytes());
    }

    pub(crate) fn decode(buf: &[u8]) -> Self {
        Self {
            magic: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            version: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            n_records: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            start_log_idx: i64::from_le_bytes(buf[12..20].try_into().unwrap()),
            group_size: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            inline_data_offset: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            oob_data_offset: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            footer_offset: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            prev_grp_crc: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
            cur_grp_crc: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
            logdev_id: u32::from_le_bytes(buf[44..48].try_into().unwrap()),
        }
    }

    pub(crate) fn magic_ok(&self) -> bool {
        self.magic == LOG_GROUP_HDR_MAGIC && self.version == LOG_GROUP_HDR_VERSION
    }

    /// Decode the nth record slot out of a group image.
    pub(crate) fn nth_record(group: &[u8], n: usize) -> SerializedLogRecord {
        let off = LOG_GROUP_HDR_SIZE + n * SERIALIZED_RECORD_SIZE;
        SerializedLogRecord::decode(&group[off..off + SERIALIZED_RECORD_SIZE])
    }

    /// CRC over the bytes between the header and the footer. The image
    /// must cover at least `footer_offset` bytes.
    pub(crate) fn compute_crc_of(&self, group: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new_with_initial(INIT_CRC32);
        hasher.update(&group[LOG_GROUP_HDR_SIZE..self.footer_offset as usize]);
        hasher.finalize()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LogGroupFooter {
    pub(crate) magic: u32,
    pub(crate) version: u8,
    pub(crate) start_log_idx: i64,
}

impl LogGroupFooter {
    pub(crate) fn encode(&self, buf: &mut [u8]) {
        let packed = (self.magic & 0x00FF_FFFF) | ((self.version as u32) << 24);
        buf[0..4].copy_from_slice(&packed.to_le_bytes());
        buf[4..12].copy_from_slice(&self.start_log_idx.to_le_bytes());
        buf[12..24].fill(0);
    }

    pub(crate) fn decode(buf: &[u8]) -> Self {
        let packed = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        Self {
            magic: packed & 0x00FF_FFFF,
            version: (packed >> 24) as u8,
            start_log_idx: i64::from_le_bytes(buf[4..12].try_into().unwrap()),
        }
    }

    pub(crate) fn matches(&self, header: &LogGroupHeader) -> bool {
        self.magic == LOG_GROUP_FOOTER_MAGIC
            && self.version == LOG_GROUP_FOOTER_VERSION
            && self.start_log_idx == header.start_log_idx
    }
}

/// In-memory assembly of one group. Two of these are pooled by the logdev
/// (one flushing, one filling); `reset` recycles a slot between flushes.
pub(crate) struct LogGroup {
    buf: AlignedBuf,
    footer_buf: AlignedBuf,
    oob_records: Vec<Arc<LogRecord>>,

    nrecords: usize,
    max_records: usize,
    actual_data_size: u32,
    inline_data_pos: usize,
    oob_data_size: usize,

    // Final layout, valid after finish()
    oob_data_offset: usize,
    footer_offset: usize,
    group_size: usize,

    pub(crate) flush_log_idx_from: i64,
    pub(crate) flush_log_idx_upto: i64,
    pub(crate) log_dev_offset: u64,

    flush_size_multiple: u64,
    optimal_inline_data_size: usize,
}

impl LogGroup {
    pub(crate) fn new() -> Self {
        Self {
            buf: AlignedBuf::zeroed(0),
            footer_buf: AlignedBuf::zeroed(0),
            oob_records: Vec::new(),
            nrecords: 0,
            max_records: 0,
            actual_data_size: 0,
            inline_data_pos: 0,
            oob_data_size: 0,
            oob_data_offset: 0,
            footer_offset: 0,
            group_size: 0,
            flush_log_idx_from: -1,
            flush_log_idx_upto: -1,
            log_dev_offset: 0,
            flush_size_multiple: DMA_ADDRESS_BOUNDARY,
            optimal_inline_data_size: 512,
        }
    }

    pub(crate) fn start(&mut self, flush_size_multiple: u64, optimal_inline_data_size: usize) {
        self.flush_size_multiple = flush_size_multiple;
        self.optimal_inline_data_size = optimal_inline_data_size;
        self.buf = AlignedBuf::zeroed(INLINE_LOG_BUF_SIZE);
        self.footer_buf =
            AlignedBuf::zeroed(round_up(LOG_GROUP_FOOTER_SIZE as u64, flush_size_multiple) as usize);
    }

    pub(crate) fn reset(&mut self, estimated_records: usize) {
        self.max_records = estimated_records.clamp(1, MAX_RECORDS_IN_A_BATCH);
        self.nrecords = 0;
        self.actual_data_size = 0;
        self.inline_data_pos =
            LOG_GROUP_HDR_SIZE + self.max_records * SERIALIZED_RECORD_SIZE;
        self.oob_records.clear();
        self.oob_data_size = 0;
        self.oob_data_offset = 0;
        self.footer_offset = 0;
        self.group_size = 0;
        self.flush_log_idx_from = -1;
        self.flush_log_idx_upto = -1;
        self.log_dev_offset = 0;
        self.buf.as_mut_slice().fill(0);
        self.footer_buf.as_mut_slice().fill(0);
        // The slot area must fit in the initial buffer
        debug_assert!(self.inline_data_pos <= self.buf.len());
    }

    /// Add one record. Returns false only when the slot array is full; a
    /// payload that outgrows the inline buffer grows it instead.
    pub(crate) fn add_record(&mut self, rec: &Arc<LogRecord>, log_idx: i64) -> bool {
        if self.nrecords >= self.max_records {
            return false;
        }

        let size = rec.data.len();
        let inlined = rec.is_inlineable(self.flush_size_multiple, self.optimal_inline_data_size);
        let offset = if inlined {
            let pos = self.inline_data_pos;
            if pos + size > self.buf.len() {
                self.create_overflow_buf(pos + size);
            }
            self.buf.as_mut_slice()[pos..pos + size].copy_from_slice(rec.data.as_slice());
            self.inline_data_pos += size;
            pos as u32
        } else {
            let off = self.oob_data_size as u32;
            self.oob_records.push(rec.clone());
            self.oob_data_size += size;
            off
        };

        let slot = SerializedLogRecord {
            size: size as u32,
            offset,
            is_inlined: inlined,
            store_seq_num: rec.seq_num,
            store_id: rec.store_id,
        };
        let slot_off = LOG_GROUP_HDR_SIZE + self.nrecords * SERIALIZED_RECORD_SIZE;
        slot.encode(&mut self.buf.as_mut_slice()[slot_off..slot_off + SERIALIZED_RECORD_SIZE]);

        if self.nrecords == 0 {
            self.flush_log_idx_from = log_idx;
        }
        self.flush_log_idx_upto = log_idx;
        self.nrecords += 1;
        self.actual_data_size += size as u32;
        true
    }

    /// Grow the inline buffer to at least `min_needed`, preserving the
    /// header area, the slot array and the inline data written so far.
    pub(crate) fn create_overflow_buf(&mut self, min_needed: usize) {
        let new_len = round_up(
            min_needed.max(self.buf.len() * 2) as u64,
            self.flush_size_multiple,
        ) as usize;
        let mut overflow = AlignedBuf::zeroed(new_len);
        overflow.as_mut_slice()[..self.inline_data_pos]
            .copy_from_slice(&self.buf.as_slice()[..self.inline_data_pos]);
        self.buf = overflow;
        debug_print!("[log_group] grew inline buffer to {}", new_len);
    }

    /// Stamp the header and footer, compute the chained CRC, and freeze the
    /// final layout. Returns the total group size.
    pub(crate) fn finish(&mut self, logdev_id: u32, prev_crc: u32) -> usize {
        self.oob_data_offset =
            round_up(self.inline_data_pos as u64, self.flush_size_multiple) as usize;
        if self.oob_data_offset > self.buf.len() {
            self.create_overflow_buf(self.oob_data_offset);
        }
        self.footer_offset = self.oob_data_offset + self.oob_data_size;
        self.group_size = self.footer_offset + self.footer_buf.len();

        let mut header = LogGroupHeader {
            magic: LOG_GROUP_HDR_MAGIC,
            version: LOG_GROUP_HDR_VERSION,
            n_records: self.nrecords as u32,
            start_log_idx: self.flush_log_idx_from,
            group_size: self.group_size as u32,
            inline_data_offset: (LOG_GROUP_HDR_SIZE
                + self.max_records * SERIALIZED_RECORD_SIZE) as u32,
            oob_data_offset: self.oob_data_offset as u32,
            footer_offset: self.footer_offset as u32,
            prev_grp_crc: prev_crc,
            cur_grp_crc: 0,
            logdev_id,
        };
        header.encode(&mut self.buf.as_mut_slice()[..LOG_GROUP_HDR_SIZE]);
        header.cur_grp_crc = self.compute_crc();
        header.encode(&mut self.buf.as_mut_slice()[..LOG_GROUP_HDR_SIZE]);

        let footer = LogGroupFooter {
            magic: LOG_GROUP_FOOTER_MAGIC,
            version: LOG_GROUP_FOOTER_VERSION,
            start_log_idx: self.flush_log_idx_from,
        };
        footer.encode(&mut self.footer_buf.as_mut_slice()[..LOG_GROUP_FOOTER_SIZE]);

        self.group_size
    }

    /// CRC of everything between the header and the footer: slot array,
    /// inline area (including alignment padding) and OOB payloads.
    pub(crate) fn compute_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new_with_initial(INIT_CRC32);
        hasher.update(&self.buf.as_slice()[LOG_GROUP_HDR_SIZE..self.oob_data_offset]);
        for rec in &self.oob_records {
            hasher.update(rec.data.as_slice());
        }
        hasher.finalize()
    }

    /// The iovec array for one vectored write of the whole group.
    pub(crate) fn iovecs(&self) -> Vec<IoSlice<'_>> {
        let mut iovs = Vec::with_capacity(2 + self.oob_records.len());
        iovs.push(IoSlice::new(&self.buf.as_slice()[..self.oob_data_offset]));
        for rec in &self.oob_records {
            iovs.push(IoSlice::new(rec.data.as_slice()));
        }
        iovs.push(IoSlice::new(self.footer_buf.as_slice()));
        iovs
    }

    pub(crate) fn header(&self) -> LogGroupHeader {
        LogGroupHeader::decode(&self.buf.as_slice()[..LOG_GROUP_HDR_SIZE])
    }

    pub(crate) fn nrecords(&self) -> usize {
        self.nrecords
    }

    pub(crate) fn actual_data_size(&self) -> u32 {
        self.actual_data_size
    }

    pub(crate) fn group_size(&self) -> usize {
        self.group_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(store_id: u32, seq: i64, data: &[u8]) -> Arc<LogRecord> {
        Arc::new(LogRecord::new(store_id, seq, data, None))
    }

    #[test]
    fn serialized_record_roundtrip() {
        let slot = SerializedLogRecord {
            size: 1234,
            offset: (1 << 31) - 1,
            is_inlined: true,
            store_seq_num: -42,
            store_id: 7,
        };
        let mut buf = [0u8; SERIALIZED_RECORD_SIZE];
        slot.encode(&mut buf);
        assert_eq!(SerializedLogRecord::decode(&buf), slot);

        let slot2 = SerializedLogRecord { is_inlined: false, offset: 512, ..slot };
        slot2.encode(&mut buf);
        assert_eq!(SerializedLogRecord::decode(&buf), slot2);
    }

    #[test]
    fn footer_roundtrip() {
        let footer = LogGroupFooter {
            magic: LOG_GROUP_FOOTER_MAGIC,
            version: LOG_GROUP_FOOTER_VERSION,
            start_log_idx: 99,
        };
        let mut buf = [0u8; LOG_GROUP_FOOTER_SIZE];
        footer.encode(&mut buf);
        assert_eq!(LogGroupFooter::decode(&buf), footer);
    }

    #[test]
    fn inlining_rules() {
        // below the optimal size: always inline
        assert!(is_size_inlineable(511, 512, 512));
        // exactly one flush multiple at the optimal size: out-of-band
        assert!(!is_size_inlineable(512, 512, 512));
        // not a multiple of the flush boundary: inline
        assert!(is_size_inlineable(513, 512, 512));
        assert!(!is_size_inlineable(4096, 512, 512));

        let aligned = AlignedBuf::zeroed(4096);
        assert!(!is_record_inlineable(aligned.as_slice(), 512, 512));
        // misaligned base address forces inline even for large payloads
        assert!(is_record_inlineable(&aligned.as_slice()[1..2049], 512, 512));
    }

    #[test]
    fn group_layout_small_records() {
        let mut lg = LogGroup::new();
        lg.start(512, 512);
        lg.reset(4);

        assert!(lg.add_record(&rec(1, 0, b"alpha"), 10));
        assert!(lg.add_record(&rec(1, 1, b"beta"), 11));
        assert!(lg.add_record(&rec(2, 0, b"gamma-data"), 12));
        let total = lg.finish(5, 0xDEAD_BEEF);

        let header = lg.header();
        assert!(header.magic_ok());
        assert_eq!(header.n_records, 3);
        assert_eq!(header.start_log_idx, 10);
        assert_eq!(header.prev_grp_crc, 0xDEAD_BEEF);
        assert_eq!(header.logdev_id, 5);
        assert_eq!(header.group_size as usize, total);
        assert_eq!(total as u64 % 512, 0);
        assert_eq!(header.oob_data_offset, header.footer_offset); // no OOB

        // Payloads resolve through the slots
        let image: Vec<u8> = {
            let mut v = Vec::new();
            for iov in lg.iovecs() {
                v.extend_from_slice(&iov);
            }
            v
        };
        assert_eq!(image.len(), total);
        let slot1 = LogGroupHeader::nth_record(&image, 1);
        assert!(slot1.is_inlined);
        assert_eq!(slot1.store_seq_num, 1);
        let off = slot1.data_offset(&header);
        assert_eq!(&image[off..off + slot1.size as usize], b"beta");

        // CRC of the image matches the stamped value
        assert_eq!(header.compute_crc_of(&image), header.cur_grp_crc);

        // Footer seals the same group
        let footer =
            LogGroupFooter::decode(&image[header.footer_offset as usize..]);
        assert!(footer.matches(&header));
    }

    #[test]
    fn group_layout_oob_record() {
        let mut lg = LogGroup::new();
        lg.start(512, 512);
        lg.reset(4);

        let payload = AlignedBuf::from_slice(&vec![0xCD; 4096]);
        let oob = Arc::new(LogRecord {
            store_id: 3,
            seq_num: 8,
            data: payload,
            context: None,
        });
        assert!(lg.add_record(&rec(3, 7, b"tiny"), 20));
        assert!(lg.add_record(&oob, 21));
        lg.finish(1, 0);

        let header = lg.header();
        assert_eq!(header.n_records, 2);
        assert_eq!(header.oob_data_offset as u64 % 512, 0);
        assert_eq!(
            header.footer_offset,
            header.oob_data_offset + 4096
        );

        let image: Vec<u8> = {
            let mut v = Vec::new();
            for iov in lg.iovecs() {
                v.extend_from_slice(&iov);
            }
            v
        };
        assert_eq!(image.len(), lg.group_size());

        let slot = LogGroupHeader::nth_record(&image, 1);
        assert!(!slot.is_inlined);
        assert_eq!(slot.offset, 0); // first OOB payload
        let off = slot.data_offset(&header);
        assert!(image[off..off + 4096].iter().all(|&b| b == 0xCD));
        assert_eq!(header.compute_crc_of(&image), header.cur_grp_crc);
    }

    #[test]
    fn inline_buffer_grows_on_demand() {
        let mut lg = LogGroup::new();
        lg.start(512, 65536);
        lg.reset(8);

        // Every record is inlineable (below optimal) and together they
        // exceed the initial inline buffer.
        for i in 0..4 {
            let data = vec![i as u8; 4000];
            assert!(lg.add_record(&rec(1, i as i64, &data), i as i64));
        }
        lg.finish(0, 0);

        let header = lg.header();
        assert_eq!(header.n_records, 4);
        let image: Vec<u8> = {
            let mut v = Vec::new();
            for iov in lg.iovecs() {
                v.extend_from_slice(&iov);
            }
            v
        };
        for i in 0..4u32 {
            let slot = LogGroupHeader::nth_record(&image, i as usize);
            let off = slot.data_offset(&header);
            assert!(image[off..off + 4000].iter().all(|&b| b == i as u8));
        }
        assert_eq!(header.compute_crc_of(&image), header.cur_grp_crc);
    }

    #[test]
    fn slot_capacity_rejects_extra_records() {
        let mut lg = LogGroup::new();
        lg.start(512, 512);
        lg.reset(2);
        assert!(lg.add_record(&rec(1, 0, b"a"), 0));
        assert!(lg.add_record(&rec(1, 1, b"b"), 1));
        assert!(!lg.add_record(&rec(1, 2, b"c"), 2));
        assert_eq!(lg.nrecords(), 2);
    }
}
