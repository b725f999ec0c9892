//! Forward scanner over the journal used during recovery. Yields one
//! validated group at a time and tracks the CRC chain across groups.
//!
//! Termination is deliberately soft: a bad header magic, a torn footer or
//! a current-group CRC mismatch all look like the end of the log (a torn
//! tail after a crash is exactly that). A broken `prev_group_crc` chain on
//! an otherwise valid group can only be corruption and asserts hard; so
//! does a future log index found past the end (checked by the caller via
//! [`group_in_next_page`](LogStreamReader::group_in_next_page)).

use super::device::JournalDevice;
use super::group::{LogGroupFooter, LogGroupHeader, LOG_GROUP_FOOTER_SIZE, LOG_GROUP_HDR_SIZE};
use crate::config::{debug_print, INITIAL_READ_SIZE};
use std::io;
use std::sync::Arc;

pub(crate) struct LogStreamReader {
    vdev: Arc<JournalDevice>,
    cursor: u64,
    prev_crc: Option<u32>,
    next_log_idx: Option<i64>,
    read_size_multiple: u64,
}

impl LogStreamReader {
    pub(crate) fn new(vdev: Arc<JournalDevice>, device_cursor: u64) -> Self {
        Self {
            vdev,
            cursor: device_cursor,
            prev_crc: None,
            next_log_idx: None,
            read_size_multiple: INITIAL_READ_SIZE,
        }
    }

    /// Read, validate and return the next group. An empty buffer means the
    /// scan is over; `out_dev_offset` is the device offset of the returned
    /// group.
    pub(crate) fn next_group(&mut self, out_dev_offset: &mut u64) -> io::Result<Vec<u8>> {
        let buf = self.read_next_bytes(self.cursor, self.read_size_multiple)?;
        if buf.len() < LOG_GROUP_HDR_SIZE {
            return Ok(Vec::new());
        }

        let header = LogGroupHeader::decode(&buf[..LOG_GROUP_HDR_SIZE]);
        if !header.magic_ok() {
            debug_print!("[log_stream] no header magic at {}, end of stream", self.cursor);
            return Ok(Vec::new());
        }
        let group_size = header.group_size as u64;
        let footer_offset = header.footer_offset as u64;
        if group_size < LOG_GROUP_HDR_SIZE as u64
            || self.cursor + group_size > self.vdev.size()
            || footer_offset < LOG_GROUP_HDR_SIZE as u64
            || footer_offset + LOG_GROUP_FOOTER_SIZE as u64 > group_size
        {
            debug_print!("[log_stream] implausible group layout at {}, end of stream", self.cursor);
            return Ok(Vec::new());
        }

        // On a reused journal an old group from the previous cycle still
        // carries a valid header; its stale log idx marks the end.
        if let Some(expected) = self.next_log_idx {
            if header.start_log_idx != expected {
                debug_print!(
                    "[log_stream] group at {} starts at log_idx {} while {} was expected, end of stream",
                    self.cursor,
                    header.start_log_idx,
                    expected
                );
                return Ok(Vec::new());
            }
        }

        let full = if group_size <= buf.len() as u64 {
            buf
        } else {
            self.read_next_bytes(self.cursor, super::group::round_up(group_size, self.read_size_multiple))?
        };
        if (full.len() as u64) < group_size {
            return Ok(Vec::new());
        }

        let footer = LogGroupFooter::decode(
            &full[header.footer_offset as usize
                ..header.footer_offset as usize + LOG_GROUP_FOOTER_SIZE],
        );
        if !footer.matches(&header) {
            debug_print!("[log_stream] torn footer at {}, end of stream", self.cursor);
            return Ok(Vec::new());
        }

        let crc = header.compute_crc_of(&full[..group_size as usize]);
        if crc != header.cur_grp_crc {
            debug_print!(
                "[log_stream] group crc mismatch at {} (computed {:#x}, header {:#x}), end of stream",
                self.cursor,
                crc,
                header.cur_grp_crc
            );
            return Ok(Vec::new());
        }

        // The chain only breaks through corruption, never through a crash.
        if let Some(prev) = self.prev_crc {
            assert_eq!(
                header.prev_grp_crc, prev,
                "prev_group_crc chain broken at dev offset {}: header carries {:#x}, previous group wrote {:#x}",
                self.cursor, header.prev_grp_crc, prev
            );
        }

        self.prev_crc = Some(header.cur_grp_crc);
        self.next_log_idx = Some(header.start_log_idx + header.n_records as i64);
        *out_dev_offset = self.cursor;
        self.cursor += group_size;

        let mut group = full;
        group.truncate(group_size as usize);
        Ok(group)
    }

    /// Probe the next page boundary for a header. Used after end-of-stream
    /// to tell a clean tail from local corruption.
    pub(crate) fn group_in_next_page(&mut self) -> io::Result<Vec<u8>> {
        self.cursor += self.read_size_multiple;
        let buf = self.read_next_bytes(self.cursor, self.read_size_multiple)?;
        if buf.len() < LOG_GROUP_HDR_SIZE {
            return Ok(Vec::new());
        }
        let header = LogGroupHeader::decode(&buf[..LOG_GROUP_HDR_SIZE]);
        if header.magic_ok() {
            Ok(buf)
        } else {
            Ok(Vec::new())
        }
    }

    /// Device offset the next `next_group` call would read from.
    pub(crate) fn group_cursor(&self) -> u64 {
        self.cursor
    }

    fn read_next_bytes(&self, offset: u64, nbytes: u64) -> io::Result<Vec<u8>> {
        if offset >= self.vdev.size() {
            return Ok(Vec::new());
        }
        let avail = (self.vdev.size() - offset).min(nbytes);
        let mut buf = vec![0u8; avail as usize];
        self.vdev.pread(offset, &mut buf)?;
        Ok(buf)
    }
}
