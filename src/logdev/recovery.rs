//! Recovery: forward scan of the journal from the persisted start offset,
//! replaying every surviving record to its stream.

use super::group::{LogGroupHeader, LOG_GROUP_HDR_SIZE};
use super::stream::LogStreamReader;
use super::{LogDev, LogDevKey, LogFoundEntry};
use crate::config::{debug_print, MAX_BLKS_READ_FOR_ADDITIONAL_CHECK};
use std::io;
use std::sync::atomic::Ordering;

impl LogDev {
    /// Scan groups from `start_offset`, dispatch every non-rolled-back
    /// record, and leave the device tail where new appends continue.
    pub(crate) fn do_load(&self, start_offset: u64) -> io::Result<()> {
        let vdev = self.vdev();
        let mut lstream = LogStreamReader::new(vdev.clone(), start_offset);
        let mut log_idx = self.meta.lock().unwrap().get_start_log_idx();
        let mut loaded_from: i64 = -1;

        loop {
            let mut group_dev_offset = 0u64;
            let buf = lstream.next_group(&mut group_dev_offset)?;
            if buf.is_empty() {
                let end_cursor = lstream.group_cursor();
                self.assert_next_pages(&mut lstream, log_idx);
                tracing::info!(
                    logdev_id = self.logdev_id,
                    from = loaded_from,
                    upto = log_idx - 1,
                    "logdev loaded log idx range"
                );
                vdev.update_tail_offset(end_cursor);
                break;
            }

            let header = LogGroupHeader::decode(&buf[..LOG_GROUP_HDR_SIZE]);
            if loaded_from == -1 {
                loaded_from = header.start_log_idx;
            }
            let nrecords = header.n_records as i64;
            let flush_ld_key =
                LogDevKey::new(header.start_log_idx + nrecords - 1, group_dev_offset);

            for i in 0..header.n_records as usize {
                let slot = LogGroupHeader::nth_record(&buf, i);
                let idx = header.start_log_idx + i as i64;
                if self.meta.lock().unwrap().is_rolled_back(slot.store_id, idx) {
                    debug_print!(
                        "[recovery] skipping rolled back record store={} log_idx={}",
                        slot.store_id,
                        idx
                    );
                    continue;
                }
                let data_off = slot.data_offset(&header);
                let data = &buf[data_off..data_off + slot.size as usize];
                self.on_logfound(
                    slot.store_id,
                    slot.store_seq_num,
                    LogDevKey::new(idx, group_dev_offset),
                    flush_ld_key,
                    data,
                    (nrecords - 1 - i as i64) as u32,
                );
            }

            self.group_boundaries
                .lock()
                .unwrap()
                .insert(header.start_log_idx, group_dev_offset);
            log_idx = header.start_log_idx + nrecords;
            self.last_crc.store(header.cur_grp_crc, Ordering::Release);
        }

        self.log_idx.store(log_idx, Ordering::Release);
        Ok(())
    }

    /// End-of-stream was declared at the current cursor. Probe the next
    /// few pages: a header carrying a log idx we have not assigned yet
    /// means the scan stopped on corruption, not on the real tail.
    fn assert_next_pages(&self, lstream: &mut LogStreamReader, cur_log_idx: i64) {
        tracing::info!(
            "validating end of stream at dev offset {}: probing subsequent pages",
            lstream.group_cursor()
        );
        for _ in 0..MAX_BLKS_READ_FOR_ADDITIONAL_CHECK {
            match lstream.group_in_next_page() {
                Ok(buf) if buf.len() >= LOG_GROUP_HDR_SIZE => {
                    let header = LogGroupHeader::decode(&buf[..LOG_GROUP_HDR_SIZE]);
                    assert!(
                        cur_log_idx > header.start_log_idx,
                        "found a header with future log_idx {} (current {}) after reaching end \
                         of log: preceding data must be corrupted",
                        header.start_log_idx,
                        cur_log_idx
                    );
                }
                _ => {}
            }
        }
    }

    fn on_logfound(
        &self,
        store_id: u32,
        seq_num: i64,
        ld_key: LogDevKey,
        flush_ld_key: LogDevKey,
        data: &[u8],
        nremaining_in_batch: u32,
    ) {
        let store = self.stores.read().unwrap().get(&store_id).cloned();
        match store {
            Some(store) => {
                store.on_log_found(&LogFoundEntry {
                    store_id,
                    seq_num,
                    ld_key,
                    flush_ld_key,
                    data,
                    nremaining_in_batch,
                });
            }
            None => {
                *self
                    .unopened_store_io
                    .lock()
                    .unwrap()
                    .entry(store_id)
                    .or_insert(0) += 1;
            }
        }
    }
}
