//! Sparse tracker of in-memory log records, indexed by log idx. Appends
//! land out of order (the idx is taken before the tracker lock), so slots
//! are reserved up front and a hole marks an append that has not inserted
//! yet; flushes stop at the first hole to keep groups contiguous.

use super::group::LogRecord;
use std::collections::VecDeque;
use std::sync::Arc;

struct Slot {
    rec: Option<Arc<LogRecord>>,
    completed: bool,
}

pub(crate) struct RecordTracker {
    base_idx: i64,
    entries: VecDeque<Slot>,
}

impl RecordTracker {
    pub(crate) fn new() -> Self {
        Self { base_idx: 0, entries: VecDeque::new() }
    }

    /// Restart the tracker at `start_idx` (the idx the next append gets).
    pub(crate) fn reinit(&mut self, start_idx: i64) {
        self.base_idx = start_idx;
        self.entries.clear();
    }

    pub(crate) fn create(&mut self, idx: i64, rec: Arc<LogRecord>) {
        debug_assert!(idx >= self.base_idx, "append below tracker base");
        let pos = (idx - self.base_idx) as usize;
        while self.entries.len() <= pos {
            self.entries.push_back(Slot { rec: None, completed: false });
        }
        let slot = &mut self.entries[pos];
        debug_assert!(slot.rec.is_none() && !slot.completed);
        slot.rec = Some(rec);
    }

    /// Contiguous run of filled, un-flushed records starting at `from_idx`.
    pub(crate) fn active_from(&self, from_idx: i64) -> Vec<(i64, Arc<LogRecord>)> {
        let mut out = Vec::new();
        if from_idx < self.base_idx {
            return out;
        }
        let mut pos = (from_idx - self.base_idx) as usize;
        while let Some(slot) = self.entries.get(pos) {
            match (&slot.rec, slot.completed) {
                (Some(rec), false) => out.push((self.base_idx + pos as i64, rec.clone())),
                _ => break,
            }
            pos += 1;
        }
        out
    }

    /// Mark `[from, upto]` flushed and return their records for the
    /// completion callbacks; the payload memory is released with the
    /// returned handles.
    pub(crate) fn complete_range(&mut self, from: i64, upto: i64) -> Vec<Arc<LogRecord>> {
        let mut out = Vec::with_capacity((upto - from + 1).max(0) as usize);
        for idx in from..=upto {
            let pos = (idx - self.base_idx) as usize;
            let slot = &mut self.entries[pos];
            if let Some(rec) = slot.rec.take() {
                slot.completed = true;
                out.push(rec);
            }
        }
        out
    }

    /// Drop everything at or below `upto_idx`; returns how many flushed
    /// records were dropped.
    pub(crate) fn truncate(&mut self, upto_idx: i64) -> u64 {
        let mut count = 0;
        while self.base_idx <= upto_idx {
            match self.entries.pop_front() {
                Some(slot) => {
                    if slot.completed {
                        count += 1;
                    }
                    self.base_idx += 1;
                }
                None => {
                    self.base_idx = upto_idx + 1;
                    break;
                }
            }
        }
        count
    }

    pub(crate) fn base_idx(&self) -> i64 {
        self.base_idx
    }
}
