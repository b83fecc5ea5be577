//! Binary search over a `SortedTable` with a read-ahead window
//!
//! The search narrows the row range with single-row disk reads until it fits in
//! one window, then loads that window and finishes in memory. The window is
//! kept, so nearby searches (the merge engine's access pattern) mostly avoid
//! disk entirely. Every loaded window is order-checked on the way in.

use super::sstable::SortedTable;
use crate::{Result, StorageError};
use std::cmp::Ordering;

/// Rows loaded per window unless configured otherwise
pub const DEFAULT_ROWS_PER_SEARCH_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Hit(u64),
    Miss(u64),
}

/// Per-thread search state over one table
///
/// The table is borrowed for the searcher's lifetime, so it cannot grow
/// underneath a loaded window.
pub struct Searcher<'a> {
    table: &'a SortedTable,
    rows_per_buffer: usize,

    /// Window of rows `[buffer_first, buffer_first + buffer_rows)`
    buffer: Vec<u8>,
    buffer_first: u64,
    buffer_rows: u64,

    /// Scratch row for single-row disk reads
    scratch: Vec<u8>,

    /// Copy of the last hit
    hit: Vec<u8>,
    outcome: Option<Outcome>,
}

impl<'a> Searcher<'a> {
    pub fn new(table: &'a SortedTable, rows_per_buffer: usize) -> Self {
        let width = table.row_width();
        Self {
            table,
            rows_per_buffer: rows_per_buffer.max(1),
            buffer: Vec::new(),
            buffer_first: 0,
            buffer_rows: 0,
            scratch: vec![0u8; width],
            hit: vec![0u8; width],
            outcome: None,
        }
    }

    pub fn table(&self) -> &'a SortedTable {
        self.table
    }

    /// Search the whole table for `key`
    pub fn search(&mut self, key: &[u8]) -> Result<bool> {
        self.search_range(key, 0, self.table.row_count())
    }

    /// Search rows `[lo, hi)` for `key`
    ///
    /// On a miss the insertion point is the position within `[lo, hi]` where
    /// `key` would go.
    pub fn search_range(&mut self, key: &[u8], lo: u64, hi: u64) -> Result<bool> {
        let layout = self.table.layout();
        layout.check_key(key)?;
        if lo > hi || hi > self.table.row_count() {
            return Err(StorageError::InvalidArgument(format!(
                "search range {}..{} outside table of {} rows",
                lo,
                hi,
                self.table.row_count()
            )));
        }
        self.outcome = None;

        let (mut lo, mut hi) = (lo, hi);

        // Narrow with the current window first
        if let Some((s, e)) = self.window_overlap(lo, hi) {
            if layout.compare(key, self.buffered(s)) == Ordering::Less {
                hi = s;
            } else if layout.compare(key, self.buffered(e - 1)) == Ordering::Greater {
                lo = e;
            } else {
                return Ok(self.search_window(key, s, e));
            }
        }

        // Disk reads until the range fits in one window
        while hi - lo > self.rows_per_buffer as u64 {
            let mid = lo + (hi - lo) / 2;
            self.table.read_row(mid, &mut self.scratch)?;
            match layout.compare(key, &self.scratch) {
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
                Ordering::Equal => {
                    self.hit.copy_from_slice(&self.scratch);
                    self.outcome = Some(Outcome::Hit(mid));
                    return Ok(true);
                }
            }
        }

        if lo == hi {
            self.outcome = Some(Outcome::Miss(lo));
            return Ok(false);
        }

        self.load_window(lo)?;
        Ok(self.search_window(key, lo, hi))
    }

    /// Rows of `[lo, hi)` covered by the loaded window
    fn window_overlap(&self, lo: u64, hi: u64) -> Option<(u64, u64)> {
        let s = lo.max(self.buffer_first);
        let e = hi.min(self.buffer_first + self.buffer_rows);
        (s < e).then_some((s, e))
    }

    #[inline]
    fn buffered(&self, index: u64) -> &[u8] {
        let width = self.table.row_width();
        let pos = (index - self.buffer_first) as usize * width;
        &self.buffer[pos..pos + width]
    }

    /// Load a full window that contains row `lo` and everything up to `lo + rows_per_buffer`
    fn load_window(&mut self, lo: u64) -> Result<()> {
        let width = self.table.row_width();
        let end = self
            .table
            .row_count()
            .min(lo.saturating_add(self.rows_per_buffer as u64));
        let start = end.saturating_sub(self.rows_per_buffer as u64);
        let rows = end - start;

        self.buffer_rows = 0;
        self.buffer.resize(rows as usize * width, 0);
        self.table.read_rows(start, &mut self.buffer)?;
        self.table
            .layout()
            .check_ascending(&self.buffer, &self.table.path().display().to_string())?;

        self.buffer_first = start;
        self.buffer_rows = rows;
        Ok(())
    }

    /// Binary search within window rows `[lo, hi)`
    fn search_window(&mut self, key: &[u8], mut lo: u64, mut hi: u64) -> bool {
        let layout = self.table.layout();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match layout.compare(key, self.buffered(mid)) {
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
                Ordering::Equal => {
                    let width = self.table.row_width();
                    let pos = (mid - self.buffer_first) as usize * width;
                    self.hit.copy_from_slice(&self.buffer[pos..pos + width]);
                    self.outcome = Some(Outcome::Hit(mid));
                    return true;
                }
            }
        }
        self.outcome = Some(Outcome::Miss(lo));
        false
    }

    /// Row found by the last search
    pub fn hit_row(&self) -> Option<&[u8]> {
        match self.outcome {
            Some(Outcome::Hit(_)) => Some(&self.hit),
            _ => None,
        }
    }

    pub fn hit_row_number(&self) -> Option<u64> {
        match self.outcome {
            Some(Outcome::Hit(i)) => Some(i),
            _ => None,
        }
    }

    /// Where the last missed key would be inserted
    pub fn insertion_point(&self) -> Option<u64> {
        match self.outcome {
            Some(Outcome::Miss(p)) => Some(p),
            _ => None,
        }
    }

    /// `index` on a hit, `-(insertion_point) - 1` on a miss
    pub fn result_code(&self) -> Option<i64> {
        self.outcome.map(|o| match o {
            Outcome::Hit(i) => i as i64,
            Outcome::Miss(p) => -(p as i64) - 1,
        })
    }

    /// Row `index`, served from the window when it is loaded
    pub fn row_at(&mut self, index: u64) -> Result<&[u8]> {
        if index >= self.buffer_first && index < self.buffer_first + self.buffer_rows {
            return Ok(self.buffered(index));
        }
        self.table.read_row(index, &mut self.scratch)?;
        Ok(&self.scratch)
    }
}
