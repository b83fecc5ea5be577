//! SetMergeSort: merge sorted tables into one
//!
//! ## Algorithm
//! One cursor per source, ordered by (key ascending, precedence descending).
//! Each step looks at the two leading cursors `top` and `next`:
//! - same key: `next` is the lower precedence, its row is overridden and skipped
//! - otherwise: `next`'s key is binary-searched in `top`'s remaining rows and
//!   the whole collision-free run before it is copied in one shot
//!
//! Long runs of non-overlapping keys therefore cost one search plus a bulk
//! copy instead of a heap operation per row.
//!
//! With a `DeleteCodec`, tombstones are purged from copied runs unless the
//! back-set (older tables not taking part in the merge) still holds the key;
//! then the tombstone is kept so it keeps masking the older row.

use crate::storage::table::{
    RowLayout, Searcher, SortedTable, TableSet, TableSetReader, DEFAULT_COPY_BUFFER_ROWS,
    DEFAULT_ROWS_PER_SEARCH_BUFFER,
};
use crate::{Result, StorageError};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Merge statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Rows across all sources
    pub rows_read: u64,

    /// Rows in the target
    pub rows_written: u64,

    /// Lower-precedence rows dropped for an equal key
    pub rows_overridden: u64,

    /// Tombstones dropped (no older row left to mask)
    pub tombstones_purged: u64,

    /// Tombstones kept because the back-set holds the key
    pub tombstones_kept: u64,

    /// Collision-free runs copied
    pub runs: u64,

    pub elapsed_ms: u64,
}

struct Cursor<'a> {
    precedence: usize,
    searcher: Searcher<'a>,
    row: u64,
    end: u64,
    current: Vec<u8>,
}

impl<'a> Cursor<'a> {
    fn new(precedence: usize, table: &'a SortedTable, rows_per_buffer: usize) -> Result<Option<Self>> {
        if table.is_empty() {
            return Ok(None);
        }
        let mut searcher = table.searcher_with(rows_per_buffer);
        let current = searcher.row_at(0)?.to_vec();
        Ok(Some(Self {
            precedence,
            searcher,
            row: 0,
            end: table.row_count(),
            current,
        }))
    }

    /// Move to `row`; false once exhausted
    fn seek(&mut self, row: u64) -> Result<bool> {
        self.row = row;
        if row >= self.end {
            return Ok(false);
        }
        let next = self.searcher.row_at(row)?;
        self.current.copy_from_slice(next);
        Ok(true)
    }
}

/// Merge of `sources` (lowest → highest precedence) into a new table
pub struct SetMergeSort<'a> {
    sources: Vec<&'a SortedTable>,
    target: PathBuf,
    layout: RowLayout,
    back_set: Option<&'a TableSet>,
    rows_per_search_buffer: usize,
    copy_buffer_rows: usize,
}

impl<'a> SetMergeSort<'a> {
    pub fn new(
        sources: impl IntoIterator<Item = &'a SortedTable>,
        target: impl AsRef<Path>,
    ) -> Result<Self> {
        let sources: Vec<&'a SortedTable> = sources.into_iter().collect();
        let layout = sources
            .first()
            .map(|t| t.layout().clone())
            .ok_or_else(|| StorageError::InvalidArgument("merge needs at least one source".into()))?;
        for source in &sources[1..] {
            layout.check_compatible(source.layout())?;
        }
        Ok(Self {
            sources,
            target: target.as_ref().to_path_buf(),
            layout,
            back_set: None,
            rows_per_search_buffer: DEFAULT_ROWS_PER_SEARCH_BUFFER,
            copy_buffer_rows: DEFAULT_COPY_BUFFER_ROWS,
        })
    }

    /// Older tables consulted before purging a tombstone
    pub fn with_back_set(mut self, back_set: &'a TableSet) -> Result<Self> {
        if !self.is_delete_aware() {
            return Err(StorageError::InvalidArgument(
                "back-set given for a layout without delete codec".into(),
            ));
        }
        self.layout.check_compatible(back_set.layout())?;
        self.back_set = Some(back_set);
        Ok(self)
    }

    pub fn with_rows_per_search_buffer(mut self, rows: usize) -> Self {
        self.rows_per_search_buffer = rows.max(1);
        self
    }

    /// Rows per chunk when copying runs
    pub fn with_copy_buffer_rows(mut self, rows: usize) -> Self {
        self.copy_buffer_rows = rows.max(1);
        self
    }

    pub fn is_delete_aware(&self) -> bool {
        self.layout.delete_codec().is_some()
    }

    /// Run the merge; the target must not exist
    ///
    /// On failure the partial target is removed.
    pub fn run(self) -> Result<(SortedTable, MergeStats)> {
        let start = Instant::now();
        info!(
            sources = self.sources.len(),
            output = %self.target.display(),
            delete_aware = self.is_delete_aware(),
            "merge started"
        );

        let target = SortedTable::create(&self.target, self.layout.clone())?
            .with_copy_buffer_rows(self.copy_buffer_rows);

        match self.merge_into(target) {
            Ok((target, mut stats)) => {
                stats.elapsed_ms = start.elapsed().as_millis() as u64;
                info!(
                    rows_read = stats.rows_read,
                    rows_written = stats.rows_written,
                    overridden = stats.rows_overridden,
                    purged = stats.tombstones_purged,
                    kept = stats.tombstones_kept,
                    runs = stats.runs,
                    elapsed_ms = stats.elapsed_ms,
                    "merge finished"
                );
                Ok((target, stats))
            }
            Err(e) => {
                warn!(output = %self.target.display(), error = %e, "merge failed, removing partial target");
                if let Err(rm) = std::fs::remove_file(&self.target) {
                    warn!(error = %rm, "could not remove partial merge target");
                }
                Err(e)
            }
        }
    }

    fn merge_into(&self, mut target: SortedTable) -> Result<(SortedTable, MergeStats)> {
        let mut stats = MergeStats::default();
        let mut back = self.back_set.map(TableSet::reader);

        let mut cursors = Vec::with_capacity(self.sources.len());
        for (precedence, &table) in self.sources.iter().enumerate() {
            stats.rows_read += table.row_count();
            if let Some(cursor) = Cursor::new(precedence, table, self.rows_per_search_buffer)? {
                cursors.push(cursor);
            }
        }

        let layout = &self.layout;
        loop {
            cursors.sort_by(|a, b| {
                layout
                    .compare(&a.current, &b.current)
                    .then(b.precedence.cmp(&a.precedence))
            });

            if cursors.len() <= 1 {
                if let Some(last) = cursors.first() {
                    self.emit_run(&mut target, last.searcher.table(), last.row, last.end, &mut back, &mut stats)?;
                }
                break;
            }

            let (head, rest) = cursors.split_at_mut(1);
            let (top, next) = (&mut head[0], &mut rest[0]);

            if layout.compare(&top.current, &next.current) == Ordering::Equal {
                stats.rows_overridden += 1;
                if !next.seek(next.row + 1)? {
                    cursors.remove(1);
                }
                continue;
            }

            // top < next: everything in top before next's key collides with nothing
            let found = top.searcher.search_range(&next.current, top.row, top.end)?;
            let position = if found {
                top.searcher.hit_row_number()
            } else {
                top.searcher.insertion_point()
            };
            let stop = position.unwrap_or(top.row);

            if stop <= top.row {
                return Err(StorageError::NotSorted(format!(
                    "{}: row {} is out of order",
                    top.searcher.table().path().display(),
                    top.row
                )));
            }

            self.emit_run(&mut target, top.searcher.table(), top.row, stop, &mut back, &mut stats)?;
            if !top.seek(stop)? {
                cursors.remove(0);
            }
        }

        target.sync()?;
        stats.rows_written = target.row_count();
        Ok((target, stats))
    }

    /// Copy rows `[from, to)` of `source`, purging tombstones in delete-aware mode
    fn emit_run(
        &self,
        target: &mut SortedTable,
        source: &SortedTable,
        from: u64,
        to: u64,
        back: &mut Option<TableSetReader<'a>>,
        stats: &mut MergeStats,
    ) -> Result<()> {
        if from >= to {
            return Ok(());
        }
        stats.runs += 1;

        if !self.is_delete_aware() {
            return target.append_rows(source, from, to - from);
        }

        let width = self.layout.row_width();
        let chunk_rows = self.copy_buffer_rows as u64;
        let mut buf = vec![0u8; (chunk_rows.min(to - from) as usize) * width];

        let mut pos = from;
        while pos < to {
            let n = chunk_rows.min(to - pos) as usize;
            let chunk = &mut buf[..n * width];
            source.read_rows(pos, chunk)?;

            // Write maximal spans of kept rows
            let mut span_start = 0;
            for i in 0..n {
                let row = &chunk[i * width..(i + 1) * width];
                if !self.layout.is_deleted(row) {
                    continue;
                }
                let keep = match back.as_mut() {
                    Some(reader) => reader.contains_raw(row)?,
                    None => false,
                };
                if keep {
                    stats.tombstones_kept += 1;
                } else {
                    stats.tombstones_purged += 1;
                    target.append(&chunk[span_start * width..i * width])?;
                    span_start = i + 1;
                }
            }
            target.append(&chunk[span_start * width..n * width])?;
            pos += n as u64;
        }

        debug!(source = %source.path().display(), from, to, "run copied");
        Ok(())
    }
}
