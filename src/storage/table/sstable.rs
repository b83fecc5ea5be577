//! SortedTable: immutable sorted rows on disk
//!
//! ## File Format
//! ```text
//! [base offset ...][row 0][row 1] ... [row N-1]
//! ```
//! Rows are fixed width and strictly ascending under the layout's `RowOrder`.
//! Width, order and codec are not stored in the file; the opener supplies them.
//!
//! A table is written once (flush or merge target) through `append` /
//! `append_rows`, then shared read-only behind an `Arc`. Reads use positional
//! I/O, so any number of threads may read concurrently.

use super::searcher::{Searcher, DEFAULT_ROWS_PER_SEARCH_BUFFER};
use super::RowLayout;
use crate::storage::channel::{read_fully_at, write_fully_at};
use crate::storage::file_manager::SharedFile;
use crate::{Result, StorageError};
use std::cmp::Ordering;
use std::path::Path;
use tracing::debug;

/// Default rows per bulk-copy chunk
pub const DEFAULT_COPY_BUFFER_ROWS: usize = 4096;

/// Sorted table of fixed-width rows
#[derive(Debug)]
pub struct SortedTable {
    /// Shared file handle (retirement deferred until last handle drops)
    file: SharedFile,

    /// Byte offset of row 0
    base_offset: u64,

    layout: RowLayout,

    row_count: u64,

    /// Store-assigned id, if the table belongs to a `TableStore`
    id: Option<u64>,

    /// Copy of the last row, kept to check order at the append seam
    tail: Option<Vec<u8>>,

    copy_buffer_rows: usize,
}

impl SortedTable {
    /// Create a new, empty table file; fails if `path` exists
    pub fn create(path: impl AsRef<Path>, layout: RowLayout) -> Result<Self> {
        let file = SharedFile::create_new(path)?;
        debug!(path = %file.path().display(), width = layout.row_width(), "created table");
        Ok(Self::from_parts(file, 0, layout, 0))
    }

    /// Open an existing table file
    pub fn open(path: impl AsRef<Path>, layout: RowLayout) -> Result<Self> {
        Self::open_in(SharedFile::open(path)?, 0, layout)
    }

    /// Start an empty table at `base_offset` of the file at `path`
    ///
    /// The file is created if missing; bytes before `base_offset` are kept.
    pub fn create_at(path: impl AsRef<Path>, base_offset: u64, layout: RowLayout) -> Result<Self> {
        let path = path.as_ref();
        let file = if path.exists() {
            SharedFile::open(path)?
        } else {
            SharedFile::create_new(path)?
        };
        Self::create_in(file, base_offset, layout)
    }

    /// Open the table stored from `base_offset` to the end of the file at `path`
    pub fn open_at(path: impl AsRef<Path>, base_offset: u64, layout: RowLayout) -> Result<Self> {
        Self::open_in(SharedFile::open(path)?, base_offset, layout)
    }

    /// Open a table occupying the tail of `file` from `base_offset`
    ///
    /// A region that does not hold a whole number of rows is `Corruption`.
    pub fn open_in(file: SharedFile, base_offset: u64, layout: RowLayout) -> Result<Self> {
        let len = file.file().metadata()?.len();
        let region = len.saturating_sub(base_offset);
        let width = layout.row_width() as u64;
        if region % width != 0 {
            return Err(StorageError::Corruption(format!(
                "{}: {} bytes past offset {} is not a multiple of row width {}",
                file.path().display(),
                region,
                base_offset,
                width
            )));
        }
        let row_count = region / width;
        debug!(path = %file.path().display(), rows = row_count, "opened table");
        Ok(Self::from_parts(file, base_offset, layout, row_count))
    }

    /// Start an empty table at `base_offset` of an already open file
    ///
    /// Anything past `base_offset` is overwritten by later appends.
    pub fn create_in(file: SharedFile, base_offset: u64, layout: RowLayout) -> Result<Self> {
        file.file().set_len(base_offset)?;
        Ok(Self::from_parts(file, base_offset, layout, 0))
    }

    fn from_parts(file: SharedFile, base_offset: u64, layout: RowLayout, row_count: u64) -> Self {
        Self {
            file,
            base_offset,
            layout,
            row_count,
            id: None,
            tail: None,
            copy_buffer_rows: DEFAULT_COPY_BUFFER_ROWS,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// Rows moved per chunk by `append_rows`
    pub fn with_copy_buffer_rows(mut self, rows: usize) -> Self {
        self.copy_buffer_rows = rows.max(1);
        self
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    pub fn row_width(&self) -> usize {
        self.layout.row_width()
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    /// Size of the row region in bytes
    pub fn byte_size(&self) -> u64 {
        self.row_count * self.layout.row_width() as u64
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn shared_file(&self) -> &SharedFile {
        &self.file
    }

    /// Unlink the file once the last handle to it is dropped
    pub fn retire(&self) {
        debug!(path = %self.path().display(), "table retired");
        self.file.mark_for_deletion();
    }

    #[inline]
    fn row_offset(&self, index: u64) -> u64 {
        self.base_offset + index * self.layout.row_width() as u64
    }

    fn check_range(&self, from: u64, count: u64) -> Result<()> {
        let end = from.checked_add(count).unwrap_or(u64::MAX);
        if end > self.row_count {
            return Err(StorageError::OutOfRange {
                index: end.saturating_sub(1).max(from),
                row_count: self.row_count,
            });
        }
        Ok(())
    }

    /// Read row `index` into `out` (exactly one row wide)
    pub fn read_row(&self, index: u64, out: &mut [u8]) -> Result<()> {
        if index >= self.row_count {
            return Err(StorageError::OutOfRange {
                index,
                row_count: self.row_count,
            });
        }
        self.layout.check_row(out)?;
        read_fully_at(self.file.file(), out, self.row_offset(index))
    }

    /// Read row `index` into a new buffer
    pub fn row(&self, index: u64) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.layout.row_width()];
        self.read_row(index, &mut out)?;
        Ok(out)
    }

    /// Read `out.len() / row_width` consecutive rows starting at `from`
    pub fn read_rows(&self, from: u64, out: &mut [u8]) -> Result<()> {
        let width = self.layout.row_width();
        if out.len() % width != 0 {
            return Err(StorageError::InvalidArgument(format!(
                "buffer of {} bytes is not a whole number of {}-byte rows",
                out.len(),
                width
            )));
        }
        self.check_range(from, (out.len() / width) as u64)?;
        read_fully_at(self.file.file(), out, self.row_offset(from))
    }

    /// Last row, from the cached tail when available
    fn last_row(&mut self) -> Result<Option<Vec<u8>>> {
        if self.row_count == 0 {
            return Ok(None);
        }
        if self.tail.is_none() {
            self.tail = Some(self.row(self.row_count - 1)?);
        }
        Ok(self.tail.clone())
    }

    /// Append whole rows; they must continue the strictly ascending sequence
    pub fn append(&mut self, rows: &[u8]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let width = self.layout.row_width();
        self.layout.check_ascending(rows, "append")?;

        if let Some(last) = self.last_row()? {
            if self.layout.compare(&last, &rows[..width]) != Ordering::Less {
                return Err(StorageError::NotSorted(format!(
                    "{}: appended row does not follow row {}",
                    self.path().display(),
                    self.row_count - 1
                )));
            }
        }

        write_fully_at(self.file.file(), rows, self.row_offset(self.row_count))?;
        self.row_count += (rows.len() / width) as u64;
        self.tail = Some(rows[rows.len() - width..].to_vec());
        Ok(())
    }

    /// Bulk-copy `count` rows of `source` starting at `from_row` onto the tail
    ///
    /// Rows move through one chunk buffer; each chunk is order-checked in
    /// memory, so a disordered source fails with `NotSorted` instead of
    /// producing a corrupt table.
    pub fn append_rows(&mut self, source: &SortedTable, from_row: u64, count: u64) -> Result<()> {
        self.layout.check_compatible(&source.layout)?;
        source.check_range(from_row, count)?;

        let width = self.layout.row_width();
        let chunk_rows = self.copy_buffer_rows as u64;
        let mut buf = vec![0u8; (chunk_rows.min(count) as usize) * width];

        let mut copied = 0u64;
        while copied < count {
            let n = chunk_rows.min(count - copied) as usize;
            let chunk = &mut buf[..n * width];
            source.read_rows(from_row + copied, chunk)?;
            self.append(chunk)?;
            copied += n as u64;
        }
        Ok(())
    }

    /// fsync the table data
    pub fn sync(&self) -> Result<()> {
        self.file.file().sync_data()?;
        Ok(())
    }

    /// Searcher with the default read-ahead buffer
    pub fn searcher(&self) -> Searcher<'_> {
        Searcher::new(self, DEFAULT_ROWS_PER_SEARCH_BUFFER)
    }

    /// Searcher holding up to `rows_per_buffer` rows of read-ahead
    pub fn searcher_with(&self, rows_per_buffer: usize) -> Searcher<'_> {
        Searcher::new(self, rows_per_buffer)
    }

    /// Sequential scan over all rows
    pub fn iter(&self) -> SortedTableIter<'_> {
        SortedTableIter {
            table: self,
            next_row: 0,
            buffer: Vec::new(),
            buffer_first: 0,
            buffer_rows: 0,
        }
    }
}

/// Streaming iterator: reads chunks on demand instead of loading the table
pub struct SortedTableIter<'a> {
    table: &'a SortedTable,
    next_row: u64,
    buffer: Vec<u8>,
    buffer_first: u64,
    buffer_rows: u64,
}

impl<'a> SortedTableIter<'a> {
    fn load_chunk(&mut self) -> Result<()> {
        let width = self.table.row_width();
        let n = (self.table.copy_buffer_rows as u64).min(self.table.row_count - self.next_row);
        self.buffer.resize(n as usize * width, 0);
        self.table.read_rows(self.next_row, &mut self.buffer)?;
        self.buffer_first = self.next_row;
        self.buffer_rows = n;
        Ok(())
    }
}

impl<'a> Iterator for SortedTableIter<'a> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_row >= self.table.row_count {
            return None;
        }
        if self.next_row >= self.buffer_first + self.buffer_rows {
            if let Err(e) = self.load_chunk() {
                // Stop after reporting the error once
                self.next_row = self.table.row_count;
                return Some(Err(e));
            }
        }
        let width = self.table.row_width();
        let pos = (self.next_row - self.buffer_first) as usize * width;
        self.next_row += 1;
        Some(Ok(self.buffer[pos..pos + width].to_vec()))
    }
}
