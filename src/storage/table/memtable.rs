//! MemTable: writable in-memory frontier
//!
//! Rows are kept in a `Vec` sorted by the layout's `RowOrder`. Writing the
//! same key again replaces the stored row, and deleting writes a tombstone in
//! place so the row keeps masking older tables until it is merged away.
//!
//! ## Performance
//! - Lookup: O(log n)
//! - Insert: O(n) worst case (shift), fine at frontier sizes

use super::sstable::SortedTable;
use super::RowLayout;
use crate::{Result, StorageError};
use std::path::Path;
use tracing::debug;

/// In-memory sorted rows
#[derive(Debug, Clone)]
pub struct MemTable {
    layout: RowLayout,
    rows: Vec<Box<[u8]>>,
}

impl MemTable {
    pub fn new(layout: RowLayout) -> Self {
        Self {
            layout,
            rows: Vec::new(),
        }
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Check if MemTable should be flushed
    pub fn should_flush(&self, max_rows: usize) -> bool {
        self.rows.len() >= max_rows
    }

    /// `Ok(index)` for a stored key, `Err(insertion_point)` otherwise
    pub fn search(&self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        self.layout.check_key(key)?;
        Ok(self
            .rows
            .binary_search_by(|row| self.layout.compare(row, key)))
    }

    /// Stored row for `key`, tombstones included
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        Ok(self.search(key)?.ok().map(|i| &*self.rows[i]))
    }

    pub fn row(&self, index: usize) -> Option<&[u8]> {
        self.rows.get(index).map(|r| &**r)
    }

    /// Insert or replace the row with the same key; returns the replaced row
    pub fn put(&mut self, row: &[u8]) -> Result<Option<Box<[u8]>>> {
        self.layout.check_row(row)?;
        match self.search(row)? {
            Ok(i) => Ok(Some(std::mem::replace(&mut self.rows[i], row.into()))),
            Err(i) => {
                self.rows.insert(i, row.into());
                Ok(None)
            }
        }
    }

    /// Tombstone the row stored under `key`
    ///
    /// Returns false if no row with that key is stored here.
    pub fn mark_deleted(&mut self, key: &[u8]) -> Result<bool> {
        let codec = self
            .layout
            .delete_codec()
            .cloned()
            .ok_or_else(|| StorageError::Unsupported("layout has no delete codec".into()))?;
        match self.search(key)? {
            Ok(i) => {
                codec.mark_deleted(&mut self.rows[i]);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.rows.iter().map(|r| &**r)
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Write all rows (tombstones included) to a new table at `path`
    pub fn flush_to(&self, path: impl AsRef<Path>, copy_buffer_rows: usize) -> Result<SortedTable> {
        let mut table =
            SortedTable::create(path, self.layout.clone())?.with_copy_buffer_rows(copy_buffer_rows);

        let width = self.layout.row_width();
        let mut chunk = Vec::with_capacity(copy_buffer_rows.max(1) * width);
        for rows in self.rows.chunks(copy_buffer_rows.max(1)) {
            chunk.clear();
            for row in rows {
                chunk.extend_from_slice(row);
            }
            table.append(&chunk)?;
        }
        table.sync()?;

        debug!(path = %table.path().display(), rows = self.rows.len(), "memtable flushed");
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::table::test_util::*;
    use tempfile::TempDir;

    #[test]
    fn test_memtable_put_get() {
        let mut mem = MemTable::new(int_layout());
        assert!(mem.put(&row(5, 50)).unwrap().is_none());
        mem.put(&row(-2, 1)).unwrap();
        mem.put(&row(9, 2)).unwrap();

        assert_eq!(mem.len(), 3);
        assert_eq!(payload_of(mem.get(&key(5)).unwrap().unwrap()), 50);
        assert!(mem.get(&key(6)).unwrap().is_none());

        let keys: Vec<i32> = mem.iter().map(key_of).collect();
        assert_eq!(keys, vec![-2, 5, 9]);
    }

    #[test]
    fn test_memtable_replace() {
        let mut mem = MemTable::new(int_layout());
        mem.put(&row(1, 10)).unwrap();
        let old = mem.put(&row(1, 11)).unwrap().unwrap();
        assert_eq!(payload_of(&old), 10);
        assert_eq!(mem.len(), 1);
        assert_eq!(payload_of(mem.get(&key(1)).unwrap().unwrap()), 11);
    }

    #[test]
    fn test_memtable_mark_deleted() {
        let mut mem = MemTable::new(int_layout_with_deletes());
        mem.put(&row(3, 30)).unwrap();

        assert!(mem.mark_deleted(&key(3)).unwrap());
        assert!(!mem.mark_deleted(&key(4)).unwrap());

        let stored = mem.get(&key(3)).unwrap().unwrap();
        assert!(mem.layout().is_deleted(stored));
    }

    #[test]
    fn test_mark_deleted_needs_codec() {
        let mut mem = MemTable::new(int_layout());
        mem.put(&row(3, 30)).unwrap();
        let err = mem.mark_deleted(&key(3)).unwrap_err();
        assert!(matches!(err, StorageError::Unsupported(_)));
    }

    #[test]
    fn test_memtable_rejects_wrong_width() {
        let mut mem = MemTable::new(int_layout());
        assert!(mem.put(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_flush_to_table() {
        let dir = TempDir::new().unwrap();
        let mut mem = MemTable::new(int_layout_with_deletes());
        for k in [7, 1, 4, 9, 2] {
            mem.put(&row(k, k)).unwrap();
        }
        mem.mark_deleted(&key(4)).unwrap();
        assert!(mem.should_flush(5));

        let table = mem.flush_to(dir.path().join("flush.rows"), 2).unwrap();
        assert_eq!(table.row_count(), 5);
        let rows: Vec<Vec<u8>> = table.iter().collect::<Result<_>>().unwrap();
        let keys: Vec<i32> = rows.iter().map(|r| key_of(r)).collect();
        assert_eq!(keys, vec![1, 2, 4, 7, 9]);
        assert!(table.layout().is_deleted(&rows[2]));
    }
}
