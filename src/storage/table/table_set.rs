//! TableSet: precedence-ordered chain of tables
//!
//! Members are ordered lowest → highest precedence (oldest first). An optional
//! in-memory frontier sits above every disk table and is the only writable
//! member. Lookups walk from the top; scans take each member's nearest
//! candidate and let the nearest win, ties going to the higher precedence.
//!
//! With a `DeleteCodec`, a tombstone that wins hides its key from `get_row`
//! and `next_row`, masking any older row with the same key.

use super::memtable::MemTable;
use super::searcher::{Searcher, DEFAULT_ROWS_PER_SEARCH_BUFFER};
use super::sstable::SortedTable;
use super::{Direction, RowLayout};
use crate::{Result, StorageError};
use std::cmp::Ordering;
use std::sync::Arc;

/// Chain of sorted tables answering reads over one logical key space
#[derive(Debug)]
pub struct TableSet {
    layout: RowLayout,
    tables: Vec<Arc<SortedTable>>,
    frontier: Option<MemTable>,
    rows_per_search_buffer: usize,
}

impl TableSet {
    /// Chain `tables` (lowest precedence first); layout comes from the first
    pub fn new(tables: Vec<Arc<SortedTable>>) -> Result<Self> {
        let layout = tables
            .first()
            .map(|t| t.layout().clone())
            .ok_or_else(|| StorageError::InvalidArgument("table set needs at least one table".into()))?;
        Self::with_layout(layout, tables)
    }

    /// Chain with an explicit layout; `tables` may be empty
    pub fn with_layout(layout: RowLayout, tables: Vec<Arc<SortedTable>>) -> Result<Self> {
        for table in &tables {
            layout.check_compatible(table.layout())?;
        }
        Ok(Self {
            layout,
            tables,
            frontier: None,
            rows_per_search_buffer: DEFAULT_ROWS_PER_SEARCH_BUFFER,
        })
    }

    /// Put a writable frontier above every disk table
    pub fn with_frontier(mut self, frontier: MemTable) -> Result<Self> {
        self.layout.check_compatible(frontier.layout())?;
        self.frontier = Some(frontier);
        Ok(self)
    }

    pub fn with_rows_per_search_buffer(mut self, rows: usize) -> Self {
        self.rows_per_search_buffer = rows.max(1);
        self
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    pub fn tables(&self) -> &[Arc<SortedTable>] {
        &self.tables
    }

    pub fn frontier(&self) -> Option<&MemTable> {
        self.frontier.as_ref()
    }

    pub fn take_frontier(&mut self) -> Option<MemTable> {
        self.frontier.take()
    }

    pub fn is_delete_aware(&self) -> bool {
        self.layout.delete_codec().is_some()
    }

    /// Reader holding one searcher per disk table
    pub fn reader(&self) -> TableSetReader<'_> {
        TableSetReader {
            set: self,
            searchers: self
                .tables
                .iter()
                .map(|t| t.searcher_with(self.rows_per_search_buffer))
                .collect(),
        }
    }

    pub fn get_row(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.reader().get_row(key)
    }

    pub fn get_raw_row(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.reader().get_raw_row(key)
    }

    pub fn next_row(&self, key: &[u8], direction: Direction, include_key: bool) -> Result<Option<Vec<u8>>> {
        self.reader().next_row(key, direction, include_key)
    }

    /// Ordered scan from `from` (or from the first row in `direction`)
    pub fn iter(&self, from: Option<&[u8]>, direction: Direction, include_key: bool) -> TableSetIter<'_> {
        TableSetIter {
            reader: self.reader(),
            cursor: from.map(<[u8]>::to_vec),
            direction,
            include_key,
            done: false,
        }
    }

    fn frontier_mut(&mut self) -> Result<&mut MemTable> {
        self.frontier
            .as_mut()
            .ok_or_else(|| StorageError::Unsupported("table set has no writable frontier".into()))
    }

    /// Insert or replace a row in the frontier
    pub fn set_row(&mut self, row: &[u8]) -> Result<()> {
        self.frontier_mut()?.put(row)?;
        Ok(())
    }

    /// Write whole rows to the frontier; returns the number written
    pub fn set_rows(&mut self, rows: &[u8]) -> Result<usize> {
        let width = self.layout.row_width();
        if rows.len() % width != 0 {
            return Err(StorageError::InvalidArgument(format!(
                "{} bytes is not a whole number of {}-byte rows",
                rows.len(),
                width
            )));
        }
        let frontier = self.frontier_mut()?;
        for row in rows.chunks_exact(width) {
            frontier.put(row)?;
        }
        Ok(rows.len() / width)
    }

    /// Tombstone `key` in the frontier
    ///
    /// Returns false when the key exists nowhere. A key that lives only in a
    /// disk table cannot be deleted here and yields `Unsupported`.
    pub fn delete_row(&mut self, key: &[u8]) -> Result<bool> {
        if !self.is_delete_aware() {
            return Err(StorageError::Unsupported("layout has no delete codec".into()));
        }
        if self.frontier_mut()?.mark_deleted(key)? {
            return Ok(true);
        }

        let mut reader = TableSetReader {
            set: self,
            searchers: self.tables.iter().map(|t| t.searcher()).collect(),
        };
        match reader.get_row(key)? {
            Some(_) => Err(StorageError::Unsupported(
                "row lives in an immutable table; write a tombstone row with set_row".into(),
            )),
            None => Ok(false),
        }
    }
}

/// Read state for one thread: one `Searcher` per disk table
pub struct TableSetReader<'a> {
    set: &'a TableSet,
    searchers: Vec<Searcher<'a>>,
}

impl<'a> TableSetReader<'a> {
    pub fn layout(&self) -> &'a RowLayout {
        &self.set.layout
    }

    /// Highest-precedence row for `key`, tombstones included
    pub fn get_raw_row(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.set.layout.check_key(key)?;
        if let Some(frontier) = &self.set.frontier {
            if let Some(row) = frontier.get(key)? {
                return Ok(Some(row.to_vec()));
            }
        }
        for searcher in self.searchers.iter_mut().rev() {
            if searcher.search(key)? {
                return Ok(searcher.hit_row().map(<[u8]>::to_vec));
            }
        }
        Ok(None)
    }

    /// Whether any member stores `key`, tombstones included
    pub fn contains_raw(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.get_raw_row(key)?.is_some())
    }

    /// Visible row for `key`; a winning tombstone reads as absent
    pub fn get_row(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .get_raw_row(key)?
            .filter(|row| !self.set.layout.is_deleted(row)))
    }

    /// Nearest row from `key` in `direction`, skipping hidden keys
    pub fn next_row(&mut self, key: &[u8], direction: Direction, include_key: bool) -> Result<Option<Vec<u8>>> {
        self.set.layout.check_key(key)?;
        let mut row = self.next_raw_row(Some(key), direction, include_key)?;
        loop {
            match row {
                Some(r) if self.set.layout.is_deleted(&r) => {
                    row = self.next_raw_row(Some(&r), direction, false)?;
                }
                other => return Ok(other),
            }
        }
    }

    /// First visible row in `direction`
    pub fn first_row(&mut self, direction: Direction) -> Result<Option<Vec<u8>>> {
        match self.next_raw_row(None, direction, true)? {
            Some(r) if self.set.layout.is_deleted(&r) => self.next_row(&r, direction, false),
            other => Ok(other),
        }
    }

    /// Nearest candidate across members; `None` key means "from the edge"
    fn next_raw_row(
        &mut self,
        key: Option<&[u8]>,
        direction: Direction,
        include_key: bool,
    ) -> Result<Option<Vec<u8>>> {
        let layout = &self.set.layout;
        let mut best: Option<Vec<u8>> = None;

        // A candidate replaces the best only when strictly nearer, so walking
        // from the top lets equal keys go to the higher precedence.
        let mut offer = |candidate: &[u8]| {
            let nearer = match &best {
                None => true,
                Some(b) => match direction {
                    Direction::Ascending => layout.compare(candidate, b) == Ordering::Less,
                    Direction::Descending => layout.compare(candidate, b) == Ordering::Greater,
                },
            };
            if nearer {
                best = Some(candidate.to_vec());
            }
        };

        if let Some(frontier) = &self.set.frontier {
            let len = frontier.len() as u64;
            let index = match key {
                None => edge_index(len, direction),
                Some(k) => {
                    let position = frontier.search(k)?.map(|i| i as u64).map_err(|p| p as u64);
                    neighbor_index(position, len, direction, include_key)
                }
            };
            if let Some(row) = index.and_then(|i| frontier.row(i as usize)) {
                offer(row);
            }
        }

        for searcher in self.searchers.iter_mut().rev() {
            let len = searcher.table().row_count();
            let index = match key {
                None => edge_index(len, direction),
                Some(k) => {
                    let found = searcher.search(k)?;
                    let position = if found {
                        searcher.hit_row_number().map(Ok)
                    } else {
                        searcher.insertion_point().map(Err)
                    };
                    match position {
                        Some(p) => neighbor_index(p, len, direction, include_key),
                        None => None,
                    }
                }
            };
            if let Some(i) = index {
                offer(searcher.row_at(i)?);
            }
        }

        Ok(best)
    }
}

/// Row 0 or the last row
fn edge_index(len: u64, direction: Direction) -> Option<u64> {
    if len == 0 {
        return None;
    }
    match direction {
        Direction::Ascending => Some(0),
        Direction::Descending => Some(len - 1),
    }
}

/// Index of the nearest row given a search result (`Ok(hit)` / `Err(insertion)`)
fn neighbor_index(
    position: std::result::Result<u64, u64>,
    len: u64,
    direction: Direction,
    include_key: bool,
) -> Option<u64> {
    let index = match (position, direction) {
        (Ok(i), _) if include_key => Some(i),
        (Ok(i), Direction::Ascending) => Some(i + 1),
        (Ok(i), Direction::Descending) => i.checked_sub(1),
        (Err(p), Direction::Ascending) => Some(p),
        (Err(p), Direction::Descending) => p.checked_sub(1),
    };
    index.filter(|&i| i < len)
}

/// Ordered scan over visible rows
pub struct TableSetIter<'a> {
    reader: TableSetReader<'a>,
    cursor: Option<Vec<u8>>,
    direction: Direction,
    include_key: bool,
    done: bool,
}

impl<'a> Iterator for TableSetIter<'a> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = match &self.cursor {
            None => self.reader.first_row(self.direction),
            Some(key) => self.reader.next_row(key, self.direction, self.include_key),
        };
        // Only the starting key may be included
        self.include_key = false;
        match next {
            Ok(Some(row)) => {
                self.cursor = Some(row.clone());
                Some(Ok(row))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::table::test_util::*;
    use tempfile::TempDir;

    fn table(dir: &TempDir, name: &str, rows: &[Vec<u8>]) -> Arc<SortedTable> {
        let layout = if rows.iter().any(|r| r[8] != 0) {
            int_layout_with_deletes()
        } else {
            int_layout()
        };
        table_with(dir, name, layout, rows)
    }

    fn table_with(dir: &TempDir, name: &str, layout: RowLayout, rows: &[Vec<u8>]) -> Arc<SortedTable> {
        let mut t = SortedTable::create(dir.path().join(name), layout).unwrap();
        t.append(&rows.concat()).unwrap();
        Arc::new(t)
    }

    fn keys(rows: impl Iterator<Item = Result<Vec<u8>>>) -> Vec<i32> {
        rows.map(|r| key_of(&r.unwrap())).collect()
    }

    #[test]
    fn test_chain_precedence() {
        let dir = TempDir::new().unwrap();
        let old = table(&dir, "a", &[row(1, 100), row(2, 200)]);
        let new = table(&dir, "b", &[row(2, 201), row(3, 301)]);
        let set = TableSet::new(vec![old, new]).unwrap();

        assert_eq!(payload_of(&set.get_row(&key(1)).unwrap().unwrap()), 100);
        assert_eq!(payload_of(&set.get_row(&key(2)).unwrap().unwrap()), 201);
        assert_eq!(payload_of(&set.get_row(&key(3)).unwrap().unwrap()), 301);
        assert!(set.get_row(&key(4)).unwrap().is_none());
    }

    #[test]
    fn test_next_row_tie_goes_to_newest() {
        let dir = TempDir::new().unwrap();
        let old = table(&dir, "a", &[row(1, 10), row(5, 50)]);
        let new = table(&dir, "b", &[row(5, 51), row(8, 81)]);
        let set = TableSet::new(vec![old, new]).unwrap();

        let next = set.next_row(&key(2), Direction::Ascending, false).unwrap().unwrap();
        assert_eq!((key_of(&next), payload_of(&next)), (5, 51));

        let next = set.next_row(&key(5), Direction::Ascending, true).unwrap().unwrap();
        assert_eq!(payload_of(&next), 51);

        let next = set.next_row(&key(5), Direction::Ascending, false).unwrap().unwrap();
        assert_eq!(key_of(&next), 8);

        let prev = set.next_row(&key(5), Direction::Descending, false).unwrap().unwrap();
        assert_eq!(key_of(&prev), 1);

        assert!(set.next_row(&key(8), Direction::Ascending, false).unwrap().is_none());
        assert!(set.next_row(&key(1), Direction::Descending, false).unwrap().is_none());
    }

    #[test]
    fn test_iter_merges_members() {
        let dir = TempDir::new().unwrap();
        let a = table(&dir, "a", &[row(1, 0), row(4, 0), row(9, 0)]);
        let b = table(&dir, "b", &[row(2, 0), row(4, 1)]);
        let mut frontier = MemTable::new(int_layout());
        frontier.put(&row(7, 0)).unwrap();
        let set = TableSet::new(vec![a, b]).unwrap().with_frontier(frontier).unwrap();

        assert_eq!(keys(set.iter(None, Direction::Ascending, true)), vec![1, 2, 4, 7, 9]);
        assert_eq!(keys(set.iter(None, Direction::Descending, true)), vec![9, 7, 4, 2, 1]);
        assert_eq!(keys(set.iter(Some(&key(4)), Direction::Ascending, true)), vec![4, 7, 9]);
        assert_eq!(keys(set.iter(Some(&key(4)), Direction::Ascending, false)), vec![7, 9]);
    }

    #[test]
    fn test_tombstone_hides_older_rows() {
        let dir = TempDir::new().unwrap();
        let layout = int_layout_with_deletes();
        let old = table_with(&dir, "a", layout.clone(), &[row(1, 1), row(2, 2), row(3, 3)]);
        let new = table_with(&dir, "b", layout, &[tombstone(2)]);
        let set = TableSet::new(vec![old, new]).unwrap();

        assert!(set.get_row(&key(2)).unwrap().is_none());
        let raw = set.get_raw_row(&key(2)).unwrap().unwrap();
        assert!(set.layout().is_deleted(&raw));

        let next = set.next_row(&key(1), Direction::Ascending, false).unwrap().unwrap();
        assert_eq!(key_of(&next), 3);
        assert_eq!(keys(set.iter(None, Direction::Ascending, true)), vec![1, 3]);
        assert_eq!(keys(set.iter(None, Direction::Descending, true)), vec![3, 1]);
    }

    #[test]
    fn test_leading_tombstone_skipped_by_scan() {
        let dir = TempDir::new().unwrap();
        let t = table(&dir, "a", &[tombstone(1), row(2, 2)]);
        let set = TableSet::new(vec![t]).unwrap();
        assert_eq!(keys(set.iter(None, Direction::Ascending, true)), vec![2]);
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let a = table(&dir, "a", &[row(1, 1)]);
        let b = table_with(&dir, "b", int_layout_with_deletes(), &[row(1, 1)]);
        let err = TableSet::new(vec![a, b]).unwrap_err();
        assert!(matches!(err, StorageError::Incompatible(_)));

        assert!(TableSet::new(vec![]).is_err());
    }

    #[test]
    fn test_writes_need_frontier() {
        let dir = TempDir::new().unwrap();
        let t = table(&dir, "a", &[row(1, 1)]);
        let mut set = TableSet::new(vec![t]).unwrap();
        let err = set.set_row(&row(2, 2)).unwrap_err();
        assert!(matches!(err, StorageError::Unsupported(_)));
    }

    #[test]
    fn test_frontier_writes_shadow_tables() {
        let dir = TempDir::new().unwrap();
        let t = table(&dir, "a", &[row(1, 1), row(2, 2)]);
        let mut set = TableSet::new(vec![t])
            .unwrap()
            .with_frontier(MemTable::new(int_layout()))
            .unwrap();

        set.set_row(&row(2, 22)).unwrap();
        assert_eq!(set.set_rows(&rows_for(&[5, 6])).unwrap(), 2);
        assert_eq!(payload_of(&set.get_row(&key(2)).unwrap().unwrap()), 22);
        assert_eq!(set.frontier().unwrap().len(), 3);
    }

    #[test]
    fn test_delete_row_rules() {
        let dir = TempDir::new().unwrap();
        let layout = int_layout_with_deletes();
        let t = table_with(&dir, "a", layout.clone(), &[row(1, 1)]);
        let mut set = TableSet::new(vec![t])
            .unwrap()
            .with_frontier(MemTable::new(layout))
            .unwrap();

        set.set_row(&row(5, 5)).unwrap();
        assert!(set.delete_row(&key(5)).unwrap());
        assert!(set.get_row(&key(5)).unwrap().is_none());

        // Only in a disk table
        let err = set.delete_row(&key(1)).unwrap_err();
        assert!(matches!(err, StorageError::Unsupported(_)));

        assert!(!set.delete_row(&key(9)).unwrap());
    }

    #[test]
    fn test_delete_row_needs_codec() {
        let mut set = TableSet::with_layout(int_layout(), vec![])
            .unwrap()
            .with_frontier(MemTable::new(int_layout()))
            .unwrap();
        set.set_row(&row(1, 1)).unwrap();
        let err = set.delete_row(&key(1)).unwrap_err();
        assert!(matches!(err, StorageError::Unsupported(_)));
    }

    #[test]
    fn test_reader_reuses_searchers() {
        let dir = TempDir::new().unwrap();
        let ks: Vec<i32> = (0..300).collect();
        let t = Arc::new({
            let mut t = SortedTable::create(dir.path().join("a"), int_layout()).unwrap();
            t.append(&rows_for(&ks)).unwrap();
            t
        });
        let set = TableSet::new(vec![t]).unwrap().with_rows_per_search_buffer(16);
        let mut reader = set.reader();
        for k in ks {
            let r = reader.get_row(&key(k)).unwrap().unwrap();
            assert_eq!(payload_of(&r), k * 10);
        }
        assert!(!reader.contains_raw(&key(300)).unwrap());
    }
}
