//! TableStore: a directory of sorted tables with atomic set changes
//!
//! ## Directory layout
//! ```text
//! <dir>/
//!   COMMIT            live table ids, oldest first (CommitRecord)
//!   KEYSTONE          next table id (FileKeystone)
//!   table-<id>.rows   one SortedTable per id
//! ```
//!
//! ## Lifecycle
//! - New tables are fully written and fsynced before the commit record names them
//! - Compaction merges a contiguous range, swaps the record (merged id takes
//!   the range's position), then retires the inputs
//! - Retired files are unlinked when the last reader drops its handle
//! - `table-*.rows` files not named by the record are orphans from a crash
//!   and are removed on open

use crate::config::StoreConfig;
use crate::storage::compaction::{MergePolicy, MergeStats, SetMergeSort, TableInfo};
use crate::storage::file_manager::FileRefManager;
use crate::storage::manifest::{CachedKeystone, CommitRecord, FileKeystone, Keystone};
use crate::storage::table::{MemTable, RowLayout, SortedTable, TableSet};
use crate::{Result, StorageError};
use ahash::AHashSet;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const COMMIT_FILE: &str = "COMMIT";
const KEYSTONE_FILE: &str = "KEYSTONE";
const TABLE_PREFIX: &str = "table-";
const TABLE_SUFFIX: &str = ".rows";

/// Table id encoded in a `table-<id>.rows` file name
fn parse_table_file(name: &str) -> Option<u64> {
    name.strip_prefix(TABLE_PREFIX)?
        .strip_suffix(TABLE_SUFFIX)?
        .parse()
        .ok()
}

pub struct TableStore {
    dir: PathBuf,
    layout: RowLayout,
    config: StoreConfig,
    commit: CommitRecord,
    /// Next table id
    next_id: CachedKeystone<FileKeystone>,
    files: FileRefManager,
    /// Live tables, oldest first (same order as the commit record)
    tables: Vec<Arc<SortedTable>>,
}

impl TableStore {
    /// Open or create a store in `dir`
    pub fn open(dir: impl AsRef<Path>, layout: RowLayout, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let commit = CommitRecord::new(dir.join(COMMIT_FILE));
        let ids = commit.load()?;
        let files = FileRefManager::new();

        let mut tables = Vec::with_capacity(ids.len());
        for &id in &ids {
            let path = Self::table_path_in(&dir, id);
            let file = files.open(&path).map_err(|e| match e {
                StorageError::FileNotFound(p) => StorageError::Corruption(format!(
                    "committed table {} is missing ({})",
                    id,
                    p.display()
                )),
                other => other,
            })?;
            let table = SortedTable::open_in(file, 0, layout.clone())?
                .with_id(id)
                .with_copy_buffer_rows(config.copy_buffer_rows);
            tables.push(Arc::new(table));
        }

        Self::sweep_orphans(&dir, &ids)?;

        let keystone_path = dir.join(KEYSTONE_FILE);
        let keystone = if keystone_path.exists() {
            FileKeystone::open_file(&keystone_path)?
        } else {
            FileKeystone::create_file(&keystone_path, 1)?
        };
        let next_id = CachedKeystone::new(keystone)?;

        // A rolling keystone may lag behind ids that reached the record
        let floor = ids.iter().max().map_or(1, |max| *max as i64 + 1);
        if next_id.get()? < floor {
            warn!(next_id = next_id.get()?, floor, "keystone behind commit record, advancing");
            next_id.put(floor, false)?;
        }

        info!(
            dir = %dir.display(),
            tables = tables.len(),
            next_id = next_id.get()?,
            "table store opened"
        );

        Ok(Self {
            dir,
            layout,
            config,
            commit,
            next_id,
            files,
            tables,
        })
    }

    /// Remove uncommitted table files and a stale commit temp file
    fn sweep_orphans(dir: &Path, live: &[u64]) -> Result<()> {
        let live: AHashSet<u64> = live.iter().copied().collect();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            let orphan = match parse_table_file(name) {
                Some(id) => !live.contains(&id),
                None => name == format!("{}.tmp", COMMIT_FILE),
            };
            if orphan {
                info!(file = name, "removing orphan file");
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn table_path_in(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("{}{}{}", TABLE_PREFIX, id, TABLE_SUFFIX))
    }

    pub fn table_path(&self, id: u64) -> PathBuf {
        Self::table_path_in(&self.dir, id)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Live tables, oldest first
    pub fn tables(&self) -> &[Arc<SortedTable>] {
        &self.tables
    }

    pub fn table_ids(&self) -> Vec<u64> {
        self.tables.iter().filter_map(|t| t.id()).collect()
    }

    pub fn table_infos(&self) -> Vec<TableInfo> {
        self.tables
            .iter()
            .filter_map(|t| {
                t.id().map(|table_id| TableInfo {
                    table_id,
                    size: t.byte_size(),
                })
            })
            .collect()
    }

    /// Snapshot of the live tables; stays readable across later compactions
    pub fn table_set(&self) -> Result<TableSet> {
        Ok(TableSet::with_layout(self.layout.clone(), self.tables.clone())?
            .with_rows_per_search_buffer(self.config.rows_per_search_buffer))
    }

    pub fn table_set_with_frontier(&self, frontier: MemTable) -> Result<TableSet> {
        self.table_set()?.with_frontier(frontier)
    }

    /// Whether `frontier` has reached the configured flush threshold
    pub fn needs_flush(&self, frontier: &MemTable) -> bool {
        frontier.should_flush(self.config.frontier_max_rows)
    }

    fn allocate_id(&self) -> Result<u64> {
        let rolling = self.config.durability.is_rolling();
        let next = self.next_id.increment(1, rolling)?;
        Ok((next - 1) as u64)
    }

    /// Make `ids` the live set: keystone first, then the commit point
    fn commit_ids(&self, ids: &[u64]) -> Result<()> {
        self.next_id.commit()?;
        self.commit.write(ids)
    }

    fn publish(&mut self, table: SortedTable) -> Result<u64> {
        let id = table
            .id()
            .ok_or_else(|| StorageError::InvalidArgument("table has no id".into()))?;
        let mut ids = self.table_ids();
        ids.push(id);
        self.commit_ids(&ids)?;
        self.tables.push(Arc::new(table));
        debug!(id, "table published");
        Ok(id)
    }

    /// Write `rows` (whole, strictly ascending) as the newest table
    pub fn write_table(&mut self, rows: &[u8]) -> Result<u64> {
        let id = self.allocate_id()?;
        let mut table = SortedTable::create_in(
            self.files.create_new(self.table_path(id))?,
            0,
            self.layout.clone(),
        )?
        .with_id(id)
        .with_copy_buffer_rows(self.config.copy_buffer_rows);
        table.append(rows)?;
        table.sync()?;
        self.publish(table)
    }

    /// Persist `frontier` as the newest table; None if it is empty
    pub fn flush(&mut self, frontier: &MemTable) -> Result<Option<u64>> {
        if frontier.is_empty() {
            return Ok(None);
        }
        self.layout.check_compatible(frontier.layout())?;
        let id = self.allocate_id()?;
        let table = frontier
            .flush_to(self.table_path(id), self.config.copy_buffer_rows)?
            .with_id(id);
        self.publish(table).map(Some)
    }

    /// Merge whatever `policy` selects; None if it selects nothing
    pub fn compact(&mut self, policy: &dyn MergePolicy) -> Result<Option<MergeStats>> {
        match policy.select(&self.table_infos()) {
            Some(range) => self.compact_range(range).map(Some),
            None => Ok(None),
        }
    }

    /// Merge live tables `range` (positions, oldest first) into one
    pub fn compact_range(&mut self, range: Range<usize>) -> Result<MergeStats> {
        if range.is_empty() || range.end > self.tables.len() {
            return Err(StorageError::InvalidArgument(format!(
                "compaction range {:?} invalid for {} tables",
                range,
                self.tables.len()
            )));
        }

        let id = self.allocate_id()?;
        let target = self.table_path(id);
        let sources = &self.tables[range.clone()];

        // Older tables still need the tombstones that mask them
        let back_set = if self.layout.delete_codec().is_some() && range.start > 0 {
            Some(TableSet::with_layout(
                self.layout.clone(),
                self.tables[..range.start].to_vec(),
            )?)
        } else {
            None
        };

        let mut merge = SetMergeSort::new(sources.iter().map(|t| t.as_ref()), &target)?
            .with_rows_per_search_buffer(self.config.rows_per_search_buffer)
            .with_copy_buffer_rows(self.config.copy_buffer_rows);
        if let Some(back) = &back_set {
            merge = merge.with_back_set(back)?;
        }
        let (merged, stats) = merge.run()?;
        let merged = merged.with_id(id);

        let mut ids = self.table_ids();
        drop(ids.splice(range.clone(), std::iter::once(id)));
        if let Err(e) = self.commit_ids(&ids) {
            // The rename may already have happened; the sweep on open decides
            warn!(id, error = %e, "commit of compaction failed");
            drop(merged);
            return Err(e);
        }

        let retired: Vec<Arc<SortedTable>> = self
            .tables
            .splice(range.clone(), std::iter::once(Arc::new(merged)))
            .collect();
        for table in &retired {
            table.retire();
        }
        drop(retired);
        self.files.prune();

        info!(
            range = ?range,
            merged_id = id,
            rows = stats.rows_written,
            "compaction committed"
        );
        Ok(stats)
    }
}
