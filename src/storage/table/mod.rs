//! Sorted tables of fixed-width rows
//!
//! ## Architecture
//! - **RowOrder / DeleteCodec**: strategies describing key order and tombstones
//! - **SortedTable**: immutable, sorted, disk-backed rows with binary search
//! - **MemTable**: in-memory writable frontier
//! - **TableSet**: precedence-ordered chain answering lookups and scans
//!
//! Every table is opened with a [`RowLayout`]; tables are combined only when
//! their layouts are equal.

mod delete;
mod memtable;
mod order;
mod searcher;
mod sstable;
mod table_set;

pub use delete::DeleteCodec;
pub use memtable::MemTable;
pub use order::RowOrder;
pub use searcher::{Searcher, DEFAULT_ROWS_PER_SEARCH_BUFFER};
pub use sstable::{SortedTable, SortedTableIter, DEFAULT_COPY_BUFFER_ROWS};
pub use table_set::{TableSet, TableSetIter, TableSetReader};

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Scan direction for `TableSet::next_row`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Shape shared by all tables that may be chained or merged together
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowLayout {
    row_width: usize,
    order: RowOrder,
    delete_codec: Option<DeleteCodec>,
}

impl RowLayout {
    /// Layout without logical deletes
    pub fn new(row_width: usize, order: RowOrder) -> Result<Self> {
        if row_width == 0 {
            return Err(StorageError::InvalidArgument("row width must be positive".into()));
        }
        order.validate(row_width)?;
        Ok(Self {
            row_width,
            order,
            delete_codec: None,
        })
    }

    /// Attach a tombstone codec; its bytes must sit inside the row and outside the key
    pub fn with_delete_codec(mut self, codec: DeleteCodec) -> Result<Self> {
        let range = codec.byte_range();
        if range.end > self.row_width {
            return Err(StorageError::Incompatible(format!(
                "delete codec {} reaches byte {} but rows are {} bytes wide",
                codec, range.end, self.row_width
            )));
        }
        if self.order.overlaps(&range) {
            return Err(StorageError::Incompatible(format!(
                "delete codec {} overlaps key region of order {}",
                codec, self.order
            )));
        }
        self.delete_codec = Some(codec);
        Ok(self)
    }

    pub fn row_width(&self) -> usize {
        self.row_width
    }

    pub fn order(&self) -> &RowOrder {
        &self.order
    }

    pub fn delete_codec(&self) -> Option<&DeleteCodec> {
        self.delete_codec.as_ref()
    }

    #[inline]
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.order.compare(a, b)
    }

    /// False when the layout has no codec
    #[inline]
    pub fn is_deleted(&self, row: &[u8]) -> bool {
        self.delete_codec.as_ref().is_some_and(|c| c.is_deleted(row))
    }

    /// Fail with a descriptive `Incompatible` error unless `other` matches
    pub fn check_compatible(&self, other: &RowLayout) -> Result<()> {
        if self.row_width != other.row_width {
            return Err(StorageError::Incompatible(format!(
                "row width mismatch: {} vs {}",
                self.row_width, other.row_width
            )));
        }
        if self.order != other.order {
            return Err(StorageError::Incompatible(format!(
                "row order mismatch: {} vs {}",
                self.order, other.order
            )));
        }
        if self.delete_codec != other.delete_codec {
            let show = |c: &Option<DeleteCodec>| match c {
                Some(codec) => codec.to_string(),
                None => "none".to_string(),
            };
            return Err(StorageError::Incompatible(format!(
                "delete codec mismatch: {} vs {}",
                show(&self.delete_codec),
                show(&other.delete_codec)
            )));
        }
        Ok(())
    }

    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        let extent = self.order.key_extent();
        if key.len() < extent {
            return Err(StorageError::InvalidArgument(format!(
                "key is {} bytes, order {} needs {}",
                key.len(),
                self.order,
                extent
            )));
        }
        Ok(())
    }

    pub(crate) fn check_row(&self, row: &[u8]) -> Result<()> {
        if row.len() != self.row_width {
            return Err(StorageError::InvalidArgument(format!(
                "row is {} bytes, table rows are {}",
                row.len(),
                self.row_width
            )));
        }
        Ok(())
    }

    /// Rows in `buf` must be whole and strictly ascending
    pub(crate) fn check_ascending(&self, buf: &[u8], context: &str) -> Result<()> {
        if buf.len() % self.row_width != 0 {
            return Err(StorageError::InvalidArgument(format!(
                "{}: {} bytes is not a whole number of {}-byte rows",
                context,
                buf.len(),
                self.row_width
            )));
        }
        for (i, pair) in buf.windows(2 * self.row_width).step_by(self.row_width).enumerate() {
            let (a, b) = pair.split_at(self.row_width);
            if self.order.compare(a, b) != Ordering::Less {
                return Err(StorageError::NotSorted(format!(
                    "{}: row {} is not below row {}",
                    context,
                    i,
                    i + 1
                )));
            }
        }
        Ok(())
    }
}
