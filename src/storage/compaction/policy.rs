//! Merge policy: which tables to merge next
//!
//! The engine (`SetMergeSort`) is the mechanism; a `MergePolicy` only picks a
//! contiguous precedence range of the live tables.

use crate::config::MergePolicyConfig;
use std::ops::Range;

/// Live table as seen by a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableInfo {
    pub table_id: u64,
    /// Bytes of row data
    pub size: u64,
}

pub trait MergePolicy: Send + Sync {
    /// `tables` are ordered oldest → newest; returns the range to merge
    fn select(&self, tables: &[TableInfo]) -> Option<Range<usize>>;
}

/// Size-tiered selection over the newest tables
///
/// Starting from the newest table, older tables join the run while each is
/// no larger than `size_ratio` × the combined size of the newer tables
/// already in it. The run is merged if it has at least `min_tables` members.
#[derive(Debug, Clone)]
pub struct TieredMergePolicy {
    min_tables: usize,
    max_tables: usize,
    size_ratio: f64,
}

impl TieredMergePolicy {
    pub fn new(min_tables: usize, max_tables: usize, size_ratio: f64) -> Self {
        let min_tables = min_tables.max(2);
        Self {
            min_tables,
            max_tables: max_tables.max(min_tables),
            size_ratio,
        }
    }
}

impl From<&MergePolicyConfig> for TieredMergePolicy {
    fn from(config: &MergePolicyConfig) -> Self {
        Self::new(config.min_tables, config.max_tables, config.size_ratio)
    }
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        Self::from(&MergePolicyConfig::default())
    }
}

impl MergePolicy for TieredMergePolicy {
    fn select(&self, tables: &[TableInfo]) -> Option<Range<usize>> {
        let n = tables.len();
        if n < self.min_tables {
            return None;
        }

        let mut start = n;
        let mut newer_size = 0u64;
        for i in (0..n).rev() {
            let members = n - i;
            if members > self.max_tables {
                break;
            }
            if members > 1 && tables[i].size as f64 > self.size_ratio * newer_size as f64 {
                break;
            }
            newer_size += tables[i].size;
            start = i;
        }

        (n - start >= self.min_tables).then_some(start..n)
    }
}
