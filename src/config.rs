//! Store configuration and durability levels
//!
//! Provides tuning knobs for the read path, bulk copy, frontier flushing and
//! the default tiered merge policy.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 持久性级别（Durability Level）
///
/// Controls how keystone updates reach the disk:
/// - Synchronous: every update is fsynced before returning
/// - Rolling: updates skip the barrier until `commit()` is called
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityLevel {
    /// 同步模式：每次更新立即 fsync（最安全）
    Synchronous,

    /// 滚动模式：批量更新，`commit()` 时统一 fsync
    ///
    /// A crash may lose the updates issued since the last `commit()`, but the
    /// persisted value is never torn.
    Rolling,
}

impl Default for DurabilityLevel {
    fn default() -> Self {
        DurabilityLevel::Synchronous
    }
}

impl DurabilityLevel {
    /// Value passed as the `rolling` flag to keystone updates
    pub fn is_rolling(&self) -> bool {
        matches!(self, Self::Rolling)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Synchronous => "synchronous (fsync per update)",
            Self::Rolling => "rolling (fsync on commit)",
        }
    }
}

/// Parameters for the default tiered merge policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePolicyConfig {
    /// Minimum number of tables merged in one job
    pub min_tables: usize,

    /// Maximum number of tables merged in one job
    pub max_tables: usize,

    /// An older table joins a run only if its size is at most
    /// `size_ratio` × the combined size of the newer tables in the run
    pub size_ratio: f64,
}

impl Default for MergePolicyConfig {
    fn default() -> Self {
        Self {
            min_tables: 4,
            max_tables: 16,
            size_ratio: 1.0,
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Rows held in a searcher's read-ahead buffer
    ///
    /// Binary search goes to disk one row at a time until the candidate range
    /// fits in the buffer; the rest of the search runs in memory.
    pub rows_per_search_buffer: usize,

    /// Rows copied per chunk by bulk append and merge runs
    pub copy_buffer_rows: usize,

    /// Frontier (MemTable) row count that triggers a flush
    pub frontier_max_rows: usize,

    /// 持久性级别
    pub durability: DurabilityLevel,

    /// Tiered merge policy parameters
    pub merge: MergePolicyConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            rows_per_search_buffer: 64,
            copy_buffer_rows: 4096,
            frontier_max_rows: 64 * 1024,
            durability: DurabilityLevel::default(),
            merge: MergePolicyConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Small buffers and eager merging (tests)
    pub fn for_testing() -> Self {
        Self {
            rows_per_search_buffer: 4,
            copy_buffer_rows: 8,
            frontier_max_rows: 128,
            durability: DurabilityLevel::Rolling,
            merge: MergePolicyConfig {
                min_tables: 2,
                max_tables: 8,
                size_ratio: 1.0,
            },
        }
    }

    /// Larger search buffers for point-lookup heavy workloads
    pub fn read_optimized() -> Self {
        Self {
            rows_per_search_buffer: 256,
            merge: MergePolicyConfig {
                min_tables: 2,
                ..MergePolicyConfig::default()
            },
            ..Self::default()
        }
    }

    /// Bigger frontier and lazier merging for ingest heavy workloads
    pub fn write_optimized() -> Self {
        Self {
            copy_buffer_rows: 16 * 1024,
            frontier_max_rows: 256 * 1024,
            durability: DurabilityLevel::Rolling,
            merge: MergePolicyConfig {
                min_tables: 8,
                max_tables: 32,
                size_ratio: 2.0,
            },
            ..Self::default()
        }
    }

    /// Reject settings that would stall the engine
    pub fn validate(&self) -> Result<()> {
        if self.rows_per_search_buffer == 0 {
            return Err(StorageError::InvalidArgument(
                "rows_per_search_buffer must be positive".into(),
            ));
        }
        if self.copy_buffer_rows == 0 {
            return Err(StorageError::InvalidArgument(
                "copy_buffer_rows must be positive".into(),
            ));
        }
        if self.frontier_max_rows == 0 {
            return Err(StorageError::InvalidArgument(
                "frontier_max_rows must be positive".into(),
            ));
        }
        let merge = &self.merge;
        if merge.min_tables < 2 || merge.max_tables < merge.min_tables {
            return Err(StorageError::InvalidArgument(format!(
                "merge table bounds invalid: min {} max {}",
                merge.min_tables, merge.max_tables
            )));
        }
        if !(merge.size_ratio > 0.0) {
            return Err(StorageError::InvalidArgument(format!(
                "merge size_ratio must be positive, got {}",
                merge.size_ratio
            )));
        }
        Ok(())
    }

    /// Load a JSON config file and validate it
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: StoreConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this config as pretty JSON
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_durability_levels() {
        assert!(!DurabilityLevel::Synchronous.is_rolling());
        assert!(DurabilityLevel::Rolling.is_rolling());
        assert_eq!(DurabilityLevel::default(), DurabilityLevel::Synchronous);
    }

    #[test]
    fn test_config_presets() {
        assert!(StoreConfig::default().validate().is_ok());
        assert!(StoreConfig::for_testing().validate().is_ok());
        assert!(StoreConfig::read_optimized().validate().is_ok());
        assert!(StoreConfig::write_optimized().validate().is_ok());

        let testing = StoreConfig::for_testing();
        assert!(testing.durability.is_rolling());
        assert_eq!(testing.merge.min_tables, 2);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = StoreConfig::default();
        config.rows_per_search_buffer = 0;
        assert!(config.validate().is_err());

        let mut config = StoreConfig::default();
        config.merge.max_tables = 1;
        assert!(config.validate().is_err());

        let mut config = StoreConfig::default();
        config.merge.size_ratio = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rowstore.json");

        let config = StoreConfig::write_optimized();
        config.save_json(&path).unwrap();

        let loaded = StoreConfig::load_json(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
