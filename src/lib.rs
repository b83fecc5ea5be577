//! RowStore Storage Engine
//!
//! 嵌入式日志结构有序表存储引擎
//!
//! ## 核心特性
//! - 固定宽度行，按可配置的 `RowOrder` 严格升序存储
//! - 表链 (`TableSet`) 覆盖读取：新表优先，墓碑屏蔽旧行
//! - 批量合并 (`SetMergeSort`)：无冲突区段一次性复制
//! - 崩溃安全元数据：`Keystone` 双槽 + CRC，`CommitRecord` 原子重命名
//!
//! ## 架构
//! - 表层: SortedTable + Searcher (二分查找 + 预读窗口) + MemTable 前沿
//! - 合并层: SetMergeSort + MergePolicy + rayon 并行任务
//! - 元数据层: Keystone + CommitRecord
//! - 目录层: TableStore (COMMIT / KEYSTONE / table-<id>.rows)

pub mod config;
pub mod storage;

mod error;

pub use config::{DurabilityLevel, MergePolicyConfig, StoreConfig};
pub use error::{Result, StorageError};

// 主要对外 API
pub use storage::{
    CommitRecord, DeleteCodec, Direction, FileKeystone, Keystone, MemTable, MergePolicy,
    MergeStats, RowLayout, RowOrder, SetMergeSort, SortedTable, TableSet, TableStore,
    TieredMergePolicy,
};
