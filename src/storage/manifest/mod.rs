//! Manifest: 持久化元数据和原子性提交
//!
//! ## 核心功能
//! 1. **Keystone**: 崩溃安全的单个 `i64`（双槽 + CRC）
//! 2. **CommitRecord**: 原子替换的活动表 id 列表（tmp + fsync + rename）

mod commit_record;
mod keystone;

pub use commit_record::CommitRecord;
pub use keystone::{CachedKeystone, FileKeystone, Keystone, MemoryKeystone};
