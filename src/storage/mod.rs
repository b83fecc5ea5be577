//! Storage layer implementation
//!
//! Log-structured storage of fixed-width sorted rows:
//! - `table`: sorted tables, searchers, the in-memory frontier, table chains
//! - `compaction`: merge engine, merge policy, parallel merge jobs
//! - `manifest`: keystone and commit record (crash-safe metadata)
//! - `store`: directory of tables tying the pieces together

pub mod channel;
pub mod checksum;
pub mod compaction;
pub mod file_manager;
pub mod manifest;
pub mod store;
pub mod table;

pub use checksum::{Checksum, ChecksumError};
pub use compaction::{
    run_merge_jobs, MergeJob, MergePolicy, MergeStats, SetMergeSort, TableInfo, TieredMergePolicy,
};
pub use file_manager::{FileRefManager, SharedFile};
pub use manifest::{CachedKeystone, CommitRecord, FileKeystone, Keystone, MemoryKeystone};
pub use store::TableStore;
pub use table::{
    DeleteCodec, Direction, MemTable, RowLayout, RowOrder, Searcher, SortedTable, TableSet,
    TableSetIter, TableSetReader,
};
