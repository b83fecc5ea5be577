//! Merging sorted tables
//!
//! - `merge_sort`: the merge engine (`SetMergeSort`)
//! - `policy`: which tables to merge (`MergePolicy`, `TieredMergePolicy`)
//! - `jobs`: independent merges in parallel on the rayon pool

mod jobs;
mod merge_sort;
mod policy;

pub use jobs::{run_merge_jobs, MergeJob};
pub use merge_sort::{MergeStats, SetMergeSort};
pub use policy::{MergePolicy, TableInfo, TieredMergePolicy};
