//! Parallel execution of independent merge jobs
//!
//! Each merge is single-threaded; independent merges run side by side on the
//! rayon pool. Jobs must not share a source or a target.

use super::merge_sort::{MergeStats, SetMergeSort};
use crate::config::StoreConfig;
use crate::storage::table::{SortedTable, TableSet};
use crate::{Result, StorageError};
use ahash::AHashSet;
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// One merge: sources lowest → highest precedence
#[derive(Debug)]
pub struct MergeJob {
    pub sources: Vec<Arc<SortedTable>>,
    pub back_set: Option<TableSet>,
    pub target: PathBuf,
}

impl MergeJob {
    pub fn new(sources: Vec<Arc<SortedTable>>, target: impl Into<PathBuf>) -> Self {
        Self {
            sources,
            back_set: None,
            target: target.into(),
        }
    }

    pub fn with_back_set(mut self, back_set: TableSet) -> Self {
        self.back_set = Some(back_set);
        self
    }

    fn run(&self, config: &StoreConfig) -> Result<(SortedTable, MergeStats)> {
        let mut merge = SetMergeSort::new(self.sources.iter().map(|t| t.as_ref()), &self.target)?
            .with_rows_per_search_buffer(config.rows_per_search_buffer)
            .with_copy_buffer_rows(config.copy_buffer_rows);
        if let Some(back) = &self.back_set {
            merge = merge.with_back_set(back)?;
        }
        merge.run()
    }
}

/// Reject job lists where two jobs touch the same file
fn check_disjoint(jobs: &[MergeJob]) -> Result<()> {
    let mut seen = AHashSet::new();
    for job in jobs {
        let paths = job
            .sources
            .iter()
            .map(|t| t.path().to_path_buf())
            .chain(std::iter::once(job.target.clone()));
        for path in paths {
            if !seen.insert(path.clone()) {
                return Err(StorageError::InvalidArgument(format!(
                    "{} appears in more than one merge job",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

/// Run `jobs` in parallel; results come back in job order
///
/// The outer `Result` fails only when the jobs overlap; each job reports its
/// own outcome.
pub fn run_merge_jobs(
    jobs: Vec<MergeJob>,
    config: &StoreConfig,
) -> Result<Vec<Result<(SortedTable, MergeStats)>>> {
    check_disjoint(&jobs)?;
    info!(jobs = jobs.len(), "running merge jobs");
    Ok(jobs.par_iter().map(|job| job.run(config)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::table::test_util::*;
    use tempfile::TempDir;

    fn build(dir: &TempDir, name: &str, keys: &[i32]) -> Arc<SortedTable> {
        let mut t = SortedTable::create(dir.path().join(name), int_layout()).unwrap();
        t.append(&rows_for(keys)).unwrap();
        Arc::new(t)
    }

    #[test]
    fn test_parallel_jobs() {
        let dir = TempDir::new().unwrap();
        let jobs: Vec<MergeJob> = (0..4)
            .map(|j| {
                let a = build(&dir, &format!("a{}", j), &[j, j + 10]);
                let b = build(&dir, &format!("b{}", j), &[j + 5, j + 10]);
                MergeJob::new(vec![a, b], dir.path().join(format!("out{}", j)))
            })
            .collect();

        let results = run_merge_jobs(jobs, &StoreConfig::for_testing()).unwrap();
        assert_eq!(results.len(), 4);
        for (j, result) in results.into_iter().enumerate() {
            let (table, stats) = result.unwrap();
            assert_eq!(table.row_count(), 3);
            assert_eq!(stats.rows_overridden, 1);
            assert_eq!(key_of(&table.row(0).unwrap()), j as i32);
        }
    }

    #[test]
    fn test_overlapping_jobs_rejected() {
        let dir = TempDir::new().unwrap();
        let shared = build(&dir, "shared", &[1]);
        let other = build(&dir, "other", &[2]);
        let jobs = vec![
            MergeJob::new(vec![shared.clone()], dir.path().join("out1")),
            MergeJob::new(vec![other, shared], dir.path().join("out2")),
        ];
        let err = run_merge_jobs(jobs, &StoreConfig::for_testing()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
        assert!(!dir.path().join("out1").exists());
    }

    #[test]
    fn test_failed_job_reported_alone() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("taken"), b"").unwrap();
        let jobs = vec![
            MergeJob::new(vec![build(&dir, "a", &[1])], dir.path().join("ok")),
            MergeJob::new(vec![build(&dir, "b", &[2])], dir.path().join("taken")),
        ];
        let results = run_merge_jobs(jobs, &StoreConfig::for_testing()).unwrap();
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(StorageError::FileExists(_))));
    }
}
