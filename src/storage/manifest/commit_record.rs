//! CommitRecord: the atomically replaced list of live table ids
//!
//! ## Commit protocol
//! ```text
//! 1. Write COMMIT.tmp (one decimal id per line)
//! 2. fsync COMMIT.tmp
//! 3. rename(COMMIT.tmp → COMMIT)   ← commit point
//! 4. fsync parent directory
//! ```
//!
//! A crash before step 3 leaves the previous record authoritative. Files
//! written for the new set but never committed are orphans.

use crate::{Result, StorageError};
use ahash::AHashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Ordered id list stored at one path
#[derive(Debug, Clone)]
pub struct CommitRecord {
    path: PathBuf,
}

impl CommitRecord {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Replace the record with `ids`, in order
    ///
    /// Duplicates are rejected before anything touches the filesystem.
    pub fn write(&self, ids: &[u64]) -> Result<()> {
        let mut seen = AHashSet::with_capacity(ids.len());
        for &id in ids {
            if !seen.insert(id) {
                return Err(StorageError::DuplicateTableId(id));
            }
        }

        let temp_path = self.temp_path();
        if let Err(e) = self.replace_with(&temp_path, ids) {
            // Only reached before the rename; nothing else sweeps the temp file
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }
        sync_parent_dir(&self.path)?;

        debug!(path = %self.path.display(), ids = ?ids, "commit record replaced");
        Ok(())
    }

    /// Write and fsync `temp_path`, then rename it over the record
    fn replace_with(&self, temp_path: &Path, ids: &[u64]) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(temp_path)?;

        let mut writer = BufWriter::new(file);
        for id in ids {
            writeln!(writer, "{}", id)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        std::fs::rename(temp_path, &self.path)?;
        Ok(())
    }

    /// Ids in the order written; a missing file is an empty record
    pub fn load(&self) -> Result<Vec<u64>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        text.split_whitespace()
            .map(|token| {
                token.parse::<u64>().map_err(|_| {
                    StorageError::Corruption(format!(
                        "{}: bad table id '{}'",
                        self.path.display(),
                        token
                    ))
                })
            })
            .collect()
    }

    pub fn contains(&self, id: u64) -> Result<bool> {
        Ok(self.load()?.contains(&id))
    }
}

/// fsync the directory holding `path` so a rename survives a crash
fn sync_parent_dir(path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let dir = File::open(dir)?;
        // SAFETY: the descriptor is owned by `dir` and open for the whole call
        let rc = unsafe { libc::fsync(dir.as_raw_fd()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }

    // 非 Unix 平台无法 fsync 目录
    #[cfg(not(unix))]
    {
        let _ = dir;
        File::open(path)?.sync_all()?;
    }

    Ok(())
}
