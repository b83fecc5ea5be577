//! Shared file handles with deferred deletion
//!
//! Provides shared ownership of open table files.
//!
//! ## Features
//! - Reference counting through `Arc` (one `SharedFile` per holder)
//! - Delayed deletion: a retired file is unlinked when its last handle drops
//! - A registry so that opening the same path twice shares one descriptor
//!
//! ## Safety
//! - Readers holding a `TableSet` keep their files alive across a compaction
//! - Close and unlink happen exactly once, in `Drop` of the shared inner value

use crate::{Result, StorageError};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Open file plus its retirement flag
#[derive(Debug)]
struct FileRef {
    file: File,
    path: PathBuf,
    delete_pending: AtomicBool,
}

impl Drop for FileRef {
    fn drop(&mut self) {
        if self.delete_pending.load(Ordering::SeqCst) {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "retired file unlinked"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %self.path.display(), error = %e, "failed to unlink retired file"),
            }
        }
    }
}

/// Shared handle to an open file (RAII-managed)
#[derive(Debug, Clone)]
pub struct SharedFile {
    inner: Arc<FileRef>,
}

impl SharedFile {
    /// Open an existing file for reading and writing
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::FileNotFound(path));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self::wrap(file, path))
    }

    /// Create a new file; fails if it already exists
    pub fn create_new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StorageError::FileExists(path));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self::wrap(file, path))
    }

    fn wrap(file: File, path: PathBuf) -> Self {
        Self {
            inner: Arc::new(FileRef {
                file,
                path,
                delete_pending: AtomicBool::new(false),
            }),
        }
    }

    /// Get file reference
    pub fn file(&self) -> &File {
        &self.inner.file
    }

    /// Get path
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Unlink the file once every handle has been dropped
    pub fn mark_for_deletion(&self) {
        self.inner.delete_pending.store(true, Ordering::SeqCst);
    }

    fn downgrade(&self) -> Weak<FileRef> {
        Arc::downgrade(&self.inner)
    }
}

/// File reference manager (thread-safe)
///
/// Hands out one `SharedFile` per path for as long as any handle is alive.
#[derive(Clone, Default)]
pub struct FileRefManager {
    refs: Arc<RwLock<AHashMap<PathBuf, Weak<FileRef>>>>,
}

impl FileRefManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a file (or get existing reference)
    pub fn open(&self, path: impl AsRef<Path>) -> Result<SharedFile> {
        let path = path.as_ref().to_path_buf();
        let mut refs = self.refs.write();

        if let Some(inner) = refs.get(&path).and_then(Weak::upgrade) {
            return Ok(SharedFile { inner });
        }

        let handle = SharedFile::open(&path)?;
        refs.insert(path, handle.downgrade());
        Ok(handle)
    }

    /// Create a new file and register it
    pub fn create_new(&self, path: impl AsRef<Path>) -> Result<SharedFile> {
        let handle = SharedFile::create_new(path.as_ref())?;
        self.refs
            .write()
            .insert(path.as_ref().to_path_buf(), handle.downgrade());
        Ok(handle)
    }

    /// Drop registry entries whose files are closed
    pub fn prune(&self) {
        self.refs.write().retain(|_, weak| weak.strong_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn handles(file: &SharedFile) -> usize {
        Arc::strong_count(&file.inner)
    }

    #[test]
    fn test_open_shares_descriptor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.rows");
        std::fs::write(&path, b"test data").unwrap();

        let manager = FileRefManager::new();
        let handle1 = manager.open(&path).unwrap();
        let handle2 = manager.open(&path).unwrap();
        let handle3 = handle2.clone();
        assert!(Arc::ptr_eq(&handle1.inner, &handle2.inner));
        assert_eq!(handles(&handle1), 3);
        assert_eq!(handle1.path(), path.as_path());

        drop(handle2);
        drop(handle3);
        assert_eq!(handles(&handle1), 1);
    }

    #[test]
    fn test_prune_drops_closed_entries() {
        let dir = TempDir::new().unwrap();
        let manager = FileRefManager::new();
        let kept = manager.create_new(dir.path().join("kept.rows")).unwrap();
        drop(manager.create_new(dir.path().join("closed.rows")).unwrap());

        manager.prune();
        assert_eq!(manager.refs.read().len(), 1);

        // A closed path is reopened with a fresh descriptor
        let reopened = manager.open(dir.path().join("closed.rows")).unwrap();
        assert_eq!(handles(&reopened), 1);
        assert_eq!(handles(&kept), 1);
    }

    #[test]
    fn test_deferred_deletion() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("retired.rows");
        std::fs::write(&path, b"test data").unwrap();

        let manager = FileRefManager::new();
        let reader = manager.open(&path).unwrap();
        let writer = reader.clone();

        writer.mark_for_deletion();
        drop(writer);
        assert!(path.exists()); // reader still holds it

        drop(reader);
        assert!(!path.exists());
    }

    #[test]
    fn test_open_missing_file() {
        let dir = TempDir::new().unwrap();
        let manager = FileRefManager::new();
        let err = manager.open(dir.path().join("nothing.rows")).unwrap_err();
        assert!(matches!(err, StorageError::FileNotFound(_)));
    }

    #[test]
    fn test_create_new_refuses_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.rows");
        std::fs::write(&path, b"x").unwrap();

        let err = SharedFile::create_new(&path).unwrap_err();
        assert!(matches!(err, StorageError::FileExists(_)));
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.rows");
        std::fs::write(&path, b"test data").unwrap();

        let manager = FileRefManager::new();
        let handle1 = manager.open(&path).unwrap();

        let manager_clone = manager.clone();
        let path_clone = path.clone();
        let thread = thread::spawn(move || manager_clone.open(&path_clone).unwrap());

        let handle2 = thread.join().unwrap();
        assert!(Arc::ptr_eq(&handle1.inner, &handle2.inner));
        assert_eq!(handles(&handle1), 2);
    }
}
