//! Keystone: one crash-safe `i64`
//!
//! ## On-disk layout (`FileKeystone::SIZE` bytes at a caller-chosen offset)
//! ```text
//! slot 0: [generation u64][value i64][crc32 u32][pad 12]   32 bytes
//! slot 1: [generation u64][value i64][crc32 u32][pad 12]   32 bytes
//! ```
//! All integers big-endian; the CRC covers generation and value.
//!
//! An update writes the slot that does *not* hold the last synced generation,
//! with generation + 1. Rolling updates keep rewriting that same slot until
//! `commit()` syncs it, so a torn write never reaches the synced slot and
//! recovery (newest generation with a valid CRC) always finds a value.

use crate::storage::channel::{read_fully_at, write_fully_at};
use crate::storage::checksum::Checksum;
use crate::storage::file_manager::SharedFile;
use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::path::Path;
use tracing::{debug, info, warn};

/// Crash-safe, internally synchronized `i64`
pub trait Keystone: Send + Sync {
    fn get(&self) -> Result<i64>;

    /// Store `value`; returns the previous value
    ///
    /// `rolling = true` defers durability until `commit()`.
    fn put(&self, value: i64, rolling: bool) -> Result<i64>;

    /// Add `delta`; returns the new value
    fn increment(&self, delta: i64, rolling: bool) -> Result<i64>;

    /// Make rolling updates durable
    fn commit(&self) -> Result<()>;

    /// Bytes of storage used
    fn size(&self) -> u64;
}

fn add_checked(value: i64, delta: i64) -> Result<i64> {
    value.checked_add(delta).ok_or_else(|| {
        StorageError::InvalidArgument(format!("keystone overflow: {} + {}", value, delta))
    })
}

const SLOT_SIZE: usize = 32;
const CRC_OFFSET: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    generation: u64,
    value: i64,
}

impl Slot {
    fn to_bytes(self) -> [u8; SLOT_SIZE] {
        let mut buf = [0u8; SLOT_SIZE];
        buf[0..8].copy_from_slice(&self.generation.to_be_bytes());
        buf[8..16].copy_from_slice(&self.value.to_be_bytes());
        let crc = Checksum::compute(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// None if the CRC does not verify
    fn from_bytes(buf: &[u8]) -> Option<Self> {
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&buf[CRC_OFFSET..CRC_OFFSET + 4]);
        Checksum::verify(&buf[..CRC_OFFSET], u32::from_be_bytes(crc)).ok()?;

        let mut generation = [0u8; 8];
        let mut value = [0u8; 8];
        generation.copy_from_slice(&buf[0..8]);
        value.copy_from_slice(&buf[8..16]);
        Some(Self {
            generation: u64::from_be_bytes(generation),
            value: i64::from_be_bytes(value),
        })
    }
}

#[derive(Debug)]
struct SlotState {
    current: Slot,
    /// Index of the slot holding `current`
    active: usize,
    /// Index of the slot holding the last synced generation
    durable: usize,
    /// Written but not yet fsynced
    dirty: bool,
}

/// Keystone stored in two alternating slots of a file region
#[derive(Debug)]
pub struct FileKeystone {
    file: SharedFile,
    offset: u64,
    state: Mutex<SlotState>,
}

impl FileKeystone {
    pub const SIZE: u64 = 2 * SLOT_SIZE as u64;

    /// Initialize the region at `offset` with `initial`, durably
    pub fn create(file: SharedFile, offset: u64, initial: i64) -> Result<Self> {
        let first = Slot {
            generation: 1,
            value: initial,
        };
        let mut region = [0u8; 2 * SLOT_SIZE];
        region[..SLOT_SIZE].copy_from_slice(&first.to_bytes());
        // slot 1 stays zeroed: its CRC cannot verify
        write_fully_at(file.file(), &region, offset)?;
        file.file().sync_data()?;

        debug!(path = %file.path().display(), offset, initial, "keystone created");
        Ok(Self {
            file,
            offset,
            state: Mutex::new(SlotState {
                current: first,
                active: 0,
                durable: 0,
                dirty: false,
            }),
        })
    }

    /// Recover the region at `offset`: newest generation with a valid CRC wins
    pub fn load(file: SharedFile, offset: u64) -> Result<Self> {
        let mut region = [0u8; 2 * SLOT_SIZE];
        read_fully_at(file.file(), &mut region, offset)?;

        let slots = [
            Slot::from_bytes(&region[..SLOT_SIZE]),
            Slot::from_bytes(&region[SLOT_SIZE..]),
        ];
        let (active, current) = match slots {
            [Some(a), Some(b)] if b.generation > a.generation => (1, b),
            [Some(a), _] => (0, a),
            [None, Some(b)] => (1, b),
            [None, None] => {
                return Err(StorageError::Corruption(format!(
                    "{}: no valid keystone slot at offset {}",
                    file.path().display(),
                    offset
                )));
            }
        };
        if slots.iter().any(Option::is_none) {
            warn!(path = %file.path().display(), active, "keystone slot failed CRC, using the other");
        }

        info!(
            path = %file.path().display(),
            slot = active,
            generation = current.generation,
            value = current.value,
            "keystone recovered"
        );
        Ok(Self {
            file,
            offset,
            state: Mutex::new(SlotState {
                current,
                active,
                durable: active,
                dirty: false,
            }),
        })
    }

    /// Create a standalone keystone file; fails if it exists
    pub fn create_file(path: impl AsRef<Path>, initial: i64) -> Result<Self> {
        Self::create(SharedFile::create_new(path)?, 0, initial)
    }

    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load(SharedFile::open(path)?, 0)
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().current.generation
    }

    /// Write `value` into the slot opposite the synced one; caller holds the lock
    fn write_locked(&self, state: &mut SlotState, value: i64, rolling: bool) -> Result<()> {
        let next = Slot {
            generation: state.current.generation + 1,
            value,
        };
        let target = 1 - state.durable;
        let offset = self.offset + (target * SLOT_SIZE) as u64;
        write_fully_at(self.file.file(), &next.to_bytes(), offset)?;
        state.current = next;
        state.active = target;

        if rolling {
            state.dirty = true;
        } else {
            self.file.file().sync_data()?;
            state.durable = target;
            state.dirty = false;
        }
        Ok(())
    }
}

impl Keystone for FileKeystone {
    fn get(&self) -> Result<i64> {
        Ok(self.state.lock().current.value)
    }

    fn put(&self, value: i64, rolling: bool) -> Result<i64> {
        let mut state = self.state.lock();
        let old = state.current.value;
        self.write_locked(&mut state, value, rolling)?;
        Ok(old)
    }

    fn increment(&self, delta: i64, rolling: bool) -> Result<i64> {
        let mut state = self.state.lock();
        let new = add_checked(state.current.value, delta)?;
        self.write_locked(&mut state, new, rolling)?;
        Ok(new)
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.dirty {
            self.file.file().sync_data()?;
            state.durable = state.active;
            state.dirty = false;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        Self::SIZE
    }
}

/// Volatile keystone
#[derive(Debug, Default)]
pub struct MemoryKeystone {
    value: Mutex<i64>,
}

impl MemoryKeystone {
    pub fn new(initial: i64) -> Self {
        Self {
            value: Mutex::new(initial),
        }
    }
}

impl Keystone for MemoryKeystone {
    fn get(&self) -> Result<i64> {
        Ok(*self.value.lock())
    }

    fn put(&self, value: i64, _rolling: bool) -> Result<i64> {
        Ok(std::mem::replace(&mut *self.value.lock(), value))
    }

    fn increment(&self, delta: i64, _rolling: bool) -> Result<i64> {
        let mut value = self.value.lock();
        *value = add_checked(*value, delta)?;
        Ok(*value)
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        0
    }
}

/// Caches the base keystone's value for cheap `get`
///
/// Every mutation compares the old value reported by the base with the cache;
/// a mismatch means someone wrote the base directly and is a `Consistency`
/// error. The cache then follows the base.
#[derive(Debug)]
pub struct CachedKeystone<K: Keystone> {
    base: K,
    cached: Mutex<i64>,
}

impl<K: Keystone> CachedKeystone<K> {
    pub fn new(base: K) -> Result<Self> {
        let value = base.get()?;
        Ok(Self {
            base,
            cached: Mutex::new(value),
        })
    }

    pub fn base(&self) -> &K {
        &self.base
    }

    fn diverged(expected: i64, actual: i64) -> StorageError {
        StorageError::Consistency(format!(
            "keystone changed underneath cache: cached {}, base had {}",
            expected, actual
        ))
    }
}

impl<K: Keystone> Keystone for CachedKeystone<K> {
    fn get(&self) -> Result<i64> {
        Ok(*self.cached.lock())
    }

    fn put(&self, value: i64, rolling: bool) -> Result<i64> {
        let mut cached = self.cached.lock();
        let old = self.base.put(value, rolling)?;
        let expected = std::mem::replace(&mut *cached, value);
        if old != expected {
            return Err(Self::diverged(expected, old));
        }
        Ok(old)
    }

    fn increment(&self, delta: i64, rolling: bool) -> Result<i64> {
        let mut cached = self.cached.lock();
        let new = self.base.increment(delta, rolling)?;
        let expected = std::mem::replace(&mut *cached, new);
        let old = new - delta;
        if old != expected {
            return Err(Self::diverged(expected, old));
        }
        Ok(new)
    }

    fn commit(&self) -> Result<()> {
        self.base.commit()
    }

    fn size(&self) -> u64 {
        self.base.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_increment_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("KEYSTONE");
        {
            let ks = FileKeystone::create_file(&path, 5).unwrap();
            assert_eq!(ks.increment(10, false).unwrap(), 15);
            assert_eq!(ks.get().unwrap(), 15);
        }
        let ks = FileKeystone::open_file(&path).unwrap();
        assert_eq!(ks.get().unwrap(), 15);
        assert_eq!(ks.generation(), 2);
    }

    #[test]
    fn test_put_returns_old_and_alternates_slots() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("KEYSTONE");
        let ks = FileKeystone::create_file(&path, 0).unwrap();
        for v in 1..=5 {
            assert_eq!(ks.put(v * 100, false).unwrap(), (v - 1) * 100);
        }
        drop(ks);

        let ks = FileKeystone::open_file(&path).unwrap();
        assert_eq!(ks.get().unwrap(), 500);
        assert_eq!(ks.generation(), 6);
        assert_eq!(ks.size(), 64);
    }

    #[test]
    fn test_torn_slot_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("KEYSTONE");
        {
            let ks = FileKeystone::create_file(&path, 5).unwrap();
            ks.increment(10, false).unwrap();
        }

        // The newest value lives in slot 1; tear it
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[SLOT_SIZE + 12] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let ks = FileKeystone::open_file(&path).unwrap();
        assert_eq!(ks.get().unwrap(), 5);

        // The next update overwrites the damaged slot
        ks.put(7, false).unwrap();
        drop(ks);
        assert_eq!(FileKeystone::open_file(&path).unwrap().get().unwrap(), 7);
    }

    #[test]
    fn test_no_valid_slot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("KEYSTONE");
        std::fs::write(&path, [0xABu8; 64]).unwrap();
        let err = FileKeystone::open_file(&path).unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[test]
    fn test_region_at_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("combined");
        std::fs::write(&path, [0u8; 100]).unwrap();

        let file = SharedFile::open(&path).unwrap();
        let ks = FileKeystone::create(file.clone(), 16, 42).unwrap();
        ks.increment(-2, true).unwrap();
        ks.commit().unwrap();
        drop(ks);

        let ks = FileKeystone::load(file, 16).unwrap();
        assert_eq!(ks.get().unwrap(), 40);
        assert_eq!(&std::fs::read(&path).unwrap()[..16], &[0u8; 16]);
    }

    #[test]
    fn test_overflow_rejected() {
        let ks = MemoryKeystone::new(i64::MAX);
        assert!(matches!(ks.increment(1, false), Err(StorageError::InvalidArgument(_))));
        assert_eq!(ks.get().unwrap(), i64::MAX);
    }

    #[test]
    fn test_cached_keystone() {
        let cached = CachedKeystone::new(MemoryKeystone::new(3)).unwrap();
        assert_eq!(cached.increment(4, false).unwrap(), 7);
        assert_eq!(cached.put(1, false).unwrap(), 7);
        assert_eq!(cached.get().unwrap(), 1);
    }

    #[test]
    fn test_cached_detects_divergence() {
        let cached = CachedKeystone::new(MemoryKeystone::new(3)).unwrap();
        cached.base().put(50, false).unwrap();

        let err = cached.increment(1, false).unwrap_err();
        assert!(matches!(err, StorageError::Consistency(_)));

        // Cache followed the base
        assert_eq!(cached.get().unwrap(), 51);
        assert_eq!(cached.increment(1, false).unwrap(), 52);
    }

    #[test]
    fn test_rolling_updates_keep_synced_slot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("KEYSTONE");
        let ks = FileKeystone::create_file(&path, 5).unwrap();
        let synced = std::fs::read(&path).unwrap();

        ks.put(6, true).unwrap();
        ks.put(7, true).unwrap();
        let pending = std::fs::read(&path).unwrap();
        assert_eq!(&pending[..SLOT_SIZE], &synced[..SLOT_SIZE]);

        // Crash: only the first 8 bytes of the pending slot reached the disk
        let mut image = synced.clone();
        image[SLOT_SIZE..SLOT_SIZE + 8].copy_from_slice(&pending[SLOT_SIZE..SLOT_SIZE + 8]);
        let crashed = dir.path().join("KEYSTONE.crashed");
        std::fs::write(&crashed, &image).unwrap();
        assert_eq!(FileKeystone::open_file(&crashed).unwrap().get().unwrap(), 5);

        // Once committed, slot 1 is the synced one and slot 0 takes the writes
        ks.commit().unwrap();
        let committed = std::fs::read(&path).unwrap();
        ks.put(8, true).unwrap();
        ks.put(9, true).unwrap();
        let pending = std::fs::read(&path).unwrap();
        assert_eq!(&pending[SLOT_SIZE..], &committed[SLOT_SIZE..]);

        let mut image = committed.clone();
        image[..8].copy_from_slice(&pending[..8]);
        std::fs::write(&crashed, &image).unwrap();
        assert_eq!(FileKeystone::open_file(&crashed).unwrap().get().unwrap(), 7);

        drop(ks);
        let ks = FileKeystone::open_file(&path).unwrap();
        assert_eq!(ks.get().unwrap(), 9);
        assert_eq!(ks.generation(), 5);
    }

    #[test]
    fn test_file_keystone_concurrent_increments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("KEYSTONE");
        let ks = std::sync::Arc::new(FileKeystone::create_file(&path, 0).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let ks = ks.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        ks.increment(1, (t + i) % 2 == 0).unwrap();
                    }
                    ks.commit().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ks.get().unwrap(), 200);
        drop(ks);

        let ks = FileKeystone::open_file(&path).unwrap();
        assert_eq!(ks.get().unwrap(), 200);
        assert_eq!(ks.generation(), 201);
    }

    #[test]
    fn test_cached_file_keystone_concurrent_increments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("KEYSTONE");
        let cached = std::sync::Arc::new(
            CachedKeystone::new(FileKeystone::create_file(&path, 1).unwrap()).unwrap(),
        );
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cached = cached.clone();
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..50 {
                        seen.push(cached.increment(1, true).unwrap());
                    }
                    seen
                })
            })
            .collect();
        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        cached.commit().unwrap();

        // Every increment got a distinct id
        all.sort_unstable();
        assert_eq!(all, (2..=201).collect::<Vec<i64>>());
        assert_eq!(cached.get().unwrap(), cached.base().get().unwrap());
        drop(cached);
        assert_eq!(FileKeystone::open_file(&path).unwrap().get().unwrap(), 201);
    }

    #[test]
    fn test_keystone_is_shareable() {
        let ks = std::sync::Arc::new(MemoryKeystone::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ks = ks.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        ks.increment(1, true).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ks.get().unwrap(), 400);
    }
}
