//! Tombstone encoding inside fixed-width rows
//!
//! A `DeleteCodec` marks a row as deleted by writing bytes outside the key
//! region, so a tombstone keeps its position in the table's sort order.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Tombstone codec
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeleteCodec {
    /// Byte at `offset` is non-zero for a tombstone
    FlagByte { offset: usize },
    /// Big-endian `i64` at `offset` equals `magic` for a tombstone
    MagicLong { offset: usize, magic: i64 },
}

impl DeleteCodec {
    pub fn flag_byte(offset: usize) -> Self {
        Self::FlagByte { offset }
    }

    pub fn magic_long(offset: usize, magic: i64) -> Self {
        Self::MagicLong { offset, magic }
    }

    pub fn is_deleted(&self, row: &[u8]) -> bool {
        match self {
            Self::FlagByte { offset } => row[*offset] != 0,
            Self::MagicLong { offset, magic } => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&row[*offset..offset + 8]);
                i64::from_be_bytes(bytes) == *magic
            }
        }
    }

    /// Turn `row` into a tombstone; the key region must not overlap `byte_range()`
    pub fn mark_deleted(&self, row: &mut [u8]) {
        match self {
            Self::FlagByte { offset } => row[*offset] = 1,
            Self::MagicLong { offset, magic } => {
                row[*offset..offset + 8].copy_from_slice(&magic.to_be_bytes());
            }
        }
    }

    /// Bytes read and written by the codec
    pub fn byte_range(&self) -> Range<usize> {
        match self {
            Self::FlagByte { offset } => *offset..offset + 1,
            Self::MagicLong { offset, .. } => *offset..offset + 8,
        }
    }

    /// Parse `flag:OFF` or `magic:OFF:VALUE`
    pub fn parse(spec: &str) -> Result<Self> {
        let bad = || StorageError::InvalidArgument(format!("bad delete codec spec '{}'", spec));
        let fields: Vec<&str> = spec.trim().split(':').collect();
        let offset = |s: &str| s.parse::<usize>().map_err(|_| bad());

        match fields.as_slice() {
            ["flag", off] => Ok(Self::flag_byte(offset(off)?)),
            ["magic", off, magic] => {
                let magic = magic.parse::<i64>().map_err(|_| bad())?;
                Ok(Self::magic_long(offset(off)?, magic))
            }
            _ => Err(bad()),
        }
    }
}

impl fmt::Display for DeleteCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlagByte { offset } => write!(f, "flag:{}", offset),
            Self::MagicLong { offset, magic } => write!(f, "magic:{}:{}", offset, magic),
        }
    }
}
