//! Row ordering strategies
//!
//! A `RowOrder` compares two rows by looking only at their key region. It is a
//! plain value: two tables can be combined only if their orders are `==`.
//!
//! Numeric keys are big-endian two's complement, compared as signed values.
//! `Bytes` keys compare as unsigned lexical strings.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Range;

/// Total order over fixed-width rows
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowOrder {
    /// Signed 16-bit key at `offset`
    Short { offset: usize },
    /// Signed 32-bit key at `offset`
    Int { offset: usize },
    /// Signed 64-bit key at `offset`
    Long { offset: usize },
    /// Unsigned lexical key of `len` bytes at `offset`
    Bytes { offset: usize, len: usize },
    /// Lexicographic over the parts, first part most significant
    Compound { parts: Vec<RowOrder> },
}

#[inline]
fn read_i16(buf: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

#[inline]
fn read_i64(buf: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    i64::from_be_bytes(bytes)
}

impl RowOrder {
    pub fn short(offset: usize) -> Self {
        Self::Short { offset }
    }

    pub fn int(offset: usize) -> Self {
        Self::Int { offset }
    }

    pub fn long(offset: usize) -> Self {
        Self::Long { offset }
    }

    pub fn bytes(offset: usize, len: usize) -> Self {
        Self::Bytes { offset, len }
    }

    pub fn compound(parts: Vec<RowOrder>) -> Self {
        Self::Compound { parts }
    }

    /// Compare two rows (or bare keys) by key region only
    ///
    /// Both arguments must be at least `key_extent()` bytes long.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Self::Short { offset } => read_i16(a, *offset).cmp(&read_i16(b, *offset)),
            Self::Int { offset } => read_i32(a, *offset).cmp(&read_i32(b, *offset)),
            Self::Long { offset } => read_i64(a, *offset).cmp(&read_i64(b, *offset)),
            Self::Bytes { offset, len } => {
                let end = offset + len;
                a[*offset..end].cmp(&b[*offset..end])
            }
            Self::Compound { parts } => {
                for part in parts {
                    let ord = part.compare(a, b);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            }
        }
    }

    /// Minimum buffer length a key argument must have
    pub fn key_extent(&self) -> usize {
        self.key_ranges().iter().map(|r| r.end).max().unwrap_or(0)
    }

    /// Byte ranges examined by `compare`
    pub fn key_ranges(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        self.collect_ranges(&mut ranges);
        ranges
    }

    fn collect_ranges(&self, out: &mut Vec<Range<usize>>) {
        match self {
            Self::Short { offset } => out.push(*offset..offset + 2),
            Self::Int { offset } => out.push(*offset..offset + 4),
            Self::Long { offset } => out.push(*offset..offset + 8),
            Self::Bytes { offset, len } => out.push(*offset..offset + len),
            Self::Compound { parts } => parts.iter().for_each(|p| p.collect_ranges(out)),
        }
    }

    /// True if any key byte falls in `range`
    pub fn overlaps(&self, range: &Range<usize>) -> bool {
        self.key_ranges()
            .iter()
            .any(|k| k.start < range.end && range.start < k.end)
    }

    /// Check the order is well formed for rows of `row_width` bytes
    pub fn validate(&self, row_width: usize) -> Result<()> {
        match self {
            Self::Bytes { len: 0, .. } => {
                return Err(StorageError::InvalidArgument(
                    "bytes key must have positive length".into(),
                ));
            }
            Self::Compound { parts } if parts.is_empty() => {
                return Err(StorageError::InvalidArgument(
                    "compound order needs at least one part".into(),
                ));
            }
            Self::Compound { parts } => {
                for part in parts {
                    part.validate(row_width)?;
                }
            }
            _ => {}
        }

        let extent = self.key_extent();
        if extent > row_width {
            return Err(StorageError::Incompatible(format!(
                "order {} needs {} bytes but rows are {} bytes wide",
                self, extent, row_width
            )));
        }
        Ok(())
    }

    /// Write `value` into the leading numeric key field of `row`
    ///
    /// Returns false if the leading field is not numeric or `value` does not
    /// fit its width.
    pub fn write_key(&self, row: &mut [u8], value: i64) -> bool {
        match self {
            Self::Short { offset } => match i16::try_from(value) {
                Ok(v) => {
                    row[*offset..offset + 2].copy_from_slice(&v.to_be_bytes());
                    true
                }
                Err(_) => false,
            },
            Self::Int { offset } => match i32::try_from(value) {
                Ok(v) => {
                    row[*offset..offset + 4].copy_from_slice(&v.to_be_bytes());
                    true
                }
                Err(_) => false,
            },
            Self::Long { offset } => {
                row[*offset..offset + 8].copy_from_slice(&value.to_be_bytes());
                true
            }
            Self::Bytes { .. } => false,
            Self::Compound { parts } => parts.first().is_some_and(|p| p.write_key(row, value)),
        }
    }

    /// Build a bare key buffer (`key_extent()` bytes) for a numeric key
    pub fn key_for(&self, value: i64) -> Option<Vec<u8>> {
        let mut key = vec![0u8; self.key_extent()];
        self.write_key(&mut key, value).then_some(key)
    }

    /// Read the leading numeric key field, if there is one
    pub fn read_key(&self, row: &[u8]) -> Option<i64> {
        match self {
            Self::Short { offset } => Some(read_i16(row, *offset) as i64),
            Self::Int { offset } => Some(read_i32(row, *offset) as i64),
            Self::Long { offset } => Some(read_i64(row, *offset)),
            Self::Bytes { .. } => None,
            Self::Compound { parts } => parts.first().and_then(|p| p.read_key(row)),
        }
    }

    /// Parse `int:0`, `long:8`, `short:2`, `bytes:0:16`; commas make a compound
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(',').map(str::trim).collect();
        if parts.len() > 1 {
            let parts = parts
                .into_iter()
                .map(Self::parse_single)
                .collect::<Result<Vec<_>>>()?;
            return Ok(Self::compound(parts));
        }
        Self::parse_single(parts[0])
    }

    fn parse_single(spec: &str) -> Result<Self> {
        let bad = || StorageError::InvalidArgument(format!("bad row order spec '{}'", spec));
        let fields: Vec<&str> = spec.split(':').collect();
        let num = |s: &str| s.parse::<usize>().map_err(|_| bad());

        match fields.as_slice() {
            ["short", off] => Ok(Self::short(num(off)?)),
            ["int", off] => Ok(Self::int(num(off)?)),
            ["long", off] => Ok(Self::long(num(off)?)),
            ["bytes", off, len] => Ok(Self::bytes(num(off)?, num(len)?)),
            _ => Err(bad()),
        }
    }
}

impl fmt::Display for RowOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Short { offset } => write!(f, "short:{}", offset),
            Self::Int { offset } => write!(f, "int:{}", offset),
            Self::Long { offset } => write!(f, "long:{}", offset),
            Self::Bytes { offset, len } => write!(f, "bytes:{}:{}", offset, len),
            Self::Compound { parts } => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", part)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_order_is_signed() {
        let order = RowOrder::int(0);
        let neg = order.key_for(-8).unwrap();
        let pos = order.key_for(5).unwrap();
        assert_eq!(order.compare(&neg, &pos), Ordering::Less);
        assert_eq!(order.compare(&pos, &neg), Ordering::Greater);
        assert_eq!(order.compare(&pos, &pos), Ordering::Equal);
    }

    #[test]
    fn test_compare_ignores_value_region() {
        let order = RowOrder::int(0);
        let a = [0, 0, 0, 7, 1, 1];
        let b = [0, 0, 0, 7, 9, 9];
        assert_eq!(order.compare(&a, &b), Ordering::Equal);
    }

    #[test]
    fn test_bare_key_against_row() {
        let order = RowOrder::long(0);
        let key = order.key_for(42).unwrap();
        assert_eq!(key.len(), 8);

        let mut row = vec![0xAB; 20];
        order.write_key(&mut row, 42);
        assert_eq!(order.compare(&key, &row), Ordering::Equal);
    }

    #[test]
    fn test_compound_order() {
        let order = RowOrder::compound(vec![RowOrder::short(0), RowOrder::bytes(2, 2)]);
        assert_eq!(order.key_extent(), 4);

        let a = [0, 1, b'a', b'z'];
        let b = [0, 1, b'b', b'a'];
        let c = [0, 2, b'a', b'a'];
        assert_eq!(order.compare(&a, &b), Ordering::Less);
        assert_eq!(order.compare(&b, &c), Ordering::Less);
    }

    #[test]
    fn test_equality_is_structural() {
        assert_eq!(RowOrder::int(4), RowOrder::int(4));
        assert_ne!(RowOrder::int(4), RowOrder::int(0));
        assert_ne!(RowOrder::int(0), RowOrder::long(0));
    }

    #[test]
    fn test_validate() {
        assert!(RowOrder::long(0).validate(8).is_ok());
        assert!(RowOrder::long(4).validate(8).is_err());
        assert!(RowOrder::bytes(0, 0).validate(8).is_err());
        assert!(RowOrder::compound(vec![]).validate(8).is_err());
    }

    #[test]
    fn test_parse_and_display() {
        for spec in ["int:0", "long:8", "short:2", "bytes:0:16", "int:0,bytes:4:4"] {
            let order = RowOrder::parse(spec).unwrap();
            assert_eq!(order.to_string(), spec);
        }
        assert!(RowOrder::parse("float:0").is_err());
        assert!(RowOrder::parse("int:x").is_err());
    }

    #[test]
    fn test_write_key_range_check() {
        let order = RowOrder::short(0);
        let mut row = [0u8; 2];
        assert!(!order.write_key(&mut row, 70_000));
        assert!(order.write_key(&mut row, -3));
        assert_eq!(order.read_key(&row), Some(-3));
    }
}
