//! Checksum 验证模块
//!
//! CRC32 helpers used to detect torn or stale metadata slots.
//!
//! ## 使用示例
//! ```ignore
//! use rowstore::storage::checksum::Checksum;
//!
//! let crc = Checksum::compute(b"slot bytes");
//! Checksum::verify(b"slot bytes", crc)?;
//! ```

use crc32fast::Hasher;

/// Checksum 计算器
pub struct Checksum;

impl Checksum {
    /// 计算数据的 CRC32
    pub fn compute(data: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// 验证数据的 CRC32
    pub fn verify(data: &[u8], expected: u32) -> Result<(), ChecksumError> {
        let actual = Self::compute(data);
        if actual != expected {
            return Err(ChecksumError::Mismatch {
                expected,
                actual,
                data_len: data.len(),
            });
        }
        Ok(())
    }
}

/// Checksum 错误类型
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x} (data_len={data_len})")]
    Mismatch {
        expected: u32,
        actual: u32,
        data_len: usize,
    },
}
